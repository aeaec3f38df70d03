use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runtime config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: `{value}`")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub build_id: String,
}

impl Default for FirmwareInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_id: option_env!("HEATER_FW_ID").unwrap_or("dev").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReportConfig {
    /// Zero disables reporting.
    pub interval_ms: u64,
    pub sensor_data_url: Option<String>,
    /// Sent verbatim as the `Authorization` header value.
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub firmware: FirmwareInfo,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.report.sanitize();
    }
}

impl ReportConfig {
    pub fn sanitize(&mut self) {
        self.sensor_data_url = non_blank(self.sensor_data_url.take());
        self.auth = non_blank(self.auth.take());
    }

    /// Apply a `KEY=value` style override, as read from the environment.
    pub fn apply_override(&mut self, key: &'static str, value: &str) -> Result<(), ConfigError> {
        match key {
            "interval_ms" => {
                self.interval_ms =
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue {
                            key,
                            value: value.to_string(),
                        })?;
            }
            "sensor_data_url" => self.sensor_data_url = non_blank(Some(value.to_string())),
            "auth" => self.auth = non_blank(Some(value.to_string())),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = RuntimeConfig::from_json(br#"{"report":{"interval_ms":5000,"sensor_data_url":"http://hub/data","auth":null}}"#)
            .unwrap();

        assert_eq!(config.firmware, FirmwareInfo::default());
        assert_eq!(
            config.report,
            ReportConfig {
                interval_ms: 5000,
                sensor_data_url: Some("http://hub/data".to_string()),
                auth: None,
            }
        );
        assert!(config.network.wifi_ssid.is_empty());
    }

    #[test]
    fn blank_strings_are_treated_as_unset() {
        let config = RuntimeConfig::from_json(
            br#"{"report":{"interval_ms":1000,"sensor_data_url":"  ","auth":""}}"#,
        )
        .unwrap();

        assert_eq!(config.report.sensor_data_url, None);
        assert_eq!(config.report.auth, None);
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json(b"{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overrides_replace_fields() {
        let mut report = ReportConfig::default();

        report.apply_override("interval_ms", "30000").unwrap();
        report.apply_override("sensor_data_url", "http://hub/data").unwrap();
        report.apply_override("auth", "Bearer abc").unwrap();

        assert_eq!(report.interval_ms, 30_000);
        assert_eq!(report.sensor_data_url.as_deref(), Some("http://hub/data"));
        assert_eq!(report.auth.as_deref(), Some("Bearer abc"));
        assert!(report.apply_override("interval_ms", "soon").is_err());
        assert_eq!(report.interval_ms, 30_000);
    }
}
