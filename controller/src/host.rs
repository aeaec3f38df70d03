use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use heater_common::{
    surface, ConnectionEvent, ConnectionId, ConnectionRegistry, FirmwareInfo, HeaterController,
    HttpReply, ReportRequest, ReportTransport, Reporter, RuntimeConfig, TransportError,
    PATH_DEBUG, PATH_HEATER,
};

use crate::sim::{SimulatedBus, SimulatedPin};

type Heater = HeaterController<SimulatedPin, SimulatedPin>;

const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    bus: Arc<Mutex<SimulatedBus>>,
    heater: Arc<Mutex<Heater>>,
    firmware: Arc<FirmwareInfo>,
}

struct ConfigStore {
    runtime_path: PathBuf,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    // Uptime for /debug counts from here.
    monotonic_ms();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |var| std::env::var(var).ok());

    let bus = SimulatedBus::from_env()?;
    match bus.sensor() {
        Some(temperature) => info!("simulated MCP9808 reading {temperature}°C"),
        None => warn!("no simulated sensor; temperature will be unavailable"),
    }

    let heater = HeaterController::new(SimulatedPin::new("led"), SimulatedPin::new("relay"));

    let app_state = AppState {
        bus: Arc::new(Mutex::new(bus)),
        heater: Arc::new(Mutex::new(heater)),
        firmware: Arc::new(runtime.firmware.clone()),
    };

    match Reporter::from_config(&runtime.report) {
        Some(reporter) => {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let transport = HttpReportTransport::new(events_tx)?;
            info!(
                "reporting to {} every {}ms",
                reporter.url(),
                reporter.interval().as_millis()
            );
            spawn_report_loop(app_state.clone(), reporter, transport, events_rx);
        }
        None => info!("sensor reporting disabled"),
    }

    let app = router(app_state);

    let port = std::env::var("HEATER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind heater server at {addr}"))?;

    info!("heater listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route(PATH_HEATER, get(handle_heater))
        .route("/heater/", get(handle_heater_action))
        .route("/heater/{*action}", get(handle_heater_action))
        .route(PATH_DEBUG, get(handle_debug))
        .with_state(app_state)
}

/// A bad override leaves reporting off instead of stopping the node.
fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    let overrides = [
        ("HEATER_REPORT_INTERVAL_MS", "interval_ms"),
        ("HEATER_REPORT_URL", "sensor_data_url"),
        ("HEATER_REPORT_AUTH", "auth"),
    ];
    for (var, key) in overrides {
        let Some(value) = lookup(var) else {
            continue;
        };
        if let Err(err) = runtime.report.apply_override(key, &value) {
            warn!("ignoring {var}: {err}; sensor reporting disabled");
            runtime.report.interval_ms = 0;
        }
    }
}

/// Single event loop for the reporter: timer ticks and connection events are
/// handled one at a time, in arrival order.
fn spawn_report_loop(
    app_state: AppState,
    mut reporter: Reporter,
    mut transport: HttpReportTransport,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        let period = reporter.interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut bus = app_state.bus.lock().await;
                    reporter.on_timer(&mut *bus, &mut transport);
                }
                Some(event) = events.recv() => reporter.on_event(event),
            }
        }
    });
}

struct HttpReportTransport {
    client: reqwest::Client,
    registry: ConnectionRegistry,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl HttpReportTransport {
    fn new(events: mpsc::UnboundedSender<ConnectionEvent>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .context("failed to build report client")?;
        Ok(Self {
            client,
            registry: ConnectionRegistry::new(),
            events,
        })
    }
}

impl ReportTransport for HttpReportTransport {
    fn open_post(&mut self, request: &ReportRequest) -> Result<ConnectionId, TransportError> {
        let url = reqwest::Url::parse(&request.url).map_err(|err| TransportError::Open {
            url: request.url.clone(),
            reason: err.to_string(),
        })?;

        let mut builder = self.client.post(url).body(request.body.clone());
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let id = self.registry.open();
        let registry = self.registry.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match builder.send().await {
                // The body is never read; dropping the response ends the exchange.
                Ok(response) => {
                    let status = response.status().as_u16();
                    let _ = events.send(ConnectionEvent::Reply { id, status });
                }
                Err(err) => warn!("report {id} failed: {err}"),
            }
            registry.close(id);
            let _ = events.send(ConnectionEvent::Closed { id });
        });

        Ok(id)
    }

    fn is_open(&self, id: ConnectionId) -> bool {
        self.registry.is_open(id)
    }
}

async fn handle_heater(State(state): State<AppState>) -> Response {
    let reply = {
        let mut bus = state.bus.lock().await;
        let heater = state.heater.lock().await;
        surface::status_reply(&mut *bus, &*heater, &state.firmware)
    };
    into_response(reply)
}

async fn handle_heater_action(State(state): State<AppState>, uri: Uri) -> Response {
    let reply = {
        let mut heater = state.heater.lock().await;
        surface::action_reply(uri.path(), &mut *heater)
    };
    into_response(reply)
}

async fn handle_debug() -> Response {
    into_response(surface::debug_reply(monotonic_ms(), free_memory_bytes().await))
}

fn into_response(reply: HttpReply) -> Response {
    let status = StatusCode::from_u16(reply.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in reply.headers() {
        builder = builder.header(name, value);
    }

    match builder.body(Body::from(reply.body().to_string())) {
        Ok(response) => response,
        Err(err) => {
            warn!("failed to build response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heater"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(RuntimeConfig::from_json(&raw)
                .with_context(|| format!("failed to parse {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// `MemAvailable` from `/proc/meminfo`, or 0 where that is not available.
async fn free_memory_bytes() -> u64 {
    tokio::fs::read_to_string("/proc/meminfo")
        .await
        .ok()
        .and_then(|meminfo| parse_mem_available(&meminfo))
        .unwrap_or(0)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kib.saturating_mul(1024))
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_available_is_converted_to_bytes() {
        let meminfo = "MemTotal:       16318412 kB\n\
                       MemFree:          402124 kB\n\
                       MemAvailable:    8200000 kB\n";

        assert_eq!(parse_mem_available(meminfo), Some(8_396_800_000));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    fn test_state() -> AppState {
        AppState {
            bus: Arc::new(Mutex::new(SimulatedBus::new(None))),
            heater: Arc::new(Mutex::new(HeaterController::new(
                SimulatedPin::new("led"),
                SimulatedPin::new("relay"),
            ))),
            firmware: Arc::new(FirmwareInfo::default()),
        }
    }

    #[tokio::test]
    async fn every_path_under_heater_redirects() {
        let state = test_state();
        let heater = state.heater.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        for path in ["/heater/on", "/heater/bogus", "/heater/"] {
            let response = client
                .get(format!("http://{addr}{path}"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::FOUND, "{path}");
            assert_eq!(response.headers()["location"], "/heater", "{path}");
        }
        assert!(heater.lock().await.is_on());

        let page = client
            .get(format!("http://{addr}/heater"))
            .send()
            .await
            .unwrap();
        assert_eq!(page.status(), reqwest::StatusCode::OK);
        let body = page.text().await.unwrap();
        assert!(body.contains("Heater is on."));
        assert!(body.contains("Temperature is unavailable."));
    }

    #[test]
    fn bad_interval_override_disables_reporting() {
        let mut runtime = RuntimeConfig::default();
        runtime.report.interval_ms = 60_000;

        apply_env_overrides(&mut runtime, |var| match var {
            "HEATER_REPORT_INTERVAL_MS" => Some("10s".to_string()),
            "HEATER_REPORT_URL" => Some("http://hub.local/sensor".to_string()),
            _ => None,
        });

        assert_eq!(runtime.report.interval_ms, 0);
        assert_eq!(
            runtime.report.sensor_data_url.as_deref(),
            Some("http://hub.local/sensor")
        );
        assert!(Reporter::from_config(&runtime.report).is_none());
    }

    #[test]
    fn env_overrides_replace_stored_values() {
        let mut runtime = RuntimeConfig::default();

        apply_env_overrides(&mut runtime, |var| match var {
            "HEATER_REPORT_INTERVAL_MS" => Some("15000".to_string()),
            "HEATER_REPORT_URL" => Some("http://hub.local/sensor".to_string()),
            "HEATER_REPORT_AUTH" => Some("Bearer abc".to_string()),
            _ => None,
        });

        assert_eq!(runtime.report.interval_ms, 15_000);
        assert_eq!(runtime.report.auth.as_deref(), Some("Bearer abc"));
        assert!(Reporter::from_config(&runtime.report).is_some());
    }

    #[test]
    fn replies_keep_status_and_close_header() {
        let response = into_response(HttpReply::Redirect {
            status: 302,
            location: "/heater",
        });

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/heater");
        assert_eq!(response.headers()["connection"], "close");
    }
}
