//! Periodic temperature reporting with at most one request in flight.
//!
//! The runtime drives a [`Reporter`] from a single event loop: timer ticks go
//! to [`Reporter::on_timer`], connection lifecycle events go to
//! [`Reporter::on_event`]. The reporter only remembers a [`ConnectionId`]; the
//! connection itself belongs to the transport.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    bus::TwoWireBus,
    config::ReportConfig,
    hardware::MCP9808_ADDR,
    mcp9808::{read_temperature, Temperature},
    routes::REPORT_FIELD_TEMPERATURE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Reply { id: ConnectionId, status: u16 },
    Closed { id: ConnectionId },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open report connection to {url}: {reason}")]
    Open { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub url: String,
    pub authorization: Option<String>,
    pub body: String,
}

impl ReportRequest {
    pub fn headers(&self) -> Vec<(&str, &str)> {
        let mut headers = vec![("Content-Type", "application/json")];
        if let Some(auth) = self.authorization.as_deref() {
            headers.push(("Authorization", auth));
        }
        headers
    }
}

/// Outbound side of the runtime's HTTP client.
///
/// Every connection handed out by `open_post` must later produce exactly one
/// [`ConnectionEvent::Closed`], whatever happened to the exchange.
pub trait ReportTransport {
    fn open_post(&mut self, request: &ReportRequest) -> Result<ConnectionId, TransportError>;

    fn is_open(&self, id: ConnectionId) -> bool;
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    open: HashSet<ConnectionId>,
}

/// Set of live outbound connections, shared between a transport and the
/// workers completing its requests.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> ConnectionId {
        let mut state = self.lock();
        state.next_id = state.next_id.wrapping_add(1);
        let id = ConnectionId(state.next_id);
        state.open.insert(id);
        id
    }

    /// Returns `false` if `id` was not open.
    pub fn close(&self, id: ConnectionId) -> bool {
        self.lock().open.remove(&id)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.lock().open.contains(&id)
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// A previous report is still outstanding; this tick is skipped.
    InFlight(ConnectionId),
    SensorUnavailable,
    Dispatched(ConnectionId),
    OpenFailed,
}

/// Interval to arm the report timer with, or `None` when reporting is off.
pub fn report_interval(config: &ReportConfig) -> Option<Duration> {
    let has_url = config
        .sensor_data_url
        .as_deref()
        .is_some_and(|url| !url.trim().is_empty());
    if config.interval_ms > 0 && has_url {
        Some(Duration::from_millis(config.interval_ms))
    } else {
        None
    }
}

pub fn report_body(temperature: Temperature) -> String {
    format!("{{\"{REPORT_FIELD_TEMPERATURE}\": {temperature}}}")
}

#[derive(Debug, Clone)]
pub struct Reporter {
    url: String,
    auth: Option<String>,
    interval: Duration,
    pending: Option<ConnectionId>,
}

impl Reporter {
    /// `None` when the configuration leaves reporting disabled; such a node
    /// never arms the timer.
    pub fn from_config(config: &ReportConfig) -> Option<Self> {
        let interval = report_interval(config)?;
        let url = config.sensor_data_url.clone()?;
        Some(Self {
            url,
            auth: config.auth.clone(),
            interval,
            pending: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pending(&self) -> Option<ConnectionId> {
        self.pending
    }

    pub fn is_reporting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn on_timer<B, T>(&mut self, bus: &mut B, transport: &mut T) -> ReportOutcome
    where
        B: TwoWireBus,
        T: ReportTransport,
    {
        if let Some(id) = self.pending {
            if transport.is_open(id) {
                debug!("report {id} still in flight; skipping tick");
                return ReportOutcome::InFlight(id);
            }
            debug!("report {id} no longer open; treating reporter as idle");
        }

        let Some(temperature) = read_temperature(bus, MCP9808_ADDR) else {
            debug!("temperature unavailable; skipping report");
            return ReportOutcome::SensorUnavailable;
        };

        let request = self.request_for(temperature);
        match transport.open_post(&request) {
            Ok(id) => {
                info!("reporting {temperature}°C to {} as {id}", self.url);
                self.pending = Some(id);
                ReportOutcome::Dispatched(id)
            }
            Err(err) => {
                warn!("{err}");
                ReportOutcome::OpenFailed
            }
        }
    }

    pub fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Reply { id, status } => {
                debug!("report {id} answered with HTTP {status}");
            }
            ConnectionEvent::Closed { id } => {
                if self.pending == Some(id) {
                    self.pending = None;
                } else {
                    debug!("ignoring close of untracked connection {id}");
                }
            }
        }
    }

    fn request_for(&self, temperature: Temperature) -> ReportRequest {
        ReportRequest {
            url: self.url.clone(),
            authorization: self.auth.clone(),
            body: report_body(temperature),
        }
    }
}
