use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method},
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use heater_common::{
    config::NetworkConfig,
    hardware::{I2C_SCL_GPIO, I2C_SDA_GPIO, LED_GPIO, RELAY_GPIO},
    retry::retry,
    surface, ConnectionEvent, ConnectionId, ConnectionRegistry, FirmwareInfo, HeaterController,
    HttpReply, ReportRequest, ReportTransport, Reporter, RuntimeConfig, TransportError,
    PATH_DEBUG, PATH_HEATER,
};

use crate::two_wire::BitBangBus;

const NVS_NAMESPACE: &str = "heater";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
const WIFI_STACK_SIZE: usize = 6 * 1024;
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_STACK_SIZE: usize = 8 * 1024;

type OutputLine = PinDriver<'static, AnyOutputPin, Output>;
type Heater = HeaterController<OutputLine, OutputLine>;

#[derive(Clone)]
struct SharedState {
    bus: Arc<Mutex<BitBangBus>>,
    heater: Arc<Mutex<Heater>>,
    firmware: Arc<FirmwareInfo>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    monotonic_ms();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    let Peripherals { modem, .. } = Peripherals::take()?;

    let heater = HeaterController::new(
        init_output(LED_GPIO).context("failed to initialize heater LED")?,
        init_output(RELAY_GPIO).context("failed to initialize heater relay")?,
    );

    // SAFETY: the pin numbers are fixed board wiring and nothing else claims them.
    let (sda, scl) = unsafe { (AnyIOPin::new(I2C_SDA_GPIO), AnyIOPin::new(I2C_SCL_GPIO)) };
    let bus = BitBangBus::new(sda, scl).context("failed to initialize two-wire bus")?;

    match start_wifi(modem, sys_loop.clone(), nvs_partition, &runtime.network) {
        Ok(Some(esp_wifi)) => spawn_wifi_supervisor(esp_wifi, sys_loop),
        Ok(None) => warn!("wifi credentials missing; running offline"),
        Err(err) => warn!("wifi startup failed: {err:#}; running offline"),
    }

    let state = SharedState {
        bus: Arc::new(Mutex::new(bus)),
        heater: Arc::new(Mutex::new(heater)),
        firmware: Arc::new(runtime.firmware.clone()),
    };

    let server = create_http_server(state.clone())?;

    // Keep the server alive for the program lifetime.
    let _server = server;

    match Reporter::from_config(&runtime.report) {
        Some(reporter) => {
            info!(
                "reporting to {} every {}ms",
                reporter.url(),
                reporter.interval().as_millis()
            );
            run_report_loop(state, reporter)
        }
        None => {
            info!("sensor reporting disabled");
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 8 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(PATH_HEATER, Method::Get, move |req| {
            let reply = {
                let mut bus = lock(&state.bus);
                let heater = lock(&state.heater);
                surface::status_reply(&mut *bus, &*heater, &state.firmware)
            };
            write_reply(req, &reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/heater/*", Method::Get, move |req| {
            let path = req.uri().split('?').next().unwrap_or_default().to_string();
            let reply = surface::action_reply(&path, &mut *lock(&state.heater));
            write_reply(req, &reply)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(PATH_DEBUG, Method::Get, move |req| {
        let reply = surface::debug_reply(monotonic_ms(), free_heap_bytes());
        write_reply(req, &reply)
    })?;

    Ok(server)
}

fn write_reply(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    reply: &HttpReply,
) -> anyhow::Result<()> {
    let headers = reply.headers();
    req.into_response(reply.status(), None, &headers)?
        .write_all(reply.body().as_bytes())?;
    Ok(())
}

/// Timer ticks and connection events for the reporter, handled on this thread
/// only.
fn run_report_loop(state: SharedState, mut reporter: Reporter) -> ! {
    let (events_tx, events_rx) = mpsc::channel();
    let mut transport = EspReportTransport::new(events_tx);
    let period = reporter.interval();
    let mut next_tick = Instant::now() + period;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match events_rx.recv_timeout(wait) {
            Ok(event) => reporter.on_event(event),
            Err(RecvTimeoutError::Timeout) => {
                next_tick = Instant::now() + period;
                let mut bus = lock(&state.bus);
                reporter.on_timer(&mut *bus, &mut transport);
            }
            // The transport keeps a sender alive, so this is never hit.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
        }
    }
}

struct EspReportTransport {
    registry: ConnectionRegistry,
    events: mpsc::Sender<ConnectionEvent>,
}

impl EspReportTransport {
    fn new(events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            events,
        }
    }
}

impl ReportTransport for EspReportTransport {
    fn open_post(&mut self, request: &ReportRequest) -> Result<ConnectionId, TransportError> {
        let id = self.registry.open();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let job = request.clone();

        let spawned = thread::Builder::new()
            .name("report".to_string())
            .stack_size(REPORT_STACK_SIZE)
            .spawn(move || {
                match post_report(&job) {
                    Ok(status) => {
                        let _ = events.send(ConnectionEvent::Reply { id, status });
                    }
                    Err(err) => warn!("report {id} failed: {err:#}"),
                }
                registry.close(id);
                let _ = events.send(ConnectionEvent::Closed { id });
            });

        match spawned {
            Ok(_) => Ok(id),
            Err(err) => {
                self.registry.close(id);
                Err(TransportError::Open {
                    url: request.url.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    fn is_open(&self, id: ConnectionId) -> bool {
        self.registry.is_open(id)
    }
}

fn post_report(request: &ReportRequest) -> anyhow::Result<u16> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(REPORT_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let content_length = request.body.len().to_string();
    let mut headers = request.headers();
    headers.push(("Content-Length", &content_length));

    let mut outgoing = client
        .request(Method::Post, &request.url, &headers)
        .map_err(|e| anyhow!("{e:?}"))?;
    outgoing
        .write_all(request.body.as_bytes())
        .map_err(|e| anyhow!("{e:?}"))?;
    outgoing.flush().map_err(|e| anyhow!("{e:?}"))?;

    // Only the status is looked at; the connection is dropped right after.
    let response = outgoing.submit().map_err(|e| anyhow!("{e:?}"))?;
    Ok(response.status())
}

fn init_output(pin: i32) -> anyhow::Result<OutputLine> {
    // SAFETY: output pins are fixed board wiring and are claimed exactly once.
    let mut driver = PinDriver::output(unsafe { AnyOutputPin::new(pin) })?;
    driver.set_low()?;
    Ok(driver)
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

/// Configures and starts the station. `Ok(None)` means no credentials are
/// configured and the node stays offline.
fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Option<Box<EspWifi<'static>>>> {
    if network.wifi_ssid.trim().is_empty() {
        return Ok(None);
    }

    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started for `{}`", network.wifi_ssid);

    drop(wifi);
    Ok(Some(esp_wifi))
}

fn connect_station(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
) -> anyhow::Result<()> {
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop.clone())?;

    retry(
        WIFI_CONNECT_ATTEMPTS,
        |attempt| {
            info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
            let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
            match &result {
                Ok(()) => info!("wifi connected and netif up on attempt {attempt}"),
                Err(err) => {
                    warn!("wifi connect failed on attempt {attempt}: {err:#}");
                    let _ = wifi.disconnect();
                }
            }
            result
        },
        || thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS)),
    )
    .map_err(|err| {
        anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}")
    })
}

/// Owns the station for the program lifetime and reconnects whenever the link
/// is down. The heater keeps serving while this thread retries.
fn spawn_wifi_supervisor(mut esp_wifi: Box<EspWifi<'static>>, sys_loop: EspSystemEventLoop) {
    let spawned = thread::Builder::new()
        .name("wifi".to_string())
        .stack_size(WIFI_STACK_SIZE)
        .spawn(move || loop {
            if !esp_wifi.is_connected().unwrap_or(false) {
                if let Err(err) = connect_station(esp_wifi.as_mut(), &sys_loop) {
                    warn!(
                        "{err:#}; retrying in {}s",
                        WIFI_RECONNECT_INTERVAL.as_secs()
                    );
                }
            }
            thread::sleep(WIFI_RECONNECT_INTERVAL);
        });

    if let Err(err) = spawned {
        warn!("failed to start wifi supervisor: {err}; running offline");
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn free_heap_bytes() -> u64 {
    u64::from(unsafe { esp_idf_svc::sys::esp_get_free_heap_size() })
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
