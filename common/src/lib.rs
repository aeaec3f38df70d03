pub mod bus;
pub mod config;
pub mod hardware;
pub mod heater;
pub mod mcp9808;
pub mod report;
pub mod retry;
pub mod routes;
pub mod surface;
pub mod types;

pub use bus::{Ack, Direction, TwoWireBus};
pub use config::{ConfigError, FirmwareInfo, NetworkConfig, ReportConfig, RuntimeConfig};
pub use heater::HeaterController;
pub use mcp9808::{decode_ambient, read_temperature, Temperature};
pub use report::{
    ConnectionEvent, ConnectionId, ConnectionRegistry, ReportOutcome, ReportRequest,
    ReportTransport, Reporter, TransportError,
};
pub use routes::*;
pub use surface::HttpReply;
pub use types::HeaterState;
