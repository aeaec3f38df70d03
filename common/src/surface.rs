//! Request handlers for the heater web UI.
//!
//! Handlers produce an [`HttpReply`]; the runtime that owns the connection
//! turns it into a response and closes the connection after sending it.

use core::fmt::Write as _;

use embedded_hal::digital::OutputPin;

use crate::{
    bus::TwoWireBus,
    config::FirmwareInfo,
    hardware::MCP9808_ADDR,
    heater::HeaterController,
    mcp9808::{read_temperature, Temperature},
    routes::{PATH_HEATER, PATH_HEATER_OFF, PATH_HEATER_ON},
    types::HeaterState,
};

pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Every reply closes its connection; no keep-alive.
pub const CONNECTION_CLOSE: (&str, &str) = ("Connection", "close");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpReply {
    Page {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    Redirect {
        status: u16,
        location: &'static str,
    },
}

impl HttpReply {
    pub fn status(&self) -> u16 {
        match self {
            Self::Page { status, .. } | Self::Redirect { status, .. } => *status,
        }
    }

    /// Response headers, `Connection: close` included.
    pub fn headers(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Page { content_type, .. } => {
                vec![("Content-Type", *content_type), CONNECTION_CLOSE]
            }
            Self::Redirect { location, .. } => vec![("Location", *location), CONNECTION_CLOSE],
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Page { body, .. } => body,
            Self::Redirect { .. } => "",
        }
    }
}

/// `GET /heater`
pub fn status_reply<B, L, R>(
    bus: &mut B,
    heater: &HeaterController<L, R>,
    firmware: &FirmwareInfo,
) -> HttpReply
where
    B: TwoWireBus,
    L: OutputPin,
    R: OutputPin,
{
    let temperature = read_temperature(bus, MCP9808_ADDR);
    HttpReply::Page {
        status: 200,
        content_type: CONTENT_TYPE_HTML,
        body: render_status_page(temperature, heater.state(), firmware),
    }
}

/// `GET /heater/on`, `GET /heater/off`; any other path under `/heater/` only
/// redirects.
pub fn action_reply<L: OutputPin, R: OutputPin>(
    path: &str,
    heater: &mut HeaterController<L, R>,
) -> HttpReply {
    if let Some(on) = action_for_path(path) {
        heater.set(on);
    }
    HttpReply::Redirect {
        status: 302,
        location: PATH_HEATER,
    }
}

/// `GET /debug`
pub fn debug_reply(uptime_ms: u64, free_memory: u64) -> HttpReply {
    HttpReply::Page {
        status: 200,
        content_type: CONTENT_TYPE_TEXT,
        body: render_debug(uptime_ms, free_memory),
    }
}

pub fn action_for_path(path: &str) -> Option<bool> {
    match path {
        PATH_HEATER_ON => Some(true),
        PATH_HEATER_OFF => Some(false),
        _ => None,
    }
}

pub fn render_status_page(
    temperature: Option<Temperature>,
    heater: HeaterState,
    firmware: &FirmwareInfo,
) -> String {
    let toggle = heater.opposite().as_str();
    let mut page = String::with_capacity(320);

    page.push_str("<h1>Welcome to Office IoT!</h1>\r\n");
    match temperature {
        Some(temperature) => {
            let _ = write!(page, "<p>Temperature is {temperature}&deg;C.</p>\r\n");
        }
        None => page.push_str("<p>Temperature is unavailable.</p>\r\n"),
    }
    let _ = write!(
        page,
        "<p>Heater is {}.</p>\r\n\
         <form action={PATH_HEATER}/{toggle}><input type=submit value='Turn heater {toggle}'></form>\r\n\
         <hr>\r\n\
         Heater FW {} ({})",
        heater.as_str(),
        escape_html(&firmware.version),
        escape_html(&firmware.build_id),
    );
    page
}

pub fn render_debug(uptime_ms: u64, free_memory: u64) -> String {
    format!(
        "Time is {:.2}. Free RAM {free_memory}.\r\n",
        uptime_ms as f64 / 1000.0
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
