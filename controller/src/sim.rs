//! Stand-ins for the board hardware when running on a development host.

use std::{collections::VecDeque, convert::Infallible};

use anyhow::Context;
use embedded_hal::digital::{ErrorType, OutputPin};
use tracing::debug;

use heater_common::{
    hardware::MCP9808_ADDR,
    mcp9808::{encode_ambient, AMBIENT_TEMPERATURE_REGISTER},
    Ack, Direction, Temperature, TwoWireBus,
};

/// Two-wire bus with a single MCP9808 answering at its usual address.
///
/// With no sensor temperature configured nothing acknowledges, which is what a
/// board with the sensor unplugged looks like.
#[derive(Debug)]
pub struct SimulatedBus {
    sensor: Option<Temperature>,
    selected: Option<Direction>,
    register: Option<u8>,
    outgoing: VecDeque<u8>,
}

impl SimulatedBus {
    pub fn new(sensor: Option<Temperature>) -> Self {
        Self {
            sensor,
            selected: None,
            register: None,
            outgoing: VecDeque::new(),
        }
    }

    /// Reads `HEATER_SIM_TEMP_C`; unset or `off` means no sensor.
    pub fn from_env() -> anyhow::Result<Self> {
        let sensor = match std::env::var("HEATER_SIM_TEMP_C") {
            Ok(value) if !value.eq_ignore_ascii_case("off") => {
                let celsius = value
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid HEATER_SIM_TEMP_C `{value}`"))?;
                Some(temperature_from_celsius(celsius))
            }
            _ => None,
        };
        Ok(Self::new(sensor))
    }

    pub fn sensor(&self) -> Option<Temperature> {
        self.sensor
    }
}

impl TwoWireBus for SimulatedBus {
    fn start(&mut self, address: u8, direction: Direction) -> Ack {
        self.outgoing.clear();
        let Some(temperature) = self.sensor.filter(|_| address == MCP9808_ADDR) else {
            self.selected = None;
            return Ack::Nak;
        };

        self.selected = Some(direction);
        if direction == Direction::Read {
            let (upper, lower) = match self.register {
                Some(AMBIENT_TEMPERATURE_REGISTER) => encode_ambient(temperature),
                _ => (0x00, 0x00),
            };
            self.outgoing.extend([upper, lower]);
        }
        Ack::Ack
    }

    fn send_byte(&mut self, byte: u8) -> Ack {
        match self.selected {
            Some(Direction::Write) => {
                self.register = Some(byte);
                Ack::Ack
            }
            _ => Ack::Nak,
        }
    }

    fn read_byte(&mut self, _ack: Ack) -> u8 {
        // Released SDA reads as all ones.
        self.outgoing.pop_front().unwrap_or(0xFF)
    }

    fn stop(&mut self) {
        self.selected = None;
        self.outgoing.clear();
    }
}

fn temperature_from_celsius(celsius: f64) -> Temperature {
    let sixteenths = (celsius * 16.0).round().clamp(-4096.0, 4095.0);
    Temperature::from_sixteenths(sixteenths as i16)
}

/// Output line that only remembers and logs its level.
#[derive(Debug)]
pub struct SimulatedPin {
    name: &'static str,
    high: bool,
}

impl SimulatedPin {
    pub fn new(name: &'static str) -> Self {
        Self { name, high: false }
    }

    #[cfg(test)]
    pub fn is_high(&self) -> bool {
        self.high
    }
}

impl ErrorType for SimulatedPin {
    type Error = Infallible;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        debug!("{} -> low", self.name);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        debug!("{} -> high", self.name);
        Ok(())
    }
}
