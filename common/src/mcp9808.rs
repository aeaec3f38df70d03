//! MCP9808 ambient temperature readout.
//!
//! The ambient register is 13-bit sign-magnitude: bit 12 of the 16-bit word is
//! the sign, bits 11..0 are the magnitude in 1/16 °C. Bits 15..13 carry alarm
//! flags and are ignored.

use core::fmt;

use crate::bus::{Ack, Direction, TwoWireBus};

pub const AMBIENT_TEMPERATURE_REGISTER: u8 = 0x05;

const UPPER_MASK: u8 = 0x1F;
const SIGN_BIT: u8 = 0x10;
const SIXTEENTHS_PER_DEGREE: i16 = 16;
const NEGATIVE_OFFSET: i16 = 256 * SIXTEENTHS_PER_DEGREE;

/// Signed fixed-point temperature with 1/16 °C resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Temperature {
    sixteenths: i16,
}

impl Temperature {
    pub const fn from_sixteenths(sixteenths: i16) -> Self {
        Self { sixteenths }
    }

    pub fn sixteenths(self) -> i16 {
        self.sixteenths
    }

    /// Whole degrees, truncated toward negative infinity.
    pub fn whole_degrees(self) -> i16 {
        self.sixteenths.div_euclid(SIXTEENTHS_PER_DEGREE)
    }

    pub fn celsius(self) -> f64 {
        f64::from(self.sixteenths) / f64::from(SIXTEENTHS_PER_DEGREE)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.celsius())
    }
}

/// Decode the two ambient register bytes as read off the bus.
pub fn decode_ambient(upper: u8, lower: u8) -> Temperature {
    let upper = upper & UPPER_MASK;
    let magnitude = i16::from(upper & !SIGN_BIT) * 256 + i16::from(lower);

    if upper & SIGN_BIT != 0 {
        Temperature::from_sixteenths(magnitude - NEGATIVE_OFFSET)
    } else {
        Temperature::from_sixteenths(magnitude)
    }
}

/// Run the fixed read sequence against the sensor at `address`.
///
/// Returns `None` as soon as either start condition is not acknowledged; the
/// caller treats that as "no sample this cycle".
pub fn read_temperature<B: TwoWireBus>(bus: &mut B, address: u8) -> Option<Temperature> {
    if !bus.start(address, Direction::Write).is_ack() {
        return None;
    }
    bus.send_byte(AMBIENT_TEMPERATURE_REGISTER);

    if !bus.start(address, Direction::Read).is_ack() {
        return None;
    }
    let upper = bus.read_byte(Ack::Ack);
    let lower = bus.read_byte(Ack::Nak);
    bus.stop();

    Some(decode_ambient(upper, lower))
}

/// Register bytes the sensor would report for `temperature`.
///
/// Inverse of [`decode_ambient`] for values the sensor can represent; used by
/// simulated buses.
pub fn encode_ambient(temperature: Temperature) -> (u8, u8) {
    let raw = if temperature.sixteenths < 0 {
        (temperature.sixteenths + NEGATIVE_OFFSET) as u16 | (u16::from(SIGN_BIT) << 8)
    } else {
        temperature.sixteenths as u16
    };
    let raw = raw & 0x1FFF;
    ((raw >> 8) as u8, (raw & 0xFF) as u8)
}
