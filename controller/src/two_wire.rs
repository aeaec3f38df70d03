use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, InputOutput, Pin, PinDriver, Pull},
};
use log::{info, warn};

use heater_common::{Ack, Direction, TwoWireBus};

/// Half an SCL period, roughly 100 kHz.
const HALF_PERIOD_US: u32 = 5;
/// Longest a slave may hold SCL low before we carry on anyway.
const CLOCK_STRETCH_LIMIT_US: u32 = 1_000;

/// Software two-wire master on two open-drain GPIOs with pull-ups.
pub struct BitBangBus {
    sda: PinDriver<'static, AnyIOPin, InputOutput>,
    scl: PinDriver<'static, AnyIOPin, InputOutput>,
    sda_gpio: i32,
    scl_gpio: i32,
    started: bool,
}

impl BitBangBus {
    /// Releases both lines; the bus is idle afterwards.
    pub fn new(sda: AnyIOPin, scl: AnyIOPin) -> anyhow::Result<Self> {
        let sda_gpio = sda.pin();
        let scl_gpio = scl.pin();

        let mut sda = PinDriver::input_output_od(sda)?;
        sda.set_pull(Pull::Up)?;
        sda.set_high()?;

        let mut scl = PinDriver::input_output_od(scl)?;
        scl.set_pull(Pull::Up)?;
        scl.set_high()?;

        info!("two-wire bus ready on SDA GPIO{sda_gpio} / SCL GPIO{scl_gpio}");
        Ok(Self {
            sda,
            scl,
            sda_gpio,
            scl_gpio,
            started: false,
        })
    }

    fn half_period() {
        Ets::delay_us(HALF_PERIOD_US);
    }

    fn set_sda(&mut self, high: bool) {
        let result = if high {
            self.sda.set_high()
        } else {
            self.sda.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive SDA GPIO{}: {err}", self.sda_gpio);
        }
    }

    fn scl_low(&mut self) {
        if let Err(err) = self.scl.set_low() {
            warn!("failed to drive SCL GPIO{}: {err}", self.scl_gpio);
        }
    }

    fn scl_high(&mut self) {
        if let Err(err) = self.scl.set_high() {
            warn!("failed to release SCL GPIO{}: {err}", self.scl_gpio);
            return;
        }
        for _ in 0..CLOCK_STRETCH_LIMIT_US {
            if self.scl.is_high() {
                return;
            }
            Ets::delay_us(1);
        }
    }

    fn write_bit(&mut self, bit: bool) {
        self.set_sda(bit);
        Self::half_period();
        self.scl_high();
        Self::half_period();
        self.scl_low();
    }

    fn read_bit(&mut self) -> bool {
        self.set_sda(true);
        Self::half_period();
        self.scl_high();
        Self::half_period();
        let bit = self.sda.is_high();
        self.scl_low();
        bit
    }
}

impl TwoWireBus for BitBangBus {
    fn start(&mut self, address: u8, direction: Direction) -> Ack {
        if self.started {
            // Repeated start: bring both lines back up first.
            self.set_sda(true);
            Self::half_period();
            self.scl_high();
            Self::half_period();
        }
        self.set_sda(false);
        Self::half_period();
        self.scl_low();
        self.started = true;

        self.send_byte(direction.address_byte(address))
    }

    fn send_byte(&mut self, byte: u8) -> Ack {
        for shift in (0..8).rev() {
            self.write_bit((byte >> shift) & 1 == 1);
        }
        if self.read_bit() {
            Ack::Nak
        } else {
            Ack::Ack
        }
    }

    fn read_byte(&mut self, ack: Ack) -> u8 {
        let mut byte = 0_u8;
        for _ in 0..8 {
            byte = (byte << 1) | u8::from(self.read_bit());
        }
        self.write_bit(!ack.is_ack());
        byte
    }

    fn stop(&mut self) {
        self.set_sda(false);
        Self::half_period();
        self.scl_high();
        Self::half_period();
        self.set_sda(true);
        Self::half_period();
        self.started = false;
    }
}
