/// Acknowledge bit on the two-wire bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nak,
}

impl Ack {
    pub fn is_ack(self) -> bool {
        self == Self::Ack
    }
}

/// Transfer direction encoded in the address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
}

impl Direction {
    /// Address byte as clocked onto the wire (7-bit address, R/W in bit 0).
    pub fn address_byte(self, address: u8) -> u8 {
        let rw = match self {
            Self::Write => 0,
            Self::Read => 1,
        };
        (address << 1) | rw
    }
}

/// Byte-level primitives of a two-wire (I2C style) bus master.
///
/// Implementations are synchronous and bounded; a missing device shows up as
/// [`Ack::Nak`] from [`TwoWireBus::start`], never as a hang.
pub trait TwoWireBus {
    /// Issue a (repeated) start condition and clock out the address byte.
    fn start(&mut self, address: u8, direction: Direction) -> Ack;

    fn send_byte(&mut self, byte: u8) -> Ack;

    /// Clock in one byte, answering with `ack` (`Ack` when more data is
    /// expected, `Nak` to end the read).
    fn read_byte(&mut self, ack: Ack) -> u8;

    fn stop(&mut self);
}

impl<T: TwoWireBus + ?Sized> TwoWireBus for &mut T {
    fn start(&mut self, address: u8, direction: Direction) -> Ack {
        (**self).start(address, direction)
    }

    fn send_byte(&mut self, byte: u8) -> Ack {
        (**self).send_byte(byte)
    }

    fn read_byte(&mut self, ack: Ack) -> u8 {
        (**self).read_byte(ack)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_carries_direction_bit() {
        assert_eq!(Direction::Write.address_byte(0x1F), 0x3E);
        assert_eq!(Direction::Read.address_byte(0x1F), 0x3F);
    }
}
