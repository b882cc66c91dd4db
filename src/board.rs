//! Static pin layout of the remote board.

use crate::protocol::PINS_PER_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMapping {
    /// Explicit pin per line, indexed by line number.
    Pins(&'static [u8]),
    /// Pin N drives line N for N below the line count.
    Identity,
}

/// Pin to port and pin to interrupt-line mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardLayout {
    interrupt_lines: usize,
    mapping: InterruptMapping,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::uno()
    }
}

impl BoardLayout {
    /// ATmega328 boards: pin 2 on line 0, pin 3 on line 1.
    pub const fn uno() -> Self {
        Self {
            interrupt_lines: 2,
            mapping: InterruptMapping::Pins(&[2, 3]),
        }
    }

    /// Boards where every pin below `lines` can raise an interrupt on the line
    /// of the same number.
    pub const fn identity(lines: usize) -> Self {
        Self {
            interrupt_lines: lines,
            mapping: InterruptMapping::Identity,
        }
    }

    pub fn interrupt_lines(&self) -> usize {
        self.interrupt_lines
    }

    pub fn interrupt_for_pin(&self, pin: u8) -> Option<usize> {
        match self.mapping {
            InterruptMapping::Pins(pins) => pins.iter().position(|&p| p == pin),
            InterruptMapping::Identity => {
                let line = usize::from(pin);
                (line < self.interrupt_lines).then_some(line)
            }
        }
    }

    pub fn port_for_pin(pin: u8) -> u8 {
        (pin / PINS_PER_PORT) & 0x0F
    }

    pub fn bit_for_pin(pin: u8) -> u8 {
        1 << (pin % PINS_PER_PORT)
    }
}
