//! Digital port state and interrupt emulation.
//!
//! The board reports whole ports (8 pins) whenever a watched input changes.
//! Edge-triggered interrupts are emulated by comparing each report against the
//! last level seen on every interrupt-capable pin of port 0 that has a callback.

use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::board::BoardLayout;
use crate::firmata::{Feature, FeatureHandle, Firmata, Wire};
use crate::protocol::{
    InterruptMode, PORT_COUNT, PINS_PER_PORT, PinMode, encode_report_digital,
    encode_set_digital_pin_value, encode_set_pin_mode,
};

/// Highest addressable pin is `MAX_PINS - 1`.
pub const MAX_PINS: usize = PORT_COUNT * PINS_PER_PORT as usize;

pub type InterruptCallback = Box<dyn FnMut()>;

#[derive(Debug)]
pub enum DigitalError {
    Io(std::io::Error),
    InvalidPin(u8),
    NoSuchInterrupt { line: usize, lines: usize },
}

impl std::fmt::Display for DigitalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::InvalidPin(pin) => write!(f, "pin {pin} is outside the {MAX_PINS} addressable pins"),
            Self::NoSuchInterrupt { line, lines } => {
                write!(f, "interrupt line {line} does not exist; board has {lines}")
            }
        }
    }
}

impl std::error::Error for DigitalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::InvalidPin(_) | Self::NoSuchInterrupt { .. } => None,
        }
    }
}

impl From<std::io::Error> for DigitalError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Default)]
struct InterruptSlot {
    mode: InterruptMode,
    level: bool,
    pending: bool,
    callback: Option<InterruptCallback>,
}

impl std::fmt::Debug for InterruptSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptSlot")
            .field("mode", &self.mode)
            .field("level", &self.level)
            .field("pending", &self.pending)
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct DigitalPortFeature {
    layout: BoardLayout,
    ports: [u8; PORT_COUNT],
    reporting: [bool; PORT_COUNT],
    slots: Vec<InterruptSlot>,
    interrupts_enabled: bool,
}

impl Default for DigitalPortFeature {
    fn default() -> Self {
        Self::new(BoardLayout::default())
    }
}

impl DigitalPortFeature {
    pub fn new(layout: BoardLayout) -> Self {
        Self {
            layout,
            ports: [0; PORT_COUNT],
            reporting: [false; PORT_COUNT],
            slots: (0..layout.interrupt_lines())
                .map(|_| InterruptSlot::default())
                .collect(),
            interrupts_enabled: true,
        }
    }

    pub fn layout(&self) -> &BoardLayout {
        &self.layout
    }

    /// Configures `pin` and, the first time any pin of its port is touched,
    /// asks the board to start reporting that port.
    pub fn set_pin_mode<T: Write>(
        &mut self,
        wire: &mut Wire<T>,
        pin: u8,
        mode: PinMode,
    ) -> Result<(), DigitalError> {
        check_pin(pin)?;
        wire.write(&encode_set_pin_mode(pin, mode))?;

        let port = BoardLayout::port_for_pin(pin);
        if !self.reporting[usize::from(port)] {
            wire.write(&encode_report_digital(port, true))?;
            self.reporting[usize::from(port)] = true;
            debug!(port, "enabled digital port reporting");
        }
        Ok(())
    }

    pub fn digital_write<T: Write>(
        &mut self,
        wire: &mut Wire<T>,
        pin: u8,
        level: bool,
    ) -> Result<(), DigitalError> {
        check_pin(pin)?;
        wire.write(&encode_set_digital_pin_value(pin, level))?;
        Ok(())
    }

    pub fn pin_value(&self, pin: u8) -> bool {
        let port = BoardLayout::port_for_pin(pin);
        self.ports[usize::from(port)] & BoardLayout::bit_for_pin(pin) != 0
    }

    pub fn port_value(&self, port: u8) -> Option<u8> {
        self.ports.get(usize::from(port)).copied()
    }

    pub fn is_reporting(&self, port: u8) -> bool {
        self.reporting.get(usize::from(port)).copied().unwrap_or(false)
    }

    /// Stores an inbound port report and runs interrupt detection on port 0.
    pub fn set_digital_port(&mut self, port: u8, value: u8) {
        let Some(stored) = self.ports.get_mut(usize::from(port)) else {
            trace!(port, "ignoring report for untracked port");
            return;
        };
        *stored = value;

        if port != 0 {
            return;
        }

        for pin in 0..PINS_PER_PORT {
            let Some(line) = self.layout.interrupt_for_pin(pin) else {
                continue;
            };
            let Some(slot) = self.slots.get_mut(line) else {
                continue;
            };

            let Some(callback) = slot.callback.as_mut() else {
                continue;
            };
            let level = value & BoardLayout::bit_for_pin(pin) != 0;
            let previous = core::mem::replace(&mut slot.level, level);
            let triggered = slot.mode.triggers(previous, level);

            if !triggered {
                continue;
            }
            if self.interrupts_enabled {
                trace!(pin, line, "interrupt fired");
                callback();
            } else {
                trace!(pin, line, "interrupt deferred");
                slot.pending = true;
            }
        }
    }

    pub fn attach_interrupt(
        &mut self,
        line: usize,
        mode: InterruptMode,
        callback: impl FnMut() + 'static,
    ) -> Result<(), DigitalError> {
        let slot = self.slot_mut(line)?;
        slot.mode = mode;
        slot.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Removes the callback and resets the trigger mode and pending flag with
    /// it. The last level seen while attached is kept.
    pub fn detach_interrupt(&mut self, line: usize) -> Result<(), DigitalError> {
        let slot = self.slot_mut(line)?;
        slot.callback = None;
        slot.mode = InterruptMode::default();
        slot.pending = false;
        Ok(())
    }

    /// Enables delivery and flushes every pending interrupt in pin order.
    pub fn interrupts(&mut self) {
        self.interrupts_enabled = true;

        for pin in 0..PINS_PER_PORT {
            let Some(line) = self.layout.interrupt_for_pin(pin) else {
                continue;
            };
            let Some(slot) = self.slots.get_mut(line) else {
                continue;
            };
            if !slot.pending {
                continue;
            }
            if let Some(callback) = slot.callback.as_mut() {
                slot.pending = false;
                callback();
            }
        }
    }

    pub fn no_interrupts(&mut self) {
        self.interrupts_enabled = false;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    pub fn is_pending(&self, line: usize) -> bool {
        self.slots.get(line).is_some_and(|slot| slot.pending)
    }

    pub fn interrupt_mode(&self, line: usize) -> Option<InterruptMode> {
        self.slots.get(line).map(|slot| slot.mode)
    }

    fn slot_mut(&mut self, line: usize) -> Result<&mut InterruptSlot, DigitalError> {
        let lines = self.slots.len();
        self.slots
            .get_mut(line)
            .ok_or(DigitalError::NoSuchInterrupt { line, lines })
    }
}

impl Feature for DigitalPortFeature {
    fn handle_sysex(&mut self, _command: u8, _payload: &[u8]) -> bool {
        false
    }

    fn handle_digital_port(&mut self, port: u8, value: u8) -> bool {
        self.set_digital_port(port, value);
        true
    }
}

fn check_pin(pin: u8) -> Result<(), DigitalError> {
    if usize::from(pin) < MAX_PINS {
        Ok(())
    } else {
        Err(DigitalError::InvalidPin(pin))
    }
}

/// Handle to a registered [`DigitalPortFeature`].
pub type Digital = FeatureHandle<DigitalPortFeature>;

impl FeatureHandle<DigitalPortFeature> {
    pub fn set_pin_mode<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        pin: u8,
        mode: PinMode,
    ) -> Result<(), DigitalError> {
        let (feature, wire) = firmata.split(self);
        feature.set_pin_mode(wire, pin, mode)
    }

    pub fn digital_write<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        pin: u8,
        level: bool,
    ) -> Result<(), DigitalError> {
        let (feature, wire) = firmata.split(self);
        feature.digital_write(wire, pin, level)
    }

    pub fn pin_value<T: Read + Write>(self, firmata: &Firmata<T>, pin: u8) -> bool {
        firmata.feature(self).pin_value(pin)
    }

    pub fn attach_interrupt<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        line: usize,
        mode: InterruptMode,
        callback: impl FnMut() + 'static,
    ) -> Result<(), DigitalError> {
        firmata
            .feature_mut(self)
            .attach_interrupt(line, mode, callback)
    }

    pub fn detach_interrupt<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        line: usize,
    ) -> Result<(), DigitalError> {
        firmata.feature_mut(self).detach_interrupt(line)
    }

    pub fn interrupts<T: Read + Write>(self, firmata: &mut Firmata<T>) {
        firmata.feature_mut(self).interrupts();
    }

    pub fn no_interrupts<T: Read + Write>(self, firmata: &mut Firmata<T>) {
        firmata.feature_mut(self).no_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::testing::MockTransport;

    fn counter() -> (Rc<Cell<usize>>, impl FnMut() + 'static) {
        let count = Rc::new(Cell::new(0));
        let inner = Rc::clone(&count);
        (count, move || inner.set(inner.get() + 1))
    }

    #[test]
    fn pin_values_follow_port_bits() {
        let mut digital = DigitalPortFeature::default();
        for port in 0..PORT_COUNT as u8 {
            let value = port.wrapping_mul(37) ^ 0xA5;
            digital.set_digital_port(port, value);
            for bit in 0..PINS_PER_PORT {
                let pin = port * PINS_PER_PORT + bit;
                assert_eq!(digital.pin_value(pin), value & (1 << bit) != 0, "pin {pin}");
            }
        }
    }

    #[test]
    fn out_of_range_port_is_ignored() {
        let mut digital = DigitalPortFeature::default();
        digital.set_digital_port(16, 0xFF);
        assert!((0..16).all(|port| digital.port_value(port) == Some(0)));
    }

    #[test]
    fn change_fires_on_every_flip() {
        let mut digital = DigitalPortFeature::default();
        let (count, callback) = counter();
        digital
            .attach_interrupt(0, InterruptMode::Change, callback)
            .expect("line 0");

        for value in [0x04, 0x04, 0x00, 0x00, 0x04, 0x00] {
            digital.set_digital_port(0, value);
        }
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn rising_and_falling_fire_on_their_edge_only() {
        let mut digital = DigitalPortFeature::default();
        let (rising, on_rise) = counter();
        let (falling, on_fall) = counter();
        digital
            .attach_interrupt(0, InterruptMode::Rising, on_rise)
            .expect("line 0");
        digital
            .attach_interrupt(1, InterruptMode::Falling, on_fall)
            .expect("line 1");

        // pin 2 -> line 0, pin 3 -> line 1
        for value in [0x0C, 0x0C, 0x00, 0x04, 0x08, 0x00] {
            digital.set_digital_port(0, value);
        }
        assert_eq!(rising.get(), 2);
        assert_eq!(falling.get(), 2);
    }

    #[test]
    fn level_is_only_tracked_while_attached() {
        let mut digital = DigitalPortFeature::default();
        digital.set_digital_port(0, 0x04);

        let (count, callback) = counter();
        digital
            .attach_interrupt(0, InterruptMode::Change, callback)
            .expect("line 0");
        digital.set_digital_port(0, 0x04);
        assert_eq!(count.get(), 1);

        digital.set_digital_port(0, 0x04);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn other_ports_never_fire() {
        let mut digital = DigitalPortFeature::default();
        let (count, callback) = counter();
        digital
            .attach_interrupt(0, InterruptMode::Change, callback)
            .expect("line 0");

        digital.set_digital_port(1, 0x04);
        digital.set_digital_port(1, 0x00);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn disabled_interrupts_are_delivered_once_on_enable() {
        let mut digital = DigitalPortFeature::default();
        let (count, callback) = counter();
        digital
            .attach_interrupt(1, InterruptMode::Rising, callback)
            .expect("line 1");

        digital.no_interrupts();
        digital.set_digital_port(0, 0x08);
        digital.set_digital_port(0, 0x00);
        digital.set_digital_port(0, 0x08);
        assert_eq!(count.get(), 0);
        assert!(digital.is_pending(1));

        digital.interrupts();
        assert_eq!(count.get(), 1);
        assert!(!digital.is_pending(1));

        digital.interrupts();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn pending_flush_runs_in_pin_order() {
        let mut digital = DigitalPortFeature::new(BoardLayout::identity(8));
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        for line in [5, 1, 3] {
            let order = Rc::clone(&order);
            digital
                .attach_interrupt(line, InterruptMode::Change, move || order.borrow_mut().push(line))
                .expect("line");
        }

        digital.no_interrupts();
        digital.set_digital_port(0, 0b0010_1010);
        digital.interrupts();

        assert_eq!(*order.borrow(), vec![1, 3, 5]);
    }

    #[test]
    fn detach_resets_mode_and_pending() {
        let mut digital = DigitalPortFeature::default();
        let (count, callback) = counter();
        digital
            .attach_interrupt(0, InterruptMode::Falling, callback)
            .expect("line 0");
        digital.no_interrupts();
        digital.set_digital_port(0, 0x04);
        digital.set_digital_port(0, 0x00);
        assert!(digital.is_pending(0));

        digital.detach_interrupt(0).expect("line 0");
        assert!(!digital.is_pending(0));
        assert_eq!(digital.interrupt_mode(0), Some(InterruptMode::Change));

        digital.interrupts();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn unknown_line_is_an_error() {
        let mut digital = DigitalPortFeature::default();
        let err = digital
            .attach_interrupt(2, InterruptMode::Change, || {})
            .expect_err("uno has two lines");
        assert!(matches!(err, DigitalError::NoSuchInterrupt { line: 2, lines: 2 }));
    }

    #[test]
    fn pin_mode_announces_each_port_once() {
        let mut firmata = Firmata::new(MockTransport::new());
        let digital = firmata.register(DigitalPortFeature::default());

        digital.set_pin_mode(&mut firmata, 2, PinMode::Input).expect("pin 2");
        digital.set_pin_mode(&mut firmata, 3, PinMode::Input).expect("pin 3");
        digital.set_pin_mode(&mut firmata, 13, PinMode::Output).expect("pin 13");

        assert_eq!(
            firmata.transport_mut().take_sent(),
            vec![0xF4, 2, 0x00, 0xD0, 1, 0xF4, 3, 0x00, 0xF4, 13, 0x01, 0xD1, 1]
        );
        assert!(firmata.feature(digital).is_reporting(0));
        assert!(firmata.feature(digital).is_reporting(1));
        assert!(!firmata.feature(digital).is_reporting(2));
    }

    #[test]
    fn rejects_pins_beyond_last_port() {
        let mut firmata = Firmata::new(MockTransport::new());
        let digital = firmata.register(DigitalPortFeature::default());

        let err = digital
            .set_pin_mode(&mut firmata, 128, PinMode::Input)
            .expect_err("pin 128");
        assert!(matches!(err, DigitalError::InvalidPin(128)));
        assert!(firmata.transport_mut().take_sent().is_empty());
    }

    #[test]
    fn digital_write_sends_pin_value() {
        let mut firmata = Firmata::new(MockTransport::new());
        let digital = firmata.register(DigitalPortFeature::default());

        digital.digital_write(&mut firmata, 13, true).expect("write");
        assert_eq!(firmata.transport_mut().take_sent(), vec![0xF5, 13, 1]);
    }

    #[test]
    fn inbound_digital_messages_drive_interrupts() {
        let mut firmata = Firmata::new(MockTransport::new());
        let digital = firmata.register(DigitalPortFeature::default());
        let (count, callback) = counter();
        digital
            .attach_interrupt(&mut firmata, 0, InterruptMode::Rising, callback)
            .expect("line 0");

        firmata.transport_mut().queue(&[0x90, 0x04, 0x00, 0x90, 0x00, 0x00, 0x90, 0x04, 0x00]);
        firmata.update().expect("update");

        assert_eq!(count.get(), 2);
        assert!(digital.pin_value(&firmata, 2));
    }
}
