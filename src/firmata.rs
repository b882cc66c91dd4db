use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;

use tracing::{debug, trace};

use crate::encoder::{decode_pairs, encode_two_7bit};
use crate::framing::{Message, MessageDecoder, encode_sysex};
use crate::protocol::{
    END_SYSEX, PinMode, REPORT_FIRMWARE, REPORT_VERSION, START_SYSEX, SYSTEM_RESET,
    encode_set_pin_mode,
};
#[cfg(feature = "serial")]
use crate::transport::serial::{SerialOptions, SerialTransport, SerialTransportError};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
pub enum FirmataError {
    Io(std::io::Error),
}

impl std::fmt::Display for FirmataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for FirmataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for FirmataError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// A capability module sharing the connection with other features.
///
/// Inbound messages are offered to features in registration order; the first
/// one returning `true` claims the message and later features never see it.
pub trait Feature: 'static {
    fn handle_sysex(&mut self, command: u8, payload: &[u8]) -> bool;

    fn handle_digital_port(&mut self, _port: u8, _value: u8) -> bool {
        false
    }

    /// Called once per [`Firmata::update`], whether or not a message arrived.
    fn update(&mut self) {}
}

trait AnyFeature: Feature {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<F: Feature> AnyFeature for F {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Typed reference to a feature registered with a [`Firmata`].
pub struct FeatureHandle<F> {
    index: usize,
    _feature: PhantomData<fn() -> F>,
}

impl<F> Clone for FeatureHandle<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for FeatureHandle<F> {}

impl<F> std::fmt::Debug for FeatureHandle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureHandle")
            .field("index", &self.index)
            .finish()
    }
}

/// Name and version reported by the board firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FirmataOptions {
    pub read_buffer_size: usize,
}

impl Default for FirmataOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Outbound half of the connection, handed to features while they emit.
pub struct Wire<T> {
    io: T,
}

impl<T: Write> Wire<T> {
    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.write_all(bytes)
    }

    pub fn start_sysex(&mut self) -> std::io::Result<()> {
        self.io.write_all(&[START_SYSEX])
    }

    pub fn end_sysex(&mut self) -> std::io::Result<()> {
        self.io.write_all(&[END_SYSEX])
    }

    pub fn send_two_7bit(&mut self, value: u16) -> std::io::Result<()> {
        self.io.write_all(&encode_two_7bit(value))
    }

    pub fn send_sysex(&mut self, command: u8, payload: &[u8]) -> std::io::Result<()> {
        self.io.write_all(&encode_sysex(command, payload))
    }
}

type UnrecognizedHook = Box<dyn FnMut(u8, &[u8])>;

pub struct Firmata<T> {
    wire: Wire<T>,
    decoder: MessageDecoder,
    read_buffer: Vec<u8>,
    features: Vec<Box<dyn AnyFeature>>,
    on_unrecognized: Option<UnrecognizedHook>,
    version: Option<(u8, u8)>,
    firmware: Option<Firmware>,
}

impl<T: Read + Write> Firmata<T> {
    pub fn new(io: T) -> Self {
        Self::with_options(io, FirmataOptions::default())
    }

    pub fn with_options(io: T, options: FirmataOptions) -> Self {
        Self {
            wire: Wire { io },
            decoder: MessageDecoder::new(),
            read_buffer: vec![0; options.read_buffer_size.max(1)],
            features: Vec::new(),
            on_unrecognized: None,
            version: None,
            firmware: None,
        }
    }

    pub fn into_inner(self) -> T {
        self.wire.io
    }

    pub fn transport(&self) -> &T {
        &self.wire.io
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.wire.io
    }

    pub fn register<F: Feature>(&mut self, feature: F) -> FeatureHandle<F> {
        self.features.push(Box::new(feature));
        FeatureHandle {
            index: self.features.len() - 1,
            _feature: PhantomData,
        }
    }

    /// # Panics
    ///
    /// Panics if `handle` does not name a feature of type `F` in this client.
    /// A handle from another `Firmata` that happens to hold the same feature
    /// type at the same position is not detected.
    pub fn feature<F: Feature>(&self, handle: FeatureHandle<F>) -> &F {
        match self
            .features
            .get(handle.index)
            .and_then(|f| f.as_any().downcast_ref::<F>())
        {
            Some(feature) => feature,
            None => panic!("feature handle {} does not belong to this client", handle.index),
        }
    }

    /// # Panics
    ///
    /// Panics if `handle` does not name a feature of type `F` in this client.
    /// A handle from another `Firmata` that happens to hold the same feature
    /// type at the same position is not detected.
    pub fn feature_mut<F: Feature>(&mut self, handle: FeatureHandle<F>) -> &mut F {
        self.split(handle).0
    }

    /// Borrows a feature together with the outbound wire.
    pub(crate) fn split<F: Feature>(&mut self, handle: FeatureHandle<F>) -> (&mut F, &mut Wire<T>) {
        match self
            .features
            .get_mut(handle.index)
            .and_then(|f| f.as_any_mut().downcast_mut::<F>())
        {
            Some(feature) => (feature, &mut self.wire),
            None => panic!("feature handle {} does not belong to this client", handle.index),
        }
    }

    /// Installs an observer for extended commands no feature claimed.
    pub fn on_unrecognized(&mut self, hook: impl FnMut(u8, &[u8]) + 'static) {
        self.on_unrecognized = Some(Box::new(hook));
    }

    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        self.version
    }

    pub fn firmware(&self) -> Option<&Firmware> {
        self.firmware.as_ref()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), FirmataError> {
        Ok(self.wire.write(bytes)?)
    }

    pub fn send_sysex(&mut self, command: u8, payload: &[u8]) -> Result<(), FirmataError> {
        Ok(self.wire.send_sysex(command, payload)?)
    }

    pub fn set_pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), FirmataError> {
        self.write(&encode_set_pin_mode(pin, mode))
    }

    pub fn request_version(&mut self) -> Result<(), FirmataError> {
        self.write(&[REPORT_VERSION])
    }

    pub fn query_firmware(&mut self) -> Result<(), FirmataError> {
        self.send_sysex(REPORT_FIRMWARE, &[])
    }

    pub fn reset(&mut self) -> Result<(), FirmataError> {
        self.write(&[SYSTEM_RESET])
    }

    /// Reads whatever the transport has ready, dispatches every completed
    /// message, then gives each feature its periodic `update`.
    ///
    /// Returns the number of messages dispatched. A read timeout or an empty
    /// read counts as "nothing available", not as an error.
    pub fn update(&mut self) -> Result<usize, FirmataError> {
        let read = match self.wire.io.read(&mut self.read_buffer) {
            Ok(read) => read,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(err) => return Err(err.into()),
        };

        let messages = self.decoder.push(&self.read_buffer[..read]);
        let count = messages.len();
        for message in messages {
            self.dispatch(message);
        }

        for feature in &mut self.features {
            feature.update();
        }

        Ok(count)
    }

    /// Offers an extended command to each feature until one claims it.
    pub fn dispatch_extended(&mut self, command: u8, payload: &[u8]) -> bool {
        if self
            .features
            .iter_mut()
            .any(|feature| feature.handle_sysex(command, payload))
        {
            return true;
        }

        debug!(command, len = payload.len(), "unclaimed extended command");
        if let Some(hook) = self.on_unrecognized.as_mut() {
            hook(command, payload);
        }
        false
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Digital { port, value } => {
                let value = (value & 0xFF) as u8;
                if !self
                    .features
                    .iter_mut()
                    .any(|feature| feature.handle_digital_port(port, value))
                {
                    trace!(port, value, "no feature tracks digital ports");
                }
            }
            Message::Version { major, minor } => {
                debug!(major, minor, "protocol version");
                self.version = Some((major, minor));
            }
            Message::Analog { pin, .. } => {
                trace!(pin, "ignoring analog report");
            }
            Message::Sysex { command, payload } => {
                if command == REPORT_FIRMWARE && payload.len() >= 2 {
                    let name = decode_pairs(&payload[2..])
                        .filter_map(|c| char::from_u32(u32::from(c)))
                        .collect();
                    self.firmware = Some(Firmware {
                        major: payload[0],
                        minor: payload[1],
                        name,
                    });
                    return;
                }
                self.dispatch_extended(command, &payload);
            }
        }
    }
}

#[cfg(feature = "serial")]
impl Firmata<SerialTransport> {
    pub fn open_serial(path: &str) -> Result<Self, SerialTransportError> {
        Ok(Self::new(SerialTransport::open(path)?))
    }

    pub fn open_serial_with(path: &str, options: &SerialOptions) -> Result<Self, SerialTransportError> {
        Ok(Self::new(SerialTransport::open_with(path, options)?))
    }

    /// Connects to the first board found on a USB serial port.
    pub fn detect_serial() -> Result<Self, SerialTransportError> {
        Ok(Self::new(SerialTransport::detect(&SerialOptions::default())?))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testing::MockTransport;

    struct Recorder {
        claims: u8,
        seen: Rc<RefCell<Vec<u8>>>,
        updates: Rc<RefCell<usize>>,
    }

    impl Recorder {
        fn new(claims: u8) -> (Self, Rc<RefCell<Vec<u8>>>, Rc<RefCell<usize>>) {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let updates = Rc::new(RefCell::new(0));
            let recorder = Self {
                claims,
                seen: Rc::clone(&seen),
                updates: Rc::clone(&updates),
            };
            (recorder, seen, updates)
        }
    }

    impl Feature for Recorder {
        fn handle_sysex(&mut self, command: u8, _payload: &[u8]) -> bool {
            self.seen.borrow_mut().push(command);
            command == self.claims
        }

        fn update(&mut self) {
            *self.updates.borrow_mut() += 1;
        }
    }

    #[test]
    fn first_claimer_stops_dispatch() {
        let mut firmata = Firmata::new(MockTransport::new());
        let (a, seen_a, _) = Recorder::new(0x10);
        let (b, seen_b, _) = Recorder::new(0x10);
        firmata.register(a);
        firmata.register(b);

        assert!(firmata.dispatch_extended(0x10, &[]));
        assert!(!firmata.dispatch_extended(0x11, &[]));

        assert_eq!(*seen_a.borrow(), vec![0x10, 0x11]);
        assert_eq!(*seen_b.borrow(), vec![0x11]);
    }

    #[test]
    fn unclaimed_commands_reach_hook() {
        let mut firmata = Firmata::new(MockTransport::new());
        let (a, _, _) = Recorder::new(0x10);
        firmata.register(a);

        let unrecognized = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&unrecognized);
        firmata.on_unrecognized(move |command, payload| {
            sink.borrow_mut().push((command, payload.to_vec()));
        });

        firmata.transport_mut().queue(&[0xF0, 0x10, 0xF7, 0xF0, 0x42, 0x01, 0xF7]);
        assert_eq!(firmata.update().expect("update"), 2);
        assert_eq!(firmata.transport().pending_chunks(), 0);

        assert_eq!(*unrecognized.borrow(), vec![(0x42, vec![0x01])]);
    }

    #[test]
    fn every_feature_updates_on_idle_pump() {
        let mut firmata = Firmata::new(MockTransport::new());
        let (a, _, updates_a) = Recorder::new(0x10);
        let (b, _, updates_b) = Recorder::new(0x11);
        firmata.register(a);
        firmata.register(b);

        assert_eq!(firmata.update().expect("update"), 0);
        assert_eq!(firmata.update().expect("update"), 0);

        assert_eq!(*updates_a.borrow(), 2);
        assert_eq!(*updates_b.borrow(), 2);
    }

    #[test]
    fn writes_go_straight_to_transport() {
        let mut firmata = Firmata::new(MockTransport::new());
        firmata.set_pin_mode(13, PinMode::Output).expect("pin mode");
        firmata.request_version().expect("version");
        firmata.query_firmware().expect("firmware");

        assert_eq!(
            firmata.transport_mut().take_sent(),
            vec![0xF4, 13, 0x01, 0xF9, 0xF0, 0x79, 0xF7]
        );
    }

    #[test]
    fn records_version_and_firmware() {
        let mut firmata = Firmata::new(MockTransport::new());
        firmata
            .transport_mut()
            .queue(&[0xF9, 2, 5, 0xF0, 0x79, 2, 5, b'O', 0, b'K', 0, 0xF7]);

        firmata.update().expect("update");

        assert_eq!(firmata.protocol_version(), Some((2, 5)));
        assert_eq!(
            firmata.firmware(),
            Some(&Firmware {
                major: 2,
                minor: 5,
                name: "OK".to_string(),
            })
        );
    }

    #[test]
    fn read_timeouts_are_not_errors() {
        struct TimingOut;

        impl Read for TimingOut {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::TimedOut, "no data"))
            }
        }

        impl Write for TimingOut {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut firmata = Firmata::new(TimingOut);
        assert_eq!(firmata.update().expect("timeout is idle"), 0);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_handle_panics() {
        let mut other = Firmata::new(MockTransport::new());
        let (a, _, _) = Recorder::new(0x10);
        let handle = other.register(a);

        let firmata = Firmata::new(MockTransport::new());
        let _ = firmata.feature(handle);
    }
}
