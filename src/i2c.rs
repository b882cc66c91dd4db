//! I2C transactions tunnelled through sysex.
//!
//! Requests carry a 2-bit request id that the board echoes in its reply. By
//! default every request carries [`SENTINEL_REQUEST_ID`] and only one read may
//! be outstanding. With [`RequestIdMode::Sequential`] ids increase and wrap,
//! each id owns one slot of a small arena, and up to [`MAX_PENDING`] reads can
//! be in flight. A blocking read pumps the client until its slot completes or
//! the reply timeout expires.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::encoder::{decode_pairs, decode_two_7bit};
use crate::firmata::{Feature, FeatureHandle, Firmata, FirmataError, Wire};
use crate::protocol::{
    I2C_REPLY, I2C_REQUEST, I2C_REQUEST_ID_MASK, I2cAddressMode, I2cRestart, I2cTransferMode,
    encode_i2c_config, i2c_config_byte,
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CLOCK_HZ: u32 = 100_000;
/// Pin value telling the board to keep its default SCL/SDA pins.
pub const DEFAULT_PIN: u8 = 0x7F;
pub const MAX_PENDING: usize = I2C_REQUEST_ID_MASK as usize + 1;
/// Id carried by every request in [`RequestIdMode::Fixed`].
pub const SENTINEL_REQUEST_ID: u8 = 0;

/// How request ids are assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestIdMode {
    /// Every request carries [`SENTINEL_REQUEST_ID`].
    #[default]
    Fixed,
    /// Ids increase per request and wrap at the 2-bit field width.
    Sequential,
}

/// Request id echoed back by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u8);

impl RequestId {
    pub fn value(self) -> u8 {
        self.0
    }
}

#[derive(Debug)]
pub enum I2cError {
    Io(std::io::Error),
    Firmata(FirmataError),
    Timeout { address: u8, request_id: RequestId },
    TooManyPending,
    BufferTooSmall { needed: usize, len: usize },
}

impl std::fmt::Display for I2cError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Firmata(err) => write!(f, "client error: {err}"),
            Self::Timeout {
                address,
                request_id,
            } => write!(
                f,
                "no I2C reply from {address:#04x} (request {})",
                request_id.value()
            ),
            Self::TooManyPending => write!(f, "all {MAX_PENDING} I2C request slots are in use"),
            Self::BufferTooSmall { needed, len } => {
                write!(f, "input buffer holds {len} bytes, read needs {needed}")
            }
        }
    }
}

impl std::error::Error for I2cError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Firmata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for I2cError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<FirmataError> for I2cError {
    fn from(value: FirmataError) -> Self {
        Self::Firmata(value)
    }
}

/// Why an `I2C_REPLY` was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    NotAwaiting,
    TooShort { len: usize },
    UnknownRequestId(u8),
    AddressMismatch { expected: u8, actual: u8 },
    BadLength { len: usize, max: usize },
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAwaiting => write!(f, "not awaiting a reply"),
            Self::TooShort { len } => write!(f, "reply payload of {len} bytes has no address and id"),
            Self::UnknownRequestId(id) => write!(f, "unknown request id {id}"),
            Self::AddressMismatch { expected, actual } => {
                write!(f, "reply from {actual:#04x}, expected {expected:#04x}")
            }
            Self::BadLength { len, max } => {
                write!(f, "reply payload of {len} bytes; expected an even count of 4..={max}")
            }
        }
    }
}

impl std::error::Error for ReplyError {}

#[derive(Debug, Clone)]
pub struct I2cConfig {
    pub delay_us: u16,
    pub clock_hz: u32,
    pub scl_pin: u8,
    pub sda_pin: u8,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            delay_us: 0,
            clock_hz: DEFAULT_CLOCK_HZ,
            scl_pin: DEFAULT_PIN,
            sda_pin: DEFAULT_PIN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct I2cOptions {
    pub reply_timeout: Duration,
    pub request_ids: RequestIdMode,
}

impl Default for I2cOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            request_ids: RequestIdMode::default(),
        }
    }
}

/// One addressed transaction.
#[derive(Debug, Clone)]
pub struct I2cRequest<'a> {
    pub address: u8,
    pub restart: I2cRestart,
    pub transfer: I2cTransferMode,
    pub data: &'a [u8],
    pub register: Option<u16>,
    pub read_len: u8,
}

impl<'a> I2cRequest<'a> {
    pub fn write(address: u8, data: &'a [u8]) -> Self {
        Self::new(address, I2cTransferMode::Write, data, None, 0)
    }

    pub fn read(address: u8, read_len: u8) -> Self {
        Self::new(address, I2cTransferMode::Read, &[], None, read_len)
    }

    pub fn read_register(address: u8, register: u16, read_len: u8) -> Self {
        Self::new(address, I2cTransferMode::Read, &[], Some(register), read_len)
    }

    pub fn read_continuously(address: u8, register: Option<u16>, read_len: u8) -> Self {
        Self::new(
            address,
            I2cTransferMode::ReadContinuously,
            &[],
            register,
            read_len,
        )
    }

    pub fn stop_reading(address: u8) -> Self {
        Self::new(address, I2cTransferMode::StopReading, &[], None, 0)
    }

    pub fn with_restart(mut self, restart: I2cRestart) -> Self {
        self.restart = restart;
        self
    }

    fn new(
        address: u8,
        transfer: I2cTransferMode,
        data: &'a [u8],
        register: Option<u16>,
        read_len: u8,
    ) -> Self {
        Self {
            address: address & 0x7F,
            restart: I2cRestart::Restart,
            transfer,
            data,
            register,
            read_len,
        }
    }
}

#[derive(Debug)]
struct PendingRead {
    address: u8,
    expected: usize,
    register: Option<u16>,
    received: Option<Vec<u8>>,
}

impl PendingRead {
    fn awaiting(&self) -> bool {
        self.received.is_none()
    }
}

#[derive(Debug, Default)]
pub struct I2cFeature {
    options: I2cOptions,
    next_request_id: u8,
    pending: [Option<PendingRead>; MAX_PENDING],
}

impl I2cFeature {
    pub fn new(options: I2cOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &I2cOptions {
        &self.options
    }

    pub fn config<T: Write>(&mut self, wire: &mut Wire<T>, config: &I2cConfig) -> Result<(), I2cError> {
        wire.write(&encode_i2c_config(
            config.delay_us,
            config.clock_hz,
            config.scl_pin,
            config.sda_pin,
        ))?;
        Ok(())
    }

    /// Sends `request` and, for a plain read, reserves the slot its reply will
    /// land in.
    pub fn send<T: Write>(
        &mut self,
        wire: &mut Wire<T>,
        request: &I2cRequest<'_>,
    ) -> Result<RequestId, I2cError> {
        let id = match self.options.request_ids {
            RequestIdMode::Fixed => SENTINEL_REQUEST_ID,
            RequestIdMode::Sequential => self.next_request_id,
        };
        let tracks_reply = request.transfer == I2cTransferMode::Read;
        if tracks_reply && self.pending[usize::from(id)].is_some() {
            return Err(I2cError::TooManyPending);
        }

        let config = i2c_config_byte(
            request.restart,
            I2cAddressMode::SevenBit,
            request.transfer,
            id,
        );
        wire.start_sysex()?;
        wire.write(&[I2C_REQUEST, request.address & 0x7F, config])?;
        match request.transfer {
            I2cTransferMode::Write => {
                for &b in request.data {
                    wire.send_two_7bit(u16::from(b))?;
                }
            }
            I2cTransferMode::Read | I2cTransferMode::ReadContinuously => {
                if let Some(register) = request.register {
                    wire.send_two_7bit(register)?;
                }
                wire.send_two_7bit(u16::from(request.read_len))?;
            }
            I2cTransferMode::StopReading => {}
        }
        wire.end_sysex()?;

        if self.options.request_ids == RequestIdMode::Sequential {
            self.next_request_id = id.wrapping_add(1) & I2C_REQUEST_ID_MASK;
        }
        if tracks_reply {
            self.pending[usize::from(id)] = Some(PendingRead {
                address: request.address & 0x7F,
                expected: usize::from(request.read_len),
                register: request.register,
                received: None,
            });
        }
        debug!(
            address = request.address,
            transfer = %request.transfer,
            request_id = id,
            "sent I2C request"
        );
        Ok(RequestId(id))
    }

    /// Takes the bytes of a completed read, freeing its slot.
    pub fn take_completed(&mut self, id: RequestId) -> Option<Vec<u8>> {
        let slot = self.pending.get_mut(usize::from(id.0))?;
        if slot.as_ref().is_some_and(PendingRead::awaiting) {
            return None;
        }
        slot.take().and_then(|pending| pending.received)
    }

    /// Abandons a read; a late reply for it is dropped as unknown.
    pub fn cancel(&mut self, id: RequestId) {
        if let Some(slot) = self.pending.get_mut(usize::from(id.0)) {
            *slot = None;
        }
    }

    pub fn is_awaiting(&self, id: RequestId) -> bool {
        self.pending
            .get(usize::from(id.0))
            .and_then(Option::as_ref)
            .is_some_and(PendingRead::awaiting)
    }

    pub fn awaiting_count(&self) -> usize {
        self.pending
            .iter()
            .flatten()
            .filter(|pending| pending.awaiting())
            .count()
    }

    /// Validates a reply payload `[address, id, reg lsb, reg msb, data...]`
    /// and stores its data in the matching slot. A rejected reply leaves every
    /// slot as it was.
    pub fn handle_reply(&mut self, payload: &[u8]) -> Result<RequestId, ReplyError> {
        if self.awaiting_count() == 0 {
            return Err(ReplyError::NotAwaiting);
        }

        let (address, id) = match payload {
            [address, id, ..] => (*address, *id),
            _ => return Err(ReplyError::TooShort { len: payload.len() }),
        };
        let pending = self
            .pending
            .get_mut(usize::from(id))
            .and_then(Option::as_mut)
            .filter(|pending| pending.awaiting())
            .ok_or(ReplyError::UnknownRequestId(id))?;

        if address != pending.address {
            return Err(ReplyError::AddressMismatch {
                expected: pending.address,
                actual: address,
            });
        }

        let max = pending.expected * 2 + 4;
        if payload.len() < 4 || payload.len() > max || payload.len() % 2 != 0 {
            return Err(ReplyError::BadLength {
                len: payload.len(),
                max,
            });
        }

        let register = decode_two_7bit(payload[2], payload[3]);
        if pending.register.is_some_and(|expected| expected != register) {
            debug!(register, "reply register differs from request");
        }
        let data = decode_pairs(&payload[4..])
            .map(|value| (value & 0xFF) as u8)
            .collect();
        pending.received = Some(data);
        Ok(RequestId(id))
    }
}

impl Feature for I2cFeature {
    fn handle_sysex(&mut self, command: u8, payload: &[u8]) -> bool {
        if command != I2C_REPLY {
            return false;
        }
        if payload.len() < 2 {
            warn!(len = payload.len(), "I2C reply: empty message");
            return false;
        }

        match self.handle_reply(payload) {
            Ok(id) => debug!(request_id = id.value(), "I2C reply received"),
            Err(reason) => warn!(%reason, "I2C reply dropped"),
        }
        true
    }
}

/// Handle to a registered [`I2cFeature`].
pub type I2c = FeatureHandle<I2cFeature>;

impl FeatureHandle<I2cFeature> {
    pub fn config<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        config: &I2cConfig,
    ) -> Result<(), I2cError> {
        let (feature, wire) = firmata.split(self);
        feature.config(wire, config)
    }

    /// Runs one transaction. Writes, continuous reads and stops return `Ok(0)`
    /// once sent; a plain read blocks until its reply fills `in_buffer` and
    /// returns the number of bytes received.
    pub fn request<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        request: &I2cRequest<'_>,
        in_buffer: &mut [u8],
    ) -> Result<usize, I2cError> {
        if request.transfer != I2cTransferMode::Read {
            let (feature, wire) = firmata.split(self);
            feature.send(wire, request)?;
            return Ok(0);
        }

        let needed = usize::from(request.read_len);
        if in_buffer.len() < needed {
            return Err(I2cError::BufferTooSmall {
                needed,
                len: in_buffer.len(),
            });
        }

        let id = self.begin_read(firmata, request)?;
        let received = self.wait_read(firmata, id, request.address)?;
        let count = received.len().min(in_buffer.len());
        in_buffer[..count].copy_from_slice(&received[..count]);
        Ok(count)
    }

    /// Sends a read without waiting; collect the reply with
    /// [`poll_read`](Self::poll_read).
    pub fn begin_read<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        request: &I2cRequest<'_>,
    ) -> Result<RequestId, I2cError> {
        let request = I2cRequest {
            transfer: I2cTransferMode::Read,
            ..request.clone()
        };
        let (feature, wire) = firmata.split(self);
        feature.send(wire, &request)
    }

    pub fn poll_read<T: Read + Write>(self, firmata: &mut Firmata<T>, id: RequestId) -> Option<Vec<u8>> {
        firmata.feature_mut(self).take_completed(id)
    }

    fn wait_read<T: Read + Write>(
        self,
        firmata: &mut Firmata<T>,
        id: RequestId,
        address: u8,
    ) -> Result<Vec<u8>, I2cError> {
        let deadline = Instant::now() + firmata.feature(self).options().reply_timeout;

        loop {
            if let Err(err) = firmata.update() {
                firmata.feature_mut(self).cancel(id);
                return Err(err.into());
            }
            if let Some(received) = firmata.feature_mut(self).take_completed(id) {
                return Ok(received);
            }
            if Instant::now() >= deadline {
                firmata.feature_mut(self).cancel(id);
                warn!(address, request_id = id.value(), "I2C read timed out");
                return Err(I2cError::Timeout {
                    address,
                    request_id: id,
                });
            }
        }
    }
}
