//! Serial link to a board running Firmata firmware.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPortInfo, SerialPortType};
use tracing::{debug, info};

pub const FIRMATA_BAUD_RATE: u32 = 115_200;
/// Kept short: each `Firmata::update` performs at most one read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Auto-reset boards reboot when the port opens and run their bootloader
/// for about this long before the firmware listens.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(2);

/// USB vendor ids of Arduino boards and the USB-serial bridges clones use.
const BOARD_VENDOR_IDS: &[u16] = &[
    0x2341, // Arduino LLC
    0x2A03, // Arduino SRL
    0x1A86, // QinHeng CH340
    0x0403, // FTDI
    0x10C4, // Silicon Labs CP210x
];

#[derive(Debug, Clone)]
pub struct SerialOptions {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    /// Wait after opening before the link is used; zero skips it.
    pub reset_settle: Duration,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: FIRMATA_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            reset_settle: DEFAULT_RESET_SETTLE,
        }
    }
}

#[derive(Debug)]
pub enum SerialTransportError {
    Open {
        path: String,
        source: serialport::Error,
    },
    Enumerate(serialport::Error),
    NoBoardFound,
}

impl std::fmt::Display for SerialTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, source } => write!(f, "cannot open board on {path}: {source}"),
            Self::Enumerate(err) => write!(f, "cannot list serial ports: {err}"),
            Self::NoBoardFound => write!(f, "no USB serial board connected"),
        }
    }
}

impl std::error::Error for SerialTransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Enumerate(err) => Some(err),
            Self::NoBoardFound => None,
        }
    }
}

pub struct SerialTransport {
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self, SerialTransportError> {
        Self::open_with(path, &SerialOptions::default())
    }

    /// Opens `path`, waits out the board's reset and discards whatever the
    /// bootloader printed meanwhile.
    pub fn open_with(path: &str, options: &SerialOptions) -> Result<Self, SerialTransportError> {
        let open_error = |source| SerialTransportError::Open {
            path: path.to_string(),
            source,
        };

        let port = serialport::new(path, options.baud_rate)
            .timeout(options.read_timeout)
            .open()
            .map_err(open_error)?;

        if !options.reset_settle.is_zero() {
            debug!(path, settle = ?options.reset_settle, "waiting for board reset");
            std::thread::sleep(options.reset_settle);
        }
        port.clear(ClearBuffer::Input).map_err(open_error)?;

        info!(path, baud_rate = options.baud_rate, "serial link open");
        Ok(Self { inner: port })
    }

    /// Opens the first connected board, preferring known Arduino vendor ids
    /// over any other USB serial device.
    pub fn detect(options: &SerialOptions) -> Result<Self, SerialTransportError> {
        let ports = serialport::available_ports().map_err(SerialTransportError::Enumerate)?;
        let port = find_board(&ports).ok_or(SerialTransportError::NoBoardFound)?;
        Self::open_with(&port.port_name, options)
    }
}

fn find_board(ports: &[SerialPortInfo]) -> Option<&SerialPortInfo> {
    let usb_vid = |port: &SerialPortInfo| match &port.port_type {
        SerialPortType::UsbPort(usb) => Some(usb.vid),
        _ => None,
    };

    ports
        .iter()
        .find(|port| usb_vid(port).is_some_and(|vid| BOARD_VENDOR_IDS.contains(&vid)))
        .or_else(|| ports.iter().find(|port| usb_vid(port).is_some()))
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
