//! Host-side client for Firmata-style boards.
//!
//! The recommended API surface is:
//! - [`Firmata`] for the connection, message pump and feature registry
//! - [`DigitalPortFeature`] for port state, pin modes and emulated interrupts
//! - [`I2cFeature`] for I2C transactions
//! - [`transport`] for serial I/O adapters
//!
//! Features are registered with [`Firmata::register`], which returns a typed
//! handle used for every later call:
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use client_firmata::{DigitalPortFeature, Firmata, I2cFeature, I2cRequest, PinMode};
//!
//! let mut firmata = Firmata::open_serial("/dev/ttyACM0")?;
//! let digital = firmata.register(DigitalPortFeature::default());
//! let i2c = firmata.register(I2cFeature::default());
//!
//! digital.set_pin_mode(&mut firmata, 2, PinMode::Input)?;
//! let mut buffer = [0_u8; 2];
//! let count = i2c.request(&mut firmata, &I2cRequest::read(0x20, 2), &mut buffer)?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```

mod board;
mod digital;
pub mod encoder;
mod firmata;
pub mod framing;
mod i2c;
pub mod protocol;
#[cfg(test)]
mod testing;
/// Transport adapters for connecting to a board.
pub mod transport;

pub use board::BoardLayout;
pub use digital::{Digital, DigitalError, DigitalPortFeature, InterruptCallback, MAX_PINS};
pub use firmata::{
    Feature, FeatureHandle, Firmata, FirmataError, FirmataOptions, Firmware, Wire,
};
pub use i2c::{
    I2c, I2cConfig, I2cError, I2cFeature, I2cOptions, I2cRequest, MAX_PENDING, ReplyError,
    RequestId, RequestIdMode, SENTINEL_REQUEST_ID,
};
pub use protocol::{I2cAddressMode, I2cRestart, I2cTransferMode, InterruptMode, PinMode};
