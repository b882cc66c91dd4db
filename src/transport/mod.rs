//! Transport adapters. Any `Read + Write` byte stream works with
//! [`Firmata`](crate::Firmata); these wrap the common ones.

#[cfg(feature = "serial")]
pub mod serial;
