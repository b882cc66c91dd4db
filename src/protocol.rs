//! Protocol constants and typed command values.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display, EnumIter};

use crate::encoder::encode_two_7bit;
use crate::framing::encode_sysex;

// Message command bytes (0x80-0xFF).
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const SET_PIN_MODE: u8 = 0xF4;
pub const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
pub const REPORT_VERSION: u8 = 0xF9;
pub const SYSTEM_RESET: u8 = 0xFF;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;

// Extended (sysex) commands (0x00-0x7F).
pub const I2C_REQUEST: u8 = 0x76;
pub const I2C_REPLY: u8 = 0x77;
pub const I2C_CONFIG: u8 = 0x78;
pub const REPORT_FIRMWARE: u8 = 0x79;

/// Number of digital ports tracked; 16 ports of 8 pins cover 128 pins.
pub const PORT_COUNT: usize = 16;
pub const PINS_PER_PORT: u8 = 8;

/// Width of the request id field in the I2C config byte.
pub const I2C_REQUEST_ID_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PinMode {
    Input = 0x00,
    Output = 0x01,
    Analog = 0x02,
    Pwm = 0x03,
    Servo = 0x04,
    Shift = 0x05,
    I2c = 0x06,
    OneWire = 0x07,
    Stepper = 0x08,
    Encoder = 0x09,
    Serial = 0x0A,
    InputPullup = 0x0B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display)]
#[repr(u8)]
pub enum I2cTransferMode {
    Write = 0,
    Read = 1,
    ReadContinuously = 2,
    StopReading = 3,
}

/// Whether the board ends a read with a STOP or a repeated START.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum I2cRestart {
    Restart = 0,
    Stop = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum I2cAddressMode {
    SevenBit = 0,
    TenBit = 1,
}

/// Trigger condition of an emulated interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter)]
pub enum InterruptMode {
    #[default]
    Change,
    Rising,
    Falling,
}

impl InterruptMode {
    pub fn triggers(self, previous: bool, current: bool) -> bool {
        match self {
            Self::Change => previous != current,
            Self::Rising => !previous && current,
            Self::Falling => previous && !current,
        }
    }
}

pub fn encode_set_pin_mode(pin: u8, mode: PinMode) -> [u8; 3] {
    [SET_PIN_MODE, pin & 0x7F, u8::from(mode)]
}

pub fn encode_report_digital(port: u8, enable: bool) -> [u8; 2] {
    [REPORT_DIGITAL | (port & 0x0F), u8::from(enable)]
}

pub fn encode_set_digital_pin_value(pin: u8, level: bool) -> [u8; 3] {
    [SET_DIGITAL_PIN_VALUE, pin & 0x7F, u8::from(level)]
}

/// Builds the `I2C_CONFIG` sysex. The clock frequency is sent in 7-bit groups
/// starting at bit 7.
pub fn encode_i2c_config(delay_us: u16, clock_hz: u32, scl_pin: u8, sda_pin: u8) -> Vec<u8> {
    let delay = encode_two_7bit(delay_us);
    let payload = [
        delay[0],
        delay[1],
        ((clock_hz >> 7) & 0x7F) as u8,
        ((clock_hz >> 14) & 0x7F) as u8,
        ((clock_hz >> 21) & 0x7F) as u8,
        ((clock_hz >> 28) & 0x0F) as u8,
        scl_pin & 0x7F,
        sda_pin & 0x7F,
    ];
    encode_sysex(I2C_CONFIG, &payload)
}

pub fn i2c_config_byte(
    restart: I2cRestart,
    address_mode: I2cAddressMode,
    transfer: I2cTransferMode,
    request_id: u8,
) -> u8 {
    (u8::from(restart) & 0x01) << 6
        | (u8::from(address_mode) & 0x01) << 5
        | (u8::from(transfer) & 0x03) << 3
        | (request_id & I2C_REQUEST_ID_MASK)
}
