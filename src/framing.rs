//! Message framing: sysex encoding on the way out, message reassembly on the
//! way in.

use tracing::{debug, trace};

use crate::encoder::decode_two_7bit;
use crate::protocol::{
    ANALOG_MESSAGE, DIGITAL_MESSAGE, END_SYSEX, REPORT_DIGITAL, REPORT_VERSION, SET_DIGITAL_PIN_VALUE,
    SET_PIN_MODE, START_SYSEX, SYSTEM_RESET,
};

/// Longest sysex body (command byte included) accepted before the frame is
/// abandoned.
pub const MAX_SYSEX_LEN: usize = 1024;

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Digital { port: u8, value: u16 },
    Analog { pin: u8, value: u16 },
    Version { major: u8, minor: u8 },
    Sysex { command: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    StrayDataByte(u8),
    InterruptedMessage { status: u8, by: u8 },
    InterruptedSysex { by: u8 },
    EmptySysex,
    SysexTooLong,
}

impl core::fmt::Display for FramingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::StrayDataByte(b) => write!(f, "data byte {b:#04x} outside a message"),
            Self::InterruptedMessage { status, by } => {
                write!(f, "message {status:#04x} interrupted by status {by:#04x}")
            }
            Self::InterruptedSysex { by } => write!(f, "sysex interrupted by status {by:#04x}"),
            Self::EmptySysex => write!(f, "sysex without command byte"),
            Self::SysexTooLong => write!(f, "sysex longer than {MAX_SYSEX_LEN} bytes"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Frames `command` and `payload` between the sysex sentinels. The payload is
/// sent as-is; callers encode wide values with
/// [`encode_two_7bit`](crate::encoder::encode_two_7bit) first.
pub fn encode_sysex(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(START_SYSEX);
    out.push(command & 0x7F);
    out.extend_from_slice(payload);
    out.push(END_SYSEX);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Simple {
        status: u8,
        needed: usize,
        data: [u8; 2],
        len: usize,
    },
    Sysex,
}

#[derive(Debug)]
pub struct MessageDecoder {
    state: DecodeState,
    sysex: Vec<u8>,
    dropped: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            sysex: Vec::new(),
            dropped: 0,
        }
    }

    /// Number of partial or malformed messages discarded so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();

        for &b in chunk {
            if let Some(message) = self.push_byte(b) {
                messages.push(message);
            }
        }

        messages
    }

    fn push_byte(&mut self, b: u8) -> Option<Message> {
        match self.state {
            DecodeState::Sysex => self.push_sysex_byte(b),
            DecodeState::Simple {
                status,
                needed,
                mut data,
                len,
            } => {
                if b & 0x80 != 0 {
                    self.abandon(FramingError::InterruptedMessage { status, by: b });
                    return self.start(b);
                }

                data[len] = b;
                if len + 1 < needed {
                    self.state = DecodeState::Simple {
                        status,
                        needed,
                        data,
                        len: len + 1,
                    };
                    return None;
                }

                self.state = DecodeState::Idle;
                complete_simple(status, data)
            }
            DecodeState::Idle => {
                if b & 0x80 != 0 {
                    self.start(b)
                } else {
                    self.abandon(FramingError::StrayDataByte(b));
                    None
                }
            }
        }
    }

    fn push_sysex_byte(&mut self, b: u8) -> Option<Message> {
        match b {
            END_SYSEX => {
                self.state = DecodeState::Idle;
                let mut body = core::mem::take(&mut self.sysex);
                if body.is_empty() {
                    self.abandon(FramingError::EmptySysex);
                    return None;
                }
                let command = body.remove(0);
                Some(Message::Sysex {
                    command,
                    payload: body,
                })
            }
            _ if b & 0x80 != 0 => {
                self.sysex.clear();
                self.abandon(FramingError::InterruptedSysex { by: b });
                self.start(b)
            }
            _ => {
                if self.sysex.len() >= MAX_SYSEX_LEN {
                    self.sysex.clear();
                    self.state = DecodeState::Idle;
                    self.abandon(FramingError::SysexTooLong);
                    return None;
                }
                self.sysex.push(b);
                None
            }
        }
    }

    fn start(&mut self, status: u8) -> Option<Message> {
        if status == START_SYSEX {
            self.sysex.clear();
            self.state = DecodeState::Sysex;
            return None;
        }

        match data_len(status) {
            Some(needed) => {
                self.state = DecodeState::Simple {
                    status,
                    needed,
                    data: [0; 2],
                    len: 0,
                };
            }
            None => {
                trace!(status, "ignoring status byte without inbound meaning");
                self.state = DecodeState::Idle;
            }
        }
        None
    }

    fn abandon(&mut self, reason: FramingError) {
        self.dropped += 1;
        debug!(%reason, "dropping malformed input");
    }
}

fn data_len(status: u8) -> Option<usize> {
    match status {
        REPORT_VERSION | SET_PIN_MODE | SET_DIGITAL_PIN_VALUE => Some(2),
        SYSTEM_RESET => None,
        _ => match status & 0xF0 {
            DIGITAL_MESSAGE | ANALOG_MESSAGE => Some(2),
            REPORT_DIGITAL | 0xC0 => Some(1),
            _ => None,
        },
    }
}

fn complete_simple(status: u8, data: [u8; 2]) -> Option<Message> {
    match status {
        REPORT_VERSION => Some(Message::Version {
            major: data[0],
            minor: data[1],
        }),
        _ => match status & 0xF0 {
            DIGITAL_MESSAGE => Some(Message::Digital {
                port: status & 0x0F,
                value: decode_two_7bit(data[0], data[1]),
            }),
            ANALOG_MESSAGE => Some(Message::Analog {
                pin: status & 0x0F,
                value: decode_two_7bit(data[0], data[1]),
            }),
            _ => {
                trace!(status, "discarding host-bound message echoed by board");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sysex_frame() {
        assert_eq!(
            encode_sysex(0x76, &[0x20, 0x08]),
            vec![0xF0, 0x76, 0x20, 0x08, 0xF7]
        );
    }

    #[test]
    fn decodes_simple_and_sysex_messages() {
        let input = [0x90, 0x05, 0x01, 0xF0, 0x77, 0x20, 0x00, 0xF7, 0xF9, 2, 5];
        let mut decoder = MessageDecoder::new();
        let messages = decoder.push(&input);

        assert_eq!(
            messages,
            vec![
                Message::Digital {
                    port: 0,
                    value: 0x85
                },
                Message::Sysex {
                    command: 0x77,
                    payload: vec![0x20, 0x00]
                },
                Message::Version { major: 2, minor: 5 },
            ]
        );
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn decodes_byte_by_byte() {
        let input = [0xF0, 0x79, 2, 5, 0x41, 0x00, 0xF7, 0x93, 0x7F, 0x00];
        let mut decoder = MessageDecoder::new();
        let mut messages = Vec::new();

        for &b in &input {
            messages.extend(decoder.push(core::slice::from_ref(&b)));
        }

        assert_eq!(
            messages,
            vec![
                Message::Sysex {
                    command: 0x79,
                    payload: vec![2, 5, 0x41, 0x00]
                },
                Message::Digital {
                    port: 3,
                    value: 0x7F
                },
            ]
        );
    }

    #[test]
    fn unterminated_sysex_is_abandoned_at_next_start() {
        let input = [0xF0, 0x77, 0x01, 0xF0, 0x77, 0x20, 0xF7];
        let mut decoder = MessageDecoder::new();

        assert_eq!(
            decoder.push(&input),
            vec![Message::Sysex {
                command: 0x77,
                payload: vec![0x20]
            }]
        );
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn interrupted_simple_message_is_dropped() {
        let input = [0x91, 0x01, 0x92, 0x03, 0x00];
        let mut decoder = MessageDecoder::new();

        assert_eq!(
            decoder.push(&input),
            vec![Message::Digital { port: 2, value: 3 }]
        );
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn stray_data_and_empty_sysex_are_counted() {
        let mut decoder = MessageDecoder::new();
        assert!(decoder.push(&[0x10, 0x11, 0xF0, 0xF7]).is_empty());
        assert_eq!(decoder.dropped(), 3);
    }

    #[test]
    fn oversized_sysex_is_dropped() {
        let mut input = vec![0xF0];
        input.extend(core::iter::repeat_n(0x01, MAX_SYSEX_LEN + 1));
        input.push(0xF7);
        let mut decoder = MessageDecoder::new();

        assert!(decoder.push(&input).is_empty());
        assert!(decoder.dropped() >= 1);
    }
}
