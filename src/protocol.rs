//! Wire protocol between the host and the remote sensor node
//!
//! Every frame is laid out as
//!
//! ```text
//! [MAGIC][type][seq][len][payload; len bytes][checksum]
//! ```
//!
//! where `checksum` is the XOR of every preceding byte. Multi-byte fields are
//! big-endian. Telemetry values are full-scale signed counts: `g = raw * range / 32768`,
//! with the range taken from the scale byte carried in the same frame.

use std::fmt;
use thiserror::Error;

use crate::sample::{ScaleSetting, TelemetrySample};

// Frame layout
pub const FRAME_MAGIC: u8 = 0xA5;
const HEADER_LEN: usize = 4; // magic, type, seq, len
const MIN_FRAME_LEN: usize = HEADER_LEN + 1; // header + checksum

// Frame types
const TYPE_HELLO: u8 = 0x01;
const TYPE_HELLO_ACK: u8 = 0x02;
const TYPE_COMMAND: u8 = 0x10;
const TYPE_ACK: u8 = 0x11;
const TYPE_TELEMETRY: u8 = 0x20;

// Command codes
const CMD_PING: u8 = 0x01;
const CMD_SET_SCALE: u8 = 0x02;
const CMD_CALIBRATE: u8 = 0x03;
const CMD_SET_STREAMING: u8 = 0x04;

// Payload sizes
const HELLO_ACK_LEN: usize = 2;
const COMMAND_LEN: usize = 2;
const ACK_LEN: usize = 3;
const TELEMETRY_LEN: usize = 11; // u32 timestamp + u8 scale + 3 x i16

/// Ack status byte for an accepted command
pub const ACK_OK: u8 = 0x00;

const FULL_SCALE_COUNTS: f64 = 32768.0;

/// Decode failures; each one drops exactly one frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad magic byte 0x{0:02X}")]
    BadMagic(u8),

    #[error("frame too short ({0} bytes)")]
    Truncated(usize),

    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unknown frame type 0x{0:02X}")]
    UnknownType(u8),

    #[error("payload of {len} bytes is invalid for frame type 0x{frame_type:02X}")]
    BadPayload { frame_type: u8, len: usize },

    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// Kind of command sent to the node, used to correlate acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    SetScale,
    Calibrate,
    SetStreaming,
}

impl CommandKind {
    fn code(self) -> u8 {
        match self {
            CommandKind::Ping => CMD_PING,
            CommandKind::SetScale => CMD_SET_SCALE,
            CommandKind::Calibrate => CMD_CALIBRATE,
            CommandKind::SetStreaming => CMD_SET_STREAMING,
        }
    }

    fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            CMD_PING => Ok(CommandKind::Ping),
            CMD_SET_SCALE => Ok(CommandKind::SetScale),
            CMD_CALIBRATE => Ok(CommandKind::Calibrate),
            CMD_SET_STREAMING => Ok(CommandKind::SetStreaming),
            other => Err(FrameError::InvalidField(format!("command code 0x{:02X}", other))),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Ping => "ping",
            CommandKind::SetScale => "set-scale",
            CommandKind::Calibrate => "calibrate",
            CommandKind::SetStreaming => "set-streaming",
        })
    }
}

/// A command with its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    SetScale(ScaleSetting),
    Calibrate,
    SetStreaming(bool),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Ping => CommandKind::Ping,
            Command::SetScale(_) => CommandKind::SetScale,
            Command::Calibrate => CommandKind::Calibrate,
            Command::SetStreaming(_) => CommandKind::SetStreaming,
        }
    }

    fn arg(&self) -> u8 {
        match self {
            Command::SetScale(scale) => scale.to_wire(),
            Command::SetStreaming(enabled) => u8::from(*enabled),
            Command::Ping | Command::Calibrate => 0,
        }
    }

    fn from_wire(code: u8, arg: u8) -> Result<Self, FrameError> {
        match CommandKind::from_code(code)? {
            CommandKind::Ping => Ok(Command::Ping),
            CommandKind::Calibrate => Ok(Command::Calibrate),
            CommandKind::SetScale => ScaleSetting::from_wire(arg)
                .map(Command::SetScale)
                .ok_or_else(|| FrameError::InvalidField(format!("scale {}", arg))),
            CommandKind::SetStreaming => Ok(Command::SetStreaming(arg != 0)),
        }
    }
}

/// One unit of data exchanged over the link
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Host → node handshake request
    Hello { seq: u8 },
    /// Node → host handshake reply carrying the node's current settings
    HelloAck { seq: u8, scale: ScaleSetting, streaming: bool },
    /// Host → node command
    Command { seq: u8, command: Command },
    /// Node → host acknowledgement of the command with the same `seq`
    Ack { seq: u8, command: CommandKind, status: u8, arg: u8 },
    /// Node → host acceleration sample
    Telemetry { seq: u8, timestamp_ms: u32, scale: ScaleSetting, raw: [i16; 3] },
}

impl Frame {
    /// Build a telemetry frame from a sample in g
    pub fn telemetry(seq: u8, timestamp_ms: u32, scale: ScaleSetting, accel_g: [f64; 3]) -> Self {
        let range = scale.range_g();
        let to_counts = |g: f64| {
            let counts = (g / range * FULL_SCALE_COUNTS).round();
            counts.clamp(i16::MIN as f64, i16::MAX as f64) as i16
        };
        Frame::Telemetry {
            seq,
            timestamp_ms,
            scale,
            raw: [to_counts(accel_g[0]), to_counts(accel_g[1]), to_counts(accel_g[2])],
        }
    }

    /// Sequence number of this frame
    pub fn seq(&self) -> u8 {
        match self {
            Frame::Hello { seq }
            | Frame::HelloAck { seq, .. }
            | Frame::Command { seq, .. }
            | Frame::Ack { seq, .. }
            | Frame::Telemetry { seq, .. } => *seq,
        }
    }

    /// Convert a telemetry frame into a sample; `None` for every other frame type
    pub fn to_sample(&self) -> Option<TelemetrySample> {
        match self {
            Frame::Telemetry { timestamp_ms, scale, raw, .. } => {
                let range = scale.range_g();
                let g = |counts: i16| counts as f64 * range / FULL_SCALE_COUNTS;
                Some(TelemetrySample::new(
                    *timestamp_ms as f64 / 1000.0,
                    g(raw[0]),
                    g(raw[1]),
                    g(raw[2]),
                ))
            }
            _ => None,
        }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Vec<u8> {
        let (frame_type, payload): (u8, Vec<u8>) = match self {
            Frame::Hello { .. } => (TYPE_HELLO, Vec::new()),
            Frame::HelloAck { scale, streaming, .. } => {
                (TYPE_HELLO_ACK, vec![scale.to_wire(), u8::from(*streaming)])
            }
            Frame::Command { command, .. } => {
                (TYPE_COMMAND, vec![command.kind().code(), command.arg()])
            }
            Frame::Ack { command, status, arg, .. } => (TYPE_ACK, vec![command.code(), *status, *arg]),
            Frame::Telemetry { timestamp_ms, scale, raw, .. } => {
                let mut payload = Vec::with_capacity(TELEMETRY_LEN);
                payload.extend_from_slice(&timestamp_ms.to_be_bytes());
                payload.push(scale.to_wire());
                for value in raw {
                    payload.extend_from_slice(&value.to_be_bytes());
                }
                (TYPE_TELEMETRY, payload)
            }
        };

        let mut bytes = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
        bytes.push(FRAME_MAGIC);
        bytes.push(frame_type);
        bytes.push(self.seq());
        bytes.push(payload.len() as u8);
        bytes.extend_from_slice(&payload);
        bytes.push(checksum(&bytes));
        bytes
    }

    /// Parse bytes into a frame
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        if bytes[0] != FRAME_MAGIC {
            return Err(FrameError::BadMagic(bytes[0]));
        }

        let payload_len = bytes[3] as usize;
        let expected = MIN_FRAME_LEN + payload_len;
        if bytes.len() != expected {
            return Err(FrameError::LengthMismatch { expected, actual: bytes.len() });
        }

        let (body, tail) = bytes.split_at(bytes.len() - 1);
        let computed = checksum(body);
        if computed != tail[0] {
            return Err(FrameError::Checksum { expected: computed, actual: tail[0] });
        }

        let frame_type = bytes[1];
        let seq = bytes[2];
        let payload = &body[HEADER_LEN..];
        let expect_len = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(FrameError::BadPayload { frame_type, len: payload.len() })
            }
        };

        match frame_type {
            TYPE_HELLO => {
                expect_len(0)?;
                Ok(Frame::Hello { seq })
            }
            TYPE_HELLO_ACK => {
                expect_len(HELLO_ACK_LEN)?;
                let scale = ScaleSetting::from_wire(payload[0])
                    .ok_or_else(|| FrameError::InvalidField(format!("scale {}", payload[0])))?;
                Ok(Frame::HelloAck { seq, scale, streaming: payload[1] != 0 })
            }
            TYPE_COMMAND => {
                expect_len(COMMAND_LEN)?;
                let command = Command::from_wire(payload[0], payload[1])?;
                Ok(Frame::Command { seq, command })
            }
            TYPE_ACK => {
                expect_len(ACK_LEN)?;
                let command = CommandKind::from_code(payload[0])?;
                Ok(Frame::Ack { seq, command, status: payload[1], arg: payload[2] })
            }
            TYPE_TELEMETRY => {
                expect_len(TELEMETRY_LEN)?;
                let timestamp_ms = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let scale = ScaleSetting::from_wire(payload[4])
                    .ok_or_else(|| FrameError::InvalidField(format!("scale {}", payload[4])))?;
                let raw = [
                    i16::from_be_bytes([payload[5], payload[6]]),
                    i16::from_be_bytes([payload[7], payload[8]]),
                    i16::from_be_bytes([payload[9], payload[10]]),
                ];
                Ok(Frame::Telemetry { seq, timestamp_ms, scale, raw })
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_frame_decodes_to_sample() {
        let frame = Frame::telemetry(7, 1500, ScaleSetting::TwoG, [1.0, -0.5, 0.25]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);

        let sample = decoded.to_sample().unwrap();
        assert_eq!(sample.timestamp(), 1.5);
        assert!((sample.ax() - 1.0).abs() < 1e-3);
        assert!((sample.ay() + 0.5).abs() < 1e-3);
        assert!((sample.az() - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_telemetry_uses_frame_scale() {
        let two = Frame::telemetry(1, 0, ScaleSetting::TwoG, [1.0, 0.0, 0.0]);
        let six = Frame::telemetry(1, 0, ScaleSetting::SixG, [1.0, 0.0, 0.0]);
        match (&two, &six) {
            (Frame::Telemetry { raw: r2, .. }, Frame::Telemetry { raw: r6, .. }) => {
                assert_eq!(r2[0], 16384);
                assert_eq!(r6[0], 5461);
            }
            _ => unreachable!(),
        }
        let s6 = six.to_sample().unwrap();
        assert!((s6.ax() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_out_of_range_clamps() {
        let frame = Frame::telemetry(1, 0, ScaleSetting::TwoG, [5.0, -5.0, 0.0]);
        if let Frame::Telemetry { raw, .. } = frame {
            assert_eq!(raw[0], i16::MAX);
            assert_eq!(raw[1], i16::MIN);
        }
    }

    #[test]
    fn test_command_and_ack_frames() {
        let cmd = Frame::Command { seq: 3, command: Command::SetScale(ScaleSetting::SixG) };
        let bytes = cmd.encode();
        assert_eq!(bytes[0], FRAME_MAGIC);
        assert_eq!(Frame::decode(&bytes).unwrap(), cmd);

        let ack = Frame::Ack { seq: 3, command: CommandKind::SetScale, status: ACK_OK, arg: 6 };
        assert_eq!(Frame::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut bytes = Frame::Hello { seq: 1 }.encode();
        assert!(matches!(Frame::decode(&bytes[..3]), Err(FrameError::Truncated(3))));

        bytes[2] ^= 0xFF;
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::Checksum { .. })));

        let mut bad_magic = Frame::Hello { seq: 1 }.encode();
        bad_magic[0] = 0x00;
        assert_eq!(Frame::decode(&bad_magic), Err(FrameError::BadMagic(0x00)));

        let mut long = Frame::Hello { seq: 1 }.encode();
        long.push(0);
        assert!(matches!(Frame::decode(&long), Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = vec![FRAME_MAGIC, 0x7F, 0, 0];
        bytes.push(checksum(&bytes));
        assert_eq!(Frame::decode(&bytes), Err(FrameError::UnknownType(0x7F)));
    }

    #[test]
    fn test_decode_rejects_bad_scale() {
        let mut bytes = vec![FRAME_MAGIC, TYPE_HELLO_ACK, 1, 2, 4, 0];
        bytes.push(checksum(&bytes));
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::InvalidField(_))));
    }
}
