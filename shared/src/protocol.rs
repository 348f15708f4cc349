//! ASCII telemetry protocol spoken by the vehicle controller firmware
//!
//! Host to device:
//! ```text
//! R            request a snapshot
//! SP<dddd>     set speed, value is km/h x10 (one implied decimal)
//! GR<dddd>     set gear ratio
//! ```
//!
//! Device to host:
//! ```text
//! <ssss><gggg> snapshot, speed x10 then gear ratio (8 ASCII digits)
//! ```
//!
//! Every numeric field is exactly four zero-padded decimal digits. Classic
//! (stream) transports terminate each device message with [`LINE_DELIMITER`].

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Width of every numeric field on the wire
pub const FIELD_WIDTH: usize = 4;

/// Largest value a field can carry
pub const MAX_FIELD_VALUE: u16 = 9999;

/// Length of a snapshot payload (speed + gear ratio)
pub const SNAPSHOT_LEN: usize = FIELD_WIDTH * 2;

/// Terminator for device messages on stream transports
pub const LINE_DELIMITER: u8 = b'\n';

/// Longest device line accepted before the buffer is discarded
pub const MAX_LINE_LEN: usize = 256;

const READ_OPCODE: &[u8] = b"R";
const SPEED_OPCODE: &[u8] = b"SP";
const GEAR_OPCODE: &[u8] = b"GR";

/// Errors that can occur while encoding or decoding protocol messages
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Value out of range: {0} (max: {MAX_FIELD_VALUE})")]
    OutOfRange(f64),

    #[error("Snapshot too short: need {SNAPSHOT_LEN} bytes, have {0}")]
    ShortSnapshot(usize),

    #[error("Non-digit data in numeric field: {0:?}")]
    InvalidDigits(String),

    #[error("Unknown command byte: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Line exceeds {MAX_LINE_LEN} bytes without delimiter")]
    LineTooLong,
}

/// A command sent from the dashboard to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the device to report a snapshot
    ReadSnapshot,
    /// Set target speed in tenths of km/h
    SetSpeed(u16),
    /// Set target gear ratio
    SetGearRatio(u16),
}

impl Command {
    /// Build a set-speed command from km/h, rounding to one decimal
    pub fn set_speed_kmh(kmh: f32) -> Result<Self, ProtocolError> {
        let tenths = (kmh as f64 * 10.0).round();
        if !tenths.is_finite() || tenths < 0.0 || tenths > MAX_FIELD_VALUE as f64 {
            return Err(ProtocolError::OutOfRange(kmh as f64));
        }
        Ok(Command::SetSpeed(tenths as u16))
    }

    /// Build a set-gear-ratio command
    pub fn set_gear_ratio(ratio: u16) -> Result<Self, ProtocolError> {
        if ratio > MAX_FIELD_VALUE {
            return Err(ProtocolError::OutOfRange(ratio as f64));
        }
        Ok(Command::SetGearRatio(ratio))
    }

    /// Encode to the exact wire bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Command::ReadSnapshot => Bytes::from_static(READ_OPCODE),
            Command::SetSpeed(v) => encode_field(SPEED_OPCODE, *v),
            Command::SetGearRatio(v) => encode_field(GEAR_OPCODE, *v),
        }
    }

    /// Number of wire bytes a command starting with `first` occupies
    fn wire_len(first: u8) -> Option<usize> {
        match first {
            b'R' => Some(READ_OPCODE.len()),
            b'S' | b'G' => Some(2 + FIELD_WIDTH),
            _ => None,
        }
    }
}

fn encode_field(opcode: &[u8], value: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(opcode.len() + FIELD_WIDTH);
    buf.extend_from_slice(opcode);
    buf.extend_from_slice(format_field(value).as_bytes());
    buf.freeze()
}

fn format_field(value: u16) -> String {
    format!("{:0width$}", value.min(MAX_FIELD_VALUE), width = FIELD_WIDTH)
}

fn parse_field(raw: &[u8]) -> Result<u16, ProtocolError> {
    if raw.len() != FIELD_WIDTH || !raw.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidDigits(
            String::from_utf8_lossy(raw).into_owned(),
        ));
    }
    Ok(raw
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}

/// A single telemetry reading: current speed and gear ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Speed in tenths of km/h
    pub speed_tenths: u16,
    pub gear_ratio: u16,
}

impl Snapshot {
    /// Speed in km/h
    pub fn speed_kmh(&self) -> f32 {
        self.speed_tenths as f32 / 10.0
    }

    /// Parse a snapshot payload; trailing CR/LF and extra bytes are ignored
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let data = trim_line_end(data);
        if data.len() < SNAPSHOT_LEN {
            return Err(ProtocolError::ShortSnapshot(data.len()));
        }
        Ok(Self {
            speed_tenths: parse_field(&data[..FIELD_WIDTH])?,
            gear_ratio: parse_field(&data[FIELD_WIDTH..SNAPSHOT_LEN])?,
        })
    }

    /// Encode as the 8-digit wire payload (no delimiter)
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.raw_fields().join(""))
    }

    /// The two zero-padded wire fields as shown in the raw readout
    pub fn raw_fields(&self) -> [String; 2] {
        [format_field(self.speed_tenths), format_field(self.gear_ratio)]
    }
}

fn trim_line_end(mut data: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = data {
        data = rest;
    }
    data
}

/// Streaming decoder for commands arriving at the device
///
/// Commands are self-delimiting, so no framing bytes are required. Whitespace
/// between commands is skipped.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buffer: BytesMut,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next command
    ///
    /// Returns `Ok(None)` when more data is needed. On error the offending
    /// bytes are consumed so the caller can keep decoding.
    pub fn decode_next(&mut self) -> Result<Option<Command>, ProtocolError> {
        while let Some(&b) = self.buffer.first() {
            if b.is_ascii_whitespace() {
                self.buffer.advance(1);
            } else {
                break;
            }
        }

        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };

        let Some(len) = Command::wire_len(first) else {
            self.buffer.advance(1);
            return Err(ProtocolError::UnknownCommand(first));
        };

        if self.buffer.len() < len {
            return Ok(None);
        }

        let frame = self.buffer.split_to(len);
        match &frame[..2.min(len)] {
            b"R" => Ok(Some(Command::ReadSnapshot)),
            b"SP" => Ok(Some(Command::SetSpeed(parse_field(&frame[2..])?))),
            b"GR" => Ok(Some(Command::SetGearRatio(parse_field(&frame[2..])?))),
            _ => Err(ProtocolError::UnknownCommand(frame[1])),
        }
    }
}

/// Splits a device byte stream into delimiter-terminated messages
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_LINE_LEN),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete line without its delimiter; empty lines are skipped
    pub fn next_line(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            match self.buffer.iter().position(|&b| b == LINE_DELIMITER) {
                Some(pos) => {
                    let mut line = self.buffer.split_to(pos + 1);
                    line.truncate(trim_line_end(&line).len());
                    if !line.is_empty() {
                        return Ok(Some(line.freeze()));
                    }
                }
                None if self.buffer.len() > MAX_LINE_LEN => {
                    self.buffer.clear();
                    return Err(ProtocolError::LineTooLong);
                }
                None => return Ok(None),
            }
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
