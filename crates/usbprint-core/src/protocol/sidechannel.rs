//! Side-channel message framing.
//!
//! Every request and reply is one frame:
//!
//! ```text
//! +---------+--------+-------------+--------------+
//! | command | status | length (BE) | data[length] |
//! |   u8    |   u8   |     u16     |              |
//! +---------+--------+-------------+--------------+
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Frame header length in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload a frame can carry.
pub const MAX_FRAME_DATA: usize = u16::MAX as usize;

/// Printer state bit reported for `GetState`.
pub const STATE_ONLINE: u8 = 1;

#[derive(Error, Debug)]
pub enum SideChannelError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),
    #[error("Unknown side-channel command {0}")]
    UnknownCommand(u8),
    #[error("Frame declares {declared} data bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Payload of {0} bytes exceeds the frame limit")]
    TooBig(usize),
    #[error("Side channel timed out")]
    Timeout,
    #[error("Side channel closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests the spooler can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SideCommand {
    SoftReset = 1,
    DrainOutput = 2,
    GetBidi = 3,
    GetDeviceId = 4,
    GetState = 5,
    SnmpGet = 6,
    SnmpGetNext = 7,
    GetConnected = 8,
}

impl TryFrom<u8> for SideCommand {
    type Error = SideChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::SoftReset,
            2 => Self::DrainOutput,
            3 => Self::GetBidi,
            4 => Self::GetDeviceId,
            5 => Self::GetState,
            6 => Self::SnmpGet,
            7 => Self::SnmpGetNext,
            8 => Self::GetConnected,
            other => return Err(SideChannelError::UnknownCommand(other)),
        })
    }
}

impl fmt::Display for SideCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideCommand::SoftReset => write!(f, "soft-reset"),
            SideCommand::DrainOutput => write!(f, "drain-output"),
            SideCommand::GetBidi => write!(f, "get-bidi"),
            SideCommand::GetDeviceId => write!(f, "get-device-id"),
            SideCommand::GetState => write!(f, "get-state"),
            SideCommand::SnmpGet => write!(f, "snmp-get"),
            SideCommand::SnmpGetNext => write!(f, "snmp-get-next"),
            SideCommand::GetConnected => write!(f, "get-connected"),
        }
    }
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SideStatus {
    None = 0,
    Ok = 1,
    IoError = 2,
    Timeout = 3,
    NoResponse = 4,
    BadMessage = 5,
    TooBig = 6,
    NotImplemented = 7,
}

impl SideStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ok,
            2 => Self::IoError,
            3 => Self::Timeout,
            4 => Self::NoResponse,
            5 => Self::BadMessage,
            6 => Self::TooBig,
            7 => Self::NotImplemented,
            _ => Self::None,
        }
    }
}

/// A decoded side-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideRequest {
    pub command: SideCommand,
    pub data: Vec<u8>,
}

/// A reply to send back to the spooler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideReply {
    pub command: SideCommand,
    pub status: SideStatus,
    pub data: Vec<u8>,
}

impl SideReply {
    pub fn new(command: SideCommand, status: SideStatus, data: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            status,
            data: data.into(),
        }
    }

    pub fn ok(command: SideCommand) -> Self {
        Self::new(command, SideStatus::Ok, Vec::new())
    }

    pub fn ok_byte(command: SideCommand, value: u8) -> Self {
        Self::new(command, SideStatus::Ok, vec![value])
    }
}

/// Encode one frame.
pub fn encode_frame(
    command: SideCommand,
    status: SideStatus,
    data: &[u8],
) -> Result<Vec<u8>, SideChannelError> {
    if data.len() > MAX_FRAME_DATA {
        return Err(SideChannelError::TooBig(data.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    buf.write_u8(command as u8)?;
    buf.write_u8(status as u8)?;
    buf.write_u16::<BigEndian>(data.len() as u16)?;
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Decode one request frame received from the spooler.
pub fn decode_request(frame: &[u8]) -> Result<SideRequest, SideChannelError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(SideChannelError::Truncated(frame.len()));
    }
    let mut cursor = Cursor::new(frame);
    let command = SideCommand::try_from(cursor.read_u8()?)?;
    let _status = cursor.read_u8()?;
    let declared = cursor.read_u16::<BigEndian>()? as usize;

    let data = &frame[FRAME_HEADER_SIZE..];
    if data.len() < declared {
        return Err(SideChannelError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    if data.len() > declared {
        debug!(
            ?command,
            dropped = data.len() - declared,
            "Discarding bytes after side-channel request"
        );
    }

    Ok(SideRequest {
        command,
        data: data[..declared].to_vec(),
    })
}

/// Decode a reply frame. Used by the spooler side of tests.
pub fn decode_reply(frame: &[u8]) -> Result<SideReply, SideChannelError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(SideChannelError::Truncated(frame.len()));
    }
    let mut cursor = Cursor::new(frame);
    let command = SideCommand::try_from(cursor.read_u8()?)?;
    let status = SideStatus::from_u8(cursor.read_u8()?);
    let declared = cursor.read_u16::<BigEndian>()? as usize;

    let data = &frame[FRAME_HEADER_SIZE..];
    if data.len() < declared {
        return Err(SideChannelError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    Ok(SideReply {
        command,
        status,
        data: data[..declared].to_vec(),
    })
}
