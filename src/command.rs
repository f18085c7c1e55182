// src/command.rs

use std::fmt;

use crate::layout::RING_ALIGNMENT;

/// Size of the fixed command header. One alignment unit, so a header-only
/// command occupies exactly one ring slot.
pub const COMMAND_HEADER_BYTES: u32 = RING_ALIGNMENT;

/// Size of the fixed completion record header.
pub const COMPLETION_HEADER_BYTES: u32 = RING_ALIGNMENT;

bitflags::bitflags! {
    /// Per-command flags carried in the header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// Variable-length payload follows the header.
        const HAS_PAYLOAD      = 0b0001;
        /// The device must post a completion record for this command.
        const WANTS_COMPLETION = 0b0010;
    }
}

/// What the device should do with a command.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Launch a compiled program; payload holds instructions + runtime args.
    RunProgram = 1,
    /// Host-to-device buffer transfer; payload is the data.
    WriteBuffer = 2,
    /// Device-to-host readback; completion record carries the data.
    ReadBuffer = 3,
    /// Drain marker: completion means everything before it finished.
    Barrier = 4,
    /// Wrap marker: the producer wrapped to the ring start; the consumer must
    /// rewrap its read cursor and discard the tail. Never completed.
    Wrap = 5,
}

impl CommandKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => CommandKind::RunProgram,
            2 => CommandKind::WriteBuffer,
            3 => CommandKind::ReadBuffer,
            4 => CommandKind::Barrier,
            5 => CommandKind::Wrap,
            _ => return None,
        })
    }
}

/// Result status in a completion record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok = 0,
    /// The command tripped the watcher; a [`FaultReport`](crate::fault::FaultReport)
    /// carries the detail.
    Fault = 1,
}

impl CompletionStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => CompletionStatus::Ok,
            1 => CompletionStatus::Fault,
            _ => return None,
        })
    }
}

/// A header failed to decode. The transport treats header layout as a
/// compile-time constant, so this only occurs on protocol corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    Truncated { len: usize },
    BadKind(u32),
    BadFlags(u32),
    BadStatus(u32),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::Truncated { len } => write!(f, "header truncated at {} bytes", len),
            HeaderError::BadKind(v) => write!(f, "unknown command kind {}", v),
            HeaderError::BadFlags(v) => write!(f, "unknown command flags {:#x}", v),
            HeaderError::BadStatus(v) => write!(f, "unknown completion status {}", v),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Fixed 32-byte command header. Field layout (little endian):
///
/// ```text
/// 0..4   kind        4..8   flags
/// 8..16  sequence    16..20 payload bytes
/// 20..24 completion record bytes (0 = none)
/// 24..32 reserved, zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub kind: CommandKind,
    pub flags: CommandFlags,
    pub seq: u64,
    pub payload_bytes: u32,
    /// Total size of the completion record this command produces, header
    /// included. Zero for commands without completions.
    pub completion_bytes: u32,
}

impl CommandHeader {
    pub fn new(kind: CommandKind, seq: u64, payload_bytes: u32, completion_bytes: u32) -> Self {
        let mut flags = CommandFlags::empty();
        if payload_bytes > 0 {
            flags |= CommandFlags::HAS_PAYLOAD;
        }
        if completion_bytes > 0 {
            flags |= CommandFlags::WANTS_COMPLETION;
        }
        CommandHeader {
            kind,
            flags,
            seq,
            payload_bytes,
            completion_bytes,
        }
    }

    /// The wrap marker: header-only, no completion.
    pub fn wrap_marker() -> Self {
        CommandHeader {
            kind: CommandKind::Wrap,
            flags: CommandFlags::empty(),
            seq: 0,
            payload_bytes: 0,
            completion_bytes: 0,
        }
    }

    /// Total on-ring size of this command in bytes, before alignment
    /// rounding.
    pub fn total_bytes(&self) -> u32 {
        COMMAND_HEADER_BYTES + self.payload_bytes
    }

    pub fn encode(&self) -> [u8; COMMAND_HEADER_BYTES as usize] {
        let mut buf = [0u8; COMMAND_HEADER_BYTES as usize];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_bytes.to_le_bytes());
        buf[20..24].copy_from_slice(&self.completion_bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < COMMAND_HEADER_BYTES as usize {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        let word = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(buf[range].try_into().expect("4-byte slice"))
        };
        let kind_raw = word(0..4);
        let kind = CommandKind::from_u32(kind_raw).ok_or(HeaderError::BadKind(kind_raw))?;
        let flags_raw = word(4..8);
        let flags =
            CommandFlags::from_bits(flags_raw).ok_or(HeaderError::BadFlags(flags_raw))?;
        let seq = u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice"));
        Ok(CommandHeader {
            kind,
            flags,
            seq,
            payload_bytes: word(16..20),
            completion_bytes: word(20..24),
        })
    }
}

/// Fixed 32-byte completion record header. Field layout (little endian):
///
/// ```text
/// 0..8   sequence    8..12  status
/// 12..16 payload bytes
/// 16..32 reserved, zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionHeader {
    pub seq: u64,
    pub status: CompletionStatus,
    pub payload_bytes: u32,
}

impl CompletionHeader {
    pub fn new(seq: u64, status: CompletionStatus, payload_bytes: u32) -> Self {
        CompletionHeader {
            seq,
            status,
            payload_bytes,
        }
    }

    /// Total on-ring size of this record in bytes, before alignment rounding.
    pub fn total_bytes(&self) -> u32 {
        COMPLETION_HEADER_BYTES + self.payload_bytes
    }

    pub fn encode(&self) -> [u8; COMPLETION_HEADER_BYTES as usize] {
        let mut buf = [0u8; COMPLETION_HEADER_BYTES as usize];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.status as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < COMPLETION_HEADER_BYTES as usize {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        let status_raw = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let status =
            CompletionStatus::from_u32(status_raw).ok_or(HeaderError::BadStatus(status_raw))?;
        Ok(CompletionHeader {
            seq: u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice")),
            status,
            payload_bytes: u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice")),
        })
    }
}
