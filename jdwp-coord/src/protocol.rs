// JDWP protocol definitions, packet handling and the engine error taxonomy
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

// JDWP uses big-endian (network byte order) for all multi-byte values

pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("JDWP error code {0}: {1}")]
    JdwpErrorCode(u16, String),

    /// A stack operation needed a suspended thread and the thread was running.
    #[error("Thread {0:#x} is not suspended")]
    ThreadNotSuspended(u64),

    /// The frame handle was captured before the thread's stack changed.
    #[error("Stale frame handle for thread {thread:#x} (generation {held}, current {current})")]
    StaleFrame { thread: u64, held: u64, current: u64 },

    #[error("Frame index {index} out of range (thread {thread:#x} has {count} frames)")]
    FrameIndexOutOfRange { thread: u64, index: usize, count: usize },

    #[error("Event set #{0} was already resumed")]
    DoubleResume(u64),

    #[error("Resume without matching suspend ({0})")]
    UnbalancedResume(String),

    #[error("Controlled process disconnected")]
    Disconnected,

    #[error("Ambiguous request: {0}")]
    AmbiguousRequest(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown request key {0}")]
    UnknownRequest(u32),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordError {
    /// Map a JDWP reply error code onto the engine taxonomy where one exists.
    pub fn from_error_code(code: u16, thread: u64) -> Self {
        match code {
            error_codes::THREAD_NOT_SUSPENDED => CoordError::ThreadNotSuspended(thread),
            error_codes::VM_DEAD => CoordError::Disconnected,
            _ => CoordError::JdwpErrorCode(code, error_message(code).to_string()),
        }
    }

    /// True for errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordError::Disconnected
                | CoordError::Io(_)
                | CoordError::InvalidHandshake
                | CoordError::Timeout(_)
        )
    }
}

// JDWP handshake string
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

pub mod error_codes {
    pub const NONE: u16 = 0;
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const INVALID_CLASS: u16 = 21;
    pub const CLASS_NOT_PREPARED: u16 = 22;
    pub const INVALID_METHODID: u16 = 23;
    pub const INVALID_LOCATION: u16 = 24;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const NO_MORE_FRAMES: u16 = 31;
    pub const OPAQUE_FRAME: u16 = 32;
    pub const NOT_FOUND: u16 = 41;
    pub const VM_DEAD: u16 = 112;
    pub const INTERNAL: u16 = 113;
    pub const INVALID_INDEX: u16 = 503;
}

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // command flag
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }
}

impl ReplyPacket {
    pub fn decode(mut buf: &[u8]) -> CoordResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(CoordError::Protocol("Reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(CoordError::Protocol(format!("Invalid reply flag: {:#x}", flags)));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_codes::NONE
    }

    pub fn check_error(&self) -> CoordResult<()> {
        if self.is_error() {
            Err(CoordError::JdwpErrorCode(
                self.error_code,
                self.error_message().to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Like `check_error`, but maps thread-related codes onto the engine taxonomy
    pub fn check_thread_error(&self, thread: u64) -> CoordResult<()> {
        if self.is_error() {
            Err(CoordError::from_error_code(self.error_code, thread))
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn error_message(&self) -> &'static str {
        error_message(self.error_code)
    }
}

pub fn error_message(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        10 => "INVALID_THREAD",
        11 => "INVALID_THREAD_GROUP",
        13 => "THREAD_NOT_SUSPENDED",
        14 => "THREAD_SUSPENDED",
        20 => "INVALID_OBJECT",
        21 => "INVALID_CLASS",
        22 => "CLASS_NOT_PREPARED",
        23 => "INVALID_METHODID",
        24 => "INVALID_LOCATION",
        30 => "INVALID_FRAMEID",
        31 => "NO_MORE_FRAMES",
        32 => "OPAQUE_FRAME",
        33 => "NOT_CURRENT_FRAME",
        40 => "DUPLICATE",
        41 => "NOT_FOUND",
        50 => "INVALID_MONITOR",
        51 => "NOT_MONITOR_OWNER",
        99 => "NOT_IMPLEMENTED",
        100 => "NULL_POINTER",
        101 => "ABSENT_INFORMATION",
        102 => "INVALID_EVENT_TYPE",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        111 => "ACCESS_DENIED",
        112 => "VM_DEAD",
        113 => "INTERNAL",
        115 => "UNATTACHED_THREAD",
        503 => "INVALID_INDEX",
        504 => "INVALID_LENGTH",
        512 => "INVALID_COUNT",
        _ => "UNKNOWN_ERROR",
    }
}
