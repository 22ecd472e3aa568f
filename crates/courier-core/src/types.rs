//! Core types for Courier

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, TransferError};
use crate::path::validate_filename;

/// Which way the file moves, seen from the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Client sends a file to the server (PUT)
    Upload = 0x01,
    /// Client fetches a file from the server (GET)
    Download = 0x02,
}

impl Direction {
    /// Command byte that opens every connection
    pub fn command_byte(self) -> u8 {
        self as u8
    }

    pub fn from_command_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Direction::Upload),
            0x02 => Ok(Direction::Download),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "PUT"),
            Direction::Download => write!(f, "GET"),
        }
    }
}

/// A request to move one file. Fields are fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    file_name: String,
    file_size: u64,
    direction: Direction,
}

impl TransferRequest {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        direction: Direction,
    ) -> Result<Self, ProtocolError> {
        let file_name = file_name.into();
        validate_filename(&file_name)?;
        Ok(Self {
            file_name,
            file_size,
            direction,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Status byte the server sends in reply to a download request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0x00,
    NotFound = 0x01,
    Invalid = 0x02,
    IoError = 0x03,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(ReplyStatus::Ok),
            0x01 => Ok(ReplyStatus::NotFound),
            0x02 => Ok(ReplyStatus::Invalid),
            0x03 => Ok(ReplyStatus::IoError),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Ok => write!(f, "ok"),
            ReplyStatus::NotFound => write!(f, "file not found"),
            ReplyStatus::Invalid => write!(f, "invalid request"),
            ReplyStatus::IoError => write!(f, "server I/O error"),
        }
    }
}

/// Final classification of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferOutcome {
    Ok,
    Partial,
    IoError,
    ProtocolError,
}

impl TransferOutcome {
    /// Process exit code for a client run that ended with this outcome
    pub fn exit_code(self) -> u8 {
        match self {
            TransferOutcome::Ok => 0,
            TransferOutcome::IoError => 3,
            TransferOutcome::ProtocolError => 4,
            TransferOutcome::Partial => 5,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Ok => write!(f, "OK"),
            TransferOutcome::Partial => write!(f, "PARTIAL"),
            TransferOutcome::IoError => write!(f, "IO_ERROR"),
            TransferOutcome::ProtocolError => write!(f, "PROTOCOL_ERROR"),
        }
    }
}

/// What one session produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub outcome: TransferOutcome,
    /// Name from the frame header, once known
    pub file_name: Option<String>,
    /// Final path of a received file (receiver, OK only)
    pub stored_at: Option<PathBuf>,
    /// Failure description for logs
    pub detail: Option<String>,
}

impl TransferResult {
    pub fn ok(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            outcome: TransferOutcome::Ok,
            file_name: None,
            stored_at: None,
            detail: None,
        }
    }

    pub fn failed(bytes_transferred: u64, error: &TransferError) -> Self {
        Self {
            bytes_transferred,
            outcome: error.outcome(),
            file_name: None,
            stored_at: None,
            detail: Some(error.to_string()),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_stored_at(mut self, path: PathBuf) -> Self {
        self.stored_at = Some(path);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == TransferOutcome::Ok
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let name = self.file_name.as_deref().unwrap_or("<unknown>");
        match &self.detail {
            Some(detail) => format!(
                "{} '{}' ({} bytes): {}",
                self.outcome, name, self.bytes_transferred, detail
            ),
            None => format!("{} '{}' ({} bytes)", self.outcome, name, self.bytes_transferred),
        }
    }
}

/// Random per-session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 8]);

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            // No OS entropy: mix a process counter with the clock
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
            bytes = (nanos ^ count.rotate_left(32)).to_be_bytes();
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// What the server does when an upload's name is already taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Publish under the next free `name-N.ext`
    #[default]
    KeepBoth,
    /// Atomically replace the existing file
    Overwrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_command_byte() {
        assert_eq!(
            Direction::from_command_byte(Direction::Upload.command_byte()).unwrap(),
            Direction::Upload
        );
        assert_eq!(
            Direction::from_command_byte(0x02).unwrap(),
            Direction::Download
        );
        assert_eq!(
            Direction::from_command_byte(0x7f),
            Err(ProtocolError::UnknownCommand(0x7f))
        );
    }

    #[test]
    fn test_request_rejects_bad_names() {
        assert!(TransferRequest::new("a.txt", 12, Direction::Upload).is_ok());
        assert!(TransferRequest::new("", 0, Direction::Upload).is_err());
        assert!(TransferRequest::new("dir/a.txt", 0, Direction::Upload).is_err());
        assert!(TransferRequest::new("..", 0, Direction::Download).is_err());
    }

    #[test]
    fn test_reply_status_parse() {
        assert_eq!(ReplyStatus::try_from(0x01).unwrap(), ReplyStatus::NotFound);
        assert_eq!(
            ReplyStatus::try_from(0x09),
            Err(ProtocolError::UnknownStatus(0x09))
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            TransferOutcome::Ok.exit_code(),
            TransferOutcome::Partial.exit_code(),
            TransferOutcome::IoError.exit_code(),
            TransferOutcome::ProtocolError.exit_code(),
        ];
        assert_eq!(codes[0], 0);
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_session_ids_differ() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn test_result_summary() {
        let err = TransferError::Partial {
            received: 500,
            expected: 1000,
        };
        let result = TransferResult::failed(500, &err).with_file_name("b.bin");
        assert_eq!(result.outcome, TransferOutcome::Partial);
        let summary = result.summary();
        assert!(summary.starts_with("PARTIAL 'b.bin' (500 bytes)"));
    }

    #[test]
    fn test_conflict_policy_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: ConflictPolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"policy = "overwrite""#).unwrap();
        assert_eq!(parsed.policy, ConflictPolicy::Overwrite);
        let parsed: Wrapper = toml::from_str(r#"policy = "keep-both""#).unwrap();
        assert_eq!(parsed.policy, ConflictPolicy::KeepBoth);
    }
}
