//! Error types for the Courier protocol

use std::io;

use thiserror::Error;

use crate::types::{ReplyStatus, TransferOutcome};

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("connection closed before the frame header was complete")]
    TruncatedHeader,

    #[error("file name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("unknown reply status: {0:#04x}")]
    UnknownStatus(u8),
}

/// Failure while reading a frame header
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error while reading frame header: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // The peer went away mid-header
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FrameError::Protocol(ProtocolError::TruncatedHeader),
            _ => FrameError::Io(e),
        }
    }
}

/// Failure while moving payload bytes between two streams
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("source ended after {transferred} of {expected} bytes")]
    SourceEnded { transferred: u64, expected: u64 },

    #[error("read failed after {transferred} bytes: {source}")]
    Read {
        transferred: u64,
        #[source]
        source: io::Error,
    },

    #[error("write failed after {transferred} bytes: {source}")]
    Write {
        transferred: u64,
        #[source]
        source: io::Error,
    },
}

impl CopyError {
    /// Bytes fully moved before the failure
    pub fn transferred(&self) -> u64 {
        match self {
            CopyError::SourceEnded { transferred, .. }
            | CopyError::Read { transferred, .. }
            | CopyError::Write { transferred, .. } => *transferred,
        }
    }
}

/// Why a single transfer session did not complete
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed after {received} of {expected} bytes")]
    Partial { received: u64, expected: u64 },

    #[error("remote refused the transfer: {0}")]
    Remote(ReplyStatus),
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Protocol(p) => TransferError::Protocol(p),
            FrameError::Io(io) => TransferError::Io(io),
        }
    }
}

impl TransferError {
    /// Outcome reported for this failure
    pub fn outcome(&self) -> TransferOutcome {
        match self {
            TransferError::Protocol(_) => TransferOutcome::ProtocolError,
            TransferError::Io(_) => TransferOutcome::IoError,
            TransferError::Partial { .. } => TransferOutcome::Partial,
            TransferError::Remote(ReplyStatus::Invalid) => TransferOutcome::ProtocolError,
            TransferError::Remote(_) => TransferOutcome::IoError,
        }
    }
}
