//! Courier Core - Shared types, wire codec, and configuration
//!
//! This crate contains the foundational types used by the Courier server and client.
//! It has no dependencies on sockets or the filesystem layout of either side.

pub mod codec;
pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use codec::{copy_exact, deadline, encode_header, read_header, FrameHeader, FrameLimits};
pub use config::{ClientConfig, Config, ConfigError, ServerConfig, TransferConfig};
pub use error::*;
pub use types::*;

/// Default payload chunk size in bytes (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest accepted chunk size (1 KB)
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest accepted chunk size (1 MB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default ceiling on a declared file size (4 GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Size of the file name length prefix on the wire
pub const NAME_LEN_PREFIX: usize = 4;

/// Size of the file size field on the wire
pub const FILE_SIZE_FIELD: usize = 8;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 5001;
