//! Courier Daemon - File transfer server and client
//!
//! This crate provides:
//! - A TCP server that stores uploads and serves downloads, many at once
//! - A client that performs one upload or download per connection
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  TcpStream   ┌──────────────┐  spawn   ┌──────────────────┐
//! │   Acceptor   │ ───────────▶ │  Dispatcher  │ ───────▶ │ TransferSession  │
//! │ (accept loop)│              │ (semaphore,  │          │ header + payload │
//! └──────────────┘              │  registry)   │          └────────┬─────────┘
//!                               └──────┬───────┘                   │
//!                                      │ one result per session    │ staged file,
//!                                      ▼                           ▼ atomic publish
//!                               ┌──────────────┐          ┌──────────────────┐
//!                               │  ResultSink  │          │     storage      │
//!                               └──────────────┘          └──────────────────┘
//! ```
//!
//! Sessions never share mutable state. The only things they have in common
//! are the configuration, the dispatcher's registry, and the storage
//! directory, where names are claimed atomically.

pub mod acceptor;
pub mod client;
pub mod dispatcher;
pub mod net;
pub mod server;
pub mod session;
pub mod sink;
pub mod storage;

pub use acceptor::{listen, Listener, ListenerHandle};
pub use client::{ClientError, CourierClient};
pub use dispatcher::Dispatcher;
pub use net::Connection;
pub use server::{CourierServer, ServerError};
pub use session::TransferSession;
pub use sink::{
    LogSink, MultiSink, ResultSink, SessionInfo, TransferStats, TransferStatsSnapshot,
};
pub use storage::{Destination, SourceFile, StagedFile};

/// Exit code when configuration or startup fails
pub const EXIT_STARTUP_FAILURE: u8 = 1;
