//! Where finished sessions report their results

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use courier_core::{SessionId, TransferOutcome, TransferResult};

/// Identity of one accepted connection
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub started_at: Instant,
}

impl SessionInfo {
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Receives exactly one result per dispatched session
pub trait ResultSink: Send + Sync {
    fn record(&self, info: &SessionInfo, result: &TransferResult);
}

/// Log each result through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn record(&self, info: &SessionInfo, result: &TransferResult) {
        let elapsed = info.elapsed();
        if result.is_ok() {
            info!(
                session = %info.id,
                peer = %info.peer,
                bytes = result.bytes_transferred,
                elapsed_ms = elapsed.as_millis() as u64,
                "{}",
                result.summary()
            );
        } else {
            warn!(
                session = %info.id,
                peer = %info.peer,
                bytes = result.bytes_transferred,
                outcome = %result.outcome,
                "{}",
                result.summary()
            );
        }
    }
}

/// Running totals across all sessions
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Sessions that reported a result
    pub sessions: AtomicU64,
    pub completed: AtomicU64,
    pub partial: AtomicU64,
    pub io_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    /// Payload bytes moved, including partial transfers
    pub total_bytes: AtomicU64,
}

impl TransferStats {
    /// Get snapshot for reporting
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

impl ResultSink for TransferStats {
    fn record(&self, _info: &SessionInfo, result: &TransferResult) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(result.bytes_transferred, Ordering::Relaxed);
        let counter = match result.outcome {
            TransferOutcome::Ok => &self.completed,
            TransferOutcome::Partial => &self.partial,
            TransferOutcome::IoError => &self.io_errors,
            TransferOutcome::ProtocolError => &self.protocol_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of transfer stats
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub sessions: u64,
    pub completed: u64,
    pub partial: u64,
    pub io_errors: u64,
    pub protocol_errors: u64,
    pub total_bytes: u64,
}

impl TransferStatsSnapshot {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.sessions == 0 {
            100.0
        } else {
            (self.completed as f64 / self.sessions as f64) * 100.0
        }
    }

    pub fn failed(&self) -> u64 {
        self.partial + self.io_errors + self.protocol_errors
    }
}

/// Fan one result out to several sinks
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ResultSink for MultiSink {
    fn record(&self, info: &SessionInfo, result: &TransferResult) {
        for sink in &self.sinks {
            sink.record(info, result);
        }
    }
}

/// Forward results to a channel, for callers that want to await them
impl ResultSink for mpsc::UnboundedSender<(SessionInfo, TransferResult)> {
    fn record(&self, info: &SessionInfo, result: &TransferResult) {
        // Receiver gone means nobody is listening any more
        let _ = self.send((info.clone(), result.clone()));
    }
}
