//! Concurrency dispatcher
//!
//! Runs each accepted connection as its own task. A semaphore bounds how many
//! sessions execute at once; the permit is taken inside the task, so
//! connections beyond the limit wait in line and the acceptor never blocks.
//!
//! Every session is watched by a supervisor task that delivers exactly one
//! result to the sink, even when the session panics.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info_span, trace, warn, Instrument};

use courier_core::{SessionId, TransferError, TransferResult};

use crate::sink::{ResultSink, SessionInfo};

/// Spawns and tracks sessions
#[derive(Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    max_sessions: usize,
    active: Arc<DashMap<SessionId, SessionInfo>>,
    idle: Arc<Notify>,
    sink: Arc<dyn ResultSink>,
}

impl Dispatcher {
    pub fn new(max_sessions: usize, sink: Arc<dyn ResultSink>) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            active: Arc::new(DashMap::new()),
            idle: Arc::new(Notify::new()),
            sink,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Sessions accepted and not yet finished, including queued ones
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sessions currently holding a permit
    pub fn running_count(&self) -> usize {
        self.max_sessions - self.permits.available_permits()
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Run `handler` for one connection as an independent task
    ///
    /// Returns as soon as the task is spawned. The handler's result, or an
    /// I/O error result if it panics, goes to the sink.
    pub fn dispatch<T, F, Fut>(&self, peer: SocketAddr, io: T, handler: F) -> SessionId
    where
        T: Send + 'static,
        F: FnOnce(SessionInfo, T) -> Fut + Send + 'static,
        Fut: Future<Output = TransferResult> + Send + 'static,
    {
        let info = SessionInfo::new(SessionId::generate(), peer);
        let id = info.id;
        let span = info_span!("session", id = %id, peer = %peer);
        self.active.insert(id, info.clone());

        let permits = self.permits.clone();
        let task_info = info.clone();
        let work = tokio::spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return internal_failure("dispatcher closed"),
                };
                trace!("Session started");
                handler(task_info, io).await
            }
            .instrument(span.clone()),
        );

        let active = self.active.clone();
        let idle = self.idle.clone();
        let sink = self.sink.clone();
        tokio::spawn(
            async move {
                let result = match work.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        error!("Session panicked");
                        internal_failure("session panicked")
                    }
                    Err(_) => {
                        warn!("Session cancelled");
                        internal_failure("session cancelled")
                    }
                };

                sink.record(&info, &result);
                active.remove(&id);
                if active.is_empty() {
                    idle.notify_waiters();
                }
            }
            .instrument(span),
        );

        id
    }

    /// Wait until no session is active, up to `timeout`
    ///
    /// Returns false if sessions were still running when time ran out.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

fn internal_failure(reason: &str) -> TransferResult {
    TransferResult::failed(
        0,
        &TransferError::Io(io::Error::other(reason.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::TransferOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot};

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn channel_dispatcher(
        max: usize,
    ) -> (
        Dispatcher,
        mpsc::UnboundedReceiver<(SessionInfo, TransferResult)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(max, Arc::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (dispatcher, mut rx) = channel_dispatcher(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for n in 0..6u64 {
            let running = running.clone();
            let peak = peak.clone();
            dispatcher.dispatch(peer(), n, move |_, n| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                TransferResult::ok(n)
            });
        }
        assert_eq!(dispatcher.active_count(), 6);

        let mut seen = Vec::new();
        for _ in 0..6 {
            let (_, result) = rx.recv().await.unwrap();
            assert!(result.is_ok());
            seen.push(result.bytes_transferred);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(dispatcher.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(dispatcher.running_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (dispatcher, mut rx) = channel_dispatcher(4);

        let bad = dispatcher.dispatch(peer(), true, |_, explode| async move {
            if explode {
                panic!("handler blew up");
            }
            TransferResult::ok(0)
        });
        let good = dispatcher.dispatch(peer(), (), |_, _| async move { TransferResult::ok(3) });

        let mut results = Vec::new();
        for _ in 0..2 {
            results.push(rx.recv().await.unwrap());
        }

        let (_, bad_result) = results.iter().find(|(i, _)| i.id == bad).unwrap();
        assert_eq!(bad_result.outcome, TransferOutcome::IoError);
        assert!(bad_result
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("session panicked")));
        let (_, good_result) = results.iter().find(|(i, _)| i.id == good).unwrap();
        assert_eq!(good_result.outcome, TransferOutcome::Ok);

        assert!(dispatcher.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_on_stuck_session() {
        let (dispatcher, mut rx) = channel_dispatcher(1);
        let (release, wait) = oneshot::channel::<()>();

        let id = dispatcher.dispatch(peer(), wait, |_, wait| async move {
            let _ = wait.await;
            TransferResult::ok(1)
        });

        assert!(!dispatcher.wait_idle(Duration::from_millis(50)).await);
        let active = dispatcher.active_sessions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);

        release.send(()).unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(rx.recv().await.unwrap().0.id, id);
    }

    #[tokio::test]
    async fn test_idle_dispatcher() {
        let (dispatcher, _rx) = channel_dispatcher(0);
        assert_eq!(dispatcher.max_sessions(), 1);
        assert!(dispatcher.wait_idle(Duration::from_millis(1)).await);
    }
}
