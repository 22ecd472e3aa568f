//! Connection acceptor
//!
//! Owns the listening socket. Every accepted stream is handed off
//! immediately, so the loop never waits on a session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::server::ServerError;

/// Pause after an accept error that is not about a single connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Stops a running accept loop from anywhere
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ListenerHandle {
    /// Stop accepting; the loop returns and the socket is closed
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Bind a listening socket on `addr`
pub async fn listen(addr: SocketAddr) -> Result<Listener, ServerError> {
    let inner = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = inner
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;

    let (shutdown, _) = watch::channel(false);
    info!("Listening on {}", local_addr);

    Ok(Listener {
        inner,
        local_addr,
        shutdown: Arc::new(shutdown),
    })
}

impl Listener {
    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept until stopped, handing each connection to `on_accept`
    ///
    /// `on_accept` must not block. Errors from a single failed accept are
    /// logged and the loop keeps going.
    pub async fn accept_loop<F>(self, mut on_accept: F)
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        let mut stop = self.shutdown.subscribe();

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                _ = stop.changed() => continue,

                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        on_accept(stream, peer);
                    }
                    Err(e) if is_per_connection(&e) => {
                        debug!("Connection dropped during accept: {}", e);
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("Stopped accepting on {}", self.local_addr);
    }
}

fn is_per_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_accepts_until_stopped() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        let handle = listener.handle();
        assert_ne!(addr.port(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(listener.accept_loop(move |stream, peer| {
            let _ = tx.send((stream, peer));
        }));

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        for client in &clients {
            let (_, peer) = rx.recv().await.unwrap();
            assert_eq!(peer, client.local_addr().unwrap());
        }

        handle.stop();
        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(2), accept)
            .await
            .unwrap()
            .unwrap();

        // Socket is closed once the loop returns
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_loop_starts() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        listener.handle().stop();
        tokio::time::timeout(Duration::from_secs(1), listener.accept_loop(|_, _| {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr();

        match listen(addr).await {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind on {} succeeded", addr),
        }
        first.handle().stop();
    }
}
