//! Courier server
//!
//! Accepts connections and runs one transfer session per connection:
//! PUT stores an upload in the storage directory, GET streams a stored file
//! back to the client.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use courier_core::path::{is_staging_name, resolve};
use courier_core::{
    Direction, ReplyStatus, ServerConfig, TransferConfig, TransferError,
    TransferResult,
};

use crate::acceptor::{listen, Listener, ListenerHandle};
use crate::dispatcher::Dispatcher;
use crate::net::Connection;
use crate::session::TransferSession;
use crate::sink::{LogSink, MultiSink, ResultSink, SessionInfo, TransferStats};
use crate::storage::{Destination, SourceFile};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("storage directory {path:?} unusable: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a session task needs, shared across sessions
struct ServerContext {
    storage_dir: PathBuf,
    destination: Destination,
    transfer: Arc<TransferConfig>,
}

/// A bound server, ready to serve
pub struct CourierServer {
    config: ServerConfig,
    listener: Listener,
    dispatcher: Dispatcher,
    stats: Arc<TransferStats>,
    context: Arc<ServerContext>,
}

impl CourierServer {
    /// Prepare storage and bind the listening socket
    ///
    /// Results go to `sink` in addition to the server's own log and stats.
    pub async fn bind(
        config: ServerConfig,
        transfer: TransferConfig,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, ServerError> {
        let storage_dir = config.storage_dir.clone();
        tokio::fs::create_dir_all(&storage_dir)
            .await
            .map_err(|source| ServerError::Storage {
                path: storage_dir.clone(),
                source,
            })?;

        let listener = listen(config.bind_addr()).await?;

        let stats = Arc::new(TransferStats::default());
        let sinks = MultiSink::new()
            .with(Arc::new(LogSink))
            .with(stats.clone())
            .with(sink);
        let dispatcher = Dispatcher::new(config.max_sessions, Arc::new(sinks));

        let context = Arc::new(ServerContext {
            destination: Destination::Directory {
                dir: storage_dir.clone(),
                on_conflict: config.on_conflict,
            },
            storage_dir,
            transfer: Arc::new(transfer),
        });

        Ok(Self {
            config,
            listener,
            dispatcher,
            stats,
            context,
        })
    }

    /// Bind with results only logged
    pub async fn bind_default(
        config: ServerConfig,
        transfer: TransferConfig,
    ) -> Result<Self, ServerError> {
        Self::bind(config, transfer, Arc::new(MultiSink::new())).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle used to stop the server
    pub fn handle(&self) -> ListenerHandle {
        self.listener.handle()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    /// Serve until stopped, then give running sessions the grace period
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self {
            config,
            listener,
            dispatcher,
            stats,
            context,
        } = self;

        info!(
            "Courier server on {} storing into {:?} (max {} sessions)",
            listener.local_addr(),
            context.storage_dir,
            dispatcher.max_sessions()
        );

        let io_timeout = context.transfer.io_timeout();
        listener
            .accept_loop(|stream, peer| {
                let context = context.clone();
                let conn = Connection::from_tcp(stream, io_timeout);
                dispatcher.dispatch(peer, conn, move |info, conn| {
                    serve_connection(info, conn, context)
                });
            })
            .await;

        let grace = config.shutdown_grace();
        let pending = dispatcher.active_count();
        if pending > 0 {
            info!(
                "Waiting up to {:?} for {} session(s) to finish",
                grace, pending
            );
            if !dispatcher.wait_idle(grace).await {
                warn!(
                    "{} session(s) still running after grace period",
                    dispatcher.active_count()
                );
            }
        }

        let snapshot = stats.snapshot();
        info!(
            sessions = snapshot.sessions,
            completed = snapshot.completed,
            failed = snapshot.failed(),
            bytes = snapshot.total_bytes,
            "Server stopped ({:.1}% success)",
            snapshot.success_rate()
        );
        Ok(())
    }
}

/// Run one session on an accepted connection
async fn serve_connection(
    info: SessionInfo,
    conn: Connection<TcpStream>,
    context: Arc<ServerContext>,
) -> TransferResult {
    let mut session = TransferSession::new(info.id, conn, context.transfer.clone());

    let direction = match session.connection_mut().read_command().await {
        Ok(direction) => direction,
        Err(e) => {
            debug!("No valid command from {}: {}", info.peer, e);
            return session.finish(TransferResult::failed(0, &e.into())).await;
        }
    };
    debug!("{} request from {}", direction, info.peer);

    match direction {
        Direction::Upload => session.receive(&context.destination).await,
        Direction::Download => serve_download(session, &context).await,
    }
}

/// Answer a GET: status byte, then the file as one frame
async fn serve_download<S>(
    mut session: TransferSession<S>,
    context: &ServerContext,
) -> TransferResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let limits = context.transfer.limits();
    let request = match session.connection_mut().read_header(&limits).await {
        Ok(header) => header.into_request(Direction::Download).map_err(TransferError::from),
        Err(e) => Err(e.into()),
    };
    let name = match request {
        Ok(request) => request.file_name().to_string(),
        Err(e) => {
            let result = TransferResult::failed(0, &e);
            return refuse(session, ReplyStatus::Invalid, result).await;
        }
    };

    let source = match open_stored(&context.storage_dir, &name).await {
        Ok(source) => source,
        Err((status, error)) => {
            let result = TransferResult::failed(0, &error).with_file_name(name);
            return refuse(session, status, result).await;
        }
    };

    if let Err(e) = session
        .connection_mut()
        .write_all(&[ReplyStatus::Ok as u8])
        .await
    {
        let result = TransferResult::failed(0, &TransferError::Io(e)).with_file_name(name);
        return session.finish(result).await;
    }

    session.send(source, &name).await
}

/// Find a stored file for download
///
/// Uploads still in progress are not stored files yet and answer `NotFound`.
async fn open_stored(
    storage_dir: &Path,
    name: &str,
) -> Result<SourceFile, (ReplyStatus, TransferError)> {
    let path = resolve(storage_dir, name)
        .map_err(|e| (ReplyStatus::Invalid, TransferError::Protocol(e)))?;
    if is_staging_name(name) {
        let e = io::Error::new(io::ErrorKind::NotFound, format!("{:?} is not stored", name));
        return Err((ReplyStatus::NotFound, TransferError::Io(e)));
    }

    SourceFile::open(&path).await.map_err(|e| {
        let status = match e.kind() {
            io::ErrorKind::NotFound => ReplyStatus::NotFound,
            _ => ReplyStatus::IoError,
        };
        (status, TransferError::Io(e))
    })
}

async fn refuse<S>(
    mut session: TransferSession<S>,
    status: ReplyStatus,
    result: TransferResult,
) -> TransferResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("Refusing download: {}", status);
    if let Err(e) = session.connection_mut().write_all(&[status as u8]).await {
        debug!("Failed to send {} status: {}", status, e);
    }
    session.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::codec::encode_download_request;
    use courier_core::{encode_header, SessionId, TransferOutcome};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context(dir: &Path) -> ServerContext {
        ServerContext {
            storage_dir: dir.to_path_buf(),
            destination: Destination::Directory {
                dir: dir.to_path_buf(),
                on_conflict: Default::default(),
            },
            transfer: Arc::new(TransferConfig::default()),
        }
    }

    fn pipe_session(
        stream: tokio::io::DuplexStream,
    ) -> TransferSession<tokio::io::DuplexStream> {
        TransferSession::new(
            SessionId::generate(),
            Connection::new(stream, None, Some(std::time::Duration::from_secs(5))),
            Arc::new(TransferConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_serve_download_streams_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello world!").unwrap();
        let context = context(dir.path());

        let (mut client, server) = tokio::io::duplex(4096);
        let request = encode_download_request("notes.txt").unwrap();
        // Command byte is consumed by serve_connection before this point
        client.write_all(&request[1..]).await.unwrap();

        let result = serve_download(pipe_session(server), &context).await;
        assert_eq!(result.outcome, TransferOutcome::Ok);
        assert_eq!(result.bytes_transferred, 12);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let mut expected = vec![ReplyStatus::Ok as u8];
        expected.extend_from_slice(&encode_header("notes.txt", 12).unwrap());
        expected.extend_from_slice(b"hello world!");
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_serve_download_not_found() {
        let dir = TempDir::new().unwrap();
        let context = context(dir.path());

        let (mut client, server) = tokio::io::duplex(4096);
        let request = encode_download_request("missing.bin").unwrap();
        client.write_all(&request[1..]).await.unwrap();

        let result = serve_download(pipe_session(server), &context).await;
        assert_eq!(result.outcome, TransferOutcome::IoError);
        assert_eq!(result.file_name.as_deref(), Some("missing.bin"));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![ReplyStatus::NotFound as u8]);
    }

    #[tokio::test]
    async fn test_serve_download_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let context = context(dir.path());

        let (mut client, server) = tokio::io::duplex(4096);
        let mut request = Vec::new();
        request.extend_from_slice(&(2u32).to_be_bytes());
        request.extend_from_slice(b"..");
        request.extend_from_slice(&0u64.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let result = serve_download(pipe_session(server), &context).await;
        assert_eq!(result.outcome, TransferOutcome::ProtocolError);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![ReplyStatus::Invalid as u8]);
    }

    #[tokio::test]
    async fn test_open_stored_rejects_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        match open_stored(dir.path(), "sub").await {
            Err((status, _)) => assert_eq!(status, ReplyStatus::IoError),
            Ok(_) => panic!("directory served as file"),
        }
    }

    #[tokio::test]
    async fn test_open_stored_hides_staging_files() {
        let dir = TempDir::new().unwrap();
        let staged = courier_core::path::staging_name("big.bin", SessionId::generate());
        std::fs::write(dir.path().join(&staged), [0u8; 500]).unwrap();

        match open_stored(dir.path(), &staged).await {
            Err((status, _)) => assert_eq!(status, ReplyStatus::NotFound),
            Ok(_) => panic!("staging file served"),
        }
    }

    #[tokio::test]
    async fn test_bind_creates_storage_dir() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("nested").join("store");
        let config = ServerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            storage_dir: storage.clone(),
            ..ServerConfig::default()
        };

        let server = CourierServer::bind_default(config, TransferConfig::default())
            .await
            .unwrap();
        assert!(storage.is_dir());
        assert_ne!(server.local_addr().port(), 0);

        let handle = server.handle();
        let serving = tokio::spawn(server.serve());
        handle.stop();
        serving.await.unwrap().unwrap();
    }
}
