//! Transfer session - one file over one connection
//!
//! A session owns its [`Connection`] and consumes itself when it runs, so the
//! connection is closed exactly once on every path (success, partial, error)
//! and can never be reused.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use courier_core::{
    copy_exact, encode_header, CopyError, FrameHeader, SessionId, TransferConfig, TransferError,
    TransferResult,
};

use crate::net::Connection;
use crate::storage::{Destination, SourceFile, StagedFile};

/// One transfer in progress
pub struct TransferSession<S = TcpStream> {
    id: SessionId,
    conn: Connection<S>,
    config: Arc<TransferConfig>,
}

impl<S> TransferSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: SessionId, conn: Connection<S>, config: Arc<TransferConfig>) -> Self {
        Self { id, conn, config }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Direct access for the command/status bytes exchanged before the frame
    pub fn connection_mut(&mut self) -> &mut Connection<S> {
        &mut self.conn
    }

    /// End the session early with an already decided result
    pub async fn finish(self, result: TransferResult) -> TransferResult {
        self.conn.close().await;
        result
    }

    /// Sender role: open `path` and send it as `file_name`
    pub async fn send_path(self, path: &Path, file_name: &str) -> TransferResult {
        match SourceFile::open(path).await {
            Ok(source) => self.send(source, file_name).await,
            Err(e) => {
                let result =
                    TransferResult::failed(0, &TransferError::Io(e)).with_file_name(file_name);
                self.finish(result).await
            }
        }
    }

    /// Sender role: write the header, stream the file, flush, close
    pub async fn send(mut self, mut source: SourceFile, file_name: &str) -> TransferResult {
        let result = match self.send_frame(&mut source, file_name).await {
            Ok(sent) => TransferResult::ok(sent),
            Err((sent, e)) => TransferResult::failed(sent, &e),
        }
        .with_file_name(file_name);

        self.finish(result).await
    }

    async fn send_frame(
        &mut self,
        source: &mut SourceFile,
        file_name: &str,
    ) -> Result<u64, (u64, TransferError)> {
        let len = source.len();
        let header =
            encode_header(file_name, len).map_err(|e| (0u64, TransferError::from(e)))?;
        self.conn
            .write_all(&header)
            .await
            .map_err(|e| (0u64, TransferError::from(e)))?;

        debug!("Sending {:?} ({} bytes) from {:?}", file_name, len, source.path());

        let io_timeout = self.conn.io_timeout();
        let chunk_size = self.config.chunk_size;
        copy_exact(
            source.file_mut(),
            self.conn.stream_mut(),
            len,
            chunk_size,
            io_timeout,
        )
        .await
        .map_err(|e| (e.transferred(), sender_error(e)))
    }

    /// Receiver role: read the header, then the payload into `destination`
    pub async fn receive(mut self, destination: &Destination) -> TransferResult {
        let limits = self.config.limits();
        let result = match self.conn.read_header(&limits).await {
            Ok(header) => self.receive_payload(header, destination).await,
            Err(e) => TransferResult::failed(0, &e.into()),
        };

        self.finish(result).await
    }

    async fn receive_payload(
        &mut self,
        header: FrameHeader,
        destination: &Destination,
    ) -> TransferResult {
        let FrameHeader {
            file_name,
            file_size,
        } = header;

        let placement = match destination.place(&file_name) {
            Ok(placement) => placement,
            Err(e) => return TransferResult::failed(0, &e.into()).with_file_name(file_name),
        };

        let mut staged = match StagedFile::create(&placement, self.id).await {
            Ok(staged) => staged,
            Err(e) => {
                return TransferResult::failed(0, &TransferError::Io(e)).with_file_name(file_name)
            }
        };

        debug!(
            "Receiving {:?} ({} bytes) into {:?}",
            file_name,
            file_size,
            staged.temp_path()
        );

        let io_timeout = self.conn.io_timeout();
        let chunk_size = self.config.chunk_size;
        let copied = match staged.file_mut() {
            Ok(file) => {
                copy_exact(
                    self.conn.stream_mut(),
                    file,
                    file_size,
                    chunk_size,
                    io_timeout,
                )
                .await
            }
            Err(e) => Err(CopyError::Write {
                transferred: 0,
                source: e,
            }),
        };

        match copied {
            Ok(received) => match staged.commit(&placement.target, placement.policy).await {
                Ok(path) => TransferResult::ok(received)
                    .with_file_name(file_name)
                    .with_stored_at(path),
                Err(e) => TransferResult::failed(received, &TransferError::Io(e))
                    .with_file_name(file_name),
            },
            Err(e) => {
                staged.discard().await;
                let received = e.transferred();
                TransferResult::failed(received, &receiver_error(e, file_size))
                    .with_file_name(file_name)
            }
        }
    }
}

/// Sender side: every failure is an I/O error
fn sender_error(e: CopyError) -> TransferError {
    match e {
        CopyError::SourceEnded {
            transferred,
            expected,
        } => TransferError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "source file shrank during transfer ({} of {} bytes)",
                transferred, expected
            ),
        )),
        CopyError::Read { source, .. } | CopyError::Write { source, .. } => {
            TransferError::Io(source)
        }
    }
}

/// Receiver side: losing the connection is partial, losing the disk is I/O
fn receiver_error(e: CopyError, expected: u64) -> TransferError {
    match e {
        CopyError::SourceEnded { transferred, .. } => TransferError::Partial {
            received: transferred,
            expected,
        },
        CopyError::Read {
            transferred,
            source,
        } => {
            trace!("Payload read failed after {} bytes: {}", transferred, source);
            TransferError::Partial {
                received: transferred,
                expected,
            }
        }
        CopyError::Write { source, .. } => TransferError::Io(source),
    }
}
