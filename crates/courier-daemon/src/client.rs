//! Courier client - one connection per upload or download

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

use courier_core::codec::encode_download_request;
use courier_core::path::{validate_filename, wire_name};
use courier_core::{
    ClientConfig, Direction, ReplyStatus, SessionId, TransferConfig, TransferError,
    TransferResult,
};

use crate::net::{connect, Connection};
use crate::session::TransferSession;
use crate::storage::{Destination, SourceFile};

/// Client errors that happen before any session exists
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::Connect { .. } => 6,
        }
    }
}

/// Courier client
pub struct CourierClient {
    config: ClientConfig,
    transfer: Arc<TransferConfig>,
}

impl CourierClient {
    pub fn new(config: ClientConfig, transfer: TransferConfig) -> Self {
        Self {
            config,
            transfer: Arc::new(transfer),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Upload `local`, stored remotely as `remote_name` or its own file name
    ///
    /// Problems with the local file are reported before connecting.
    pub async fn upload(
        &self,
        local: &Path,
        remote_name: Option<&str>,
    ) -> Result<TransferResult, ClientError> {
        let name = match remote_name {
            Some(name) => name.to_string(),
            None => match wire_name(local) {
                Ok(name) => name,
                Err(e) => return Ok(TransferResult::failed(0, &e.into())),
            },
        };
        if let Err(e) = validate_filename(&name) {
            return Ok(TransferResult::failed(0, &e.into()).with_file_name(name));
        }

        let source = match SourceFile::open(local).await {
            Ok(source) => source,
            Err(e) => {
                return Ok(TransferResult::failed(0, &TransferError::Io(e)).with_file_name(name))
            }
        };

        let mut session = self.open_session().await?;
        info!("Uploading {:?} as {:?} ({} bytes)", local, name, source.len());

        let command = [Direction::Upload.command_byte()];
        if let Err(e) = session.connection_mut().write_all(&command).await {
            let result = TransferResult::failed(0, &TransferError::Io(e)).with_file_name(name);
            return Ok(session.finish(result).await);
        }

        Ok(session.send(source, &name).await)
    }

    /// Download `name` to `output`, or into the download directory
    pub async fn download(
        &self,
        name: &str,
        output: Option<&Path>,
    ) -> Result<TransferResult, ClientError> {
        let request = match encode_download_request(name) {
            Ok(request) => request,
            Err(e) => return Ok(TransferResult::failed(0, &e.into()).with_file_name(name)),
        };

        let target = match output {
            Some(path) => path.to_path_buf(),
            None => default_download_path(&self.config, name),
        };
        if let Err(e) = ensure_parent(&target).await {
            return Ok(TransferResult::failed(0, &TransferError::Io(e)).with_file_name(name));
        }

        let mut session = self.open_session().await?;
        info!("Downloading {:?} to {:?}", name, target);

        if let Err(e) = session.connection_mut().write_all(&request).await {
            let result = TransferResult::failed(0, &TransferError::Io(e)).with_file_name(name);
            return Ok(session.finish(result).await);
        }

        let status = match session.connection_mut().read_status().await {
            Ok(status) => status,
            Err(e) => {
                let result = TransferResult::failed(0, &e.into()).with_file_name(name);
                return Ok(session.finish(result).await);
            }
        };

        if status != ReplyStatus::Ok {
            debug!("Server refused download of {:?}: {}", name, status);
            let result =
                TransferResult::failed(0, &TransferError::Remote(status)).with_file_name(name);
            return Ok(session.finish(result).await);
        }

        Ok(session.receive(&Destination::File(target)).await)
    }

    async fn open_session(&self) -> Result<TransferSession<TcpStream>, ClientError> {
        let host = &self.config.host;
        let port = self.config.port;
        let stream = connect(host, port, self.config.connect_timeout())
            .await
            .map_err(|source| ClientError::Connect {
                host: host.clone(),
                port,
                source,
            })?;

        let conn = Connection::from_tcp(stream, self.transfer.io_timeout());
        Ok(TransferSession::new(
            SessionId::generate(),
            conn,
            self.transfer.clone(),
        ))
    }
}

async fn ensure_parent(target: &Path) -> io::Result<()> {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Default local path for a download
pub fn default_download_path(config: &ClientConfig, name: &str) -> PathBuf {
    config.download_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::TransferOutcome;
    use tempfile::TempDir;

    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout_secs: 2,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails_before_connect() {
        let client = CourierClient::new(unreachable_config(), TransferConfig::default());

        let result = client
            .upload(Path::new("/no/such/file.bin"), None)
            .await
            .unwrap();
        assert_eq!(result.outcome, TransferOutcome::IoError);
        assert_eq!(result.file_name.as_deref(), Some("file.bin"));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_remote_name() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("ok.txt");
        std::fs::write(&local, b"x").unwrap();
        let client = CourierClient::new(unreachable_config(), TransferConfig::default());

        let result = client.upload(&local, Some("../escape")).await.unwrap();
        assert_eq!(result.outcome, TransferOutcome::ProtocolError);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("ok.txt");
        std::fs::write(&local, b"x").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig {
            port,
            ..unreachable_config()
        };
        let client = CourierClient::new(config, TransferConfig::default());

        let err = client.upload(&local, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert!(matches!(err, ClientError::Connect { port: p, .. } if p == port));
    }

    #[test]
    fn test_default_download_path() {
        let config = ClientConfig::default();
        assert_eq!(
            default_download_path(&config, "a.txt"),
            PathBuf::from("downloads").join("a.txt")
        );
    }
}
