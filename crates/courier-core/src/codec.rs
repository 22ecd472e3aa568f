//! Frame codec
//!
//! One frame carries one file:
//!
//! ```text
//! [4 bytes]  file name length (u32, big-endian)
//! [n bytes]  file name (UTF-8, single path component)
//! [8 bytes]  file size (u64, big-endian)
//! [size]     payload
//! ```
//!
//! Each connection is opened by a single command byte (see [`Direction`]).
//! Downloads get a one-byte [`ReplyStatus`] before the server's frame.
//!
//! Lengths read off the wire are checked against hard limits before anything
//! is allocated for them, and payloads are always moved in bounded chunks.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{CopyError, FrameError, ProtocolError};
use crate::path::validate_filename;
use crate::types::{Direction, ReplyStatus, TransferRequest};
use crate::{DEFAULT_MAX_FILE_SIZE, FILE_SIZE_FIELD, MAX_FILENAME_LEN, NAME_LEN_PREFIX};

/// Decoded frame header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub file_name: String,
    pub file_size: u64,
}

impl FrameHeader {
    pub fn into_request(self, direction: Direction) -> Result<TransferRequest, ProtocolError> {
        TransferRequest::new(self.file_name, self.file_size, direction)
    }
}

/// Limits applied while decoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_file_size: u64,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Encode a frame header
pub fn encode_header(file_name: &str, file_size: u64) -> Result<Bytes, ProtocolError> {
    validate_filename(file_name)?;

    let mut buf = BytesMut::with_capacity(NAME_LEN_PREFIX + file_name.len() + FILE_SIZE_FIELD);
    buf.put_u32(file_name.len() as u32);
    buf.put_slice(file_name.as_bytes());
    buf.put_u64(file_size);

    Ok(buf.freeze())
}

/// Encode the opening of a download: command byte plus a zero-size header
pub fn encode_download_request(file_name: &str) -> Result<Bytes, ProtocolError> {
    let header = encode_header(file_name, 0)?;

    let mut buf = BytesMut::with_capacity(1 + header.len());
    buf.put_u8(Direction::Download.command_byte());
    buf.put_slice(&header);

    Ok(buf.freeze())
}

/// Read exactly one frame header
pub async fn read_header<R>(reader: &mut R, limits: &FrameLimits) -> Result<FrameHeader, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let name_len = reader.read_u32().await? as usize;

    // Validate length before allocating
    if name_len > MAX_FILENAME_LEN {
        return Err(ProtocolError::NameTooLong {
            len: name_len,
            max: MAX_FILENAME_LEN,
        }
        .into());
    }

    let mut name_buf = vec![0u8; name_len];
    reader.read_exact(&mut name_buf).await?;

    let file_name = String::from_utf8(name_buf)
        .map_err(|_| ProtocolError::InvalidName("file name is not valid UTF-8".into()))?;
    validate_filename(&file_name)?;

    let file_size = reader.read_u64().await?;
    if file_size > limits.max_file_size {
        return Err(ProtocolError::FileTooLarge {
            size: file_size,
            max: limits.max_file_size,
        }
        .into());
    }

    trace!("decoded header: {:?} ({} bytes)", file_name, file_size);
    Ok(FrameHeader {
        file_name,
        file_size,
    })
}

/// Read the command byte that opens a connection
pub async fn read_command<R>(reader: &mut R) -> Result<Direction, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let byte = reader.read_u8().await?;
    Ok(Direction::from_command_byte(byte)?)
}

/// Read the server's reply to a download request
pub async fn read_status<R>(reader: &mut R) -> Result<ReplyStatus, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let byte = reader.read_u8().await?;
    Ok(ReplyStatus::try_from(byte)?)
}

/// Move exactly `len` bytes from `src` to `dst` in chunks of at most `chunk_size`
///
/// Short reads are normal on sockets and are accumulated. Every single read,
/// write and the final flush is bounded by `io_timeout` when one is set.
pub async fn copy_exact<R, W>(
    src: &mut R,
    dst: &mut W,
    len: u64,
    chunk_size: usize,
    io_timeout: Option<Duration>,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut transferred = 0u64;
    if len == 0 {
        return Ok(0);
    }

    let buf_len = usize::try_from(len).map_or(chunk_size, |l| l.min(chunk_size)).max(1);
    let mut buf = vec![0u8; buf_len];

    while transferred < len {
        let want = (len - transferred).min(buf.len() as u64) as usize;

        let n = deadline(io_timeout, src.read(&mut buf[..want]))
            .await
            .map_err(|source| CopyError::Read {
                transferred,
                source,
            })?;

        if n == 0 {
            return Err(CopyError::SourceEnded {
                transferred,
                expected: len,
            });
        }

        deadline(io_timeout, dst.write_all(&buf[..n]))
            .await
            .map_err(|source| CopyError::Write {
                transferred,
                source,
            })?;

        transferred += n as u64;
    }

    deadline(io_timeout, dst.flush())
        .await
        .map_err(|source| CopyError::Write {
            transferred,
            source,
        })?;

    Ok(transferred)
}

/// Bound a fallible I/O step by an optional timeout
///
/// Expiry surfaces as an `io::ErrorKind::TimedOut` error.
pub async fn deadline<T, E, F>(limit: Option<Duration>, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no progress within {:?}", limit),
            )
            .into()),
        },
        None => fut.await,
    }
}

/// Write one buffer with the same timeout rules as the payload loop
pub async fn write_all_timed<W>(
    writer: &mut W,
    buf: &[u8],
    io_timeout: Option<Duration>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    deadline(io_timeout, writer.write_all(buf)).await
}
