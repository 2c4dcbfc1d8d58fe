//! Length-prefixed framing for async streams.
//!
//! Generic over any `AsyncRead`/`AsyncWrite`, so the same code serves both
//! halves of a split `UnixStream` on the client and the agent side.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{NodectlError, Result};

/// Receive ceiling applied when no other limit is configured (16 MiB).
///
/// Kernel log batches routinely exceed small default limits, while an
/// unbounded limit lets a misbehaving peer exhaust client memory.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// Writes one frame without flushing.
///
/// Wire format: `[4-byte length as u32 big-endian] + [data]`. Callers batch
/// several frames and flush once.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| NodectlError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary. A length prefix above `max_size` fails before allocating.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(NodectlError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    Ok(Some(buf))
}

/// Map IO errors on an established stream to transport errors.
fn map_io_error(err: std::io::Error, context: &str) -> NodectlError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            NodectlError::Transport(format!("{}: connection lost", context))
        }
        _ => NodectlError::Transport(format!("{}: {}", context, err)),
    }
}
