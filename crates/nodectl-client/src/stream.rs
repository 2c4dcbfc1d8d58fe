use std::future::Future;

use nodectl_common::protocol::{NodectlError, Result};
use tokio_util::sync::CancellationToken;

use crate::channel::ResponseStream;

/// Drains one response stream through a per-chunk handler.
///
/// Stops at the natural end of the stream or at the first error, whichever
/// comes first. Nothing is retried. A failing handler ends the drain with
/// [`NodectlError::Handler`], which callers can tell apart from transport
/// loss ([`NodectlError::Transport`]) and agent errors
/// ([`NodectlError::Remote`]).
pub struct StreamReader {
    stream: ResponseStream,
    cancel: Option<CancellationToken>,
}

impl StreamReader {
    pub fn new(stream: ResponseStream) -> Self {
        Self {
            stream,
            cancel: None,
        }
    }

    /// Checks `token` at every receive and around every handler call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Runs until the stream ends and returns the number of chunks handled.
    pub async fn drain<F, Fut>(mut self, mut on_chunk: F) -> Result<u64>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cancel = self.cancel.take().unwrap_or_default();
        let mut handled = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NodectlError::Cancelled),
                chunk = self.stream.recv() => chunk?,
            };
            let Some(chunk) = chunk else {
                return Ok(handled);
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NodectlError::Cancelled),
                result = on_chunk(chunk) => result,
            };
            result.map_err(into_handler_error)?;
            handled += 1;
        }
    }
}

fn into_handler_error(err: NodectlError) -> NodectlError {
    match err {
        NodectlError::Handler(_) | NodectlError::Cancelled => err,
        other => NodectlError::Handler(other.to_string()),
    }
}

/// Runs `fut` unless `token` fires first.
pub async fn cancellable<T, Fut>(token: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(NodectlError::Cancelled),
        result = fut => result,
    }
}
