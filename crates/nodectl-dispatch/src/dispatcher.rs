use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::join_all;
use futures::stream::{select_all, SelectAll, Stream, StreamExt};
use nodectl_client::{
    cancellable, ClientConfig, ConnectionRegistry, ResponseStream, RpcClient, Services, StreamReader,
};
use nodectl_common::protocol::{ErrorKind, NodectlError, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::chunk::StreamChunk;
use crate::outcome::{DispatchOutcome, DispatchReport, OutcomeStatus};
use crate::target::NodeTarget;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Settings for every per-node client.
    pub client: ClientConfig,
    /// Chunks a branch may queue ahead of the consumer. Zero is treated as one.
    pub branch_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            branch_buffer: 64,
        }
    }
}

impl DispatchConfig {
    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_branch_buffer(mut self, branch_buffer: usize) -> Self {
        self.branch_buffer = branch_buffer.max(1);
        self
    }
}

/// Check run on every chunk before it is forwarded.
///
/// An error ends that node's branch with [`NodectlError::Handler`]; other
/// branches are unaffected.
pub type ChunkCheck = Arc<dyn Fn(&NodeTarget, &[u8]) -> Result<()> + Send + Sync>;

/// Fans one command out to many nodes.
///
/// Nothing is retried: a node that fails is reported as failed and the
/// others carry on.
#[derive(Clone)]
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<ConnectionRegistry>,
    check: Option<ChunkCheck>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("check", &self.check.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher tracking its clients in the process-wide registry.
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::global(),
            check: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Runs `check` on every chunk of every branch before forwarding it.
    pub fn with_chunk_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&NodeTarget, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Starts `invoke` against every target. Must be called within a tokio
    /// runtime.
    pub fn dispatch<F, Fut>(&self, targets: Vec<NodeTarget>, invoke: F) -> Dispatch
    where
        F: Fn(NodeTarget, Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream>> + Send + 'static,
    {
        self.dispatch_with_cancel(targets, invoke, CancellationToken::new())
    }

    /// Like [`Dispatcher::dispatch`]; cancelling `cancel` stops every branch.
    pub fn dispatch_with_cancel<F, Fut>(
        &self,
        targets: Vec<NodeTarget>,
        invoke: F,
        cancel: CancellationToken,
    ) -> Dispatch
    where
        F: Fn(NodeTarget, Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream>> + Send + 'static,
    {
        let stop = cancel.child_token();
        let invoke = Arc::new(invoke);
        let multiple_nodes = targets.len() > 1;

        debug!(targets = targets.len(), "dispatch started");

        let mut receivers = Vec::with_capacity(targets.len());
        let mut branches = Vec::with_capacity(targets.len());

        for target in targets {
            let (tx, rx) = mpsc::channel(self.config.branch_buffer.max(1));
            receivers.push(ReceiverStream::new(rx));

            let branch = Branch {
                target: target.clone(),
                client: self.config.client.clone(),
                registry: self.registry.clone(),
                stop: stop.clone(),
                multiple_nodes,
                check: self.check.clone(),
                tx,
            };
            let span = info_span!("branch", node = %target.node, endpoint = %target.endpoint);
            let handle = tokio::spawn(branch.run(invoke.clone()).instrument(span));
            branches.push((target, handle));
        }

        Dispatch {
            chunks: select_all(receivers),
            branches,
            stop,
            exhausted: false,
        }
    }
}

/// One target's share of a dispatch.
struct Branch {
    target: NodeTarget,
    client: ClientConfig,
    registry: Arc<ConnectionRegistry>,
    stop: CancellationToken,
    multiple_nodes: bool,
    check: Option<ChunkCheck>,
    tx: mpsc::Sender<StreamChunk>,
}

impl Branch {
    async fn run<F, Fut>(self, invoke: Arc<F>) -> DispatchOutcome
    where
        F: Fn(NodeTarget, Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream>> + Send + 'static,
    {
        let forwarded = AtomicU64::new(0);
        let status = match self.execute(invoke.as_ref(), &forwarded).await {
            Ok(()) => OutcomeStatus::Success,
            Err(e) => {
                if e.is_cancelled() {
                    debug!("branch cancelled");
                } else {
                    warn!(error = %e, "branch failed");
                }
                OutcomeStatus::from_error(&e)
            }
        };

        DispatchOutcome {
            node: self.target.node,
            endpoint: self.target.endpoint,
            status,
            chunks: forwarded.into_inner(),
        }
    }

    /// Opens the client, streams, and closes the client on every path.
    async fn execute<F, Fut>(&self, invoke: &F, forwarded: &AtomicU64) -> Result<()>
    where
        F: Fn(NodeTarget, Services) -> Fut,
        Fut: Future<Output = Result<ResponseStream>>,
    {
        let open = RpcClient::open_with_registry(
            self.target.endpoint.clone(),
            self.client.clone(),
            self.registry.clone(),
        );
        let client = cancellable(&self.stop, open).await?;

        let streamed = self.stream(&client, invoke, forwarded).await;
        let closed = client.close().await;

        match (streamed, closed) {
            (Ok(()), closed) => closed,
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "failed to close client after branch error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn stream<F, Fut>(&self, client: &RpcClient, invoke: &F, forwarded: &AtomicU64) -> Result<()>
    where
        F: Fn(NodeTarget, Services) -> Fut,
        Fut: Future<Output = Result<ResponseStream>>,
    {
        let stream = cancellable(&self.stop, invoke(self.target.clone(), client.services())).await?;

        let tx = &self.tx;
        let target = &self.target;
        let check = self.check.as_deref();
        let multiple_nodes = self.multiple_nodes;

        let drained = StreamReader::new(stream)
            .with_cancellation(self.stop.clone())
            .drain(|payload| {
                let checked = check.map_or(Ok(()), |check| check(target, &payload));
                let chunk = StreamChunk {
                    node: target.node.clone(),
                    payload,
                    multiple_nodes,
                };
                async move {
                    checked?;
                    // the consumer dropped the merged stream
                    tx.send(chunk).await.map_err(|_| NodectlError::Cancelled)?;
                    forwarded.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            })
            .await?;

        debug!(chunks = drained, "stream drained");
        Ok(())
    }
}

/// A running dispatch.
///
/// Yields chunks from all branches as they arrive. Chunks of one node keep
/// their order; chunks of different nodes interleave arbitrarily. Call
/// [`Dispatch::finish`] for the per-node outcomes. Dropping or finishing a
/// dispatch before its chunks are exhausted stops the remaining branches.
pub struct Dispatch {
    chunks: SelectAll<ReceiverStream<StreamChunk>>,
    branches: Vec<(NodeTarget, JoinHandle<DispatchOutcome>)>,
    stop: CancellationToken,
    exhausted: bool,
}

impl Dispatch {
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.next().await
    }

    /// Stops every branch. Chunks already queued can still be read.
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Waits for every branch and returns their outcomes in target order.
    pub async fn finish(mut self) -> DispatchReport {
        if !self.exhausted {
            self.stop.cancel();
        }
        drop(std::mem::replace(&mut self.chunks, SelectAll::new()));

        let (targets, handles): (Vec<_>, Vec<_>) = std::mem::take(&mut self.branches).into_iter().unzip();
        let joined = join_all(handles).await;

        let outcomes = targets
            .into_iter()
            .zip(joined)
            .map(|(target, result)| result.unwrap_or_else(|e| panicked(target, e)))
            .collect();
        DispatchReport::new(outcomes)
    }

    /// Reads every chunk, then finishes.
    pub async fn collect(mut self) -> (Vec<StreamChunk>, DispatchReport) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        (chunks, self.finish().await)
    }
}

impl Stream for Dispatch {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamChunk>> {
        if self.exhausted {
            return Poll::Ready(None);
        }

        match self.chunks.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                self.exhausted = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn panicked(target: NodeTarget, err: JoinError) -> DispatchOutcome {
    warn!(node = %target.node, error = %err, "branch task failed");
    DispatchOutcome {
        node: target.node,
        endpoint: target.endpoint,
        status: OutcomeStatus::Failed {
            kind: ErrorKind::Internal,
            message: format!("branch task failed: {}", err),
        },
        chunks: 0,
    }
}
