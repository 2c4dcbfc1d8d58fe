//! One multiplexed connection to an agent.
//!
//! A channel owns two tasks. The reader routes incoming frames to the call
//! they belong to; the writer is the shared write buffer every call enqueues
//! into. Frames are written through one `BufWriter` and flushed once per
//! drained batch.
//!
//! The reader never waits on a call. Streamed calls are windowed instead: the
//! agent may run at most `stream_buffer` frames ahead of the consumer, and
//! the consumer hands out credit as it reads. An agent that overruns the
//! window fails only that call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nodectl_common::protocol::{
    ClientMessage, NodectlError, Request, RequestId, Result, RpcArgs, RpcResult, ServerMessage,
};
use nodectl_common::transport::{read_frame, write_frame, Endpoint, JsonCodec};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;

/// What the reader delivers to a pending call.
#[derive(Debug)]
enum CallEvent {
    Frame(ServerMessage),
    /// The connection failed; carries the reason.
    Failed(String),
}

/// Routing entry for one call.
#[derive(Clone)]
struct PendingCall {
    tx: mpsc::UnboundedSender<CallEvent>,
    /// Data frames delivered but not yet read; `None` for unary calls.
    unread: Option<Arc<AtomicU32>>,
}

struct ChannelShared {
    endpoint: Endpoint,
    config: ClientConfig,
    /// Flow-control window of streamed calls.
    window: u32,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    /// Set under the `pending` lock once the connection is gone.
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Cloneable handle to a connection. Stubs and streams share it.
#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<ChannelShared>,
}

impl RpcChannel {
    /// Splits the stream and spawns the reader and writer tasks.
    pub(crate) fn start(
        stream: UnixStream,
        endpoint: Endpoint,
        config: ClientConfig,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();

        let window = u32::try_from(config.stream_buffer.max(1)).unwrap_or(u32::MAX);
        let shared = Arc::new(ChannelShared {
            endpoint,
            config,
            window,
            outbound,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let tasks = vec![
            tokio::spawn(read_loop(reader, shared.clone())),
            tokio::spawn(write_loop(writer, rx, shared.shutdown.clone())),
        ];

        (Self { shared }, tasks)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.shared.shutdown.is_cancelled()
    }

    /// Stops both tasks. Calls still pending observe a transport error.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Starts a streaming call.
    pub fn call_stream(&self, method: &str, args: RpcArgs) -> Result<ResponseStream> {
        self.start_call(Request::new(method, args).with_window(self.shared.window))
    }

    /// Makes a unary call, bounded by the configured call timeout.
    pub async fn call_unary(&self, method: &str, args: RpcArgs) -> Result<RpcResult> {
        let timeout = self.shared.config.call_timeout;
        let mut request = Request::new(method, args);
        if let Some(limit) = timeout {
            request = request.with_timeout(millis(limit));
        }

        // dropping the pending stream on timeout cancels the call agent-side
        let mut call = self.start_call(request)?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call.recv_unary())
                .await
                .map_err(|_| NodectlError::Timeout(millis(limit)))?,
            None => call.recv_unary().await,
        }
    }

    fn start_call(&self, request: Request) -> Result<ResponseStream> {
        let id = request.id;
        let (tx, rx) = mpsc::unbounded_channel();
        let unread = request.window.map(|_| Arc::new(AtomicU32::new(0)));

        {
            let mut pending = lock(&self.shared.pending);
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            pending.insert(
                id,
                PendingCall {
                    tx,
                    unread: unread.clone(),
                },
            );
        }

        trace!(request_id = id, method = %request.method, "call started");
        if self.shared.outbound.send(ClientMessage::Call(request)).is_err() {
            lock(&self.shared.pending).remove(&id);
            return Err(self.closed_error());
        }

        Ok(ResponseStream {
            id,
            rx,
            channel: self.clone(),
            unread,
            ungranted: 0,
            done: false,
        })
    }

    fn closed_error(&self) -> NodectlError {
        NodectlError::Transport(format!("connection to {} is closed", self.shared.endpoint))
    }

    fn abandon(&self, id: RequestId) {
        lock(&self.shared.pending).remove(&id);
        if !self.is_closed() {
            let _ = self.shared.outbound.send(ClientMessage::Cancel { id });
        }
    }

    /// Returns credit for `frames` data frames the consumer has read.
    fn grant(&self, id: RequestId, frames: u32) {
        if !self.is_closed() {
            trace!(request_id = id, frames, "granting credit");
            let _ = self.shared.outbound.send(ClientMessage::Credit { id, frames });
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("endpoint", &self.shared.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelShared {
    /// Fails every pending call and refuses new ones.
    fn fail_all(&self, reason: &str) {
        let pending: Vec<_> = {
            let mut pending = lock(&self.pending);
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().collect()
        };

        if !pending.is_empty() {
            debug!(endpoint = %self.endpoint, calls = pending.len(), reason, "failing pending calls");
        }
        for (_, call) in pending {
            let _ = call.tx.send(CallEvent::Failed(reason.to_string()));
        }
    }

    /// Queues a frame on its call without waiting.
    fn deliver(&self, id: RequestId, call: PendingCall, message: ServerMessage) {
        let overrun = match (&call.unread, &message) {
            (Some(unread), ServerMessage::Data { .. }) => {
                unread.fetch_add(1, Ordering::SeqCst) >= self.window
            }
            _ => false,
        };

        if overrun {
            warn!(
                endpoint = %self.endpoint,
                request_id = id,
                window = self.window,
                "agent overran the call window"
            );
            lock(&self.pending).remove(&id);
            let _ = call.tx.send(CallEvent::Failed(format!(
                "agent sent more than {} unread frames on call {}",
                self.window, id
            )));
            let _ = self.outbound.send(ClientMessage::Cancel { id });
            return;
        }

        // the receiver is gone once the stream is dropped
        let _ = call.tx.send(CallEvent::Frame(message));
    }
}

/// Server-to-client stream of one call.
///
/// Dropping it before the end sends a cancel frame, so a followed stream
/// stops on the agent too.
#[derive(Debug)]
pub struct ResponseStream {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<CallEvent>,
    channel: RpcChannel,
    unread: Option<Arc<AtomicU32>>,
    /// Frames read since credit was last returned.
    ungranted: u32,
    done: bool,
}

impl ResponseStream {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Next chunk, or `None` at the natural end of the stream.
    ///
    /// Connection loss is a [`NodectlError::Transport`]; an error frame from
    /// the agent is a [`NodectlError::Remote`].
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        match self.next_frame().await? {
            ServerMessage::Data { bytes, .. } => Ok(Some(bytes)),
            ServerMessage::End { .. } => Ok(None),
            ServerMessage::Error { message, .. } => Err(NodectlError::Remote(message)),
            ServerMessage::Response(_) => Err(NodectlError::InvalidResponse(
                "unary response to a streaming call".to_string(),
            )),
        }
    }

    async fn recv_unary(&mut self) -> Result<RpcResult> {
        match self.next_frame().await? {
            ServerMessage::Response(response) => response.into_result(),
            ServerMessage::Error { message, .. } => Err(NodectlError::Remote(message)),
            ServerMessage::End { .. } => Err(NodectlError::InvalidResponse(
                "call ended without a response".to_string(),
            )),
            ServerMessage::Data { .. } => Err(NodectlError::InvalidResponse(
                "stream data in reply to a unary call".to_string(),
            )),
        }
    }

    async fn next_frame(&mut self) -> Result<ServerMessage> {
        let event = self.rx.recv().await;
        match event {
            Some(CallEvent::Frame(message)) => {
                if message.is_terminal() {
                    self.done = true;
                } else {
                    self.consumed();
                }
                Ok(message)
            }
            Some(CallEvent::Failed(reason)) => {
                self.done = true;
                Err(NodectlError::Transport(reason))
            }
            None => {
                self.done = true;
                Err(NodectlError::Transport(
                    "connection closed before end of stream".to_string(),
                ))
            }
        }
    }

    /// Accounts for one data frame read, returning credit every half window.
    fn consumed(&mut self) {
        let Some(unread) = &self.unread else {
            return;
        };
        unread.fetch_sub(1, Ordering::SeqCst);
        self.ungranted += 1;

        if self.ungranted >= (self.channel.shared.window / 2).max(1) {
            self.channel.grant(self.id, self.ungranted);
            self.ungranted = 0;
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done {
            trace!(request_id = self.id, "stream dropped before end, cancelling");
            self.channel.abandon(self.id);
        }
    }
}

async fn read_loop(reader: OwnedReadHalf, shared: Arc<ChannelShared>) {
    let mut reader = BufReader::new(reader);
    let max = shared.config.max_message_size;

    let reason = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break "connection closed".to_string(),
            frame = read_frame(&mut reader, max) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by agent".to_string(),
            Err(e) => {
                warn!(endpoint = %shared.endpoint, error = %e, "agent connection failed");
                break e.to_string();
            }
        };

        // the lost frame may have ended a call, so nothing pending can be trusted
        let message = match JsonCodec::decode_server(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(endpoint = %shared.endpoint, error = %e, "failed to decode agent frame");
                break format!("undecodable agent frame: {}", e);
            }
        };

        let id = message.id();
        let target = {
            let mut pending = lock(&shared.pending);
            if message.is_terminal() {
                pending.remove(&id)
            } else {
                pending.get(&id).cloned()
            }
        };
        let Some(target) = target else {
            trace!(request_id = id, "frame for an abandoned call");
            continue;
        };

        shared.deliver(id, target, message);
    };

    shared.shutdown.cancel();
    shared.fail_all(&reason);
}

async fn write_loop(
    writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: CancellationToken,
) {
    let mut writer = BufWriter::new(writer);

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        for message in batch {
            let written = match JsonCodec::encode(&message) {
                Ok(encoded) => write_frame(&mut writer, &encoded).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "failed to write client frame");
                shutdown.cancel();
                return;
            }
        }

        if let Err(e) = writer.flush().await {
            warn!(error = %e, "failed to flush client frames");
            shutdown.cancel();
            return;
        }
    }

    let _ = writer.shutdown().await;
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
