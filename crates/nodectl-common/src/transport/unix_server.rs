use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::protocol::error::{NodectlError, Result};
use crate::protocol::{ClientMessage, Request, RequestId, Response, ServerMessage};
use crate::transport::codec::JsonCodec;
use crate::transport::endpoint::Endpoint;
use crate::transport::framing::{read_frame, write_frame, DEFAULT_MAX_MESSAGE_SIZE};

/// Frames buffered per connection before handlers are made to wait.
const OUTBOUND_BUFFER: usize = 64;

/// Async unix-socket agent server.
///
/// Speaks the same framing as the client: every accepted connection can
/// carry many concurrent calls, each handled on its own task. A call's task
/// is aborted when the client sends `Cancel` for it or disconnects. A call
/// that carries a window is paced by the `Credit` frames the client sends.
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
    max_message_size: usize,
}

impl UnixServer {
    /// Binds a listener at `path`.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path).map_err(|e| {
            NodectlError::Connection(format!("Failed to bind to {}: {}", path.display(), e))
        })?;

        Ok(Self {
            listener,
            path,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Endpoint clients should dial to reach this server.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.path.clone())
    }

    /// Runs the server with the given call handler.
    ///
    /// For a streaming call the handler pushes data through the sink and
    /// returns `Ok(())` to end the stream. For a unary call it uses
    /// [`ResponseSink::reply`]. Returning an error sends an error frame.
    pub async fn run_with_handler<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Request, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, _) = self.listener.accept().await.map_err(|e| {
                NodectlError::Connection(format!("Failed to accept connection: {}", e))
            })?;

            debug!(path = %self.path.display(), "agent connection established");

            let handler = handler.clone();
            let max = self.max_message_size;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler, max).await {
                    warn!(error = %e, "agent connection error");
                }
            });
        }
    }
}

/// Handle to answer one call.
pub struct ResponseSink {
    id: RequestId,
    tx: mpsc::Sender<ServerMessage>,
    replied: Arc<AtomicBool>,
    /// Data frames the client has room for; `None` when the call has no window.
    credits: Option<Arc<Semaphore>>,
}

impl ResponseSink {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Sends one chunk of a streaming response. Waits while the client has
    /// no credit left for this call or the connection's outbound buffer is
    /// full.
    pub async fn send_data(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        if let Some(credits) = &self.credits {
            credits
                .acquire()
                .await
                .map_err(|_| NodectlError::Transport("client connection closed".to_string()))?
                .forget();
        }
        self.send(ServerMessage::Data {
            id: self.id,
            bytes: bytes.into(),
        })
        .await
    }

    /// Answers a unary call.
    pub async fn reply(&self, result: Value) -> Result<()> {
        self.replied.store(true, Ordering::SeqCst);
        self.send(ServerMessage::Response(Response::ok(self.id, result)))
            .await
    }

    async fn send(&self, message: ServerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| NodectlError::Transport("client connection closed".to_string()))
    }
}

struct CallSlot {
    abort: AbortHandle,
    credits: Option<Arc<Semaphore>>,
}

type InFlight = Arc<Mutex<HashMap<RequestId, CallSlot>>>;

/// Handle a single connection until the client disconnects.
async fn handle_connection<F, Fut>(stream: UnixStream, handler: Arc<F>, max: usize) -> Result<()>
where
    F: Fn(Request, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let mut calls = JoinSet::new();

    let result = loop {
        let frame = match read_frame(&mut reader, max).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        match JsonCodec::decode_client(&frame) {
            Ok(ClientMessage::Call(request)) => {
                let id = request.id;
                let credits = request
                    .window
                    .map(|frames| Arc::new(Semaphore::new(frames as usize)));
                let sink = ResponseSink {
                    id,
                    tx: tx.clone(),
                    replied: Arc::new(AtomicBool::new(false)),
                    credits: credits.clone(),
                };
                // registered under the lock so a fast call cannot finish before it is recorded
                let mut registered = lock(&in_flight);
                let abort = calls.spawn(run_call(handler.clone(), request, sink, in_flight.clone()));
                registered.insert(id, CallSlot { abort, credits });
            }
            Ok(ClientMessage::Cancel { id }) => {
                if let Some(slot) = lock(&in_flight).remove(&id) {
                    debug!(request_id = id, "call cancelled by client");
                    slot.abort.abort();
                }
            }
            Ok(ClientMessage::Credit { id, frames }) => {
                let in_flight = lock(&in_flight);
                if let Some(credits) = in_flight.get(&id).and_then(|slot| slot.credits.as_ref()) {
                    let room = Semaphore::MAX_PERMITS - credits.available_permits();
                    credits.add_permits((frames as usize).min(room));
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to decode client frame");
            }
        }

        // reap finished calls so the set does not grow on long connections
        while calls.try_join_next().is_some() {}
    };

    calls.abort_all();
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn run_call<F, Fut>(handler: Arc<F>, request: Request, sink: ResponseSink, in_flight: InFlight)
where
    F: Fn(Request, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let id = sink.id;
    let tx = sink.tx.clone();
    let replied = sink.replied.clone();

    let terminal = match handler(request, sink).await {
        Ok(()) if replied.load(Ordering::SeqCst) => None,
        Ok(()) => Some(ServerMessage::End { id }),
        Err(e) => Some(ServerMessage::Error {
            id,
            message: e.to_string(),
        }),
    };

    lock(&in_flight).remove(&id);
    if let Some(message) = terminal {
        let _ = tx.send(message).await;
    }
}

/// Drains outbound frames, flushing once per batch.
async fn write_loop(writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerMessage>) {
    let mut writer = BufWriter::new(writer);

    while let Some(message) = rx.recv().await {
        let mut batch = vec![message];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        for message in batch {
            let written = match JsonCodec::encode(&message) {
                Ok(encoded) => write_frame(&mut writer, &encoded).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "failed to write agent frame");
                return;
            }
        }

        if let Err(e) = writer.flush().await {
            warn!(error = %e, "failed to flush agent frames");
            return;
        }
    }

    let _ = writer.shutdown().await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
