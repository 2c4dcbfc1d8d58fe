use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use nodectl_common::protocol::{NodectlError, Result};
use nodectl_common::transport::Endpoint;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::RpcChannel;
use crate::config::ClientConfig;
use crate::registry::{ConnectionRegistry, HandleId, LivenessMarker};
use crate::services::{ImageService, MachineService, RuntimeService, Services};

/// Connection handle to one node agent.
///
/// Owns exactly one unix-socket connection; every stub obtained from it
/// shares that connection. The handle is tracked in a [`ConnectionRegistry`]
/// from the moment [`RpcClient::open`] returns until [`RpcClient::close`].
/// Dropping it without closing shuts the connection down but leaves the
/// registry entry behind, where it is reported as leaked.
pub struct RpcClient {
    id: HandleId,
    endpoint: Endpoint,
    channel: RpcChannel,
    registry: Arc<ConnectionRegistry>,
    _liveness: Arc<LivenessMarker>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Opens a connection tracked in the process-wide registry.
    pub async fn open(endpoint: Endpoint, config: ClientConfig) -> Result<Self> {
        Self::open_with_registry(endpoint, config, ConnectionRegistry::global()).await
    }

    pub async fn open_with_registry(
        endpoint: Endpoint,
        config: ClientConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let connect = endpoint.connect();
        let stream = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                NodectlError::Connection(format!(
                    "timed out connecting to {} after {}ms",
                    endpoint,
                    limit.as_millis()
                ))
            })?,
            None => connect.await,
        }
        .map_err(|e| NodectlError::Connection(format!("failed to connect to {}: {}", endpoint, e)))?;

        let (channel, tasks) = RpcChannel::start(stream, endpoint.clone(), config);
        let id = HandleId::next();
        let liveness = Arc::new(LivenessMarker);

        if let Err(e) = registry.track(id, &endpoint, Arc::downgrade(&liveness)) {
            channel.shutdown();
            return Err(e);
        }

        debug!(handle = %id, endpoint = %endpoint, "connection opened");

        Ok(Self {
            id,
            endpoint,
            channel,
            registry,
            _liveness: liveness,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn machine(&self) -> MachineService {
        MachineService::new(self.channel.clone())
    }

    pub fn runtime(&self) -> RuntimeService {
        RuntimeService::new(self.channel.clone())
    }

    pub fn images(&self) -> ImageService {
        ImageService::new(self.channel.clone())
    }

    pub fn services(&self) -> Services {
        Services::new(self.channel.clone())
    }

    /// Shuts the connection down and removes the handle from the registry.
    ///
    /// Streams still open on the connection end with a transport error. A
    /// second call fails with [`NodectlError::RegistryInvariant`].
    pub async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.shutdown();
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
            for task in tasks {
                let _ = task.await;
            }
            debug!(handle = %self.id, endpoint = %self.endpoint, "connection closed");
        }

        self.registry.untrack(self.id)
    }

    /// Closes without waiting for the connection tasks to finish.
    fn close_now(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.shutdown();
        }
        self.registry.untrack(self.id)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if !*self.closed.get_mut() {
            warn!(
                handle = %self.id,
                endpoint = %self.endpoint,
                "connection handle dropped without close"
            );
            self.channel.shutdown();
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens a client, runs `f` with it and closes it on every path.
///
/// That includes `f` panicking and the returned future being dropped before
/// it completes; the handle is then untracked without waiting for the
/// connection to wind down.
///
/// ```no_run
/// # async fn example() -> nodectl_client::Result<()> {
/// use nodectl_client::{with_client, ClientConfig, Endpoint};
///
/// let endpoint = Endpoint::parse("unix:///run/nodectl/agent.sock")?;
/// let version = with_client(endpoint, ClientConfig::default(), |client| {
///     Box::pin(async move { client.runtime().version().await })
/// })
/// .await?;
/// println!("{}", version);
/// # Ok(())
/// # }
/// ```
pub async fn with_client<T, F>(endpoint: Endpoint, config: ClientConfig, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a RpcClient) -> BoxFuture<'a, Result<T>>,
{
    with_client_using(ConnectionRegistry::global(), endpoint, config, f).await
}

/// [`with_client`] tracking the handle in `registry`.
pub async fn with_client_using<T, F>(
    registry: Arc<ConnectionRegistry>,
    endpoint: Endpoint,
    config: ClientConfig,
    f: F,
) -> Result<T>
where
    F: for<'a> FnOnce(&'a RpcClient) -> BoxFuture<'a, Result<T>>,
{
    let client = RpcClient::open_with_registry(endpoint, config, registry).await?;
    let mut scope = CloseOnExit {
        client: &client,
        armed: true,
    };
    let result = f(&client).await;
    scope.armed = false;
    let closed = client.close().await;

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "failed to close connection after call error");
            }
            Err(e)
        }
    }
}

/// Closes a scoped client when its scope unwinds or is dropped mid-await.
struct CloseOnExit<'a> {
    client: &'a RpcClient,
    armed: bool,
}

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(handle = %self.client.id, "scope left early, closing connection");
            if let Err(e) = self.client.close_now() {
                warn!(error = %e, "failed to close connection after early exit");
            }
        }
    }
}

