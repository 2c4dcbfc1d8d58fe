//! nodectl client
//!
//! Connection handles to node agents, tracked in a [`ConnectionRegistry`]
//! so that handles dropped without being closed can be reported.
//!
//! - [`RpcClient`]: one connection to one agent, multiplexing many calls
//! - [`Services`]: typed stubs (machine, runtime, image) bound to a client
//! - [`StreamReader`]: drains a server stream chunk by chunk with cancellation

pub mod channel;
pub mod client;
pub mod config;
pub mod registry;
pub mod services;
pub mod stream;

pub use channel::{ResponseStream, RpcChannel};
pub use client::{with_client, with_client_using, RpcClient};
pub use config::ClientConfig;
pub use registry::{ConnectionRegistry, HandleId, LivenessMarker, RegistrySnapshot, TrackedConnection};
pub use services::{ImageService, MachineService, RuntimeService, Services};
pub use stream::{cancellable, StreamReader};

pub use nodectl_common::protocol::{ErrorKind, NodectlError, Result};
pub use nodectl_common::transport::Endpoint;
