//! nodectl dispatch
//!
//! Runs one command against many node agents at once. Each target gets its
//! own branch: a task that opens a client, invokes the command and drains
//! the response stream. Chunks from all branches are merged into a single
//! node-tagged stream; a failing node ends only its own branch.
//!
//! ```no_run
//! # async fn example() -> nodectl_common::protocol::Result<()> {
//! use futures::StreamExt;
//! use nodectl_common::protocol::DmesgOptions;
//! use nodectl_dispatch::{DispatchConfig, Dispatcher, NodeTarget};
//!
//! let targets = vec![
//!     NodeTarget::parse("cp-1=unix:///run/nodes/cp-1.sock")?,
//!     NodeTarget::parse("worker-1=unix:///run/nodes/worker-1.sock")?,
//! ];
//! let dispatcher = Dispatcher::new(DispatchConfig::default());
//! let mut dispatch = dispatcher.dispatch(targets, |_target, services| async move {
//!     services.machine.dmesg(DmesgOptions::default()).await
//! });
//!
//! while let Some(chunk) = dispatch.next().await {
//!     print!("{}: {}", chunk.node, String::from_utf8_lossy(&chunk.payload));
//! }
//! let report = dispatch.finish().await;
//! assert_eq!(report.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod dispatcher;
pub mod outcome;
pub mod target;

pub use chunk::StreamChunk;
pub use dispatcher::{ChunkCheck, Dispatch, DispatchConfig, Dispatcher};
pub use outcome::{DispatchOutcome, DispatchReport, OutcomeStatus};
pub use target::NodeTarget;
