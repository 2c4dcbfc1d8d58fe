//! Unix-socket transport.
//!
//! Agents are node-local services, so the channel is a unix domain socket
//! with no TLS. Every message travels as one frame:
//!
//! ```text
//! +----------------------+---------------------+
//! | length: u32, BE      | JSON body           |
//! +----------------------+---------------------+
//! ```
//!
//! A length above the receive ceiling ([`DEFAULT_MAX_MESSAGE_SIZE`] unless
//! configured otherwise) is refused before the body is read.

pub mod codec;
pub mod endpoint;
pub mod framing;
pub mod unix_server;

pub use codec::JsonCodec;
pub use endpoint::Endpoint;
pub use framing::{read_frame, write_frame, DEFAULT_MAX_MESSAGE_SIZE};
pub use unix_server::{ResponseSink, UnixServer};
