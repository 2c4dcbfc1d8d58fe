//! Shared pieces of the nodectl workspace.
//!
//! nodectl talks to an agent on every node of a cluster to run
//! administrative commands, such as reading the kernel log, on one node or
//! many at once. Everything both ends of that conversation need lives here:
//!
//! - [`protocol`]: requests, unary replies, stream frames and the error type
//! - [`transport`]: unix-socket endpoints, length-prefixed framing, the JSON
//!   codec and a small agent server
//!
//! ```
//! use nodectl_common::protocol::{methods, ClientMessage, DmesgOptions, Request};
//! use nodectl_common::transport::JsonCodec;
//!
//! let args = serde_json::to_value(DmesgOptions::default().follow(true)).unwrap();
//! let call = ClientMessage::Call(Request::new(methods::MACHINE_DMESG, args));
//! let frame = JsonCodec::encode(&call).unwrap();
//! assert_eq!(JsonCodec::decode_client(&frame).unwrap(), call);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
