pub mod error;
pub mod messages;
pub mod requests;
pub mod responses;


pub use error::{ErrorKind, NodectlError, Result};
pub use messages::{ClientMessage, ServerMessage};
pub use requests::{methods, DmesgOptions, MethodName, Request, RequestId, RpcArgs};
pub use responses::{Response, RpcResult};
