//! Frames exchanged on a connection.
//!
//! One connection carries many calls; every frame names the request it
//! belongs to. A streaming call is answered by zero or more `Data` frames
//! followed by exactly one terminal frame (`End` or `Error`). A unary call is
//! answered by one `Response` (or one `Error`).
//!
//! A streaming call may carry a window. The agent then sends at most that
//! many `Data` frames beyond what the client has granted through `Credit`.

use serde::{Deserialize, Serialize};

use super::requests::{Request, RequestId};
use super::responses::Response;

/// Client to agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Call(Request),
    /// Stop a call that is still producing output.
    Cancel { id: RequestId },
    /// Lets the agent send `frames` more data frames on a windowed call.
    Credit { id: RequestId, frames: u32 },
}

/// Agent to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(Response),
    Data { id: RequestId, bytes: Vec<u8> },
    End { id: RequestId },
    Error { id: RequestId, message: String },
}

impl ServerMessage {
    pub fn id(&self) -> RequestId {
        match self {
            ServerMessage::Response(response) => response.id,
            ServerMessage::Data { id, .. }
            | ServerMessage::End { id }
            | ServerMessage::Error { id, .. } => *id,
        }
    }

    /// Whether this frame ends its call.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerMessage::Data { .. })
    }
}
