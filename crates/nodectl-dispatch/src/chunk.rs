use serde::Serialize;

/// One piece of output from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    /// Node whose branch produced the payload.
    pub node: String,
    /// Bytes exactly as the agent sent them.
    pub payload: Vec<u8>,
    /// Whether the dispatch this chunk came from had more than one target.
    pub multiple_nodes: bool,
}
