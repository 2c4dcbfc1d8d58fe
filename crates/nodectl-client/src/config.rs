use std::time::Duration;

use nodectl_common::transport::DEFAULT_MAX_MESSAGE_SIZE;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Receive ceiling for a single frame.
    pub max_message_size: usize,
    /// Bound on dialing the agent socket. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Bound on unary calls. Streams are never timed out by the client.
    pub call_timeout: Option<Duration>,
    /// Window of a streamed call: data frames the agent may send ahead of
    /// the reader. Zero is treated as one.
    pub stream_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Some(Duration::from_secs(10)),
            call_timeout: Some(Duration::from_secs(30)),
            stream_buffer: 32,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }
}
