use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type RequestId = u64;
pub type MethodName = String;
pub type RpcArgs = serde_json::Value;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Method names understood by node agents.
pub mod methods {
    /// Kernel log, streamed. Args: [`super::DmesgOptions`].
    pub const MACHINE_DMESG: &str = "machine.Dmesg";
    pub const RUNTIME_VERSION: &str = "runtime.Version";
    pub const RUNTIME_STATUS: &str = "runtime.Status";
    pub const IMAGE_LIST: &str = "image.ListImages";
    pub const IMAGE_FS_INFO: &str = "image.ImageFsInfo";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: MethodName,
    pub args: RpcArgs,
    pub timeout_ms: Option<u64>,
    /// Data frames the agent may send before it needs credit. Unset means
    /// unlimited, which is what unary calls use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: RpcArgs) -> Self {
        Request {
            id: REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            method: method.into(),
            args,
            timeout_ms: None,
            window: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_window(mut self, frames: u32) -> Self {
        self.window = Some(frames.max(1));
        self
    }
}

/// Selector for the kernel log command.
///
/// `tail` only makes sense together with `follow`: it asks the agent to skip
/// the existing ring buffer and send only messages logged from now on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmesgOptions {
    pub follow: bool,
    pub tail: bool,
}

impl DmesgOptions {
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn tail(mut self, tail: bool) -> Self {
        self.tail = tail;
        self
    }
}
