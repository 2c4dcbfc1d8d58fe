//! Typed stubs over a shared channel.
//!
//! Stubs only build requests; all I/O goes through the [`RpcChannel`] of
//! the client they came from.

use nodectl_common::protocol::{methods, DmesgOptions, Result, RpcResult};
use serde_json::json;

use crate::channel::{ResponseStream, RpcChannel};

/// Node-level operations.
#[derive(Debug, Clone)]
pub struct MachineService {
    channel: RpcChannel,
}

impl MachineService {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    /// Streams the kernel log.
    ///
    /// Without `follow` the stream ends after the current ring buffer. With
    /// `follow` it stays open until dropped or cancelled.
    pub async fn dmesg(&self, options: DmesgOptions) -> Result<ResponseStream> {
        let args = serde_json::to_value(options)?;
        self.channel.call_stream(methods::MACHINE_DMESG, args)
    }
}

/// Container runtime control.
#[derive(Debug, Clone)]
pub struct RuntimeService {
    channel: RpcChannel,
}

impl RuntimeService {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn version(&self) -> Result<RpcResult> {
        self.channel.call_unary(methods::RUNTIME_VERSION, json!({})).await
    }

    pub async fn status(&self) -> Result<RpcResult> {
        self.channel.call_unary(methods::RUNTIME_STATUS, json!({})).await
    }
}

/// Container image control.
#[derive(Debug, Clone)]
pub struct ImageService {
    channel: RpcChannel,
}

impl ImageService {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn list_images(&self) -> Result<RpcResult> {
        self.channel.call_unary(methods::IMAGE_LIST, json!({})).await
    }

    pub async fn image_fs_info(&self) -> Result<RpcResult> {
        self.channel.call_unary(methods::IMAGE_FS_INFO, json!({})).await
    }
}

/// All stubs of one client.
#[derive(Debug, Clone)]
pub struct Services {
    pub machine: MachineService,
    pub runtime: RuntimeService,
    pub images: ImageService,
}

impl Services {
    pub fn new(channel: RpcChannel) -> Self {
        Self {
            machine: MachineService::new(channel.clone()),
            runtime: RuntimeService::new(channel.clone()),
            images: ImageService::new(channel),
        }
    }
}
