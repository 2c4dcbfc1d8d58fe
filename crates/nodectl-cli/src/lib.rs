// Copyright 2025 nodectl Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # nodectl CLI
//!
//! Command plumbing behind the `nodectl` binary: target selection, output
//! formatting and failure reporting. The binary itself only parses flags and
//! wires up cancellation.
//!
//! ## Key Commands
//!
//! - `nodectl dmesg`: print (and optionally follow) the kernel log of one or
//!   more nodes, each line prefixed with its node name

use std::collections::HashSet;
use std::io::Write;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use nodectl_client::{ConnectionRegistry, Services};
use nodectl_common::protocol::DmesgOptions;
use nodectl_dispatch::{DispatchReport, Dispatcher, NodeTarget, OutcomeStatus, StreamChunk};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Agent socket used when neither `--endpoint` nor the environment names one.
pub const DEFAULT_ENDPOINT: &str = "/run/nodectl/agent.sock";

/// Environment variable holding the default agent endpoint.
pub const ENDPOINT_ENV: &str = "NODECTL_ENDPOINT";

/// Builds the target set.
///
/// `--node name=endpoint` entries win. Without any, a single target is built
/// from `--endpoint`, then `$NODECTL_ENDPOINT`, then [`DEFAULT_ENDPOINT`].
pub fn resolve_targets(
    nodes: &[String],
    endpoint: Option<&str>,
    env_endpoint: Option<&str>,
) -> Result<Vec<NodeTarget>> {
    if nodes.is_empty() {
        let addr = endpoint.or(env_endpoint).unwrap_or(DEFAULT_ENDPOINT);
        let target = NodeTarget::parse(addr).with_context(|| format!("invalid endpoint '{}'", addr))?;
        return Ok(vec![target]);
    }

    if endpoint.is_some() {
        warn!("--endpoint is ignored when --node is given");
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(nodes.len());
    for node in nodes {
        let target = NodeTarget::parse(node).with_context(|| format!("invalid --node '{}'", node))?;
        if !seen.insert(target.node.clone()) {
            bail!("node '{}' given more than once", target.node);
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Streams the kernel log of every target to `out`.
///
/// Returns once every branch has finished, or fails if `out` cannot be
/// written, in which case all branches are stopped first.
pub async fn run_dmesg<W: Write>(
    dispatcher: &Dispatcher,
    targets: Vec<NodeTarget>,
    options: DmesgOptions,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<DispatchReport> {
    let mut dispatch = dispatcher.dispatch_with_cancel(
        targets,
        move |_target: NodeTarget, services: Services| async move {
            services.machine.dmesg(options).await
        },
        cancel,
    );

    while let Some(chunk) = dispatch.next().await {
        if let Err(e) = write_chunk(out, &chunk) {
            dispatch.cancel();
            dispatch.finish().await;
            return Err(e).context("failed to write kernel log");
        }
    }

    Ok(dispatch.finish().await)
}

/// Writes one chunk as `"{node}: {payload}"`. The payload is written as is.
pub fn write_chunk<W: Write>(out: &mut W, chunk: &StreamChunk) -> std::io::Result<()> {
    write!(out, "{}: ", chunk.node)?;
    out.write_all(&chunk.payload)?;
    out.flush()
}

/// Writes one line per failed node. Returns the number of failures.
pub fn report_failures<W: Write>(report: &DispatchReport, err: &mut W) -> std::io::Result<usize> {
    let mut failed = 0;
    for outcome in report.outcomes() {
        if let OutcomeStatus::Failed { kind, message } = &outcome.status {
            writeln!(err, "{}: error ({}): {}", outcome.node, kind, message)?;
            failed += 1;
        }
    }
    Ok(failed)
}

/// Logs every handle that was dropped without being closed.
pub fn log_leaked_handles(registry: &ConnectionRegistry) -> usize {
    let leaked = registry.leaked();
    for conn in &leaked {
        warn!(
            handle = %conn.id,
            endpoint = %conn.endpoint,
            age_ms = conn.age_ms,
            "connection handle leaked"
        );
    }

    let violations = registry.invariant_violations();
    if violations > 0 {
        warn!(violations, "connection registry invariant violated");
    }

    leaked.len()
}
