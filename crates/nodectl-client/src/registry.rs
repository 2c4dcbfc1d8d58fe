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

//! Bookkeeping of open connection handles.
//!
//! Every [`RpcClient`](crate::RpcClient) registers itself here when opened
//! and removes itself when closed. The registry holds only a weak liveness
//! marker per handle, so a handle that is dropped without `close` leaves an
//! entry whose marker is dead: that entry is what [`ConnectionRegistry::leaked`]
//! reports.
//!
//! The registry is diagnostics only. Nothing in the RPC path reads it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use nodectl_common::protocol::{NodectlError, Result};
use nodectl_common::transport::Endpoint;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static GLOBAL_REGISTRY: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();

/// Opaque identity of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn next() -> Self {
        HandleId(HANDLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Owned by a handle; the registry keeps a `Weak` to it.
#[derive(Debug, Default)]
pub struct LivenessMarker;

struct RegistryEntry {
    endpoint: Endpoint,
    opened_at: Instant,
    liveness: Weak<LivenessMarker>,
}

/// Diagnostic view of one tracked handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedConnection {
    pub id: HandleId,
    pub endpoint: Endpoint,
    pub age_ms: u64,
    pub alive: bool,
}

/// Point-in-time registry contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub tracked: usize,
    pub opened_total: u64,
    pub closed_total: u64,
    pub invariant_violations: u64,
    pub connections: Vec<TrackedConnection>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<HandleId, RegistryEntry>>,
    opened: AtomicU64,
    closed: AtomicU64,
    violations: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when none is injected.
    pub fn global() -> Arc<ConnectionRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(ConnectionRegistry::new()))
            .clone()
    }

    /// Records a newly opened handle.
    ///
    /// Tracking an id that is already present is an invariant violation; the
    /// existing entry is kept.
    pub fn track(&self, id: HandleId, endpoint: &Endpoint, liveness: Weak<LivenessMarker>) -> Result<()> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            drop(entries);
            return Err(self.violation(format!("handle {} is already tracked", id)));
        }

        entries.insert(
            id,
            RegistryEntry {
                endpoint: endpoint.clone(),
                opened_at: Instant::now(),
                liveness,
            },
        );
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %id, endpoint = %endpoint, tracked = entries.len(), "connection tracked");
        Ok(())
    }

    /// Removes a closed handle.
    ///
    /// An unknown id means the handle was closed twice or never tracked. The
    /// tracked count is left unchanged and the violation is counted.
    pub fn untrack(&self, id: HandleId) -> Result<()> {
        let mut entries = self.lock();
        match entries.remove(&id) {
            Some(entry) => {
                self.closed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    handle = %id,
                    endpoint = %entry.endpoint,
                    tracked = entries.len(),
                    "connection untracked"
                );
                Ok(())
            }
            None => {
                drop(entries);
                Err(self.violation(format!("handle {} is not tracked", id)))
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_tracked(&self, id: HandleId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn invariant_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Entries whose handle was dropped without being closed.
    pub fn leaked(&self) -> Vec<TrackedConnection> {
        self.connections()
            .into_iter()
            .filter(|conn| !conn.alive)
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let connections = self.connections();
        RegistrySnapshot {
            tracked: connections.len(),
            opened_total: self.opened.load(Ordering::Relaxed),
            closed_total: self.closed.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations(),
            connections,
        }
    }

    fn connections(&self) -> Vec<TrackedConnection> {
        let now = Instant::now();
        let mut connections: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, entry)| TrackedConnection {
                id: *id,
                endpoint: entry.endpoint.clone(),
                age_ms: duration_ms(now.saturating_duration_since(entry.opened_at)),
                alive: entry.liveness.strong_count() > 0,
            })
            .collect();
        connections.sort_by_key(|conn| conn.id);
        connections
    }

    fn violation(&self, message: String) -> NodectlError {
        let total = self.violations.fetch_add(1, Ordering::Relaxed) + 1;
        error!(violations = total, "{}", message);
        NodectlError::RegistryInvariant(message)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("tracked", &self.tracked_count())
            .field("invariant_violations", &self.invariant_violations())
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
