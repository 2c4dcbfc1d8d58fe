use nodectl_common::protocol::{ErrorKind, NodectlError};
use nodectl_common::transport::Endpoint;
use serde::Serialize;

/// How a branch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl OutcomeStatus {
    pub fn from_error(err: &NodectlError) -> Self {
        if err.is_cancelled() {
            OutcomeStatus::Cancelled
        } else {
            OutcomeStatus::Failed {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OutcomeStatus::Failed { .. })
    }

    /// Error class of a failed branch.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            OutcomeStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub node: String,
    pub endpoint: Endpoint,
    pub status: OutcomeStatus,
    /// Chunks the branch handed to the consumer.
    pub chunks: u64,
}

/// Outcomes of a dispatch, one per target, in target order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    pub fn new(outcomes: Vec<DispatchOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[DispatchOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<DispatchOutcome> {
        self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// First outcome for `node`.
    pub fn outcome(&self, node: &str) -> Option<&DispatchOutcome> {
        self.outcomes.iter().find(|outcome| outcome.node == node)
    }

    pub fn succeeded(&self) -> usize {
        self.count(OutcomeStatus::is_success)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::is_failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(|status| *status == OutcomeStatus::Cancelled)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn total_chunks(&self) -> u64 {
        self.outcomes.iter().map(|outcome| outcome.chunks).sum()
    }

    fn count(&self, pred: impl Fn(&OutcomeStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| pred(&outcome.status))
            .count()
    }
}
