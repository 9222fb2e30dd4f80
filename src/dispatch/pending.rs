//! Outstanding command records and the events they end in.

use crate::error::CommandError;
use crate::model::{Value, ValueId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Id assigned to a command when it is accepted; echoed by the driver in its
/// completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// Accepted while the mesh network is down; not sent yet.
    Queued,
    /// Sent, waiting for the driver to acknowledge.
    Pending,
    /// Acknowledged, waiting for the value report that confirms it.
    Acked,
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub correlation: CorrelationId,
    pub value_id: ValueId,
    pub desired: Value,
    pub issued_at: Instant,
    pub retries: u32,
    pub phase: CommandPhase,
    pub deadline: Option<Instant>,
}

impl PendingCommand {
    pub(crate) fn new(value_id: ValueId, desired: Value, now: Instant) -> Self {
        Self {
            correlation: CorrelationId::new(),
            value_id,
            desired,
            issued_at: now,
            retries: 0,
            phase: CommandPhase::Pending,
            deadline: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.phase, CommandPhase::Pending | CommandPhase::Acked)
    }

    /// 1-based number of the transmission currently outstanding.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub(crate) fn issue_request(&self) -> IssueRequest {
        IssueRequest {
            correlation: self.correlation,
            value_id: self.value_id.clone(),
            value: self.desired.clone(),
            attempt: self.attempt(),
        }
    }
}

/// Work item for the command issue worker.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueRequest {
    pub correlation: CorrelationId,
    pub value_id: ValueId,
    pub value: Value,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Confirmed,
    Rejected(CommandError),
    Failed(CommandError),
}

impl CommandOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            CommandOutcome::Confirmed => "confirmed",
            CommandOutcome::Rejected(_) => "rejected",
            CommandOutcome::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&CommandError> {
        match self {
            CommandOutcome::Confirmed => None,
            CommandOutcome::Rejected(e) | CommandOutcome::Failed(e) => Some(e),
        }
    }
}

/// Terminal event, exactly one per accepted or rejected command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub correlation: CorrelationId,
    pub value_id: ValueId,
    pub desired: Option<Value>,
    pub outcome: CommandOutcome,
}

impl CommandEvent {
    /// JSON body published on the value's result topic.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = json!({
            "correlation": self.correlation.to_string(),
            "status": self.outcome.status(),
        });
        if let Some(desired) = &self.desired {
            payload["value"] = desired.to_json();
        }
        if let Some(error) = self.outcome.error() {
            payload["error"] = json!(error.to_string());
        }
        payload.to_string().into_bytes()
    }
}
