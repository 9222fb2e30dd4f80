//! Inbound command handling and the worker that hands commands to the driver.

mod dispatcher;
mod pending;

pub use dispatcher::{CommandDispatcher, DispatcherConfig, Submission};
pub use pending::{
    CommandEvent, CommandOutcome, CommandPhase, CorrelationId, IssueRequest, PendingCommand,
};

use crate::zwave::MeshSession;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Drain the issue queue into the mesh session.
///
/// Runs on its own task so a slow controller never stalls MQTT ingestion.
/// Requests whose command was superseded while queued are skipped. A
/// synchronous refusal by the driver is fed back as a failed result.
pub async fn run_issue_worker(
    session: Arc<MeshSession>,
    dispatcher: Arc<CommandDispatcher>,
    mut requests: mpsc::UnboundedReceiver<IssueRequest>,
) {
    info!("[Dispatch] Issue worker started");
    while let Some(request) = requests.recv().await {
        if !dispatcher.is_outstanding(request.correlation) {
            debug!(
                "[Dispatch] Skipping {} (no longer outstanding)",
                request.correlation
            );
            continue;
        }
        match session.issue(
            &request.value_id,
            &request.value,
            request.correlation,
            request.attempt,
        ) {
            Ok(()) => debug!(
                "[ZWave] Sent {} = {} (attempt {}, {})",
                request.value_id, request.value, request.attempt, request.correlation
            ),
            Err(e) => {
                warn!(
                    "[ZWave] Driver refused {} for {}: {}",
                    request.correlation, request.value_id, e
                );
                dispatcher.on_command_result(request.correlation, request.attempt, Err(e.to_string()));
            }
        }
    }
    info!("[Dispatch] Issue worker stopped");
}
