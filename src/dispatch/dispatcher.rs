//! Command dispatcher: MQTT command messages in, Z-Wave commands out.
//!
//! Each accepted command becomes a [`PendingCommand`] that moves through
//! `Pending -> Acked -> Confirmed`, with timeouts feeding back into a bounded
//! retry loop. At most one command per value is outstanding; a newer command
//! replaces the older one under the same lock, so a superseded command can
//! never be retried afterwards.

use super::pending::{
    CommandEvent, CommandOutcome, CommandPhase, CorrelationId, IssueRequest, PendingCommand,
};
use crate::config::BridgeConfig;
use crate::error::CommandError;
use crate::model::{Value, ValueId};
use crate::state::StateStore;
use crate::topic::{TopicMapper, decode_payload};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Reissues allowed after the first attempt.
    pub retry_limit: u32,
    pub ack_timeout: Duration,
    pub confirm_timeout: Duration,
}

impl From<&BridgeConfig> for DispatcherConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
        }
    }
}

/// Immediate answer to [`CommandDispatcher::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Not a command topic of ours.
    Ignored,
    Rejected(CommandError),
    Accepted(CorrelationId),
    /// Same value already requested and outstanding.
    Duplicate(CorrelationId),
}

enum FailureCause {
    Timeout,
    Driver(String),
}

#[derive(Default)]
struct CommandTable {
    by_value: HashMap<ValueId, PendingCommand>,
    by_correlation: HashMap<CorrelationId, ValueId>,
    paused: bool,
}

impl CommandTable {
    fn insert(&mut self, command: PendingCommand) {
        self.by_correlation
            .insert(command.correlation, command.value_id.clone());
        self.by_value.insert(command.value_id.clone(), command);
    }

    fn remove(&mut self, id: &ValueId) -> Option<PendingCommand> {
        let command = self.by_value.remove(id)?;
        self.by_correlation.remove(&command.correlation);
        Some(command)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_value.values().filter_map(|c| c.deadline).min()
    }
}

pub struct CommandDispatcher {
    config: DispatcherConfig,
    mapper: TopicMapper,
    store: Arc<StateStore>,
    table: Mutex<CommandTable>,
    issue_tx: mpsc::UnboundedSender<IssueRequest>,
    events_tx: mpsc::UnboundedSender<CommandEvent>,
    wake: Notify,
}

impl CommandDispatcher {
    pub fn new(
        config: DispatcherConfig,
        mapper: TopicMapper,
        store: Arc<StateStore>,
        issue_tx: mpsc::UnboundedSender<IssueRequest>,
        events_tx: mpsc::UnboundedSender<CommandEvent>,
    ) -> Self {
        Self {
            config,
            mapper,
            store,
            table: Mutex::new(CommandTable::default()),
            issue_tx,
            events_tx,
            wake: Notify::new(),
        }
    }

    /// Handle one inbound MQTT message.
    pub fn submit(&self, topic: &str, payload: &[u8]) -> Submission {
        self.submit_at(topic, payload, Instant::now())
    }

    pub(crate) fn submit_at(&self, topic: &str, payload: &[u8], now: Instant) -> Submission {
        let Some(id) = self.mapper.decode_topic(topic) else {
            trace!("[Dispatch] Ignoring message on {}", topic);
            return Submission::Ignored;
        };

        let Some(model) = self.store.get(&id) else {
            return self.reject(id.clone(), None, CommandError::UnknownTarget(id));
        };

        let desired = match decode_payload(model.kind(), payload) {
            Ok(value) => value,
            Err(e) => return self.reject(id, None, CommandError::MalformedInput(e.to_string())),
        };

        if let Value::Enumerated(label) = &desired
            && !model.choices.is_empty()
            && !model.choices.contains(label)
        {
            let reason = format!("'{}' is not one of {:?}", label, model.choices);
            return self.reject(id, Some(desired), CommandError::MalformedInput(reason));
        }

        if model.read_only {
            return self.reject(id.clone(), Some(desired), CommandError::ReadOnly(id));
        }

        let mut table = self.table.lock();

        if let Some(existing) = table.by_value.get(&id)
            && existing.desired == desired
        {
            debug!(
                "[Dispatch] Duplicate command for {} ({}), keeping {}",
                id, desired, existing.correlation
            );
            return Submission::Duplicate(existing.correlation);
        }

        if let Some(old) = table.remove(&id) {
            info!(
                "[Dispatch] {} superseded by newer command for {}",
                old.correlation, id
            );
        }

        let mut command = PendingCommand::new(id.clone(), desired, now);
        let correlation = command.correlation;
        if table.paused {
            command.phase = CommandPhase::Queued;
            info!(
                "[Dispatch] Mesh network down, queued {} = {} ({})",
                id, command.desired, correlation
            );
        } else {
            command.deadline = Some(now + self.config.ack_timeout);
            info!(
                "[Dispatch] Issuing {} = {} ({})",
                id, command.desired, correlation
            );
            self.send_issue(&command);
        }
        table.insert(command);
        drop(table);

        self.wake.notify_one();
        Submission::Accepted(correlation)
    }

    fn reject(&self, id: ValueId, desired: Option<Value>, error: CommandError) -> Submission {
        warn!("[Dispatch] Rejected command for {}: {}", id, error);
        self.emit(CommandEvent {
            correlation: CorrelationId::new(),
            value_id: id,
            desired,
            outcome: CommandOutcome::Rejected(error.clone()),
        });
        Submission::Rejected(error)
    }

    /// Completion reported by the driver (or by the issue worker when the
    /// driver refused the command outright) for one attempt of a command.
    pub fn on_command_result(
        &self,
        correlation: CorrelationId,
        attempt: u32,
        outcome: Result<(), String>,
    ) {
        self.on_command_result_at(correlation, attempt, outcome, Instant::now());
    }

    pub(crate) fn on_command_result_at(
        &self,
        correlation: CorrelationId,
        attempt: u32,
        outcome: Result<(), String>,
        now: Instant,
    ) {
        let mut table = self.table.lock();
        let Some(id) = table.by_correlation.get(&correlation).cloned() else {
            debug!("[Dispatch] Result for unknown command {} ignored", correlation);
            return;
        };
        let current = table.by_value.get(&id).map(PendingCommand::attempt);
        if current != Some(attempt) {
            debug!(
                "[Dispatch] Result for attempt {} of {} ignored (current attempt {:?})",
                attempt, correlation, current
            );
            return;
        }

        match outcome {
            Ok(()) => {
                if let Some(command) = table.by_value.get_mut(&id)
                    && command.phase == CommandPhase::Pending
                {
                    debug!("[Dispatch] {} acknowledged by driver", correlation);
                    command.phase = CommandPhase::Acked;
                    command.deadline = Some(now + self.config.confirm_timeout);
                }
            }
            Err(reason) => {
                warn!("[Dispatch] Driver failed {}: {}", correlation, reason);
                if table.paused {
                    if let Some(command) = table.by_value.get_mut(&id) {
                        command.phase = CommandPhase::Queued;
                        command.deadline = None;
                    }
                } else {
                    self.retry_or_fail(&mut table, &id, now, FailureCause::Driver(reason));
                }
            }
        }
        drop(table);
        self.wake.notify_one();
    }

    /// A value report that was accepted into (or matched) the state store.
    pub fn on_value_observed(&self, id: &ValueId, value: &Value) {
        let mut table = self.table.lock();
        let confirmed = table
            .by_value
            .get(id)
            .is_some_and(|command| value.satisfies(&command.desired));
        if !confirmed {
            return;
        }
        let removed = table.remove(id);
        drop(table);
        if let Some(command) = removed {
            info!(
                "[Dispatch] {} confirmed: {} = {}",
                command.correlation, id, value
            );
            self.emit(CommandEvent {
                correlation: command.correlation,
                value_id: command.value_id,
                desired: Some(command.desired),
                outcome: CommandOutcome::Confirmed,
            });
        }
    }

    /// Retry or fail every command whose deadline has passed.
    ///
    /// Returns the earliest remaining deadline.
    pub fn poll_timeouts(&self, now: Instant) -> Option<Instant> {
        let mut table = self.table.lock();
        if table.paused {
            return None;
        }
        let expired: Vec<ValueId> = table
            .by_value
            .values()
            .filter(|c| c.deadline.is_some_and(|deadline| deadline <= now))
            .map(|c| c.value_id.clone())
            .collect();
        for id in expired {
            self.retry_or_fail(&mut table, &id, now, FailureCause::Timeout);
        }
        table.next_deadline()
    }

    fn retry_or_fail(&self, table: &mut CommandTable, id: &ValueId, now: Instant, cause: FailureCause) {
        let Some(command) = table.by_value.get_mut(id) else {
            return;
        };

        if command.retries < self.config.retry_limit {
            command.retries += 1;
            command.phase = CommandPhase::Pending;
            command.deadline = Some(now + self.config.ack_timeout);
            info!(
                "[Dispatch] Retrying {} for {} (retry {}/{})",
                command.correlation, id, command.retries, self.config.retry_limit
            );
            let request = command.issue_request();
            self.send_request(request);
            return;
        }

        if let Some(command) = table.remove(id) {
            let attempts = command.retries + 1;
            let error = match cause {
                FailureCause::Timeout => CommandError::CommandTimeout { attempts },
                FailureCause::Driver(reason) => CommandError::DriverFailure(reason),
            };
            warn!(
                "[Dispatch] {} for {} failed after {} attempts: {}",
                command.correlation, id, attempts, error
            );
            self.emit(CommandEvent {
                correlation: command.correlation,
                value_id: command.value_id,
                desired: Some(command.desired),
                outcome: CommandOutcome::Failed(error),
            });
        }
    }

    /// Stop sending commands; new ones queue until [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut table = self.table.lock();
        if !table.paused {
            info!("[Dispatch] Command issuing paused");
        }
        table.paused = true;
    }

    /// Start sending again after the mesh network came back.
    ///
    /// In-flight commands older than `grace` have an unknowable outcome and
    /// fail; younger ones get fresh deadlines; queued ones are sent now.
    pub fn resume(&self, now: Instant, grace: Duration) {
        let mut table = self.table.lock();
        table.paused = false;

        let ids: Vec<ValueId> = table.by_value.keys().cloned().collect();
        for id in ids {
            let Some(command) = table.by_value.get_mut(&id) else {
                continue;
            };
            if command.phase == CommandPhase::Queued {
                command.phase = CommandPhase::Pending;
                command.issued_at = now;
                command.deadline = Some(now + self.config.ack_timeout);
                let request = command.issue_request();
                self.send_request(request);
            } else if now.saturating_duration_since(command.issued_at) > grace {
                if let Some(command) = table.remove(&id) {
                    warn!(
                        "[Dispatch] {} for {} lost in mesh outage",
                        command.correlation, id
                    );
                    self.emit(CommandEvent {
                        correlation: command.correlation,
                        value_id: command.value_id,
                        desired: Some(command.desired),
                        outcome: CommandOutcome::Failed(CommandError::TransientNetwork),
                    });
                }
            } else {
                command.deadline = Some(now + self.config.ack_timeout);
            }
        }
        info!(
            "[Dispatch] Command issuing resumed, {} outstanding",
            table.by_value.len()
        );
        drop(table);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.table.lock().paused
    }

    /// Whether `correlation` still names the outstanding command for its value.
    pub fn is_outstanding(&self, correlation: CorrelationId) -> bool {
        self.table.lock().by_correlation.contains_key(&correlation)
    }

    pub fn pending(&self, id: &ValueId) -> Option<PendingCommand> {
        self.table.lock().by_value.get(id).cloned()
    }

    pub fn outstanding(&self) -> usize {
        self.table.lock().by_value.len()
    }

    /// Drive timeouts until cancelled.
    pub async fn run_timeouts(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = self.poll_timeouts(Instant::now());
            let sleep = match next {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep => {}
            }
        }
        debug!("[Dispatch] Timeout driver stopped");
    }

    fn send_issue(&self, command: &PendingCommand) {
        self.send_request(command.issue_request());
    }

    fn send_request(&self, request: IssueRequest) {
        if self.issue_tx.send(request).is_err() {
            warn!("[Dispatch] Issue queue closed, command not sent");
        }
    }

    fn emit(&self, event: CommandEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("[Dispatch] No listener for command events");
        }
    }
}
