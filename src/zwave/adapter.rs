//! Translates driver notifications into state updates and publishes.
//!
//! This is the only place that knows the driver's native value shapes. Every
//! accepted change produces exactly one publish; unchanged or stale reports
//! produce none.
//!
//! Driver sequence numbers restart whenever the controller is reopened, so
//! the generation stored with a value is `(session, sequence)` packed into a
//! `u64`: the session count occupies the bits above [`SEQUENCE_BITS`]. The
//! session count advances on every `DriverReady` seen in the notification
//! stream, which keeps it ordered with the reports themselves.

use super::driver::{MeshSession, NativeValue, NativeValueId, Notification, ValueNotification};
use crate::dispatch::CommandDispatcher;
use crate::model::{NodeId, Value, ValueClass, ValueId, ValueUpdate};
use crate::mqtt::{Publication, Publisher};
use crate::reconnect::SessionSignal;
use crate::state::{ChangeResult, StateStore};
use crate::topic::{Direction, PAYLOAD_ONLINE, TopicMapper, encode_payload};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Low bits of a generation holding the driver's own sequence number.
pub const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Generation of a report with driver `sequence` seen in driver session `session`.
pub fn generation(session: u64, sequence: u64) -> u64 {
    (session << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK)
}

pub struct NetworkEventAdapter {
    store: Arc<StateStore>,
    mapper: TopicMapper,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Publisher,
    session: Arc<MeshSession>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    driver_sessions: AtomicU64,
}

impl NetworkEventAdapter {
    pub fn new(
        store: Arc<StateStore>,
        mapper: TopicMapper,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Publisher,
        session: Arc<MeshSession>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            store,
            mapper,
            dispatcher,
            publisher,
            session,
            signals,
            driver_sessions: AtomicU64::new(0),
        }
    }

    pub fn value_id(native: &NativeValueId) -> ValueId {
        ValueId::new(
            NodeId(native.node_id),
            ValueClass::from_command_class(native.command_class, native.index),
            native.instance,
        )
    }

    /// Convert a native report from driver session `session` into an update.
    /// `None` if the value is unusable.
    pub fn to_update(notification: &ValueNotification, session: u64) -> Option<ValueUpdate> {
        let mut choices = Vec::new();
        let value = match &notification.value {
            NativeValue::Bool(b) | NativeValue::Button(b) => Value::Boolean(*b),
            NativeValue::Byte(v) => Value::Numeric(f64::from(*v)),
            NativeValue::Short(v) => Value::Numeric(f64::from(*v)),
            NativeValue::Int(v) => Value::Numeric(f64::from(*v)),
            NativeValue::Decimal(text) => {
                let parsed = text.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
                Value::Numeric(parsed)
            }
            NativeValue::List { selected, items } => {
                choices = items.clone();
                Value::Enumerated(selected.clone())
            }
            NativeValue::String(s) => Value::String(s.clone()),
        };

        Some(ValueUpdate {
            value,
            units: notification.units.clone().filter(|u| !u.is_empty()),
            choices,
            read_only: notification.read_only,
            generation: generation(session, notification.sequence),
            timestamp: Utc::now(),
        })
    }

    pub fn handle(&self, notification: Notification) {
        match notification {
            Notification::DriverReady { home_id } => {
                let session = self.driver_sessions.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "[ZWave] Driver ready, home id {:08x} (session {})",
                    home_id, session
                );
                self.session.mark_ready();
                self.signal(SessionSignal::Up { home_id });
            }
            Notification::DriverFailed { reason } => {
                warn!("[ZWave] Driver failed: {}", reason);
                self.session.mark_failed();
                self.signal(SessionSignal::Down { reason });
            }
            Notification::NodeAdded { node_id } => {
                info!("[ZWave] Node {} added", node_id);
                self.publisher.publish(Publication::retained(
                    self.mapper.node_status_topic(NodeId(node_id)),
                    PAYLOAD_ONLINE,
                ));
            }
            Notification::NodeRemoved { node_id } => self.on_node_removed(NodeId(node_id)),
            Notification::ValueAdded(value)
            | Notification::ValueChanged(value)
            | Notification::ValueRefreshed(value) => {
                self.on_value(&value);
            }
            Notification::ValueRemoved { id } => {
                let value_id = Self::value_id(&id);
                if self.store.remove_value(&value_id) {
                    debug!("[ZWave] Value {} removed", value_id);
                    self.publisher.publish(Publication::clear(
                        self.mapper.topic_for(&value_id, Direction::State),
                    ));
                }
            }
            Notification::CommandResult {
                correlation,
                attempt,
                outcome,
            } => self.dispatcher.on_command_result(correlation, attempt, outcome),
        }
    }

    /// Apply one value report. Returns what the store made of it.
    pub fn on_value(&self, notification: &ValueNotification) -> Option<ChangeResult> {
        let id = Self::value_id(&notification.id);
        let session = self.driver_sessions.load(Ordering::SeqCst);
        let Some(update) = Self::to_update(notification, session) else {
            warn!(
                "[ZWave] Unusable value for {}: {:?}",
                id, notification.value
            );
            return None;
        };

        let observed = update.value.clone();
        let result = self.store.apply(&id, update);
        match &result {
            ChangeResult::Applied(model) => {
                debug!("[ZWave] {} = {} (generation {})", id, model.value, model.generation);
                self.publisher.publish(Publication::retained(
                    self.mapper.topic_for(&id, Direction::State),
                    encode_payload(model),
                ));
                self.dispatcher.on_value_observed(&id, &observed);
            }
            ChangeResult::Unchanged => self.dispatcher.on_value_observed(&id, &observed),
            ChangeResult::Stale => {}
        }
        Some(result)
    }

    fn on_node_removed(&self, node: NodeId) {
        let removed = self.store.remove_node(node);
        info!("[ZWave] Node {} removed ({} values)", node, removed.len());
        for id in &removed {
            self.publisher
                .publish(Publication::clear(self.mapper.topic_for(id, Direction::State)));
        }
        self.publisher
            .publish(Publication::clear(self.mapper.node_status_topic(node)));
    }

    fn signal(&self, signal: SessionSignal) {
        if self.signals.send(signal).is_err() {
            debug!("[ZWave] No session supervisor listening");
        }
    }

    /// Consume the driver's notification queue until it closes or `cancel` fires.
    pub async fn run(self, mut notifications: mpsc::Receiver<Notification>, cancel: CancellationToken) {
        info!("[ZWave] Event adapter started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => self.handle(notification),
                    None => break,
                },
            }
        }
        info!("[ZWave] Event adapter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommandEvent, CommandOutcome, DispatcherConfig, Submission};
    use crate::zwave::SimulatedDriver;
    use std::time::Duration;

    struct Harness {
        adapter: NetworkEventAdapter,
        store: Arc<StateStore>,
        dispatcher: Arc<CommandDispatcher>,
        published: mpsc::Receiver<Publication>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        events: mpsc::UnboundedReceiver<CommandEvent>,
        _issues: mpsc::UnboundedReceiver<crate::dispatch::IssueRequest>,
    }

    fn harness() -> Harness {
        let store = Arc::new(StateStore::new());
        let mapper = TopicMapper::new("zwave");
        let (issue_tx, issues) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(CommandDispatcher::new(
            DispatcherConfig {
                retry_limit: 2,
                ack_timeout: Duration::from_secs(5),
                confirm_timeout: Duration::from_secs(10),
            },
            mapper.clone(),
            store.clone(),
            issue_tx,
            events_tx,
        ));
        let (publisher, published) = Publisher::channel(64);
        let (notify_tx, _) = mpsc::channel(8);
        let session = Arc::new(MeshSession::new(
            Arc::new(SimulatedDriver::new(1)),
            "sim",
            notify_tx,
        ));
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let adapter = NetworkEventAdapter::new(
            store.clone(),
            mapper,
            dispatcher.clone(),
            publisher,
            session,
            signal_tx,
        );
        Harness {
            adapter,
            store,
            dispatcher,
            published,
            signals,
            events,
            _issues: issues,
        }
    }

    fn switch_report(value: bool, sequence: u64) -> ValueNotification {
        ValueNotification {
            id: NativeValueId {
                node_id: 12,
                command_class: 0x25,
                instance: 0,
                index: 0,
            },
            value: NativeValue::Bool(value),
            units: None,
            read_only: false,
            sequence,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Publication>) -> Vec<Publication> {
        let mut out = Vec::new();
        while let Ok(publication) = rx.try_recv() {
            out.push(publication);
        }
        out
    }

    #[test]
    fn test_native_conversions() {
        let mut report = switch_report(true, 1);
        report.value = NativeValue::Decimal(" 21.50 ".into());
        report.units = Some("C".into());
        let update = NetworkEventAdapter::to_update(&report, 1).unwrap();
        assert_eq!(update.value, Value::Numeric(21.5));
        assert_eq!(update.units.as_deref(), Some("C"));

        report.value = NativeValue::Decimal("n/a".into());
        assert!(NetworkEventAdapter::to_update(&report, 1).is_none());

        report.value = NativeValue::List {
            selected: "Heat".into(),
            items: vec!["Off".into(), "Heat".into()],
        };
        report.units = Some(String::new());
        let update = NetworkEventAdapter::to_update(&report, 1).unwrap();
        assert_eq!(update.value, Value::Enumerated("Heat".into()));
        assert_eq!(update.choices.len(), 2);
        assert_eq!(update.units, None);

        report.value = NativeValue::Short(-12);
        assert_eq!(
            NetworkEventAdapter::to_update(&report, 1).unwrap().value,
            Value::Numeric(-12.0)
        );
    }

    #[test]
    fn test_duplicate_report_publishes_once() {
        let mut h = harness();
        let report = switch_report(true, 5);
        assert!(h.adapter.on_value(&report).unwrap().is_applied());
        assert_eq!(h.adapter.on_value(&report), Some(ChangeResult::Unchanged));

        let published = drain(&mut h.published);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "zwave/12/switch/0/state");
        assert!(published[0].retain);
    }

    #[test]
    fn test_out_of_order_report_is_dropped() {
        let mut h = harness();
        h.adapter.on_value(&switch_report(true, 8));
        assert_eq!(
            h.adapter.on_value(&switch_report(false, 7)),
            Some(ChangeResult::Stale)
        );
        assert_eq!(drain(&mut h.published).len(), 1);
        assert_eq!(h.store.stale_count(), 1);
    }

    #[test]
    fn test_restarted_driver_sequence_is_not_stale() {
        let mut h = harness();
        let id = NetworkEventAdapter::value_id(&switch_report(true, 1).id);
        h.adapter.handle(Notification::DriverReady { home_id: 1 });
        assert!(h.adapter.on_value(&switch_report(true, 500)).unwrap().is_applied());
        h.adapter.handle(Notification::DriverFailed {
            reason: "unplugged".into(),
        });

        // Reopened controller counts from 1 again.
        h.adapter.handle(Notification::DriverReady { home_id: 1 });
        assert!(h.adapter.on_value(&switch_report(false, 1)).unwrap().is_applied());
        assert_eq!(h.store.get(&id).unwrap().value, Value::Boolean(false));
        assert_eq!(
            h.adapter.on_value(&switch_report(true, 1)),
            Some(ChangeResult::Stale)
        );

        let published = drain(&mut h.published);
        assert_eq!(published.len(), 2);
        let json: serde_json::Value = serde_json::from_slice(&published[1].payload).unwrap();
        assert_eq!(json["value"], false);
        assert_eq!(h.store.stale_count(), 1);
    }

    #[test]
    fn test_value_removal_clears_retained_topic() {
        let mut h = harness();
        let id = NetworkEventAdapter::value_id(&switch_report(true, 1).id);
        h.adapter.on_value(&switch_report(true, 1));
        drain(&mut h.published);

        h.adapter.handle(Notification::ValueRemoved {
            id: switch_report(true, 1).id,
        });
        let published = drain(&mut h.published);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "zwave/12/switch/0/state");
        assert!(published[0].retain);
        assert!(published[0].payload.is_empty());
        assert!(h.store.get(&id).is_none());

        // Removing it again publishes nothing.
        h.adapter.handle(Notification::ValueRemoved {
            id: switch_report(true, 1).id,
        });
        assert!(drain(&mut h.published).is_empty());
    }

    #[test]
    fn test_switch_scenario_closes_command_loop() {
        let mut h = harness();
        h.adapter.on_value(&switch_report(false, 4));
        drain(&mut h.published);

        let correlation =
            match h.dispatcher.submit("zwave/12/switch/0/set", br#"{"value": true}"#) {
                Submission::Accepted(correlation) => correlation,
                other => panic!("expected accepted, got {:?}", other),
            };
        h.adapter.handle(Notification::CommandResult {
            correlation,
            attempt: 1,
            outcome: Ok(()),
        });
        h.adapter.handle(Notification::ValueChanged(switch_report(true, 5)));

        let published = drain(&mut h.published);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "zwave/12/switch/0/state");
        assert!(published[0].retain);
        let json: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(json["value"], true);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.correlation, correlation);
        assert_eq!(event.outcome, CommandOutcome::Confirmed);
        assert_eq!(h.dispatcher.outstanding(), 0);
    }

    #[test]
    fn test_node_removal_clears_retained_topics() {
        let mut h = harness();
        h.adapter.handle(Notification::NodeAdded { node_id: 12 });
        h.adapter.on_value(&switch_report(true, 1));
        drain(&mut h.published);

        h.adapter.handle(Notification::NodeRemoved { node_id: 12 });
        let published = drain(&mut h.published);
        let topics: Vec<&str> = published.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(topics, vec!["zwave/12/switch/0/state", "zwave/12/status"]);
        assert!(published.iter().all(|p| p.retain && p.payload.is_empty()));
        assert!(h.store.is_empty());
    }

    #[test]
    fn test_driver_health_is_signalled() {
        let mut h = harness();
        h.adapter.handle(Notification::DriverReady { home_id: 0xABCD });
        h.adapter.handle(Notification::DriverFailed {
            reason: "unplugged".into(),
        });
        assert_eq!(
            h.signals.try_recv().unwrap(),
            SessionSignal::Up { home_id: 0xABCD }
        );
        assert_eq!(
            h.signals.try_recv().unwrap(),
            SessionSignal::Down {
                reason: "unplugged".into()
            }
        );
    }
}
