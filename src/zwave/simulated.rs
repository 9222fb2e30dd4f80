//! In-process Z-Wave network for development and testing.
//!
//! Behaves like a driver: notifications are delivered asynchronously on the
//! queue handed to [`ZWaveDriver::connect`], commands are acknowledged after a
//! short delay and followed by a value report carrying the new state.

use super::driver::{
    NativeValue, NativeValueId, Notification, NotificationSender, ValueNotification, ZWaveDriver,
};
use crate::dispatch::CorrelationId;
use crate::error::DriverError;
use crate::model::{Value, ValueClass, ValueId};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval, sleep};

#[derive(Debug, Clone)]
struct SimValue {
    id: NativeValueId,
    value: NativeValue,
    units: Option<String>,
    read_only: bool,
    sequence: u64,
}

impl SimValue {
    fn notification(&self) -> ValueNotification {
        ValueNotification {
            id: self.id,
            value: self.value.clone(),
            units: self.units.clone(),
            read_only: self.read_only,
            sequence: self.sequence,
        }
    }

    fn matches(&self, target: &ValueId) -> bool {
        self.id.node_id == target.node.0
            && self.id.instance == target.instance
            && ValueClass::from_command_class(self.id.command_class, self.id.index) == target.class
    }
}

#[derive(Default)]
struct Network {
    events: Option<NotificationSender>,
    values: Vec<SimValue>,
    sequence: u64,
}

impl Network {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

pub struct SimulatedDriver {
    home_id: u32,
    network: Arc<Mutex<Network>>,
    ack_delay: Duration,
    report_delay: Duration,
    /// Acknowledge commands but never report the new value.
    unresponsive: AtomicBool,
}

impl SimulatedDriver {
    pub fn new(home_id: u32) -> Self {
        Self {
            home_id,
            network: Arc::new(Mutex::new(Network::default())),
            ack_delay: Duration::from_millis(20),
            report_delay: Duration::from_millis(50),
            unresponsive: AtomicBool::new(false),
        }
    }

    /// Small network with one device of each common kind.
    pub fn demo() -> Self {
        let id = |node_id, command_class, index| NativeValueId {
            node_id,
            command_class,
            instance: 0,
            index,
        };
        Self::new(0xC0FF_EE01)
            .with_value(id(2, 0x25, 0), NativeValue::Bool(false), None, false)
            .with_value(id(3, 0x26, 0), NativeValue::Byte(0), Some("%"), false)
            .with_value(id(4, 0x31, 1), NativeValue::Decimal("21.50".into()), Some("C"), true)
            .with_value(id(4, 0x80, 0), NativeValue::Byte(87), Some("%"), true)
            .with_value(
                id(5, 0x40, 0),
                NativeValue::List {
                    selected: "Off".into(),
                    items: vec!["Off".into(), "Heat".into(), "Cool".into(), "Auto".into()],
                },
                None,
                false,
            )
            .with_value(id(12, 0x25, 0), NativeValue::Bool(false), None, false)
    }

    pub fn with_value(
        self,
        id: NativeValueId,
        value: NativeValue,
        units: Option<&str>,
        read_only: bool,
    ) -> Self {
        {
            let mut network = self.network.lock();
            let sequence = network.next_sequence();
            network.values.push(SimValue {
                id,
                value,
                units: units.map(str::to_string),
                read_only,
                sequence,
            });
        }
        self
    }

    pub fn with_delays(mut self, ack: Duration, report: Duration) -> Self {
        self.ack_delay = ack;
        self.report_delay = report;
        self
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Local change on a device, e.g. someone flipped the switch by hand.
    pub fn set_value(&self, id: NativeValueId, value: NativeValue) -> bool {
        let mut network = self.network.lock();
        let sequence = network.next_sequence();
        let Some(entry) = network.values.iter_mut().find(|v| v.id == id) else {
            return false;
        };
        entry.value = value;
        entry.sequence = sequence;
        let notification = Notification::ValueChanged(entry.notification());
        Self::deliver(&network, notification)
    }

    /// Nudge every read-only decimal reading by a small random amount.
    pub fn drift_readings(&self) -> usize {
        let mut rng = rand::thread_rng();
        let targets: Vec<(NativeValueId, f64)> = self
            .network
            .lock()
            .values
            .iter()
            .filter(|v| v.read_only)
            .filter_map(|v| match &v.value {
                NativeValue::Decimal(text) => text.parse::<f64>().ok().map(|n| (v.id, n)),
                _ => None,
            })
            .collect();

        let mut changed = 0;
        for (id, current) in targets {
            let next = current + rng.gen_range(-0.25..=0.25);
            if self.set_value(id, NativeValue::Decimal(format!("{:.2}", next))) {
                changed += 1;
            }
        }
        changed
    }

    /// Drop a node from the network.
    pub fn remove_node(&self, node_id: u8) -> bool {
        let mut network = self.network.lock();
        let before = network.values.len();
        network.values.retain(|v| v.id.node_id != node_id);
        if network.values.len() == before {
            return false;
        }
        Self::deliver(&network, Notification::NodeRemoved { node_id })
    }

    /// Simulate the controller going away.
    pub fn fail(&self, reason: &str) {
        let mut network = self.network.lock();
        warn!("[Sim] Controller failure: {}", reason);
        Self::deliver(
            &network,
            Notification::DriverFailed {
                reason: reason.to_string(),
            },
        );
        network.events = None;
    }

    fn deliver(network: &Network, notification: Notification) -> bool {
        let Some(events) = &network.events else {
            return false;
        };
        match events.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Sim] Notification dropped: {}", e);
                false
            }
        }
    }

    fn to_native(current: &NativeValue, value: &Value) -> Result<NativeValue, DriverError> {
        let integral = |n: f64, min: f64, max: f64| n.fract() == 0.0 && n >= min && n <= max;
        let native = match (current, value) {
            (NativeValue::Bool(_), Value::Boolean(b)) => NativeValue::Bool(*b),
            (NativeValue::Button(_), Value::Boolean(b)) => NativeValue::Button(*b),
            (NativeValue::Byte(_), Value::Numeric(n)) if integral(*n, 0.0, 255.0) => {
                NativeValue::Byte(*n as u8)
            }
            (NativeValue::Short(_), Value::Numeric(n))
                if integral(*n, f64::from(i16::MIN), f64::from(i16::MAX)) =>
            {
                NativeValue::Short(*n as i16)
            }
            (NativeValue::Int(_), Value::Numeric(n))
                if integral(*n, f64::from(i32::MIN), f64::from(i32::MAX)) =>
            {
                NativeValue::Int(*n as i32)
            }
            (NativeValue::Decimal(_), Value::Numeric(n)) => NativeValue::Decimal(n.to_string()),
            (NativeValue::List { items, .. }, Value::Enumerated(label)) if items.contains(label) => {
                NativeValue::List {
                    selected: label.clone(),
                    items: items.clone(),
                }
            }
            (NativeValue::String(_), Value::String(s)) => NativeValue::String(s.clone()),
            _ => {
                return Err(DriverError::Rejected(format!(
                    "{} does not fit {:?}",
                    value, current
                )));
            }
        };
        Ok(native)
    }
}

impl ZWaveDriver for SimulatedDriver {
    fn connect(&self, events: NotificationSender) -> Result<(), DriverError> {
        let runtime =
            Handle::try_current().map_err(|_| DriverError::Io("no async runtime".to_string()))?;

        let announce = {
            let mut network = self.network.lock();
            network.events = Some(events.clone());
            network.values.clone()
        };
        let home_id = self.home_id;
        info!(
            "[Sim] Controller {:08x} up with {} values",
            home_id,
            announce.len()
        );

        runtime.spawn(async move {
            let nodes: BTreeSet<u8> = announce.iter().map(|v| v.id.node_id).collect();
            let mut queue = vec![Notification::DriverReady { home_id }];
            queue.extend(nodes.into_iter().map(|node_id| Notification::NodeAdded { node_id }));
            queue.extend(
                announce
                    .iter()
                    .map(|v| Notification::ValueAdded(v.notification())),
            );
            for notification in queue {
                if events.send(notification).await.is_err() {
                    debug!("[Sim] Notification queue closed during announce");
                    return;
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) {
        if self.network.lock().events.take().is_some() {
            info!("[Sim] Controller closed");
        }
    }

    fn issue_command(
        &self,
        target: &ValueId,
        value: &Value,
        correlation: CorrelationId,
        attempt: u32,
    ) -> Result<(), DriverError> {
        let runtime =
            Handle::try_current().map_err(|_| DriverError::Io("no async runtime".to_string()))?;

        let (events, report) = {
            let mut network = self.network.lock();
            let Some(events) = network.events.clone() else {
                return Err(DriverError::NotConnected);
            };
            let sequence = network.next_sequence();
            let Some(entry) = network.values.iter_mut().find(|v| v.matches(target)) else {
                return Err(DriverError::Rejected(format!("no value {}", target)));
            };
            if entry.read_only {
                return Err(DriverError::Rejected(format!("{} is read-only", target)));
            }
            entry.value = Self::to_native(&entry.value, value)?;
            entry.sequence = sequence;
            (events, entry.notification())
        };

        debug!("[Sim] {} <- {} ({} #{})", target, value, correlation, attempt);
        let ack_delay = self.ack_delay;
        let report_delay = self.report_delay;
        let unresponsive = self.unresponsive.load(Ordering::SeqCst);
        runtime.spawn(async move {
            sleep(ack_delay).await;
            let ack = Notification::CommandResult {
                correlation,
                attempt,
                outcome: Ok(()),
            };
            if events.send(ack).await.is_err() || unresponsive {
                return;
            }
            sleep(report_delay).await;
            let _ = events.send(Notification::ValueChanged(report)).await;
        });
        Ok(())
    }
}

/// Spawn a task that periodically drifts the simulated sensor readings.
pub fn run_simulation(driver: Arc<SimulatedDriver>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let changed = driver.drift_readings();
            debug!("[Sim] Drifted {} readings", changed);
        }
    })
}
