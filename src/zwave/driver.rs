//! Boundary with the Z-Wave controller driver.
//!
//! The driver reports everything it sees as [`Notification`]s pushed onto a
//! bounded queue; the bridge never runs inside driver callbacks. Commands go
//! the other way through [`ZWaveDriver::issue_command`], which only checks
//! that the command was accepted. Completion arrives later as a
//! [`Notification::CommandResult`] carrying the same correlation id and
//! attempt number.

use crate::dispatch::CorrelationId;
use crate::error::DriverError;
use crate::model::{Value, ValueId};
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Value identity as the driver reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeValueId {
    pub node_id: u8,
    pub command_class: u8,
    pub instance: u8,
    pub index: u8,
}

/// Value payload as the driver reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    /// Fixed-point reading rendered as text by the driver, e.g. `"21.50"`.
    Decimal(String),
    List { selected: String, items: Vec<String> },
    String(String),
    Button(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueNotification {
    pub id: NativeValueId,
    pub value: NativeValue,
    pub units: Option<String>,
    pub read_only: bool,
    /// Monotonic per-driver sequence number, used as the value generation.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    DriverReady { home_id: u32 },
    DriverFailed { reason: String },
    NodeAdded { node_id: u8 },
    NodeRemoved { node_id: u8 },
    ValueAdded(ValueNotification),
    ValueChanged(ValueNotification),
    ValueRefreshed(ValueNotification),
    ValueRemoved { id: NativeValueId },
    CommandResult {
        correlation: CorrelationId,
        attempt: u32,
        outcome: Result<(), String>,
    },
}

pub type NotificationSender = mpsc::Sender<Notification>;

/// A Z-Wave controller driver.
pub trait ZWaveDriver: Send + Sync {
    /// Open the controller and start delivering notifications on `events`.
    fn connect(&self, events: NotificationSender) -> Result<(), DriverError>;

    /// Close the controller. Pending completions may never arrive.
    fn disconnect(&self);

    /// Ask the driver to set a value. `Ok` only means the driver accepted it.
    /// The completion must echo both `correlation` and `attempt`.
    fn issue_command(
        &self,
        target: &ValueId,
        value: &Value,
        correlation: CorrelationId,
        attempt: u32,
    ) -> Result<(), DriverError>;
}

/// Explicit handle on the current mesh-network session.
///
/// Replaces a process-wide driver singleton: the reconnect supervisor opens
/// and reopens the session, the adapter marks it ready or failed, and the
/// issue worker sends commands through it.
pub struct MeshSession {
    driver: Arc<dyn ZWaveDriver>,
    device: String,
    events: NotificationSender,
    ready: AtomicBool,
    epoch: AtomicU64,
}

impl MeshSession {
    pub fn new(driver: Arc<dyn ZWaveDriver>, device: impl Into<String>, events: NotificationSender) -> Self {
        Self {
            driver,
            device: device.into(),
            events,
            ready: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Connect the driver. Returns the new session epoch.
    pub fn open(&self) -> Result<u64, DriverError> {
        info!("[ZWave] Opening controller on {}", self.device);
        self.driver.connect(self.events.clone())?;
        Ok(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.driver.disconnect();
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn mark_failed(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn issue(
        &self,
        target: &ValueId,
        value: &Value,
        correlation: CorrelationId,
        attempt: u32,
    ) -> Result<(), DriverError> {
        if !self.is_ready() {
            return Err(DriverError::NotConnected);
        }
        self.driver.issue_command(target, value, correlation, attempt)
    }
}
