//! Z-Wave side of the bridge.
//!
//! The driver itself is an external collaborator reached through the
//! [`ZWaveDriver`] trait; this module translates its notifications into the
//! bridge's value model.

pub mod adapter;
pub mod driver;
pub mod simulated;

pub use adapter::NetworkEventAdapter;
pub use driver::{
    MeshSession, NativeValue, NativeValueId, Notification, NotificationSender, ValueNotification,
    ZWaveDriver,
};
pub use simulated::SimulatedDriver;
