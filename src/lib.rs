//! Z-Wave to MQTT bridge library.
//!
//! Mirrors every value on a Z-Wave mesh network onto retained MQTT topics and
//! turns MQTT set requests back into confirmed device commands.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod mqtt;
pub mod reconnect;
pub mod state;
pub mod topic;
pub mod zwave;
