//! obis2mqtt library
//!
//! Polls an OBIS smart meter (SML or D0) over a serial line, derives the
//! active power from whatever registers the meter exposes and publishes the
//! results over MQTT with Home Assistant discovery.

pub mod models;
pub mod config;
pub mod obis_utils;
pub mod metering_sml;
pub mod metering_62056;
pub mod transport;
pub mod resolver;
pub mod acquisition;
pub mod validation;
pub mod polling;
pub mod sensors;
pub mod history;
pub mod mqtt;
pub mod platform;

// Re-export common types for easier access
pub use models::{DeviceIdentity, Measurement, RegisterMap};
pub use config::Config;
pub use mqtt::{MeteringData, MqttManager};
pub use transport::{MeasurementReader, ObisReader, ReaderHandle};
pub use resolver::{resolve, PowerSource, ResolvedPower};
pub use acquisition::{run_cycle, CycleOutcome};
pub use polling::PollingLoop;
pub use platform::Platform;
