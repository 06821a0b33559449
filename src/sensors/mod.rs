use crate::config::{MqttConfig, SensorsConfig};
use crate::models::{DeviceIdentity, RegisterMap};
use crate::mqtt::ha_interface::{self, HaComponent, HaDiscover};
use crate::mqtt::{MeteringData, PublishData, Transmission};
use crate::obis_utils::{numeric_value, Quantity};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

/// Lower bound of every published sensor value.
pub const SENSOR_MIN: f64 = 0.0001;
/// Upper bound of every published sensor value.
pub const SENSOR_MAX: f64 = 100000.0;

/// Maps a value into the sensor domain `[SENSOR_MIN, SENSOR_MAX]`.
pub fn clamp_sensor_value(value: f64) -> f64 {
    if !value.is_finite() || value <= SENSOR_MIN {
        SENSOR_MIN
    } else {
        value.min(SENSOR_MAX)
    }
}

/// Consumer of the values a polling tick produces. Both calls are fire and
/// forget and happen at most once per tick.
pub trait SensorSink: Send + Sync {
    fn name(&self) -> &str;

    fn publish_active_power(&self, _value: f64) {}

    fn publish_auxiliary(&self, _registers: &RegisterMap) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn register(&self) -> &'static str {
        match self {
            Phase::L1 => "32.7.0",
            Phase::L2 => "52.7.0",
            Phase::L3 => "72.7.0",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorKind {
    PowerConsumption,
    PowerReturn,
    EnergyImport,
    Voltage(Phase),
}

impl SensorKind {
    pub fn key(&self) -> String {
        match self {
            SensorKind::PowerConsumption => "power_consumption".to_string(),
            SensorKind::PowerReturn => "power_return".to_string(),
            SensorKind::EnergyImport => "energy_import".to_string(),
            SensorKind::Voltage(phase) => format!("voltage_{}", phase.suffix()),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SensorKind::PowerConsumption => "Power Consumption".to_string(),
            SensorKind::PowerReturn => "Power Return".to_string(),
            SensorKind::EnergyImport => "Energy Import".to_string(),
            SensorKind::Voltage(phase) => format!("Voltage {:?}", phase),
        }
    }

    /// Value shown by the sensor for a resolved active power reading.
    fn from_active_power(&self, value: f64) -> Option<f64> {
        match self {
            SensorKind::PowerConsumption => Some(if value > 0.0 { value } else { SENSOR_MIN }),
            SensorKind::PowerReturn => Some(if value < 0.0 { -value } else { SENSOR_MIN }),
            _ => None,
        }
    }

    fn from_registers(&self, registers: &RegisterMap) -> Option<f64> {
        let value = match self {
            SensorKind::EnergyImport => numeric_value(registers.lookup_code("1.8.0"), Quantity::Energy),
            SensorKind::Voltage(phase) => numeric_value(registers.lookup_code(phase.register()), Quantity::Voltage),
            _ => return None,
        };
        if value.is_finite() { Some(value) } else { None }
    }

    fn component(&self, device: &str) -> HaComponent {
        let (name, key) = (self.display_name(), self.key());
        match self {
            SensorKind::PowerConsumption | SensorKind::PowerReturn => HaComponent::new_power(device, &name, &key),
            SensorKind::EnergyImport => HaComponent::new_energy(device, &name, &key),
            SensorKind::Voltage(_) => HaComponent::new_voltage(device, &name, &key),
        }
    }
}

/// One numeric sensor exposed over MQTT.
pub struct MqttSensor {
    kind: SensorKind,
    key: String,
    state_topic: String,
    sender: Sender<Transmission>,
}

impl MqttSensor {
    pub fn new(kind: SensorKind, mqtt: &MqttConfig, sender: Sender<Transmission>) -> Self {
        let key = kind.key();
        MqttSensor {
            kind,
            state_topic: format!("{}/{}", mqtt.base_topic, key),
            key,
            sender,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn discovery(&self, identity: &DeviceIdentity) -> HaDiscover {
        let mut disc = HaDiscover::new(identity, &self.key, self.state_topic.clone());
        disc.add_component(&self.key, self.kind.component(&ha_interface::device_id(identity)));
        disc
    }

    fn publish(&self, value: f64) {
        let value = clamp_sensor_value(value);
        let mut state = serde_json::Map::new();
        state.insert(self.key.clone(), serde_json::json!(value));
        let payload = serde_json::Value::Object(state).to_string();
        let data = PublishData { topic: self.state_topic.clone(), payload, qos: 0, retain: false };
        if let Err(e) = self.sender.try_send(Transmission::Publish(data)) {
            warn!("Dropping {} update: {}", self.key, e);
        }
    }
}

impl SensorSink for MqttSensor {
    fn name(&self) -> &str {
        &self.key
    }

    fn publish_active_power(&self, value: f64) {
        if let Some(v) = self.kind.from_active_power(value) {
            self.publish(v);
        }
    }

    fn publish_auxiliary(&self, registers: &RegisterMap) {
        if matches!(self.kind, SensorKind::PowerConsumption | SensorKind::PowerReturn) {
            return;
        }
        match self.kind.from_registers(registers) {
            Some(v) => self.publish(v),
            None => debug!("No value for {} in this read", self.key),
        }
    }
}

/// Publishes the whole register map on `<base>/raw`.
pub struct RawRegisters {
    meter_name: String,
    protocol: String,
    sender: Sender<Transmission>,
}

impl RawRegisters {
    pub fn new(identity: &DeviceIdentity, protocol: &str, sender: Sender<Transmission>) -> Self {
        RawRegisters {
            meter_name: identity.product_name.clone(),
            protocol: protocol.to_string(),
            sender,
        }
    }
}

impl SensorSink for RawRegisters {
    fn name(&self) -> &str {
        "raw"
    }

    fn publish_auxiliary(&self, registers: &RegisterMap) {
        let data = MeteringData {
            meter_name: self.meter_name.clone(),
            protocol: self.protocol.clone(),
            metered_time: chrono::Utc::now().timestamp(),
            metered_values: registers.to_json(),
        };
        if let Err(e) = self.sender.try_send(Transmission::Metering(data)) {
            warn!("Dropping raw register update: {}", e);
        }
    }
}

fn hidden(kind: SensorKind, sensors: &SensorsConfig) -> bool {
    match kind {
        SensorKind::PowerConsumption => sensors.hide_power_consumption_device,
        SensorKind::PowerReturn => sensors.hide_power_return_device,
        SensorKind::EnergyImport => sensors.hide_energy_import_device,
        SensorKind::Voltage(_) => sensors.hide_voltage_devices,
    }
}

/// Builds the visible sensors and announces them. Hidden sensors get their
/// retained discovery document removed instead.
pub fn build_sensors(
    sensors: &SensorsConfig,
    mqtt: &MqttConfig,
    identity: &DeviceIdentity,
    protocol: &str,
    sender: &Sender<Transmission>,
) -> Vec<Arc<dyn SensorSink>> {
    let mut kinds = vec![SensorKind::PowerConsumption, SensorKind::PowerReturn, SensorKind::EnergyImport];
    kinds.extend(Phase::ALL.iter().map(|p| SensorKind::Voltage(*p)));

    let mut sinks: Vec<Arc<dyn SensorSink>> = Vec::new();
    for kind in kinds {
        if hidden(kind, sensors) {
            info!("Sensor {} is hidden", kind.key());
            if mqtt.ha_enabled {
                let topic = ha_interface::discover_topic(identity, &kind.key());
                if let Err(e) = sender.try_send(Transmission::Clear(topic)) {
                    warn!("Unable to clear discovery of {}: {}", kind.key(), e);
                }
            }
            continue;
        }

        let sensor = MqttSensor::new(kind, mqtt, sender.clone());
        if mqtt.ha_enabled {
            if let Err(e) = sender.try_send(Transmission::AutoDiscovery(sensor.discovery(identity))) {
                warn!("Unable to announce {}: {}", kind.key(), e);
            }
        }
        sinks.push(Arc::new(sensor));
    }

    sinks.push(Arc::new(RawRegisters::new(identity, protocol, sender.clone())));
    sinks
}
