use crate::models::DeviceIdentity;
use serde::Serialize;

#[derive(Serialize, Debug, Clone)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
    #[serde(skip_serializing_if = "is_none_str")]
    serial_number: String,
    #[serde(skip_serializing_if = "is_none_str")]
    sw_version: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

fn is_none_str(value: &String) -> bool {
    value.is_empty() || value == "Unknown"
}

#[derive(Serialize, Debug, Clone)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_class: String,
}

impl HaComponent {
    fn new_sensor(device: &str, name: &str, device_class: &str, unit: &str, state_class: &str, json_key: &str) -> Self {
        let safe_name = name.replace(' ', "_");
        HaComponent {
            p: "sensor".to_string(),
            name: name.to_string(),
            device_class: device_class.to_string(),
            unit_of_measurement: unit.to_string(),
            value_template: format!("{{{{ value_json.{json_key} }}}}"),
            unique_id: format!("o2m_{device}_{safe_name}").to_lowercase(),
            object_id: format!("{device}_{safe_name}").to_lowercase(),
            state_class: state_class.to_string(),
        }
    }

    pub fn new_power(device: &str, name: &str, json_key: &str) -> Self {
        Self::new_sensor(device, name, "power", "W", "measurement", json_key)
    }

    pub fn new_energy(device: &str, name: &str, json_key: &str) -> Self {
        Self::new_sensor(device, name, "energy", "kWh", "total_increasing", json_key)
    }

    pub fn new_voltage(device: &str, name: &str, json_key: &str) -> Self {
        Self::new_sensor(device, name, "voltage", "V", "measurement", json_key)
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

/// Device id used in topics and unique ids, derived from the meter serial.
pub fn device_id(identity: &DeviceIdentity) -> String {
    let source = if identity.serial != "Unknown" { &identity.serial } else { &identity.product_name };
    source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

/// Discovery topic of one sensor, also used to clear hidden sensors.
pub fn discover_topic(identity: &DeviceIdentity, object: &str) -> String {
    format!("homeassistant/device/o2m_{}-{}/config", device_id(identity), object)
}

impl HaDiscover {
    pub fn new(identity: &DeviceIdentity, object: &str, state_topic: String) -> Self {
        let device = device_id(identity);
        HaDiscover {
            discover_topic: discover_topic(identity, object),
            dev: HaDevice {
                ids: format!("o2m_{}", device),
                name: format!("{} {}", identity.product_name, identity.serial),
                manufacturer: identity.product_name.clone(),
                model: identity.product_type.clone(),
                serial_number: identity.serial.clone(),
                sw_version: identity.firmware_version.clone(),
            },
            o: HaOrigin {
                name: "obis2mqtt".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            cmps: serde_json::Map::new(),
            state_topic,
            qos: 0,
        }
    }

    pub fn add_component(&mut self, key: &str, component: HaComponent) {
        if let Ok(value) = serde_json::to_value(component) {
            self.cmps.insert(key.to_string(), value);
        }
    }

    pub fn get_dev_id(&self) -> String {
        self.dev.ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            product_name: "ZPA".to_string(),
            product_type: "ZPA".to_string(),
            serial: "0a01 5a50".to_string(),
            firmware_version: "01".to_string(),
            api_version: "01".to_string(),
        }
    }

    #[test]
    fn test_device_id() {
        assert_eq!(device_id(&identity()), "0a01_5a50");
        assert_eq!(device_id(&DeviceIdentity::default()), "unknown");
    }

    #[test]
    fn test_discovery_document() {
        let mut disc = HaDiscover::new(&identity(), "power_consumption", "obis2mqtt/power_consumption".to_string());
        disc.add_component("power_consumption", HaComponent::new_power("0a01_5a50", "Power Consumption", "power_consumption"));

        assert_eq!(disc.discover_topic, "homeassistant/device/o2m_0a01_5a50-power_consumption/config");
        assert_eq!(disc.get_dev_id(), "o2m_0a01_5a50");

        let json = serde_json::to_value(&disc).unwrap();
        assert!(json.get("discover_topic").is_none());
        let cmp = &json["cmps"]["power_consumption"];
        assert_eq!(cmp["unit_of_measurement"], "W");
        assert_eq!(cmp["value_template"], "{{ value_json.power_consumption }}");
        assert_eq!(cmp["unique_id"], "o2m_0a01_5a50_power_consumption");
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let disc = HaDiscover::new(&DeviceIdentity::default(), "raw", "obis2mqtt/raw".to_string());
        let json = serde_json::to_value(&disc).unwrap();
        assert!(json["dev"].get("serial_number").is_none());
    }
}
