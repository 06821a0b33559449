use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::obis_utils;

/// A single value of a measurement, either numeric or text (serial numbers,
/// manufacturer strings and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObisScalar {
    Number(f64),
    Text(String),
}

impl fmt::Display for ObisScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObisScalar::Number(n) => write!(f, "{}", n),
            ObisScalar::Text(t) => write!(f, "{}", t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObisValue {
    pub value: ObisScalar,
    pub unit: Option<String>,
}

impl ObisValue {
    pub fn number(value: f64, unit: Option<&str>) -> Self {
        ObisValue {
            value: ObisScalar::Number(value),
            unit: unit.map(|u| u.to_string()),
        }
    }

    pub fn text(value: &str) -> Self {
        ObisValue {
            value: ObisScalar::Text(value.to_string()),
            unit: None,
        }
    }
}

impl fmt::Display for ObisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) if !unit.is_empty() => write!(f, "{} {}", self.value, unit),
            _ => write!(f, "{}", self.value),
        }
    }
}

/// One decoded register. Immutable once produced by a decoder.
///
/// The string rendering and the structured values are both optional because
/// not every producer provides both; consumers go through [`crate::obis_utils`]
/// which prefers the rendering and falls back to the first structured value.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    values: Vec<ObisValue>,
    rendered: Option<String>,
}

impl Measurement {
    /// Measurement with structured values; the rendering is derived from them.
    pub fn new(values: Vec<ObisValue>) -> Self {
        let rendered = if values.is_empty() {
            None
        } else {
            Some(values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))
        };
        Measurement { values, rendered }
    }

    /// Measurement known only by its rendering, e.g. `"874 W"`.
    pub fn from_rendered(text: &str) -> Self {
        Measurement {
            values: Vec::new(),
            rendered: Some(text.to_string()),
        }
    }

    /// Measurement without a rendering.
    pub fn from_values(values: Vec<ObisValue>) -> Self {
        Measurement { values, rendered: None }
    }

    pub fn value_to_string(&self) -> Option<&str> {
        self.rendered.as_deref()
    }

    pub fn values(&self) -> &[ObisValue] {
        &self.values
    }
}

/// Registers decoded from one meter read, keyed by OBIS id (`1-0:16.7.0*255`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    registers: BTreeMap<String, Measurement>,
}

impl RegisterMap {
    pub fn new() -> Self {
        RegisterMap { registers: BTreeMap::new() }
    }

    pub fn insert(&mut self, id: String, measurement: Measurement) {
        self.registers.insert(id, measurement);
    }

    pub fn get(&self, id: &str) -> Option<&Measurement> {
        self.registers.get(id)
    }

    /// Returns the first register found under any of the given spellings.
    pub fn lookup<S: AsRef<str>>(&self, spellings: &[S]) -> Option<&Measurement> {
        spellings.iter().find_map(|id| self.registers.get(id.as_ref()))
    }

    /// Looks up an electricity register by its `C.D.E` code, probing the
    /// spellings with and without the `*255` suffix.
    pub fn lookup_code(&self, code: &str) -> Option<&Measurement> {
        self.lookup(&obis_utils::obis_spellings(code))
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.registers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Measurement)> {
        self.registers.iter()
    }

    /// Comma separated list of at most `limit` register ids, for log lines.
    pub fn key_preview(&self, limit: usize) -> String {
        let mut preview = self.registers.keys().take(limit).cloned().collect::<Vec<_>>().join(", ");
        if self.registers.len() > limit {
            preview.push_str(&format!(", ... ({} more)", self.registers.len() - limit));
        }
        if preview.is_empty() {
            preview = "none".to_string();
        }
        preview
    }

    /// Flattens the map into `id -> rendering` for publication.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (id, m) in &self.registers {
            let rendered = match m.value_to_string() {
                Some(r) => r.to_string(),
                None => m.values().iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "),
            };
            map.insert(id.clone(), serde_json::Value::String(rendered));
        }
        map
    }
}

impl FromIterator<(String, Measurement)> for RegisterMap {
    fn from_iter<T: IntoIterator<Item = (String, Measurement)>>(iter: T) -> Self {
        RegisterMap { registers: iter.into_iter().collect() }
    }
}

const UNKNOWN: &str = "Unknown";

const PRODUCT_KEYS: [&str; 2] = ["1-0:96.50.1*1", "1-0:96.50.1"];
const SERIAL_KEYS: [&str; 3] = ["1-0:96.1.0*255", "1-0:96.1.0", "1-0:0.0.0*255"];
const FIRMWARE_KEYS: [&str; 2] = ["1-0:0.2.0*0", "1-0:0.2.0"];

/// Static identity of the meter, captured once during validation and shared
/// read-only with every sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub product_name: String,
    pub product_type: String,
    pub serial: String,
    pub firmware_version: String,
    pub api_version: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        DeviceIdentity {
            product_name: UNKNOWN.to_string(),
            product_type: UNKNOWN.to_string(),
            serial: UNKNOWN.to_string(),
            firmware_version: UNKNOWN.to_string(),
            api_version: UNKNOWN.to_string(),
        }
    }
}

impl DeviceIdentity {
    pub fn from_registers(registers: &RegisterMap) -> Self {
        let field = |keys: &[&str]| -> String {
            registers
                .lookup(keys)
                .and_then(|m| m.value_to_string())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        let product = field(&PRODUCT_KEYS);
        let firmware = field(&FIRMWARE_KEYS);
        DeviceIdentity {
            product_name: product.clone(),
            product_type: product,
            serial: field(&SERIAL_KEYS),
            firmware_version: firmware.clone(),
            api_version: firmware,
        }
    }
}
