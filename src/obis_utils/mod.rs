use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

use crate::models::{Measurement, ObisScalar};

lazy_static! {
    static ref LEADING_NUMBER: Regex = Regex::new(r"-?\d+(?:[.,]\d+)?").unwrap();
}

/// Media suffix most meters append to electricity registers.
pub const MEDIA_SUFFIX: &str = "*255";

/// Quantity a register is read as; decides how the unit marker scales it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantity {
    /// Watts, `kW` is scaled by 1000.
    Power,
    /// Kilowatt hours, plain `Wh` is divided by 1000.
    Energy,
    /// Volts, `kV` is scaled by 1000.
    Voltage,
}

impl Quantity {
    fn scale(&self, value: f64, unit: &str) -> f64 {
        let unit = unit.to_lowercase();
        match self {
            Quantity::Power if unit.contains("kw") => value * 1000.0,
            Quantity::Energy if unit.contains("wh") && !unit.contains("kwh") => value / 1000.0,
            Quantity::Voltage if unit.contains("kv") => value * 1000.0,
            _ => value,
        }
    }
}

/// Spellings an electricity register `C.D.E` may appear under, in probe order.
pub fn obis_spellings(code: &str) -> [String; 2] {
    [format!("1-0:{}{}", code, MEDIA_SUFFIX), format!("1-0:{}", code)]
}

/// Numeric value of a measurement in the unit of `quantity`.
///
/// The string rendering is preferred: the leading signed decimal (comma or dot
/// separator) is taken and the rest of the text decides the scaling. Without a
/// usable rendering the first structured value is used. Anything else is NaN.
pub fn numeric_value(measurement: Option<&Measurement>, quantity: Quantity) -> f64 {
    let m = match measurement {
        Some(m) => m,
        None => return f64::NAN,
    };

    if let Some(text) = m.value_to_string() {
        if let Some(found) = LEADING_NUMBER.find(text) {
            if let Ok(v) = found.as_str().replace(',', ".").parse::<f64>() {
                return quantity.scale(v, text);
            }
        }
    }

    if let Some(first) = m.values().first() {
        if let ObisScalar::Number(v) = first.value {
            if v.is_finite() {
                return quantity.scale(v, first.unit.as_deref().unwrap_or(""));
            }
        }
    }

    f64::NAN
}

/// Sum of the given registers where unreadable or missing ones count as 0.
pub fn sum_registers(registers: &crate::models::RegisterMap, codes: &[&str], quantity: Quantity) -> f64 {
    codes
        .iter()
        .map(|code| numeric_value(registers.lookup_code(code), quantity))
        .filter(|v| v.is_finite())
        .sum()
}

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    let code = obis_code.split('*').next().unwrap_or(obis_code);
    let descriptions = get_standard_obis_descriptions();
    descriptions.get(code).copied()
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Energy values
    map.insert("1-0:1.8.0", "Active energy + (total)");
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.0", "Active energy - (total)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");

    // Power values
    map.insert("1-0:1.7.0", "Active power + (total)");
    map.insert("1-0:2.7.0", "Active power - (total)");
    map.insert("1-0:16.7.0", "Sum active instantaneous power");
    map.insert("1-0:21.7.0", "Active power + (L1)");
    map.insert("1-0:41.7.0", "Active power + (L2)");
    map.insert("1-0:61.7.0", "Active power + (L3)");
    map.insert("1-0:22.7.0", "Active power - (L1)");
    map.insert("1-0:42.7.0", "Active power - (L2)");
    map.insert("1-0:62.7.0", "Active power - (L3)");
    map.insert("1-0:36.7.0", "Instantaneous active power (L1)");
    map.insert("1-0:56.7.0", "Instantaneous active power (L2)");
    map.insert("1-0:76.7.0", "Instantaneous active power (L3)");

    // Voltage values
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");

    // Current values
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    // Identification
    map.insert("1-0:96.50.1", "Manufacturer");
    map.insert("1-0:96.1.0", "Serial number");
    map.insert("1-0:0.0.0", "Device ID");
    map.insert("1-0:0.2.0", "Firmware version");

    map.insert("1-0:14.7.0", "Supply frequency");

    map
}

pub fn validate_obis_code(code: &str) -> bool {
    // OBIS code format: A-B:C.D.E*F
    let parts: Vec<&str> = code.split(':').collect();
    if parts.len() != 2 {
        return false;
    }

    let ab_parts: Vec<&str> = parts[0].split('-').collect();
    if ab_parts.len() != 2 {
        return false;
    }

    let mut cde_f = parts[1].splitn(2, '*');
    let cde_parts: Vec<&str> = cde_f.next().unwrap_or("").split('.').collect();
    if cde_parts.len() != 3 {
        return false;
    }

    if let Some(f) = cde_f.next() {
        if f.parse::<u8>().is_err() {
            return false;
        }
    }

    ab_parts.iter().chain(cde_parts.iter()).all(|part| part.parse::<u8>().is_ok())
}
