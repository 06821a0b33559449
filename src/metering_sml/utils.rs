use super::structs::*;
use crate::models::ObisValue;
use crc16::{State, X_25};

pub const ESCAPE: [u8; 4] = [0x1B, 0x1B, 0x1B, 0x1B];
pub const START_SEQUENCE: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
pub const END_MARKER: u8 = 0x1A;

pub fn format_obis_code(obis_bytes: &[u8]) -> String {
    if let Some(obis) = SmlObisCode::from_bytes(obis_bytes) {
        return obis.to_register_id();
    }

    // Fallback: format as hex
    hex::encode(obis_bytes)
}

/// Converts an SML value into a measurement value, applying the scaler.
pub fn to_obis_value(value: &SmlValue, scaler: Option<i8>, unit: Option<u8>) -> ObisValue {
    let unit_name = unit.and_then(get_sml_unit_name);
    match value {
        SmlValue::Int(i) => ObisValue::number(apply_scaler(*i as f64, scaler), unit_name),
        SmlValue::UInt(u) => ObisValue::number(apply_scaler(*u as f64, scaler), unit_name),
        SmlValue::Bool(b) => ObisValue::text(&b.to_string()),
        SmlValue::OctetString(bytes) => ObisValue::text(&octet_string_text(bytes)),
    }
}

pub fn apply_scaler(value: f64, scaler: Option<i8>) -> f64 {
    match scaler {
        // Dividing by an exact power of ten keeps 2384065e-3 printable as 2384.065
        Some(s) if s < 0 => value / 10_f64.powi(-(s as i32)),
        Some(s) => value * 10_f64.powi(s as i32),
        None => value,
    }
}

pub fn octet_string_text(bytes: &[u8]) -> String {
    if let Ok(string) = std::str::from_utf8(bytes) {
        if !string.is_empty() && string.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return string.to_string();
        }
    }
    hex::encode(bytes)
}

/// CRC16/X-25 as used by the SML transport layer.
pub fn calculate_crc16(data: &[u8]) -> u16 {
    State::<X_25>::calculate(data)
}

/// Checks the trailing CRC of a complete frame (start escape to CRC bytes).
pub fn validate_frame_crc(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((0, 0));
    }
    let crc_pos = frame.len() - 2;
    let expected = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
    let calculated = calculate_crc16(&frame[..crc_pos]);
    if expected == calculated {
        Ok(())
    } else {
        Err((expected, calculated))
    }
}

/// Removes escaping of `1b1b1b1b` inside the payload (sent twice on the wire).
pub fn unescape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;
    while i < payload.len() {
        if payload[i..].starts_with(&ESCAPE) && payload[i + 4..].starts_with(&ESCAPE) {
            out.extend_from_slice(&ESCAPE);
            i += 8;
        } else {
            out.push(payload[i]);
            i += 1;
        }
    }
    out
}
