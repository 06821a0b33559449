use super::{utils, D0ParseError};
use crate::models::{Measurement, ObisValue};
use log::debug;

/// Parses one data line into its register id and measurement.
pub fn parse_obis_line(line: &str, fallback_medium: u8) -> Result<(String, Measurement), D0ParseError> {
    // Example formats:
    // 1-0:1.8.1(000123.456*kWh)
    // 1.8.0(0002686.675*kWh)
    // 0-0:96.1.255(1ESY1160407485)
    // 1-0:0.9.2(210101)(120000)

    let line = line.trim();

    let paren_start = line.find('(')
        .ok_or(D0ParseError::InvalidDataLine)?;
    if !line.ends_with(')') || paren_start == 0 {
        return Err(D0ParseError::InvalidDataLine);
    }

    let id = utils::normalize_obis_code(&line[..paren_start], fallback_medium);

    let mut values = Vec::new();
    for group in line[paren_start + 1..line.len() - 1].split(")(") {
        if group.contains('(') || group.contains(')') {
            return Err(D0ParseError::InvalidDataLine);
        }
        values.push(parse_value(group));
    }

    debug!("Parsed OBIS line - Code: {}, Values: {:?}", id, values);
    Ok((id, Measurement::new(values)))
}

fn parse_value(group: &str) -> ObisValue {
    if let Some((value, unit)) = group.split_once('*') {
        if let Some(number) = utils::extract_numeric_value(value) {
            return ObisValue::number(number, Some(unit.trim()));
        }
    }
    match utils::extract_numeric_value(group) {
        Some(number) => ObisValue::number(number, None),
        None => ObisValue::text(group),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObisScalar;

    #[test]
    fn test_parse_obis_line() {
        let (id, m) = parse_obis_line("1-0:1.8.1(000123.456*kWh)", 1).unwrap();
        assert_eq!(id, "1-0:1.8.1");
        assert_eq!(m.values()[0].value, ObisScalar::Number(123.456));
        assert_eq!(m.value_to_string(), Some("123.456 kWh"));
    }

    #[test]
    fn test_fallback_medium_and_text() {
        let (id, m) = parse_obis_line("96.1.255(1ESY1160407485)", 1).unwrap();
        assert_eq!(id, "1-0:96.1.255");
        assert_eq!(m.value_to_string(), Some("1ESY1160407485"));
    }

    #[test]
    fn test_multiple_groups() {
        let (_, m) = parse_obis_line("1-0:0.9.2(210101)(12.5*V)", 1).unwrap();
        assert_eq!(m.values().len(), 2);
        assert_eq!(m.value_to_string(), Some("210101, 12.5 V"));
    }

    #[test]
    fn test_invalid_lines() {
        assert!(parse_obis_line("garbage", 1).is_err());
        assert!(parse_obis_line("(12)", 1).is_err());
        assert!(parse_obis_line("1.8.0(12", 1).is_err());
    }
}
