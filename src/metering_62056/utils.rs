use super::{structs::DeviceIdentification, D0ParseError};
use log::debug;

pub fn parse_identification_line(line: &str) -> Result<DeviceIdentification, D0ParseError> {
    // Example formats:
    // /ELS5\@V5.3
    // /ISk5MT382-1000
    // /EBZ5DD3BL10-112
    let content = line.trim().strip_prefix('/')
        .ok_or(D0ParseError::MissingIdentification)?;

    let mut chars = content.chars();
    let manufacturer: String = chars.by_ref().take(3).collect();
    let baud_rate_id = chars.next().ok_or(D0ParseError::InvalidFormat)?;
    if manufacturer.chars().count() != 3 {
        return Err(D0ParseError::InvalidFormat);
    }

    let identification: String = chars.collect();
    debug!("Parsed identification - Manufacturer: {}, ID: {}", manufacturer, identification);

    Ok(DeviceIdentification {
        manufacturer,
        baud_rate_id,
        identification: identification.trim_start_matches(['\\', '@']).to_string(),
    })
}

/// Numeric value from strings like "000123.456" (no unit, that is split off before).
pub fn extract_numeric_value(value_str: &str) -> Option<f64> {
    let value_str = value_str.trim();
    if value_str.is_empty() {
        return None;
    }
    if !value_str.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+')) {
        return None;
    }
    value_str.parse::<f64>().ok()
}

/// Adds the `A-B:` prefix when a meter sends bare `C.D.E` ids.
pub fn normalize_obis_code(code: &str, fallback_medium: u8) -> String {
    let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    if code.contains(':') {
        code
    } else {
        format!("{}-0:{}", fallback_medium, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identification_line() {
        let device_info = parse_identification_line("/ELS5\\@V5.3").unwrap();
        assert_eq!(device_info.manufacturer, "ELS");
        assert_eq!(device_info.baud_rate_id, '5');
        assert_eq!(device_info.identification, "V5.3");

        assert!(parse_identification_line("ELS5").is_err());
        assert!(parse_identification_line("/EL").is_err());
    }

    #[test]
    fn test_extract_numeric_value() {
        assert_eq!(extract_numeric_value("000123.456"), Some(123.456));
        assert_eq!(extract_numeric_value("-12.34"), Some(-12.34));
        assert_eq!(extract_numeric_value("210101120000W"), None);
        assert_eq!(extract_numeric_value(""), None);
    }

    #[test]
    fn test_normalize_obis_code() {
        assert_eq!(normalize_obis_code(" 1-0:1.8.1 ", 1), "1-0:1.8.1");
        assert_eq!(normalize_obis_code("1.8.0", 1), "1-0:1.8.0");
        assert_eq!(normalize_obis_code("C.1.0", 6), "6-0:C.1.0");
    }
}
