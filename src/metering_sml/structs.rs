// SML Protocol Data Structures

/// Generic SML element as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SmlNode {
    OctetString(Vec<u8>),
    Bool(bool),
    Int(i64),
    UInt(u64),
    List(Vec<SmlNode>),
    /// Optional element that is not set (`0x01`).
    Absent,
    /// End of message marker (`0x00`).
    EndOfMessage,
}

impl SmlNode {
    pub fn as_list(&self) -> Option<&[SmlNode]> {
        match self {
            SmlNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SmlNode::UInt(v) => Some(*v),
            SmlNode::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SmlNode::Int(v) => Some(*v),
            SmlNode::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SmlNode::OctetString(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmlFile {
    pub messages: Vec<SmlMessage>,
}

#[derive(Debug, Clone)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub group_no: u8,
    pub abort_on_error: u8,
    pub message_body: SmlMessageBody,
}

#[derive(Debug, Clone)]
pub struct SmlMessageBody {
    pub msg_type: u32,
    pub get_list_response: Option<SmlGetListResponse>,
}

#[derive(Debug, Clone)]
pub struct SmlGetListResponse {
    pub server_id: Option<Vec<u8>>,
    pub val_list: Vec<SmlListEntry>,
}

#[derive(Debug, Clone)]
pub struct SmlListEntry {
    pub obis_code: Option<Vec<u8>>,
    pub unit: Option<u8>,
    pub scaler: Option<i8>,
    pub value: Option<SmlValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmlValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    OctetString(Vec<u8>),
}

// SML-specific OBIS code format (6 bytes)
#[derive(Debug, Clone)]
pub struct SmlObisCode {
    pub medium: u8,      // 0: abstract, 1: electricity, etc.
    pub channel: u8,     // 0-255
    pub indicator: u8,   // Physical value indicator
    pub mode: u8,        // Processing method
    pub tariff: u8,      // Tariff/time
    pub previous: u8,    // Historical value indicator
}

impl SmlObisCode {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 6 {
            Some(SmlObisCode {
                medium: bytes[0],
                channel: bytes[1],
                indicator: bytes[2],
                mode: bytes[3],
                tariff: bytes[4],
                previous: bytes[5],
            })
        } else {
            None
        }
    }

    /// `A-B:C.D.E*F`, the register id spelling used throughout the crate.
    pub fn to_register_id(&self) -> String {
        format!("{}-{}:{}.{}.{}*{}",
            self.medium, self.channel,
            self.indicator, self.mode,
            self.tariff, self.previous)
    }
}

// Unit mappings for SML values
pub fn get_sml_unit_name(unit_code: u8) -> Option<&'static str> {
    match unit_code {
        1 => Some("a"),      // year
        2 => Some("mo"),     // month
        3 => Some("wk"),     // week
        4 => Some("d"),      // day
        5 => Some("h"),      // hour
        6 => Some("min"),    // minute
        7 => Some("s"),      // second
        8 => Some("°"),      // degree
        9 => Some("°C"),     // degree celsius
        10 => Some("K"),     // kelvin
        11 => Some("m"),     // meter
        17 => Some("m³"),    // cubic meter
        18 => Some("l"),     // liter
        19 => Some("kg"),    // kilogram
        25 => Some("J"),     // joule
        27 => Some("W"),     // watt
        28 => Some("VA"),    // volt ampere
        29 => Some("var"),   // volt ampere reactive
        30 => Some("Wh"),    // watt hour
        31 => Some("VAh"),   // volt ampere hour
        32 => Some("varh"),  // volt ampere reactive hour
        33 => Some("A"),     // ampere
        34 => Some("C"),     // coulomb
        35 => Some("V"),     // volt
        44 => Some("Hz"),    // hertz
        _ => None,
    }
}
