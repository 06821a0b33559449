use super::structs::*;
use super::SmlError;
use log::{debug, warn};

// SML Message Type constants
const SML_GET_LIST_RESPONSE: u32 = 0x0701;

// Type field of the TL byte
const TYPE_OCTET_STRING: u8 = 0b000;
const TYPE_BOOL: u8 = 0b100;
const TYPE_SIGNED: u8 = 0b101;
const TYPE_UNSIGNED: u8 = 0b110;
const TYPE_LIST: u8 = 0b111;

// A TL field never needs more bytes than this for a frame that fits in memory
const MAX_TL_BYTES: usize = 8;
// SML trees are a handful of levels deep, GetListResponse entries sit at 4
const MAX_DEPTH: usize = 16;

/// Parses the unescaped payload between the start and end escape sequences.
pub fn parse_sml_file(content: &[u8]) -> Result<SmlFile, SmlError> {
    debug!("Parsing SML file content of {} bytes", content.len());
    let mut parser = SmlParser::new(content);
    parser.parse_sml_file()
}

pub(crate) struct SmlParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmlParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn parse_sml_file(&mut self) -> Result<SmlFile, SmlError> {
        let mut messages = Vec::new();

        while self.pos < self.data.len() {
            // Padding before the end sequence
            if self.data[self.pos] == 0x00 {
                self.pos += 1;
                continue;
            }

            let node = self.parse_node()?;
            match node_to_message(&node) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping SML message at position {}: {}", self.pos, e),
            }
        }

        if messages.is_empty() {
            return Err(SmlError::ParseError("No valid SML messages found".to_string()));
        }

        Ok(SmlFile { messages })
    }

    fn next_byte(&mut self) -> Result<u8, SmlError> {
        let b = *self.data.get(self.pos)
            .ok_or_else(|| SmlError::ParseError("Unexpected end of data".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SmlError> {
        if self.pos + len > self.data.len() {
            return Err(SmlError::ParseError(format!("Element of {} bytes extends beyond data", len)));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Returns (type, length, number of TL bytes).
    pub(crate) fn parse_type_length(&mut self) -> Result<(u8, usize, usize), SmlError> {
        let first = self.next_byte()?;
        let type_field = (first >> 4) & 0x07;
        let mut length = (first & 0x0F) as usize;
        let mut tl_bytes = 1;
        let mut more = first & 0x80 != 0;

        while more {
            if tl_bytes >= MAX_TL_BYTES {
                return Err(SmlError::ParseError(format!("TL field longer than {} bytes", MAX_TL_BYTES)));
            }
            let b = self.next_byte()?;
            more = b & 0x80 != 0;
            length = (length << 4) | (b & 0x0F) as usize;
            tl_bytes += 1;
        }

        Ok((type_field, length, tl_bytes))
    }

    pub(crate) fn parse_node(&mut self) -> Result<SmlNode, SmlError> {
        self.parse_node_at(0)
    }

    fn parse_node_at(&mut self, depth: usize) -> Result<SmlNode, SmlError> {
        if depth > MAX_DEPTH {
            return Err(SmlError::ParseError(format!("SML lists nested deeper than {}", MAX_DEPTH)));
        }

        match self.data.get(self.pos) {
            Some(0x00) => { self.pos += 1; return Ok(SmlNode::EndOfMessage); }
            Some(0x01) => { self.pos += 1; return Ok(SmlNode::Absent); }
            _ => {}
        }

        let (type_field, length, tl_bytes) = self.parse_type_length()?;

        if type_field == TYPE_LIST {
            // every element takes at least one byte
            let remaining = self.data.len() - self.pos;
            if length > remaining {
                return Err(SmlError::ParseError(format!(
                    "List of {} elements with only {} bytes left", length, remaining
                )));
            }
            let mut items = Vec::with_capacity(length);
            for _ in 0..length {
                items.push(self.parse_node_at(depth + 1)?);
            }
            return Ok(SmlNode::List(items));
        }

        // For everything but lists the length includes the TL bytes
        let payload_len = length.checked_sub(tl_bytes)
            .ok_or_else(|| SmlError::ParseError(format!("Invalid element length {}", length)))?;
        let payload = self.take(payload_len)?;

        match type_field {
            TYPE_OCTET_STRING => Ok(SmlNode::OctetString(payload.to_vec())),
            TYPE_BOOL => Ok(SmlNode::Bool(payload.iter().any(|b| *b != 0))),
            TYPE_SIGNED => {
                if payload.is_empty() || payload.len() > 8 {
                    return Err(SmlError::ParseError(format!("Invalid signed integer length {}", payload.len())));
                }
                let init: i64 = if payload[0] & 0x80 != 0 { -1 } else { 0 };
                Ok(SmlNode::Int(payload.iter().fold(init, |acc, b| (acc << 8) | *b as i64)))
            }
            TYPE_UNSIGNED => {
                if payload.is_empty() || payload.len() > 8 {
                    return Err(SmlError::ParseError(format!("Invalid unsigned integer length {}", payload.len())));
                }
                Ok(SmlNode::UInt(payload.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)))
            }
            other => Err(SmlError::ParseError(format!("Unknown SML type 0x{:x}", other))),
        }
    }
}

fn node_to_message(node: &SmlNode) -> Result<SmlMessage, SmlError> {
    let items = node.as_list()
        .ok_or_else(|| SmlError::ParseError("SML message is not a list".to_string()))?;
    if items.len() < 4 {
        return Err(SmlError::ParseError(format!("SML message has {} elements", items.len())));
    }

    let body = items[3].as_list()
        .filter(|b| b.len() == 2)
        .ok_or_else(|| SmlError::ParseError("Invalid SML message body".to_string()))?;
    let msg_type = body[0].as_u64()
        .ok_or_else(|| SmlError::ParseError("Missing SML message type".to_string()))? as u32;

    let get_list_response = if msg_type == SML_GET_LIST_RESPONSE {
        Some(parse_get_list_response(&body[1])?)
    } else {
        debug!("Ignoring SML message type 0x{:04x}", msg_type);
        None
    };

    Ok(SmlMessage {
        transaction_id: items[0].as_bytes().map(|b| b.to_vec()).unwrap_or_default(),
        group_no: items[1].as_u64().unwrap_or(0) as u8,
        abort_on_error: items[2].as_u64().unwrap_or(0) as u8,
        message_body: SmlMessageBody { msg_type, get_list_response },
    })
}

fn parse_get_list_response(node: &SmlNode) -> Result<SmlGetListResponse, SmlError> {
    let items = node.as_list()
        .filter(|i| i.len() >= 5)
        .ok_or_else(|| SmlError::ParseError("Invalid GetListResponse".to_string()))?;

    let val_list = items[4].as_list()
        .ok_or_else(|| SmlError::ParseError("GetListResponse without value list".to_string()))?
        .iter()
        .map(parse_list_entry)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SmlGetListResponse {
        server_id: items[1].as_bytes().map(|b| b.to_vec()),
        val_list,
    })
}

fn parse_list_entry(node: &SmlNode) -> Result<SmlListEntry, SmlError> {
    let items = node.as_list()
        .filter(|i| i.len() >= 6)
        .ok_or_else(|| SmlError::ParseError("Invalid list entry".to_string()))?;

    let value = match &items[5] {
        SmlNode::Bool(b) => Some(SmlValue::Bool(*b)),
        SmlNode::Int(i) => Some(SmlValue::Int(*i)),
        SmlNode::UInt(u) => Some(SmlValue::UInt(*u)),
        SmlNode::OctetString(b) => Some(SmlValue::OctetString(b.clone())),
        _ => None,
    };

    Ok(SmlListEntry {
        obis_code: items[0].as_bytes().map(|b| b.to_vec()),
        unit: items[3].as_u64().map(|u| u as u8),
        scaler: items[4].as_i64().map(|s| s as i8),
        value,
    })
}
