use crate::models::RegisterMap;
use log::{debug, warn};
use thiserror::Error;

pub mod utils;
pub mod structs;
pub mod obis_parser;

use structs::D0Telegram;

/// Sign-on request for meters in request/response mode.
pub const REQUEST: &[u8] = b"/?!\r\n";

#[derive(Error, Debug)]
pub enum D0ParseError {
    #[error("Invalid telegram format")]
    InvalidFormat,
    #[error("Missing identification line")]
    MissingIdentification,
    #[error("Invalid data line format")]
    InvalidDataLine,
}

pub fn parse_telegram(telegram: &str, fallback_medium: u8) -> Result<D0Telegram, D0ParseError> {
    let mut lines = telegram.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();

    let identification = match lines.peek() {
        Some(line) if line.starts_with('/') => {
            let ident = utils::parse_identification_line(line)?;
            lines.next();
            Some(ident)
        }
        Some(_) => None,
        None => return Err(D0ParseError::InvalidFormat),
    };

    let mut registers = RegisterMap::new();
    for line in lines {
        if line.starts_with('!') {
            debug!("End of telegram found");
            break;
        }

        match obis_parser::parse_obis_line(line, fallback_medium) {
            Ok((id, measurement)) => registers.insert(id, measurement),
            Err(e) => warn!("Failed to parse OBIS line '{}': {}", line, e),
        }
    }

    Ok(D0Telegram { identification, registers })
}

/// Collects text until a telegram is terminated by its `!` line.
#[derive(Default)]
pub struct D0TelegramBuffer {
    fallback_medium: u8,
    current: String,
    line: Vec<u8>,
}

impl D0TelegramBuffer {
    pub fn new(fallback_medium: u8) -> Self {
        Self { fallback_medium, current: String::new(), line: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<D0Telegram, D0ParseError>> {
        let mut telegrams = Vec::new();

        for b in bytes {
            if *b != b'\n' {
                self.line.push(*b);
                continue;
            }
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.line)).trim().to_string();
            if line.is_empty() {
                continue;
            }

            // A new sign-on answer discards a half-received telegram
            if line.starts_with('/') && !self.current.is_empty() {
                debug!("Discarding incomplete D0 telegram");
                self.current.clear();
            }

            self.current.push_str(&line);
            self.current.push('\n');

            if line.starts_with('!') {
                let text = std::mem::take(&mut self.current);
                telegrams.push(parse_telegram(&text, self.fallback_medium));
            }
        }

        telegrams
    }
}
