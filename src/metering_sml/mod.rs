use crate::config::InputEncoding;
use crate::models::{Measurement, RegisterMap};
use base64::Engine;
use log::{debug, warn};
use thiserror::Error;

pub mod structs;
pub mod parser;
pub mod utils;

use structs::*;
use utils::*;

#[derive(Error, Debug)]
pub enum SmlError {
    #[error("Invalid SML frame: {0}")]
    InvalidMessage(String),
    #[error("SML parse error: {0}")]
    ParseError(String),
    #[error("SML CRC mismatch: frame says 0x{expected:04x}, calculated 0x{calculated:04x}")]
    CrcMismatch { expected: u16, calculated: u16 },
    #[error("Invalid {encoding} input: {reason}")]
    Encoding { encoding: &'static str, reason: String },
}

/// Decodes one complete SML frame (start escape to CRC) into registers.
pub fn decode_frame(frame: &[u8], ignore_invalid_crc: bool) -> Result<RegisterMap, SmlError> {
    if frame.len() < 16 || !frame.starts_with(&START_SEQUENCE) {
        return Err(SmlError::InvalidMessage(format!("{} bytes without start sequence", frame.len())));
    }

    let end_pos = frame.len() - 8;
    if frame[end_pos..end_pos + 4] != ESCAPE || frame[end_pos + 4] != END_MARKER {
        return Err(SmlError::InvalidMessage("missing end sequence".to_string()));
    }

    if let Err((expected, calculated)) = validate_frame_crc(frame) {
        if !ignore_invalid_crc {
            return Err(SmlError::CrcMismatch { expected, calculated });
        }
        warn!("Ignoring SML CRC mismatch (0x{:04x} != 0x{:04x})", expected, calculated);
    }

    let content = unescape(&frame[START_SEQUENCE.len()..end_pos]);
    let sml_file = parser::parse_sml_file(&content)?;
    Ok(registers_from_file(&sml_file))
}

pub fn registers_from_file(sml_file: &SmlFile) -> RegisterMap {
    let mut registers = RegisterMap::new();

    for message in &sml_file.messages {
        let response = match &message.message_body.get_list_response {
            Some(r) => r,
            None => continue,
        };

        for entry in &response.val_list {
            let (obis_code, value) = match (&entry.obis_code, &entry.value) {
                (Some(c), Some(v)) => (c, v),
                _ => continue,
            };
            let id = format_obis_code(obis_code);
            let value = to_obis_value(value, entry.scaler, entry.unit);
            registers.insert(id, Measurement::new(vec![value]));
        }
    }

    registers
}

/// Longest frame the buffer waits for before it gives up on a start sequence.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Splits a byte stream into complete SML frames.
#[derive(Default)]
pub struct SmlFrameBuffer {
    buf: Vec<u8>,
}

impl SmlFrameBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let start = match find_sequence(&self.buf, &START_SEQUENCE) {
                Some(s) => s,
                None => {
                    // Keep a possible partial start sequence
                    let keep = self.buf.len().min(START_SEQUENCE.len() - 1);
                    self.buf.drain(..self.buf.len() - keep);
                    break;
                }
            };
            self.buf.drain(..start);

            match self.scan_frame_end() {
                FrameEnd::Complete(len) => {
                    frames.push(self.buf.drain(..len).collect());
                }
                FrameEnd::Restart(pos) => {
                    debug!("Discarding truncated SML frame of {} bytes", pos);
                    self.buf.drain(..pos);
                }
                FrameEnd::Incomplete if self.buf.len() > MAX_FRAME_LEN => {
                    warn!("No SML end sequence within {} bytes, resyncing", MAX_FRAME_LEN);
                    self.buf.drain(..START_SEQUENCE.len());
                }
                FrameEnd::Incomplete => break,
            }
        }

        frames
    }

    /// Escape sequences are aligned to 4 bytes relative to the frame start.
    fn scan_frame_end(&self) -> FrameEnd {
        let mut i = START_SEQUENCE.len();
        while i + 8 <= self.buf.len() {
            if self.buf[i..i + 4] != ESCAPE {
                i += 4;
                continue;
            }
            let next = &self.buf[i + 4..i + 8];
            if next == ESCAPE {
                // escaped payload bytes
                i += 8;
            } else if next[0] == END_MARKER {
                return FrameEnd::Complete(i + 8);
            } else if next == &START_SEQUENCE[4..] {
                return FrameEnd::Restart(i);
            } else {
                i += 4;
            }
        }
        FrameEnd::Incomplete
    }
}

enum FrameEnd {
    Complete(usize),
    Restart(usize),
    Incomplete,
}

fn find_sequence(data: &[u8], sequence: &[u8]) -> Option<usize> {
    data.windows(sequence.len()).position(|w| w == sequence)
}

/// Turns raw transport bytes into frames according to the input encoding.
/// The text encodings carry one frame per line.
pub struct SmlStreamDecoder {
    encoding: InputEncoding,
    frames: SmlFrameBuffer,
    line: Vec<u8>,
}

impl SmlStreamDecoder {
    pub fn new(encoding: InputEncoding) -> Self {
        Self { encoding, frames: SmlFrameBuffer::new(), line: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, SmlError> {
        if self.encoding == InputEncoding::Binary {
            return Ok(self.frames.push(bytes));
        }

        let mut frames = Vec::new();
        for b in bytes {
            if *b != b'\n' && *b != b'\r' {
                self.line.push(*b);
                continue;
            }
            if self.line.is_empty() {
                continue;
            }
            let line = std::mem::take(&mut self.line);
            let decoded = self.decode_line(&line)?;
            frames.extend(self.frames.push(&decoded));
        }
        Ok(frames)
    }

    fn decode_line(&self, line: &[u8]) -> Result<Vec<u8>, SmlError> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        match self.encoding {
            InputEncoding::Ascii => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(compact).map_err(|e| SmlError::Encoding { encoding: "hex", reason: e.to_string() })
            }
            InputEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| SmlError::Encoding { encoding: "base64", reason: e.to_string() }),
            InputEncoding::Binary => Ok(line.to_vec()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn tl_octet(bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![(bytes.len() + 1) as u8];
        v.extend_from_slice(bytes);
        v
    }

    fn entry(obis: [u8; 6], unit: Option<u8>, scaler: Option<i8>, value: &[u8]) -> Vec<u8> {
        let mut v = vec![0x77];
        v.extend(tl_octet(&obis));
        v.push(0x01); // status
        v.push(0x01); // val time
        match unit {
            Some(u) => v.extend([0x62, u]),
            None => v.push(0x01),
        }
        match scaler {
            Some(s) => v.extend([0x52, s as u8]),
            None => v.push(0x01),
        }
        v.extend_from_slice(value);
        v.push(0x01); // signature
        v
    }

    /// Builds a complete, CRC-valid SML frame with one GetListResponse.
    pub(crate) fn build_frame(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut content = vec![0x76];
        content.extend(tl_octet(&[0x01]));   // transaction id
        content.extend([0x62, 0x00]);        // group no
        content.extend([0x62, 0x00]);        // abort on error
        content.push(0x72);                  // body
        content.extend([0x63, 0x07, 0x01]);  // GetListResponse
        content.push(0x77);
        content.push(0x01);                  // client id
        content.extend(tl_octet(&[0x0A, 0x01]));
        content.push(0x01);                  // list name
        content.push(0x01);                  // act sensor time
        content.push(0x70 | entries.len() as u8);
        for e in entries {
            content.extend_from_slice(e);
        }
        content.push(0x01);                  // list signature
        content.push(0x01);                  // act gateway time
        content.extend([0x63, 0x12, 0x34]);  // message crc (not checked)
        content.push(0x00);                  // end of message

        let padding = (4 - content.len() % 4) % 4;
        content.extend(std::iter::repeat(0x00).take(padding));

        let mut frame = START_SEQUENCE.to_vec();
        frame.extend_from_slice(&content);
        frame.extend_from_slice(&ESCAPE);
        frame.push(END_MARKER);
        frame.push(padding as u8);
        let crc = calculate_crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    pub(crate) fn sample_frame() -> Vec<u8> {
        build_frame(&[
            entry([1, 0, 96, 50, 1, 1], None, None, &tl_octet(b"ZPA")),
            entry([1, 0, 1, 8, 0, 255], Some(30), Some(-1), &[0x65, 0x01, 0x6B, 0xC7, 0x8A]),
            entry([1, 0, 16, 7, 0, 255], Some(27), Some(0), &[0x53, 0x03, 0x6A]),
        ])
    }

    #[test]
    fn test_decode_frame() {
        let registers = decode_frame(&sample_frame(), false).unwrap();
        assert_eq!(registers.len(), 3);
        assert_eq!(registers.get("1-0:16.7.0*255").and_then(|m| m.value_to_string()), Some("874 W"));
        assert_eq!(registers.get("1-0:96.50.1*1").and_then(|m| m.value_to_string()), Some("ZPA"));
        assert_eq!(registers.get("1-0:1.8.0*255").and_then(|m| m.value_to_string()), Some("2384065 Wh"));
    }

    #[test]
    fn test_crc_mismatch() {
        let mut frame = sample_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode_frame(&frame, false), Err(SmlError::CrcMismatch { .. })));
        assert_eq!(decode_frame(&frame, true).unwrap().len(), 3);
    }

    #[test]
    fn test_frame_buffer_split_input() {
        let frame = sample_frame();
        let mut buffer = SmlFrameBuffer::new();
        let mut stream = vec![0xAA, 0x55, 0x00];
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&frame[..10]);

        let (a, b) = stream.split_at(20);
        assert!(buffer.push(a).is_empty());
        let frames = buffer.push(b);
        assert_eq!(frames, vec![frame.clone()]);

        // second frame completes with the remaining bytes
        let frames = buffer.push(&frame[10..]);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_frame_buffer_resyncs_on_endless_frame() {
        let mut buffer = SmlFrameBuffer::new();
        let mut stream = START_SEQUENCE.to_vec();
        stream.extend(std::iter::repeat(0x42).take(MAX_FRAME_LEN));
        assert!(buffer.push(&stream).is_empty());
        assert!(buffer.buf.len() < START_SEQUENCE.len());

        // the next real frame is still found
        let frame = sample_frame();
        assert_eq!(buffer.push(&frame), vec![frame]);
    }

    #[test]
    fn test_hostile_list_length_is_an_error() {
        let mut frame = START_SEQUENCE.to_vec();
        frame.push(0xF7);
        frame.extend_from_slice(&[0x8F; 14]);
        frame.push(0x0F);
        frame.extend_from_slice(&ESCAPE);
        frame.push(END_MARKER);
        frame.push(0x00);
        let crc = calculate_crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        assert!(matches!(decode_frame(&frame, false), Err(SmlError::ParseError(_))));
    }

    #[test]
    fn test_hex_encoded_stream() {
        let frame = sample_frame();
        let mut decoder = SmlStreamDecoder::new(InputEncoding::Ascii);
        let text = format!("{}\n", hex::encode(&frame));
        let frames = decoder.push(text.as_bytes()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_base64_stream() {
        let frame = sample_frame();
        let mut decoder = SmlStreamDecoder::new(InputEncoding::Base64);
        let text = format!("{}\r\n", base64::engine::general_purpose::STANDARD.encode(&frame));
        let frames = decoder.push(text.as_bytes()).unwrap();
        assert_eq!(frames, vec![frame]);

        assert!(decoder.push(b"not base64!!\n").is_err());
    }
}
