use crate::config::{InputEncoding, MeterConfig, Parity, Protocol, Transport};
use crate::metering_62056::{self, D0TelegramBuffer};
use crate::metering_sml::{self, SmlError, SmlStreamDecoder};
use crate::models::RegisterMap;
use crate::obis_utils::{get_obis_description, validate_obis_code};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReaderError {
    #[error("Unable to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Read from meter failed: {0}")]
    Read(String),
    #[error("Unable to decode meter data: {0}")]
    Decode(String),
    #[error("Checksum error: {0}")]
    Crc(String),
}

/// Channel a reader reports every decoded frame (or error) on. A reader may
/// report more than once per exchange.
pub type ReaderEvents = UnboundedSender<Result<RegisterMap, ReaderError>>;

pub trait MeasurementReader: Send + Sync {
    /// Prepares one exchange with the meter. Fails when the transport cannot
    /// even be opened.
    fn open(&self, options: &MeterConfig) -> Result<Box<dyn ReaderHandle>, ReaderError>;
}

pub trait ReaderHandle: Send {
    /// Starts reading in the background.
    fn process(&mut self, events: ReaderEvents);
    /// Cancels the background read. Safe to call more than once.
    fn stop(&mut self) -> Result<(), ReaderError>;
}

/// Production reader speaking SML or D0 over a serial line, TCP or a file.
#[derive(Default)]
pub struct ObisReader;

impl ObisReader {
    pub fn new() -> Self {
        ObisReader
    }
}

impl MeasurementReader for ObisReader {
    fn open(&self, options: &MeterConfig) -> Result<Box<dyn ReaderHandle>, ReaderError> {
        let source = match options.transport {
            Transport::SerialResponse | Transport::SerialRequestResponse => {
                Source::Serial(open_serial(options)?)
            }
            Transport::Tcp => Source::Tcp(options.serial_port.clone()),
            Transport::LocalFile => {
                let path = PathBuf::from(&options.serial_port);
                if !path.is_file() {
                    return Err(ReaderError::Open {
                        port: options.serial_port.clone(),
                        reason: "no such file".to_string(),
                    });
                }
                Source::File(path)
            }
        };

        if options.debug > 0 {
            debug!("Opened {:?} transport on {}", options.transport, options.serial_port);
        }

        Ok(Box::new(ObisHandle {
            options: options.clone(),
            source: Some(source),
            task: None,
        }))
    }
}

fn open_serial(options: &MeterConfig) -> Result<SerialStream, ReaderError> {
    // SML meters talk 8N1, D0 optical heads 7E1
    let (default_bits, default_parity) = match options.protocol {
        Protocol::Sml => (8, Parity::None),
        Protocol::D0 => (7, Parity::Even),
    };

    let data_bits = match options.data_bits.unwrap_or(default_bits) {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match options.stop_bits {
        Some(2) => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match options.parity.unwrap_or(default_parity) {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };

    tokio_serial::new(&options.serial_port, options.effective_baud_rate())
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open_native_async()
        .map_err(|e| ReaderError::Open {
            port: options.serial_port.clone(),
            reason: e.to_string(),
        })
}

enum Source {
    Serial(SerialStream),
    Tcp(String),
    File(PathBuf),
}

struct ObisHandle {
    options: MeterConfig,
    source: Option<Source>,
    task: Option<JoinHandle<()>>,
}

impl ReaderHandle for ObisHandle {
    fn process(&mut self, events: ReaderEvents) {
        let source = match self.source.take() {
            Some(s) => s,
            None => {
                warn!("Reader for {} already processed", self.options.serial_port);
                return;
            }
        };
        let options = self.options.clone();

        self.task = Some(tokio::spawn(async move {
            match source {
                Source::Serial(stream) => read_stream(stream, &options, &events).await,
                Source::Tcp(address) => match tokio::net::TcpStream::connect(&address).await {
                    Ok(stream) => read_stream(stream, &options, &events).await,
                    Err(e) => {
                        let _ = events.send(Err(ReaderError::Read(format!("connect to {}: {}", address, e))));
                    }
                },
                Source::File(path) => read_file(path, &options, &events).await,
            }
        }));
    }

    fn stop(&mut self) -> Result<(), ReaderError> {
        // Dropping the source closes the port when process was never called
        self.source = None;
        if let Some(task) = self.task.take() {
            task.abort();
            if self.options.debug > 0 {
                debug!("Stopped reader on {}", self.options.serial_port);
            }
        }
        Ok(())
    }
}

impl Drop for ObisHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn read_stream<S>(mut stream: S, options: &MeterConfig, events: &ReaderEvents)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new(options);
    let mut buf = [0u8; 1024];
    let request = options.transport == Transport::SerialRequestResponse;
    // interval() panics on a zero period
    let period = options.request_interval().max(std::time::Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick(), if request => {
                if options.debug > 0 {
                    debug!("Sending request to {}", options.serial_port);
                }
                if let Err(e) = stream.write_all(metering_62056::REQUEST).await {
                    let _ = events.send(Err(ReaderError::Read(e.to_string())));
                    return;
                }
            }
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        let _ = events.send(Err(ReaderError::Read("connection closed".to_string())));
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!("Read on {} failed: {}", options.serial_port, e);
                        let _ = events.send(Err(ReaderError::Read(e.to_string())));
                        return;
                    }
                };

                for event in decoder.push(&buf[..n]) {
                    if events.send(event).is_err() {
                        // nobody listens anymore
                        return;
                    }
                }
            }
        }
    }
}

async fn read_file(path: PathBuf, options: &MeterConfig, events: &ReaderEvents) {
    loop {
        match tokio::fs::read(&path).await {
            Ok(content) => {
                let mut decoder = FrameDecoder::new(options);
                for event in decoder.push(&content) {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = events.send(Err(ReaderError::Read(format!("{}: {}", path.display(), e))));
                return;
            }
        }
        tokio::time::sleep(options.request_interval()).await;
    }
}

/// Protocol specific byte stream to register map conversion.
pub enum FrameDecoder {
    Sml { decoder: SmlStreamDecoder, ignore_invalid_crc: bool, debug: u8 },
    D0 { buffer: D0TelegramBuffer, debug: u8 },
}

impl FrameDecoder {
    pub fn new(options: &MeterConfig) -> Self {
        match options.protocol {
            Protocol::Sml => FrameDecoder::Sml {
                decoder: SmlStreamDecoder::new(options.input_encoding),
                ignore_invalid_crc: options.ignore_invalid_crc,
                debug: options.debug,
            },
            Protocol::D0 => {
                if options.input_encoding != InputEncoding::Binary {
                    info!("Input encoding {:?} ignored for D0 meters", options.input_encoding);
                }
                FrameDecoder::D0 {
                    buffer: D0TelegramBuffer::new(options.obis_fallback_medium),
                    debug: options.debug,
                }
            }
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<RegisterMap, ReaderError>> {
        match self {
            FrameDecoder::Sml { decoder, ignore_invalid_crc, debug } => {
                let frames = match decoder.push(bytes) {
                    Ok(frames) => frames,
                    Err(e) => return vec![Err(e.into())],
                };
                frames
                    .iter()
                    .map(|frame| -> Result<RegisterMap, ReaderError> {
                        if *debug > 1 {
                            debug!("SML frame: {}", hex::encode(frame));
                        }
                        let registers = metering_sml::decode_frame(frame, *ignore_invalid_crc)?;
                        if *debug > 0 {
                            debug!("Decoded SML frame with {} registers", registers.len());
                        }
                        if *debug > 1 {
                            dump_registers(&registers);
                        }
                        Ok(registers)
                    })
                    .collect()
            }
            FrameDecoder::D0 { buffer, debug } => {
                if *debug > 1 {
                    debug!("D0 data: {}", String::from_utf8_lossy(bytes).escape_debug());
                }
                buffer
                    .push(bytes)
                    .into_iter()
                    .map(|telegram| -> Result<RegisterMap, ReaderError> {
                        let telegram = telegram.map_err(|e| ReaderError::Decode(e.to_string()))?;
                        if *debug > 0 {
                            debug!("Decoded D0 telegram with {} registers", telegram.registers.len());
                        }
                        if *debug > 1 {
                            dump_registers(&telegram.registers);
                        }
                        Ok(telegram.registers)
                    })
                    .collect()
            }
        }
    }
}

fn dump_registers(registers: &RegisterMap) {
    for (id, m) in registers.iter() {
        let value = m.value_to_string().unwrap_or("-");
        match get_obis_description(id) {
            Some(description) => debug!("  {} = {} ({})", id, value, description),
            None if !validate_obis_code(id) => debug!("  {} = {} (non-standard id)", id, value),
            None => debug!("  {} = {}", id, value),
        }
    }
}

impl From<SmlError> for ReaderError {
    fn from(e: SmlError) -> Self {
        match e {
            SmlError::CrcMismatch { .. } => ReaderError::Crc(e.to_string()),
            other => ReaderError::Decode(other.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_sml::tests::sample_frame;

    #[test]
    fn test_sml_decoder_reports_frames() {
        let options = MeterConfig::new("/dev/null", Protocol::Sml, Transport::SerialResponse);
        let mut decoder = FrameDecoder::new(&options);
        let frame = sample_frame();
        let (a, b) = frame.split_at(7);
        assert!(decoder.push(a).is_empty());
        let events = decoder.push(b);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().len(), 3);
    }

    #[test]
    fn test_sml_crc_error_mapped() {
        let options = MeterConfig::new("/dev/null", Protocol::Sml, Transport::SerialResponse);
        let mut decoder = FrameDecoder::new(&options);
        let mut frame = sample_frame();
        let last = frame.len() - 2;
        frame[last] ^= 0x01;
        let events = decoder.push(&frame);
        assert!(matches!(events[0], Err(ReaderError::Crc(_))));
    }

    #[test]
    fn test_d0_decoder() {
        let options = MeterConfig::new("/dev/null", Protocol::D0, Transport::SerialRequestResponse);
        let mut decoder = FrameDecoder::new(&options);
        let events = decoder.push(b"/ESY5Q3D\r\n1.8.0(0002686.675*kWh)\r\n16.7.0(874*W)\r\n!\r\n");
        let registers = events[0].as_ref().unwrap();
        assert_eq!(registers.lookup_code("16.7.0").and_then(|m| m.value_to_string()), Some("874 W"));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let options = MeterConfig::new("/nonexistent/meter.bin", Protocol::Sml, Transport::LocalFile);
        assert!(matches!(ObisReader::new().open(&options), Err(ReaderError::Open { .. })));
    }

    #[tokio::test]
    async fn test_local_file_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.bin");
        std::fs::write(&path, sample_frame()).unwrap();

        let options = MeterConfig::new(path.to_str().unwrap(), Protocol::Sml, Transport::LocalFile);
        let mut handle = ObisReader::new().open(&options).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle.process(tx);

        let registers = rx.recv().await.unwrap().unwrap();
        assert!(registers.get("1-0:16.7.0*255").is_some());
        assert!(handle.stop().is_ok());
        assert!(handle.stop().is_ok());
    }
}
