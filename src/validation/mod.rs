use crate::acquisition::{run_cycle, CycleOutcome};
use crate::config::MeterConfig;
use crate::models::DeviceIdentity;
use crate::transport::{MeasurementReader, ReaderError};
use log::{error, info};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Meter could not be read: {0}")]
    Read(#[from] ReaderError),
    #[error("Meter sent no data within {0:?}")]
    Timeout(Duration),
    #[error("Meter answered without any registers")]
    NoRegisters,
    #[error("Meter validation already failed")]
    AlreadyFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationState {
    Idle,
    Reading,
    Succeeded(DeviceIdentity),
    Failed,
}

/// Startup check of the serial line. Runs at most once; a second call
/// returns the cached result.
pub struct ValidationPhase {
    state: ValidationState,
    timeout: Duration,
}

impl ValidationPhase {
    pub fn new(timeout: Duration) -> Self {
        ValidationPhase { state: ValidationState::Idle, timeout }
    }

    pub fn state(&self) -> &ValidationState {
        &self.state
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        match &self.state {
            ValidationState::Succeeded(identity) => Some(identity),
            _ => None,
        }
    }

    pub async fn run(&mut self, reader: &dyn MeasurementReader, options: &MeterConfig) -> Result<DeviceIdentity, ValidationError> {
        match &self.state {
            ValidationState::Succeeded(identity) => return Ok(identity.clone()),
            ValidationState::Failed => return Err(ValidationError::AlreadyFailed),
            ValidationState::Idle | ValidationState::Reading => {}
        }

        info!("Validating meter on {} (waiting up to {:?})", options.serial_port, self.timeout);
        self.state = ValidationState::Reading;

        let result = match run_cycle(reader, options, self.timeout).await {
            CycleOutcome::Settled(registers) if !registers.is_empty() => {
                Ok(DeviceIdentity::from_registers(&registers))
            }
            CycleOutcome::Settled(_) => Err(ValidationError::NoRegisters),
            CycleOutcome::Failed(e) => Err(ValidationError::Read(e)),
            CycleOutcome::TimedOut => Err(ValidationError::Timeout(self.timeout)),
        };

        match &result {
            Ok(identity) => {
                info!("Meter validated: {} (serial {}, firmware {})",
                    identity.product_name, identity.serial, identity.firmware_version);
                self.state = ValidationState::Succeeded(identity.clone());
            }
            Err(e) => {
                error!("Meter validation failed: {}", e);
                self.state = ValidationState::Failed;
            }
        }

        result
    }
}
