use crate::config::{Config, ConfigError};
use crate::history::{HistoryError, HistoryKind, HistorySink, HistoryStore};
use crate::models::DeviceIdentity;
use crate::mqtt::Transmission;
use crate::polling::{PollingLoop, Subscribers};
use crate::sensors::build_sensors;
use crate::transport::MeasurementReader;
use crate::validation::{ValidationError, ValidationPhase};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Meter validation failed, polling not started: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Running system: validated meter, sinks and the polling loop.
pub struct Platform {
    identity: DeviceIdentity,
    polling: PollingLoop,
    history: Vec<Arc<HistoryStore>>,
}

impl Platform {
    /// Validates the meter and starts polling. Nothing is polled when the
    /// validation read fails.
    pub async fn initialize(
        config: Config,
        reader: Arc<dyn MeasurementReader>,
        sender: Sender<Transmission>,
    ) -> Result<Self, PlatformError> {
        config.meter.validate()?;

        let mut validation = ValidationPhase::new(config.polling.validation_timeout());
        let identity = validation.run(reader.as_ref(), &config.meter).await?;

        let protocol = format!("{:?}", config.meter.protocol);
        let sensors = build_sensors(&config.sensors, &config.mqtt, &identity, &protocol, &sender);

        let mut history = Vec::new();
        if config.history.enabled {
            let dir = Path::new(&config.history.path);
            for kind in [HistoryKind::Energy, HistoryKind::Voltage] {
                let store = HistoryStore::new(kind, dir, &identity.product_name, config.history.window())?;
                history.push(Arc::new(store));
            }
        }

        let subscribers = Subscribers {
            sensors,
            history: history.iter().map(|h| h.clone() as Arc<dyn HistorySink>).collect(),
        };
        info!("{} sensor sinks, {} history stores", subscribers.sensors.len(), subscribers.history.len());

        let polling = PollingLoop::new(
            reader,
            config.meter.clone(),
            config.polling.interval(),
            config.polling.timeout(),
            subscribers,
        );
        polling.start();

        Ok(Platform { identity, polling, history })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn polling(&self) -> &PollingLoop {
        &self.polling
    }

    pub fn shutdown(&self) {
        self.polling.stop();
        for store in &self.history {
            if let Err(e) = store.flush_pending() {
                warn!("Unable to flush history: {}", e);
            }
        }
    }
}
