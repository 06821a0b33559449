use obis2mqtt::config::LOG_LEVEL_ENV;
use obis2mqtt::{Config, MqttManager, ObisReader, Platform};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let default_filter = std::env::var(LOG_LEVEL_ENV).unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = Config::load()?;

    // Every sensor publishes through this channel
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    let mut mqtt_thread = tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    let platform = match Platform::initialize(config, Arc::new(ObisReader::new()), tx).await {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            mqtt_thread.abort();
            return Err(e.into());
        }
    };

    info!("All modules started, now waiting for a signal to exit");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = &mut mqtt_thread => error!("MQTT thread exited unexpectedly"),
    }

    platform.shutdown();
    mqtt_thread.abort();
    Ok(())
}
