pub mod ha_interface;

use crate::config::MqttConfig;
use crate::mqtt::ha_interface::HaDiscover;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MeteringData {
    pub meter_name: String,
    pub protocol: String,
    pub metered_time: i64,
    pub metered_values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub enum Transmission {
    /// Full register snapshot, published on `<base>/raw`.
    Metering(MeteringData),
    AutoDiscovery(HaDiscover),
    Publish(PublishData),
    /// Removes a retained document by publishing an empty payload.
    Clear(String),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
    base_topic: String,
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // The event loop has to be polled for anything to go out
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (MqttManager {
            rx: mrx,
            exit_thread: false,
            client,
            base_topic: config.base_topic.clone(),
        }, mtx)
    }

    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let transmission = match self.rx.recv().await {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::Metering(data) => {
                    debug!("Metering data received from {}", data.meter_name);
                    let payload = match serde_json::to_string(&data) {
                        Ok(p) => p,
                        Err(e) => { error!("Unable to serialize metering data: {}", e); continue; }
                    };
                    if let Err(e) = self.client.publish(format!("{}/raw", self.base_topic), QoS::AtLeastOnce, false, payload).await {
                        error!("Error sending: {}", e);
                    }
                }
                Transmission::AutoDiscovery(disc) => {
                    debug!("Announcing {} on {}", disc.get_dev_id(), disc.discover_topic);
                    let payload = match serde_json::to_string(&disc) {
                        Ok(p) => p,
                        Err(e) => { error!("Unable to serialize discovery: {}", e); continue; }
                    };
                    if let Err(e) = self.client.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, payload).await {
                        error!("Error sending discovery: {}", e);
                    }
                }
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        to_qos(publish_data.qos),
                        publish_data.retain,
                        publish_data.payload,
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); }
                        Ok(_) => { debug!("Published successfully"); }
                    }
                }
                Transmission::Clear(topic) => {
                    debug!("Clearing retained {}", topic);
                    if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, Vec::<u8>::new()).await {
                        error!("Error clearing: {}", e);
                    }
                }
            }
        }

        info!("MQTT thread exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
        assert_eq!(to_qos(7), QoS::AtMostOnce);
    }

    #[test]
    fn test_metering_data_serializes() {
        let mut values = serde_json::Map::new();
        values.insert("1-0:16.7.0*255".to_string(), "874 W".into());
        let data = MeteringData {
            meter_name: "ZPA".to_string(),
            protocol: "Sml".to_string(),
            metered_time: 1700000000,
            metered_values: values,
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&data).unwrap()).unwrap();
        assert_eq!(json["metered_values"]["1-0:16.7.0*255"], "874 W");
    }
}
