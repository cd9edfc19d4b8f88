use crate::commandline::MqttFormat;
use anyhow::{Context, Result};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub active: bool,
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_base: String,
    pub client_id: String,
    pub qos: u8,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    pub format: MqttFormat,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            active: true,
            broker: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic_base: "extrabms".into(),
            client_id: Self::default_client_id(),
            qos: 0,
            keep_alive: Duration::from_secs(30),
            format: MqttFormat::Json,
        }
    }
}

impl MqttConfig {
    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("extrabms-{}", Self::generate_random_string(8))
    }

    fn qos(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn create_client(&self) -> Result<Client> {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }

        log::info!(
            "Connecting to MQTT broker {}:{} with client_id: {}",
            self.broker,
            self.port,
            self.client_id
        );
        let (client, mut connection) = Client::new(options, REQUEST_QUEUE_CAPACITY);

        // the connection has to be polled for anything to go out; it
        // reconnects by itself on the next iteration after an error
        std::thread::Builder::new()
            .name("mqtt-connection".into())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            log::info!("Connected to MQTT broker: {:?}", ack.code)
                        }
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(e) => {
                            log::warn!("MQTT connection error: {e}");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .with_context(|| "Cannot spawn MQTT connection thread")?;
        Ok(client)
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let client = config.create_client()?;
        Ok(Self { client, config })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic_base
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );

        // never wait on a full request queue while the broker is away
        self.client
            .try_publish(topic, self.config.qos(), false, payload.as_bytes())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_fails_instead_of_waiting_on_a_full_queue() {
        let config = MqttConfig::default();
        // nobody drains the requests, as with an unreachable broker
        let (client, _connection) =
            Client::new(MqttOptions::new("test", &config.broker, config.port), 1);
        let mut publisher = MqttPublisher { client, config };

        publisher.publish("extrabms/battery_1/soc", "80").unwrap();
        let err = publisher
            .publish("extrabms/battery_1/soc", "81")
            .unwrap_err();
        assert!(format!("{err:#}").contains("extrabms/battery_1/soc"));
    }
}
