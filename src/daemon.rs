use anyhow::{Context, Result};
use extrabms_lib::poller::{Poller, Sink, Transport};
use extrabms_lib::telemetry::{ModuleRecord, SystemRecord};
use extrabms_lib::Error;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::commandline::{DaemonOutput, MqttFormat};
use crate::mqtt;
use crate::settings::AppConfig;

fn module_topic(base_topic: &str, address: u8) -> String {
    format!("{base_topic}/battery_{address}")
}

fn system_topic(base_topic: &str) -> String {
    format!("{base_topic}/pylon")
}

/// Walks a value tree and hands every leaf with its topic to `publish`.
fn publish_simple_format(
    topic: &str,
    value: &serde_json::Value,
    publish: &mut dyn FnMut(&str, &str),
) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                publish_simple_format(&format!("{topic}/{k}"), v, publish);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                publish_simple_format(&format!("{topic}/{i}"), v, publish);
            }
        }
        serde_json::Value::String(s) => publish(topic, s),
        serde_json::Value::Number(n) => publish(topic, &n.to_string()),
        serde_json::Value::Bool(b) => publish(topic, &b.to_string()),
        serde_json::Value::Null => {
            // Do not publish null values
        }
    }
}

fn to_json_payload(record: &impl Serialize) -> Result<String, Error> {
    let mut value = serde_json::to_value(record).map_err(|e| Error::Publish(e.to_string()))?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    serde_json::to_string(&value).map_err(|e| Error::Publish(e.to_string()))
}

pub struct MqttSink {
    publisher: mqtt::MqttPublisher,
    format: MqttFormat,
}

impl MqttSink {
    fn publish_record(&mut self, topic: &str, record: &impl Serialize) -> Result<(), Error> {
        match self.format {
            MqttFormat::Json => {
                let payload = to_json_payload(record)?;
                self.publisher
                    .publish(topic, &payload)
                    .map_err(|e| Error::Publish(format!("{e:#}")))
            }
            MqttFormat::Simple => {
                let value =
                    serde_json::to_value(record).map_err(|e| Error::Publish(e.to_string()))?;
                let mut failures = 0usize;
                publish_simple_format(topic, &value, &mut |topic: &str, payload: &str| {
                    if let Err(e) = self.publisher.publish(topic, payload) {
                        error!("Failed to publish message to topic {topic}: {e}");
                        failures += 1;
                    }
                });
                match failures {
                    0 => Ok(()),
                    n => Err(Error::Publish(format!("{n} values under {topic} not published"))),
                }
            }
        }
    }
}

impl Sink for MqttSink {
    fn publish_module(&mut self, record: &ModuleRecord) -> Result<(), Error> {
        let topic = module_topic(self.publisher.topic(), record.address);
        self.publish_record(&topic, record)?;
        info!("Published module {} to {topic}", record.address);
        Ok(())
    }

    fn publish_system(&mut self, record: &SystemRecord) -> Result<(), Error> {
        let topic = system_topic(self.publisher.topic());
        self.publish_record(&topic, record)?;
        info!("Published system view to {topic}");
        Ok(())
    }
}

pub struct ConsoleSink;

impl Sink for ConsoleSink {
    fn publish_module(&mut self, record: &ModuleRecord) -> Result<(), Error> {
        match &record.measurements {
            Some(m) => println!(
                "battery_{}: {:.2} V {:.2} A {:.1} W SoC {}% cells {:.3}..{:.3} V | charge={} ({:.1} V, {:.1} A) discharge={} ({:.1} A) balance={:?}",
                record.address,
                m.voltage,
                m.current,
                m.power,
                m.soc,
                m.min_cell_voltage,
                m.max_cell_voltage,
                record.protection.allow_to_charge,
                record.protection.max_charge_voltage,
                record.protection.max_charge_current,
                record.protection.allow_to_discharge,
                record.protection.max_discharge_current,
                record.protection.balance_request,
            ),
            None => println!("battery_{}: offline", record.address),
        }
        for alarm in record.protection.alarms.iter() {
            println!("  {:?} {}: {}", alarm.severity, alarm.tag, alarm.cause);
        }
        Ok(())
    }

    fn publish_system(&mut self, record: &SystemRecord) -> Result<(), Error> {
        println!(
            "pylon: {}/{} online, charge={} ({:.1} V, {:.1} A) discharge={} ({:.1} A), {} alarms",
            record.modules_online,
            record.modules_online + record.modules_offline,
            record.allow_to_charge,
            record.max_charge_voltage,
            record.max_charge_current,
            record.allow_to_discharge,
            record.max_discharge_current,
            record.alarms.len()
        );
        println!("--- Cycle {} at {} ---", record.cycle, chrono::Local::now().to_rfc3339());
        Ok(())
    }
}

pub fn create_sink(
    config: &AppConfig,
    output: DaemonOutput,
    format: Option<MqttFormat>,
) -> Result<Box<dyn Sink>> {
    match output {
        DaemonOutput::Console => Ok(Box::new(ConsoleSink)),
        DaemonOutput::Mqtt => {
            if !config.mqtt.active {
                warn!("MQTT output selected but mqtt.active is false, printing to console");
                return Ok(Box::new(ConsoleSink));
            }
            let format = format.unwrap_or(config.mqtt.format);
            let publisher = mqtt::MqttPublisher::new(config.mqtt.clone())
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully, format {format:?}.");
            Ok(Box::new(MqttSink { publisher, format }))
        }
    }
}

pub fn run<T: Transport>(
    mut poller: Poller<T, Box<dyn Sink>>,
    interval: std::time::Duration,
) -> Result<()> {
    info!("Starting daemon mode: interval={interval:?}");
    poller.discover();
    poller.run(interval)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_format_publishes_every_leaf() {
        let value = json!({
            "soc": 80.0,
            "online": true,
            "barcode": "HPT1",
            "soh": null,
            "balance_request": [1, 4],
            "alarms": [{"name": "LowSoc", "severity": "Warning"}],
        });
        let mut published = Vec::new();
        publish_simple_format("bms/battery_1", &value, &mut |topic: &str, payload: &str| {
            published.push(format!("{topic}={payload}"))
        });
        published.sort();
        assert_eq!(
            published,
            vec![
                "bms/battery_1/alarms/0/name=LowSoc",
                "bms/battery_1/alarms/0/severity=Warning",
                "bms/battery_1/balance_request/0=1",
                "bms/battery_1/balance_request/1=4",
                "bms/battery_1/barcode=HPT1",
                "bms/battery_1/online=true",
                "bms/battery_1/soc=80.0",
            ]
        );
    }

    #[test]
    fn json_payload_carries_timestamp() {
        let payload = to_json_payload(&json!({"address": 2})).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["address"], 2);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn topics_follow_address() {
        assert_eq!(module_topic("extrabms", 3), "extrabms/battery_3");
        assert_eq!(system_topic("extrabms"), "extrabms/pylon");
    }
}
