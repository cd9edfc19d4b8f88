use crate::mqtt::MqttConfig;
use anyhow::Result;
use extrabms_lib::config::BatteryConfig;
use extrabms_lib::protocol::{CONSOLE_BAUD_RATE, MINIMUM_DELAY};
use extrabms_lib::Error;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    /// Polling interval, one cycle per period.
    #[serde(with = "humantime_serde")]
    pub reading_freq: Duration,
    /// Deadline for one complete console reply.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    // Some USB - RS485 dongles need time to switch between TX and RX
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub baud_rate: u32,
    /// Send the wake-up frame and log into the console after opening.
    pub wakeup: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_device_name(),
            reading_freq: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            delay: MINIMUM_DELAY,
            baud_rate: CONSOLE_BAUD_RATE,
            wakeup: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log spec used when no `-v`/`-q` flag is given, e.g. "info" or "debug".
    pub level: Option<String>,
    /// Also write rotated log files into this directory.
    pub file_path: Option<PathBuf>,
    pub file_max_size_kb: u64,
    pub file_max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            file_path: None,
            file_max_size_kb: 1024,
            file_max_files: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub serial: SerialConfig,
    pub battery: BatteryConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "extrabms.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path).map_err(|e| {
            Error::Config(format!("Cannot open config file {config_file_path:?}: {e}"))
        })?;
        let config: Self = serde_yaml::from_reader(&config_file).map_err(|e| {
            Error::Config(format!("Cannot read config from file {config_file_path:?}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.battery.validate()?;
        if self.serial.timeout.is_zero() {
            return Err(Error::Config("serial.timeout must not be zero".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(Error::Config(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        Ok(())
    }
}
