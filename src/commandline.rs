use crate::settings::AppConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Deserialize;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Poll all configured modules once and print the readings and limits
    Read,
    /// Show the module information (barcode, cell count, current limits) of every address
    Info,
    /// Run the polling loop, publishing module and system limits every cycle
    Daemon {
        /// Output destination for the records
        #[arg(long, short, value_enum, default_value_t = DaemonOutput::Mqtt)]
        output: DaemonOutput,
        /// Output format for MQTT messages, overrides `mqtt.format`
        #[arg(long, value_enum)]
        format: Option<MqttFormat>,
        /// Polling interval, overrides `serial.reading_freq` (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

#[derive(clap::ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MqttFormat {
    /// Every value on its own subtopic
    Simple,
    /// One JSON document per module and one for the system
    Json,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum DaemonOutput {
    /// Print every cycle to the standard output (console).
    Console,
    /// Publish every cycle to the MQTT broker of the configuration file.
    Mqtt,
}

const fn about_text() -> &'static str {
    "battery console poller publishing charge and discharge limits"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Configuration file (YAML)
    #[arg(short, long, default_value_t = AppConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    #[command(subcommand)]
    pub command: CliCommands,
}
