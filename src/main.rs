use anyhow::{Context, Result};
use clap::Parser;
use extrabms_lib::poller::{Poller, Sink};
use extrabms_lib::serialport::ConsoleTransport;
use extrabms_lib::Error;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::*;
use std::{ops::Deref, panic, process::ExitCode};

mod commandline;
mod daemon;
mod mqtt;
mod settings;

use commandline::{CliArgs, CliCommands};
use settings::{AppConfig, LoggingConfig};

/// Exit code when the module string stopped answering.
const EXIT_COMMS_EXHAUSTED: u8 = 3;
const EXIT_CONFIG: u8 = 2;

// An explicit -v/-q wins over `logging.level`.
fn logging_init(loglevel: Option<LevelFilter>, config: &LoggingConfig) -> Result<LoggerHandle> {
    let spec = match (loglevel, &config.level) {
        (Some(level), _) => level.as_str().to_lowercase(),
        (None, Some(level)) => level.clone(),
        (None, None) => LevelFilter::Info.as_str().to_lowercase(),
    };
    let mut logger = Logger::try_with_env_or_str(spec).with_context(|| "Cannot init logging")?;
    if let Some(directory) = &config.file_path {
        logger = logger
            .log_to_file(FileSpec::default().directory(directory).basename("extrabms"))
            .rotate(
                Criterion::Size(config.file_max_size_kb * 1024),
                Naming::Numbers,
                Cleanup::KeepLogFiles(config.file_max_files),
            )
            .duplicate_to_stderr(Duplicate::All);
    }
    let log_handle = logger.start().with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.chain().find_map(|cause| cause.downcast_ref::<Error>()) {
        Some(Error::CommsExhausted { .. }) => EXIT_COMMS_EXHAUSTED,
        Some(Error::Config(_)) => EXIT_CONFIG,
        _ => 1,
    }
}

fn open_transport(config: &AppConfig) -> Result<ConsoleTransport> {
    let serial = &config.serial;
    let mut transport =
        ConsoleTransport::open(&serial.port, serial.baud_rate, serial.timeout, serial.wakeup)
            .with_context(|| format!("Cannot open serial port '{}'", serial.port))?;
    transport.set_delay(serial.delay);
    Ok(transport)
}

fn console_poller(config: &AppConfig) -> Result<Poller<ConsoleTransport, Box<dyn Sink>>> {
    let sink: Box<dyn Sink> = Box::new(daemon::ConsoleSink);
    Ok(Poller::new(open_transport(config)?, sink, config.battery.clone())?)
}

fn run(command: CliCommands, config: AppConfig) -> Result<()> {
    match command {
        CliCommands::Read => {
            let mut poller = console_poller(&config)?;
            poller.discover();
            let report = poller.poll_cycle().with_context(|| "Cannot read modules")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report.system)
                    .with_context(|| "Cannot serialize system view")?
            );
        }
        CliCommands::Info => {
            let mut poller = console_poller(&config)?;
            for address in config.battery.addresses.clone() {
                match poller.query_info(address) {
                    Ok(info) => println!("battery_{address}: {info:?}"),
                    Err(e) => println!("battery_{address}: {e}"),
                }
            }
        }
        CliCommands::Daemon {
            output,
            format,
            interval,
        } => {
            let sink = daemon::create_sink(&config, output, format)?;
            let poller = Poller::new(open_transport(&config)?, sink, config.battery.clone())?;
            daemon::run(poller, interval.unwrap_or(config.serial.reading_freq))?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config = AppConfig::load(&args.config);
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    let cli_level = args
        .verbose
        .is_present()
        .then(|| args.verbose.log_level_filter());
    let _log_handle = match logging_init(cli_level, &logging) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match config.and_then(|config| run(args.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
