//! Cycle orchestrator.
//!
//! Polls every configured address in order over one exclusively owned
//! [`Transport`], runs decode, metrics, event translation and protection, and
//! hands the resulting records to a [`Sink`]. The health tracker is the only
//! state carried from one cycle to the next.

use crate::aggregate;
use crate::config::BatteryConfig;
use crate::events;
use crate::health::HealthTracker;
use crate::metrics::DerivedMetrics;
use crate::protection::{self, ProtectionInput};
use crate::protocol::{BatteryReading, Command, ModuleInfo, RawFrame};
use crate::telemetry::{ModuleRecord, SystemRecord};
use crate::Error;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Request/reply channel to the module string.
pub trait Transport {
    /// Sends `command` and returns the complete reply, terminator included.
    fn exchange(&mut self, command: &Command) -> Result<Vec<u8>, Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn exchange(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        (**self).exchange(command)
    }
}

/// Receives the records of each cycle.
pub trait Sink {
    fn publish_module(&mut self, record: &ModuleRecord) -> Result<(), Error>;
    fn publish_system(&mut self, record: &SystemRecord) -> Result<(), Error>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish_module(&mut self, record: &ModuleRecord) -> Result<(), Error> {
        (**self).publish_module(record)
    }

    fn publish_system(&mut self, record: &SystemRecord) -> Result<(), Error> {
        (**self).publish_system(record)
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub modules: Vec<ModuleRecord>,
    pub system: SystemRecord,
}

impl CycleReport {
    pub fn failed(&self) -> impl Iterator<Item = u8> + '_ {
        self.modules.iter().filter(|m| !m.online).map(|m| m.address)
    }
}

pub struct Poller<T, S> {
    transport: T,
    sink: S,
    config: BatteryConfig,
    health: HealthTracker,
    modules: BTreeMap<u8, ModuleInfo>,
    cycle: u64,
}

impl<T: Transport, S: Sink> Poller<T, S> {
    pub fn new(transport: T, sink: S, config: BatteryConfig) -> Result<Self, Error> {
        config.validate()?;
        let health = HealthTracker::new(
            &config.addresses,
            config.comms_failure_threshold,
            config.failure_scope,
        );
        Ok(Self {
            transport,
            sink,
            config,
            health,
            modules: BTreeMap::new(),
            cycle: 0,
        })
    }

    pub fn config(&self) -> &BatteryConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Module descriptions collected by [`Poller::discover`].
    pub fn modules(&self) -> &BTreeMap<u8, ModuleInfo> {
        &self.modules
    }

    pub fn into_parts(self) -> (T, S) {
        (self.transport, self.sink)
    }

    pub fn query_info(&mut self, address: u8) -> Result<ModuleInfo, Error> {
        let reply = self.transport.exchange(&Command::Info(address))?;
        ModuleInfo::decode(&reply).map_err(|source| Error::Decode { address, source })
    }

    /// Asks every module for its description. Reported current limits lower
    /// the configured maxima, they never raise them. Failures are logged and
    /// do not count against link health.
    pub fn discover(&mut self) {
        for address in self.config.addresses.clone() {
            let info = match self.query_info(address) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("Discovery of module {address} failed: {e}");
                    continue;
                }
            };
            log::info!("Module {address}: {info:?}");
            if let Some(limit) = info.max_charge_current {
                if limit > 0.0 && limit < self.config.max_charge_current {
                    log::info!(
                        "Module {address} lowers max charge current from {} A to {limit} A",
                        self.config.max_charge_current
                    );
                    self.config.max_charge_current = limit;
                }
            }
            if let Some(limit) = info.max_discharge_current {
                if limit > 0.0 && limit < self.config.max_discharge_current {
                    log::info!(
                        "Module {address} lowers max discharge current from {} A to {limit} A",
                        self.config.max_discharge_current
                    );
                    self.config.max_discharge_current = limit;
                }
            }
            if let Some(count) = info.cell_count {
                if count != self.config.num_cells {
                    log::warn!(
                        "Module {address} reports {count} cells, configured are {}",
                        self.config.num_cells
                    );
                }
            }
            self.modules.insert(address, info);
        }
    }

    pub fn read_module(&mut self, address: u8) -> Result<BatteryReading, Error> {
        let power = self.transport.exchange(&Command::Power(address))?;
        let cells = self.transport.exchange(&Command::Cells(address))?;
        log::trace!("module {address} pwr reply: {:02X?}", power);
        RawFrame {
            address,
            power,
            cells,
        }
        .decode(self.config.num_cells)
        .map_err(|source| Error::Decode { address, source })
    }

    fn barcode(&self, address: u8) -> Option<String> {
        self.modules.get(&address).and_then(|m| m.barcode.clone())
    }

    fn evaluate(&self, reading: &BatteryReading) -> ModuleRecord {
        let prior = self.health.health(reading.address);
        let metrics = DerivedMetrics::from_reading(reading);
        let alarms = events::translate(reading);
        let output = protection::evaluate(&ProtectionInput {
            reading,
            metrics: &metrics,
            alarms: &alarms,
            config: &self.config,
            health: &prior,
        });
        ModuleRecord::online(
            self.cycle,
            self.barcode(reading.address),
            reading,
            &metrics,
            output,
        )
    }

    /// Runs one full cycle. Only [`Error::CommsExhausted`] (or an error that
    /// is not a poll failure) ends it early; nothing is published for the
    /// failing address in that case.
    pub fn poll_cycle(&mut self) -> Result<CycleReport, Error> {
        self.cycle += 1;
        let cycle = self.cycle;
        let mut modules = Vec::with_capacity(self.config.addresses.len());

        for address in self.config.addresses.clone() {
            let record = match self.read_module(address) {
                Ok(reading) => {
                    let record = self.evaluate(&reading);
                    self.health.record_success(address);
                    record
                }
                Err(e) if e.is_poll_failure() => {
                    log::warn!("Cycle {cycle}: module {address} poll failed: {e}");
                    if let Err(fatal) = self.health.record_failure(address) {
                        log::error!("Cycle {cycle}: {fatal}, giving up");
                        return Err(fatal);
                    }
                    ModuleRecord::offline(address, cycle, self.barcode(address), &self.config)
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = self.sink.publish_module(&record) {
                log::warn!("Cycle {cycle}: publishing module {address} failed: {e}");
            }
            modules.push(record);
        }

        let system = aggregate::consolidate(cycle, &modules, &self.config);
        if let Err(e) = self.sink.publish_system(&system) {
            log::warn!("Cycle {cycle}: publishing system view failed: {e}");
        }
        log::debug!(
            "Cycle {cycle} done: charge={} discharge={} alarms={}",
            system.allow_to_charge,
            system.allow_to_discharge,
            system.alarms.len()
        );
        Ok(CycleReport {
            cycle,
            modules,
            system,
        })
    }

    /// Polls forever, one cycle per `interval`. Returns only on a fatal error.
    pub fn run(&mut self, interval: Duration) -> Result<(), Error> {
        log::info!(
            "Polling modules {:?} every {interval:?}",
            self.config.addresses
        );
        loop {
            let started = Instant::now();
            self.poll_cycle()?;
            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }
}
