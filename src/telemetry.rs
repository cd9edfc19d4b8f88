//! Records handed to a sink once per cycle.

use crate::alarm::AlarmSet;
use crate::config::BatteryConfig;
use crate::metrics::DerivedMetrics;
use crate::protection::{self, ProtectionOutput};
use crate::protocol::BatteryReading;
use serde::Serialize;
use std::collections::BTreeSet;

/// Measured and derived values of one module that answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurements {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub soc: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soh: Option<f32>,
    pub temperature: f32,
    pub cycle_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_capacity_ah: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_ah: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_ah: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_go_s: Option<u32>,
    pub cell_voltages: Vec<f32>,
    pub temperatures: Vec<f32>,
    pub min_cell_voltage: f32,
    pub min_cell_index: usize,
    pub max_cell_voltage: f32,
    pub max_cell_index: usize,
    pub cell_spread: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
}

impl Measurements {
    pub fn new(reading: &BatteryReading, metrics: &DerivedMetrics) -> Self {
        Self {
            voltage: reading.voltage,
            current: reading.current,
            power: metrics.power,
            soc: reading.soc_percent,
            soh: reading.soh_percent,
            temperature: reading.temperature,
            cycle_count: reading.cycle_count,
            installed_capacity_ah: reading.installed_capacity_ah,
            capacity_ah: metrics.capacity_ah,
            consumed_ah: metrics.consumed_ah,
            time_to_go_s: metrics.time_to_go_s,
            cell_voltages: reading.cell_voltages.clone(),
            temperatures: reading.cell_temperatures.clone(),
            min_cell_voltage: metrics.min_cell_voltage,
            min_cell_index: metrics.min_cell_index,
            max_cell_voltage: metrics.max_cell_voltage,
            max_cell_index: metrics.max_cell_index,
            cell_spread: metrics.cell_spread,
            min_temperature: metrics.min_temperature,
            max_temperature: metrics.max_temperature,
        }
    }
}

/// Per module record, published to `<topic_base>/battery_<address>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleRecord {
    pub address: u8,
    pub cycle: u64,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(flatten)]
    pub measurements: Option<Measurements>,
    #[serde(flatten)]
    pub protection: ProtectionOutput,
}

impl ModuleRecord {
    pub fn online(
        cycle: u64,
        barcode: Option<String>,
        reading: &BatteryReading,
        metrics: &DerivedMetrics,
        protection: ProtectionOutput,
    ) -> Self {
        Self {
            address: reading.address,
            cycle,
            online: true,
            barcode,
            measurements: Some(Measurements::new(reading, metrics)),
            protection,
        }
    }

    /// Fail-safe record for a module that could not be read.
    pub fn offline(address: u8, cycle: u64, barcode: Option<String>, config: &BatteryConfig) -> Self {
        Self {
            address,
            cycle,
            online: false,
            barcode,
            measurements: None,
            protection: protection::offline(address, config),
        }
    }
}

/// A cell located within the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellRef {
    pub address: u8,
    pub index: usize,
    pub voltage: f32,
}

/// Consolidated view over all modules, published to `<topic_base>/pylon`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemRecord {
    pub cycle: u64,
    pub modules_online: usize,
    pub modules_offline: usize,
    pub modules_blocking_charge: usize,
    pub modules_blocking_discharge: usize,
    pub cells_per_module: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    pub current: f32,
    pub power: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_count: Option<u32>,
    pub installed_capacity_ah: f32,
    pub capacity_ah: f32,
    pub consumed_ah: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_go_s: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cell: Option<CellRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cell: Option<CellRef>,
    pub allow_to_charge: bool,
    pub allow_to_discharge: bool,
    pub max_charge_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    /// Zero-based cell indices any module asked to balance.
    pub balance_request: BTreeSet<usize>,
    pub alarms: AlarmSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::reading;

    #[test]
    fn offline_record_serializes_without_measurements() {
        let record = ModuleRecord::offline(4, 12, None, &BatteryConfig::default());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["address"], 4);
        assert_eq!(value["cycle"], 12);
        assert_eq!(value["online"], false);
        assert_eq!(value["allow_to_charge"], false);
        assert_eq!(value["max_discharge_current"], 0.0);
        assert!(value.get("voltage").is_none());
        assert!(value.get("barcode").is_none());
        assert_eq!(value["alarms"][0]["name"], "LowSoc");
        assert_eq!(value["alarms"][1]["name"], "ModuleOffline");
    }

    #[test]
    fn online_record_flattens_reading_and_limits() {
        let r = reading(&[3.30, 3.42, 3.31]);
        let metrics = DerivedMetrics::from_reading(&r);
        let protection = protection::offline(1, &BatteryConfig::default());
        let record = ModuleRecord::online(3, Some("HPT123".into()), &r, &metrics, protection);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["online"], true);
        assert_eq!(value["barcode"], "HPT123");
        assert_eq!(value["voltage"], 52.0);
        assert_eq!(value["soc"], 50.0);
        assert_eq!(value["max_cell_index"], 1);
        assert_eq!(value["cell_voltages"].as_array().unwrap().len(), 3);
        assert!(value["balance_request"].as_array().unwrap().is_empty());
    }
}
