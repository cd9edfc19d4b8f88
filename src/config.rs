use crate::health::FailureScope;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rule thresholds of the protection engine.
///
/// Defaults are the reference values; every one may be overridden from the
/// `battery.thresholds` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// SoC (%) from which the float voltage applies.
    pub float_soc: f32,
    /// SoC (%) above which charge current is tapered.
    pub taper_soc: f32,
    pub taper_charge_current: f32,
    /// Share of the configured max charge current used below `taper_soc`.
    pub charge_current_ratio: f32,
    pub cell_over_voltage: f32,
    pub cell_under_voltage: f32,
    pub discharge_block_soc: f32,
    pub discharge_limit_soc: f32,
    pub low_soc_discharge_current: f32,
    /// Below this temperature (°C) charging is blocked.
    pub charge_block_temperature: f32,
    /// Below this temperature (°C) charge current is derated.
    pub cold_charge_temperature: f32,
    /// Above this temperature (°C) charge current is derated.
    pub high_temperature: f32,
    pub derated_charge_current: f32,
    pub balance_spread: f32,
    pub balance_min_voltage: f32,
    pub imbalance_spread: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            float_soc: 95.0,
            taper_soc: 90.0,
            taper_charge_current: 7.0,
            charge_current_ratio: 0.8,
            cell_over_voltage: 3.65,
            cell_under_voltage: 2.5,
            discharge_block_soc: 5.0,
            discharge_limit_soc: 10.0,
            low_soc_discharge_current: 10.0,
            charge_block_temperature: 0.0,
            cold_charge_temperature: 5.0,
            high_temperature: 45.0,
            derated_charge_current: 10.0,
            balance_spread: 0.05,
            balance_min_voltage: 3.4,
            imbalance_spread: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub addresses: Vec<u8>,
    pub num_cells: usize,
    /// Float charge voltage, used once SoC reaches `thresholds.float_soc`.
    pub max_charge_voltage: f32,
    pub bulk_charge_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub comms_failure_threshold: u32,
    pub failure_scope: FailureScope,
    pub thresholds: Thresholds,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            addresses: vec![1, 2, 3, 4, 5],
            num_cells: 15,
            max_charge_voltage: 51.0,
            bulk_charge_voltage: 52.5,
            max_charge_current: 50.0,
            max_discharge_current: 50.0,
            comms_failure_threshold: 10,
            failure_scope: FailureScope::Global,
            thresholds: Thresholds::default(),
        }
    }
}

impl BatteryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::Config("battery.addresses must not be empty".into()));
        }
        if self.addresses.contains(&0) {
            return Err(Error::Config("battery address 0 is reserved".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.addresses.iter().find(|a| !seen.insert(**a)) {
            return Err(Error::Config(format!(
                "battery address {dup} is configured twice"
            )));
        }
        if self.num_cells == 0 {
            return Err(Error::Config("battery.num_cells must be at least 1".into()));
        }
        for (name, value) in [
            ("max_charge_voltage", self.max_charge_voltage),
            ("bulk_charge_voltage", self.bulk_charge_voltage),
            ("max_charge_current", self.max_charge_current),
            ("max_discharge_current", self.max_discharge_current),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!(
                    "battery.{name} must be positive, got {value}"
                )));
            }
        }
        if self.max_charge_voltage > self.bulk_charge_voltage {
            return Err(Error::Config(format!(
                "float voltage {} is above bulk voltage {}",
                self.max_charge_voltage, self.bulk_charge_voltage
            )));
        }
        if self.comms_failure_threshold == 0 {
            return Err(Error::Config(
                "battery.comms_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
