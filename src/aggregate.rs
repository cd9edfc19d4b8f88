//! Consolidated system view.
//!
//! Limits are combined conservatively: allow flags are AND-ed over every
//! module (offline ones included), the charge voltage is the smallest one
//! reported and current limits are the smallest per module limit multiplied
//! by the number of modules in the set.

use crate::alarm::{Alarm, AlarmSet, AlarmTag};
use crate::config::BatteryConfig;
use crate::metrics::round_to;
use crate::telemetry::{CellRef, ModuleRecord, SystemRecord};
use std::collections::BTreeSet;

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f32)
}

// Smallest per module limit times the module count.
fn scaled_min(records: &[ModuleRecord], limit: impl Fn(&ModuleRecord) -> f32) -> f32 {
    records
        .iter()
        .map(limit)
        .reduce(f32::min)
        .map(|v| round_to(v * records.len() as f32, 1))
        .unwrap_or(0.0)
}

pub fn consolidate(cycle: u64, records: &[ModuleRecord], config: &BatteryConfig) -> SystemRecord {
    let online: Vec<_> = records
        .iter()
        .filter_map(|r| r.measurements.as_ref().map(|m| (r.address, m)))
        .collect();

    let mut alarms = AlarmSet::new();
    let mut balance_request = BTreeSet::new();
    for record in records {
        alarms = alarms.union(record.protection.alarms.clone());
        balance_request.extend(record.protection.balance_request.iter().copied());
    }

    let cells = online.iter().flat_map(|(address, m)| {
        m.cell_voltages.iter().enumerate().map(|(index, &voltage)| CellRef {
            address: *address,
            index,
            voltage,
        })
    });
    let (min_cell, max_cell) = cells.fold((None, None), |(min, max): (Option<CellRef>, Option<CellRef>), cell| {
        (
            match min {
                Some(m) if m.voltage <= cell.voltage => Some(m),
                _ => Some(cell),
            },
            match max {
                Some(m) if m.voltage >= cell.voltage => Some(m),
                _ => Some(cell),
            },
        )
    });
    if let (Some(min), Some(max)) = (min_cell, max_cell) {
        let spread = max.voltage - min.voltage;
        if spread > config.thresholds.imbalance_spread {
            alarms.raise(Alarm::warning(
                AlarmTag::CellImbalance,
                format!(
                    "system cell spread {spread:.3} V between module {} cell {} and module {} cell {}",
                    max.address, max.index, min.address, min.index
                ),
            ));
        }
    }

    let current = round_to(online.iter().map(|(_, m)| m.current).sum(), 2);
    let capacity_ah = round_to(online.iter().filter_map(|(_, m)| m.capacity_ah).sum(), 1);
    let time_to_go_s = (current < 0.0 && capacity_ah > 0.0)
        .then(|| (capacity_ah / current.abs() * 3600.0) as u32);

    SystemRecord {
        cycle,
        modules_online: online.len(),
        modules_offline: records.len() - online.len(),
        modules_blocking_charge: records
            .iter()
            .filter(|r| !r.protection.allow_to_charge)
            .count(),
        modules_blocking_discharge: records
            .iter()
            .filter(|r| !r.protection.allow_to_discharge)
            .count(),
        cells_per_module: config.num_cells,
        voltage: mean(online.iter().map(|(_, m)| m.voltage)).map(|v| round_to(v, 2)),
        current,
        power: round_to(online.iter().map(|(_, m)| m.power).sum(), 1),
        temperature: mean(online.iter().map(|(_, m)| m.temperature)).map(|v| round_to(v, 1)),
        soc: mean(online.iter().map(|(_, m)| m.soc)).map(f32::round),
        cycle_count: mean(online.iter().map(|(_, m)| m.cycle_count as f32))
            .map(|v| v.round() as u32),
        installed_capacity_ah: round_to(
            online.iter().filter_map(|(_, m)| m.installed_capacity_ah).sum(),
            1,
        ),
        capacity_ah,
        consumed_ah: round_to(online.iter().filter_map(|(_, m)| m.consumed_ah).sum(), 1),
        time_to_go_s,
        min_cell,
        max_cell,
        allow_to_charge: records.iter().all(|r| r.protection.allow_to_charge),
        allow_to_discharge: records.iter().all(|r| r.protection.allow_to_discharge),
        max_charge_voltage: records
            .iter()
            .map(|r| r.protection.max_charge_voltage)
            .reduce(f32::min)
            .unwrap_or(config.max_charge_voltage),
        max_charge_current: scaled_min(records, |r| r.protection.max_charge_current),
        max_discharge_current: scaled_min(records, |r| r.protection.max_discharge_current),
        balance_request,
        alarms,
    }
}
