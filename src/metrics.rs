use crate::protocol::BatteryReading;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub power: f32,
    pub max_cell_voltage: f32,
    pub max_cell_index: usize,
    pub min_cell_voltage: f32,
    pub min_cell_index: usize,
    pub cell_spread: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub capacity_ah: Option<f32>,
    pub consumed_ah: Option<f32>,
    pub time_to_go_s: Option<u32>,
}

pub(crate) fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

// First occurrence wins on ties.
fn extreme(values: &[f32], better: fn(f32, f32) -> bool) -> (usize, f32) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |acc: Option<(usize, f32)>, (i, v)| match acc {
            Some((_, best)) if !better(v, best) => acc,
            _ => Some((i, v)),
        })
        .unwrap_or((0, 0.0))
}

impl DerivedMetrics {
    pub fn from_reading(reading: &BatteryReading) -> Self {
        let (max_cell_index, max_cell_voltage) = extreme(&reading.cell_voltages, |a, b| a > b);
        let (min_cell_index, min_cell_voltage) = extreme(&reading.cell_voltages, |a, b| a < b);

        let min_temperature = reading.temperatures().fold(f32::INFINITY, f32::min);
        let max_temperature = reading.temperatures().fold(f32::NEG_INFINITY, f32::max);

        let capacity_ah = reading
            .installed_capacity_ah
            .map(|installed| round_to(reading.soc_percent / 100.0 * installed, 1));
        let consumed_ah = reading
            .installed_capacity_ah
            .zip(capacity_ah)
            .map(|(installed, capacity)| round_to(installed - capacity, 1));
        let time_to_go_s = match capacity_ah {
            Some(capacity) if reading.current < 0.0 => {
                Some((capacity / reading.current.abs() * 3600.0) as u32)
            }
            _ => None,
        };

        Self {
            power: round_to(reading.voltage * reading.current, 1),
            max_cell_voltage,
            max_cell_index,
            min_cell_voltage,
            min_cell_index,
            cell_spread: max_cell_voltage - min_cell_voltage,
            min_temperature,
            max_temperature,
            capacity_ah,
            consumed_ah,
            time_to_go_s,
        }
    }
}
