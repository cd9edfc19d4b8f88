//! Protection engine.
//!
//! Each rule group is an independent pure function returning a [`Verdict`].
//! Verdicts only ever restrict: the final [`ProtectionOutput`] is the fold of
//! all verdicts with [`Verdict::combine`], which keeps the smaller cap, lets
//! `false` win for allow flags and unions alarms and balance requests.

use crate::alarm::{Alarm, AlarmSet, AlarmTag, Severity};
use crate::config::BatteryConfig;
use crate::health::{CommsHealth, LinkState};
use crate::metrics::DerivedMetrics;
use crate::protocol::BatteryReading;
use serde::Serialize;
use std::collections::BTreeSet;

/// Everything a rule group may look at.
pub struct ProtectionInput<'a> {
    pub reading: &'a BatteryReading,
    pub metrics: &'a DerivedMetrics,
    /// Alarms translated from the manufacturer event bits.
    pub alarms: &'a AlarmSet,
    pub config: &'a BatteryConfig,
    /// Link health before this cycle's poll was counted.
    pub health: &'a CommsHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionOutput {
    pub allow_to_charge: bool,
    pub allow_to_discharge: bool,
    pub max_charge_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub balance_request: BTreeSet<usize>,
    pub alarms: AlarmSet,
}

/// Candidate restrictions from one rule group. `None` caps leave the value alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allow_to_charge: bool,
    pub allow_to_discharge: bool,
    pub max_charge_voltage: Option<f32>,
    pub max_charge_current: Option<f32>,
    pub max_discharge_current: Option<f32>,
    pub balance_request: BTreeSet<usize>,
    pub alarms: AlarmSet,
}

fn min_cap(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Verdict {
    pub fn permissive() -> Self {
        Self {
            allow_to_charge: true,
            allow_to_discharge: true,
            max_charge_voltage: None,
            max_charge_current: None,
            max_discharge_current: None,
            balance_request: BTreeSet::new(),
            alarms: AlarmSet::new(),
        }
    }

    pub fn combine(self, other: Verdict) -> Verdict {
        Verdict {
            allow_to_charge: self.allow_to_charge && other.allow_to_charge,
            allow_to_discharge: self.allow_to_discharge && other.allow_to_discharge,
            max_charge_voltage: min_cap(self.max_charge_voltage, other.max_charge_voltage),
            max_charge_current: min_cap(self.max_charge_current, other.max_charge_current),
            max_discharge_current: min_cap(
                self.max_discharge_current,
                other.max_discharge_current,
            ),
            balance_request: self
                .balance_request
                .union(&other.balance_request)
                .copied()
                .collect(),
            alarms: self.alarms.union(other.alarms),
        }
    }

    fn block_charge(mut self) -> Self {
        self.allow_to_charge = false;
        self
    }

    fn block_discharge(mut self) -> Self {
        self.allow_to_discharge = false;
        self
    }

    fn charge_voltage(mut self, volts: f32) -> Self {
        self.max_charge_voltage = min_cap(self.max_charge_voltage, Some(volts));
        self
    }

    fn charge_current(mut self, amps: f32) -> Self {
        self.max_charge_current = min_cap(self.max_charge_current, Some(amps));
        self
    }

    fn discharge_current(mut self, amps: f32) -> Self {
        self.max_discharge_current = min_cap(self.max_discharge_current, Some(amps));
        self
    }

    fn alarm(mut self, alarm: Alarm) -> Self {
        self.alarms.raise(alarm);
        self
    }

    /// Applies the verdict to the configured maxima.
    pub fn resolve(self, config: &BatteryConfig) -> ProtectionOutput {
        ProtectionOutput {
            allow_to_charge: self.allow_to_charge,
            allow_to_discharge: self.allow_to_discharge,
            max_charge_voltage: min_cap(Some(config.bulk_charge_voltage), self.max_charge_voltage)
                .unwrap_or(config.bulk_charge_voltage),
            max_charge_current: min_cap(Some(config.max_charge_current), self.max_charge_current)
                .unwrap_or(config.max_charge_current),
            max_discharge_current: min_cap(
                Some(config.max_discharge_current),
                self.max_discharge_current,
            )
            .unwrap_or(config.max_discharge_current),
            balance_request: self.balance_request,
            alarms: self.alarms,
        }
    }
}

pub type Rule = fn(&ProtectionInput) -> Verdict;

/// Rule groups in evaluation order. Order does not change the result.
pub static RULES: &[(&str, Rule)] = &[
    ("charge voltage", charge_voltage),
    ("charge current", charge_current),
    ("discharge", discharge),
    ("balancing", balancing),
    ("temperature", temperature_envelope),
    ("hardware faults", hardware_faults),
    ("comms", comms),
];

// Rounds down to 0.1 A so the cap never exceeds the exact ratio. The
// epsilon absorbs f32 noise such as 29.599998.
fn floor_tenth(value: f32) -> f32 {
    (value * 10.0 + 1e-3).floor() / 10.0
}

pub fn charge_voltage(input: &ProtectionInput) -> Verdict {
    let config = input.config;
    let t = &config.thresholds;
    let soc = input.reading.soc_percent;
    let mut verdict = Verdict::permissive().charge_voltage(if soc < t.float_soc {
        config.bulk_charge_voltage
    } else {
        config.max_charge_voltage
    });
    if input.metrics.max_cell_voltage > t.cell_over_voltage {
        verdict = verdict.block_charge().alarm(Alarm::critical(
            AlarmTag::HighVoltage,
            format!(
                "cell {} at {:.3} V above {} V",
                input.metrics.max_cell_index, input.metrics.max_cell_voltage, t.cell_over_voltage
            ),
        ));
    }
    verdict
}

pub fn charge_current(input: &ProtectionInput) -> Verdict {
    let config = input.config;
    let t = &config.thresholds;
    let soc = input.reading.soc_percent;
    let mut verdict = Verdict::permissive().charge_current(if soc > t.taper_soc {
        t.taper_charge_current
    } else {
        floor_tenth(config.max_charge_current * t.charge_current_ratio)
    });

    let coldest = input.metrics.min_temperature;
    let hottest = input.metrics.max_temperature;
    if coldest < t.charge_block_temperature {
        verdict = verdict.block_charge().charge_current(0.0).alarm(Alarm::critical(
            AlarmTag::LowChargeTemperature,
            format!("{coldest:.1} °C below {} °C", t.charge_block_temperature),
        ));
    } else if coldest < t.cold_charge_temperature {
        verdict = verdict
            .charge_current(t.derated_charge_current)
            .alarm(Alarm::warning(
                AlarmTag::LowChargeTemperature,
                format!("{coldest:.1} °C below {} °C", t.cold_charge_temperature),
            ));
    }
    if hottest > t.high_temperature {
        verdict = verdict
            .charge_current(t.derated_charge_current)
            .alarm(Alarm::warning(
                AlarmTag::HighChargeTemperature,
                format!("{hottest:.1} °C above {} °C", t.high_temperature),
            ));
    }
    verdict
}

pub fn discharge(input: &ProtectionInput) -> Verdict {
    let t = &input.config.thresholds;
    let soc = input.reading.soc_percent;
    let mut verdict = Verdict::permissive();
    if soc < t.discharge_block_soc {
        verdict = verdict.block_discharge().discharge_current(0.0).alarm(Alarm::critical(
            AlarmTag::LowSoc,
            format!("SoC {soc}% below {}%", t.discharge_block_soc),
        ));
    } else if soc < t.discharge_limit_soc {
        verdict = verdict
            .discharge_current(t.low_soc_discharge_current)
            .alarm(Alarm::warning(
                AlarmTag::LowSoc,
                format!("SoC {soc}% below {}%", t.discharge_limit_soc),
            ));
    }
    if input.metrics.min_cell_voltage < t.cell_under_voltage {
        verdict = verdict.block_discharge().alarm(Alarm::critical(
            AlarmTag::LowCellVoltage,
            format!(
                "cell {} at {:.3} V below {} V",
                input.metrics.min_cell_index, input.metrics.min_cell_voltage, t.cell_under_voltage
            ),
        ));
    }
    verdict
}

pub fn balancing(input: &ProtectionInput) -> Verdict {
    let t = &input.config.thresholds;
    let metrics = input.metrics;
    let mut verdict = Verdict::permissive();
    if metrics.cell_spread > t.balance_spread && metrics.max_cell_voltage > t.balance_min_voltage {
        verdict.balance_request.insert(metrics.max_cell_index);
    }
    if metrics.cell_spread > t.imbalance_spread {
        verdict = verdict.alarm(Alarm::warning(
            AlarmTag::CellImbalance,
            format!(
                "cell spread {:.3} V above {} V",
                metrics.cell_spread, t.imbalance_spread
            ),
        ));
    }
    verdict
}

pub fn temperature_envelope(input: &ProtectionInput) -> Verdict {
    let t = &input.config.thresholds;
    let coldest = input.metrics.min_temperature;
    let hottest = input.metrics.max_temperature;
    let mut verdict = Verdict::permissive();
    if coldest < t.charge_block_temperature {
        verdict = verdict.alarm(Alarm::critical(
            AlarmTag::LowTemperature,
            format!("{coldest:.1} °C"),
        ));
    }
    if hottest > t.high_temperature {
        verdict = verdict.alarm(Alarm::warning(
            AlarmTag::HighTemperature,
            format!("{hottest:.1} °C"),
        ));
    }
    verdict
}

pub fn hardware_faults(input: &ProtectionInput) -> Verdict {
    let mut verdict = Verdict {
        alarms: input.alarms.clone(),
        ..Verdict::permissive()
    };
    for alarm in input.alarms.critical() {
        let (charge, discharge) = alarm.tag.blocks();
        verdict.allow_to_charge &= !charge;
        verdict.allow_to_discharge &= !discharge;
    }
    verdict
}

pub fn comms(input: &ProtectionInput) -> Verdict {
    match input.health.state {
        LinkState::Healthy => Verdict::permissive(),
        LinkState::Degraded | LinkState::Failed => Verdict::permissive().alarm(Alarm::warning(
            AlarmTag::CommsDegraded,
            format!(
                "recovered after {} failed polls",
                input.health.consecutive_failures
            ),
        )),
    }
}

pub fn evaluate(input: &ProtectionInput) -> ProtectionOutput {
    let verdict = RULES
        .iter()
        .map(|(name, rule)| {
            let verdict = rule(input);
            log::debug!("module {} rule '{name}': {verdict:?}", input.reading.address);
            verdict
        })
        .fold(Verdict::permissive(), Verdict::combine);
    verdict.resolve(input.config)
}

/// Output for a module that could not be read this cycle.
pub fn offline(address: u8, config: &BatteryConfig) -> ProtectionOutput {
    let alarms = [
        Alarm::critical(AlarmTag::ModuleOffline, format!("module {address} did not answer")),
        Alarm::warning(AlarmTag::LowSoc, "SoC unknown"),
    ]
    .into_iter()
    .collect();
    ProtectionOutput {
        allow_to_charge: false,
        allow_to_discharge: false,
        max_charge_voltage: config.max_charge_voltage,
        max_charge_current: 0.0,
        max_discharge_current: 0.0,
        balance_request: BTreeSet::new(),
        alarms,
    }
}

impl ProtectionOutput {
    pub fn has_critical(&self) -> bool {
        self.alarms.iter().any(|a| a.severity == Severity::Critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::metrics::tests::reading;

    struct Case {
        reading: BatteryReading,
        config: BatteryConfig,
        health: CommsHealth,
    }

    impl Case {
        fn new(soc: f32, temperature: f32, cells: &[f32]) -> Self {
            let mut r = reading(cells);
            r.soc_percent = soc;
            r.temperature = temperature;
            r.cell_temperatures = vec![temperature; cells.len()];
            Self {
                reading: r,
                config: BatteryConfig::default(),
                health: CommsHealth::new(1),
            }
        }

        fn nominal(soc: f32) -> Self {
            Self::new(soc, 25.0, &[3.30, 3.31, 3.32, 3.31])
        }

        fn run(&self) -> ProtectionOutput {
            let metrics = DerivedMetrics::from_reading(&self.reading);
            let alarms = events::translate(&self.reading);
            evaluate(&ProtectionInput {
                reading: &self.reading,
                metrics: &metrics,
                alarms: &alarms,
                config: &self.config,
                health: &self.health,
            })
        }
    }

    #[test]
    fn nominal_reading_is_permissive() {
        let out = Case::nominal(50.0).run();
        assert!(out.allow_to_charge);
        assert!(out.allow_to_discharge);
        assert_eq!(out.max_charge_voltage, 52.5);
        assert_eq!(out.max_charge_current, 40.0);
        assert_eq!(out.max_discharge_current, 50.0);
        assert!(out.alarms.is_empty());
        assert!(out.balance_request.is_empty());
    }

    #[test]
    fn charge_current_is_80_percent_of_configured_maximum() {
        for (max, expected) in [(50.0, 40.0), (100.0, 80.0), (37.0, 29.6)] {
            for temperature in [5.0, 20.0, 45.0] {
                let mut case = Case::new(90.0, temperature, &[3.3, 3.3]);
                case.config.max_charge_current = max;
                assert_eq!(case.run().max_charge_current, expected);
            }
        }
    }

    #[test]
    fn charge_current_ratio_rounds_down() {
        for (max, expected) in [(33.33, 26.6), (33.37, 26.6), (12.49, 9.9)] {
            let mut case = Case::nominal(50.0);
            case.config.max_charge_current = max;
            let out = case.run();
            assert_eq!(out.max_charge_current, expected);
            assert!(out.max_charge_current <= max * 0.8);
        }
    }

    #[test]
    fn float_and_bulk_voltage() {
        assert_eq!(Case::nominal(96.0).run().max_charge_voltage, 51.0);
        assert_eq!(Case::nominal(95.0).run().max_charge_voltage, 51.0);
        assert_eq!(Case::nominal(80.0).run().max_charge_voltage, 52.5);
    }

    #[test]
    fn tapered_charge_current_near_full() {
        assert_eq!(Case::nominal(96.0).run().max_charge_current, 7.0);
        assert_eq!(Case::nominal(91.0).run().max_charge_current, 7.0);
    }

    #[test]
    fn over_voltage_cell_blocks_charge_regardless_of_soc() {
        for soc in [10.0, 50.0, 99.0] {
            for temperature in [2.0, 25.0, 50.0] {
                let out = Case::new(soc, temperature, &[3.30, 3.70, 3.35]).run();
                assert!(!out.allow_to_charge);
                assert_eq!(
                    out.alarms.severity(AlarmTag::HighVoltage),
                    Some(Severity::Critical)
                );
            }
        }
    }

    #[test]
    fn low_soc_blocks_or_limits_discharge() {
        let out = Case::nominal(4.0).run();
        assert!(!out.allow_to_discharge);
        assert_eq!(out.max_discharge_current, 0.0);
        assert_eq!(out.alarms.severity(AlarmTag::LowSoc), Some(Severity::Critical));

        let out = Case::nominal(8.0).run();
        assert!(out.allow_to_discharge);
        assert_eq!(out.max_discharge_current, 10.0);
        assert_eq!(out.alarms.severity(AlarmTag::LowSoc), Some(Severity::Warning));
    }

    #[test]
    fn under_voltage_cell_blocks_discharge() {
        let out = Case::new(50.0, 25.0, &[3.2, 2.4, 3.2]).run();
        assert!(!out.allow_to_discharge);
        assert!(out.allow_to_charge);
        assert_eq!(
            out.alarms.severity(AlarmTag::LowCellVoltage),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn imbalance_requests_balancing_of_highest_cell() {
        let out = Case::new(60.0, 25.0, &[3.30, 3.42, 3.31, 3.33]).run();
        assert_eq!(out.balance_request, BTreeSet::from([1]));
        assert_eq!(
            out.alarms.severity(AlarmTag::CellImbalance),
            Some(Severity::Warning)
        );
    }

    #[test]
    fn small_spread_balances_without_alarm() {
        let out = Case::new(60.0, 25.0, &[3.40, 3.47, 3.41]).run();
        assert_eq!(out.balance_request, BTreeSet::from([1]));
        assert!(!out.alarms.contains(AlarmTag::CellImbalance));
    }

    #[test]
    fn no_balancing_below_top_of_charge() {
        let out = Case::new(60.0, 25.0, &[3.20, 3.38, 3.25]).run();
        assert!(out.balance_request.is_empty());
        assert!(out.alarms.contains(AlarmTag::CellImbalance));
    }

    #[test]
    fn freezing_blocks_charge_and_raises_both_alarms() {
        let out = Case::new(50.0, -2.0, &[3.3, 3.3]).run();
        assert!(!out.allow_to_charge);
        assert_eq!(out.max_charge_current, 0.0);
        assert_eq!(
            out.alarms.severity(AlarmTag::LowChargeTemperature),
            Some(Severity::Critical)
        );
        assert_eq!(
            out.alarms.severity(AlarmTag::LowTemperature),
            Some(Severity::Critical)
        );
        assert!(out.allow_to_discharge);
    }

    #[test]
    fn cool_pack_derates_charge_current() {
        let out = Case::new(50.0, 3.0, &[3.3, 3.3]).run();
        assert!(out.allow_to_charge);
        assert_eq!(out.max_charge_current, 10.0);
        assert_eq!(
            out.alarms.severity(AlarmTag::LowChargeTemperature),
            Some(Severity::Warning)
        );
        assert!(!out.alarms.contains(AlarmTag::LowTemperature));
    }

    #[test]
    fn hot_pack_derates_and_warns() {
        let out = Case::new(50.0, 47.0, &[3.3, 3.3]).run();
        assert_eq!(out.max_charge_current, 10.0);
        assert!(out.alarms.contains(AlarmTag::HighChargeTemperature));
        assert_eq!(
            out.alarms.severity(AlarmTag::HighTemperature),
            Some(Severity::Warning)
        );
    }

    #[test]
    fn most_restrictive_cap_wins_when_rules_overlap() {
        // taper (7 A) and hot derate (10 A) both apply
        let out = Case::new(96.0, 50.0, &[3.3, 3.3]).run();
        assert_eq!(out.max_charge_current, 7.0);
        // freezing (0 A) beats taper
        let out = Case::new(96.0, -5.0, &[3.3, 3.3]).run();
        assert_eq!(out.max_charge_current, 0.0);
    }

    #[test]
    fn critical_hardware_fault_forces_flag() {
        let mut case = Case::nominal(50.0);
        case.reading.system_fault = 0x800;
        let out = case.run();
        assert!(!out.allow_to_discharge);
        assert!(out.allow_to_charge);
        assert!(out.alarms.contains(AlarmTag::DischargeMosFail));

        case.reading.system_fault = 0x400;
        let out = case.run();
        assert!(!out.allow_to_charge);
        assert!(out.allow_to_discharge);
    }

    #[test]
    fn warning_events_are_reported_without_restriction() {
        let mut case = Case::nominal(50.0);
        case.reading.power_events = 0x8 | 0x1;
        let out = case.run();
        assert!(out.allow_to_charge && out.allow_to_discharge);
        assert!(out.alarms.contains(AlarmTag::LowVoltage));
        assert!(out.alarms.contains(AlarmTag::Overvoltage));
    }

    #[test]
    fn event_warning_and_rule_critical_merge_to_critical() {
        let mut case = Case::new(50.0, 25.0, &[3.3, 3.7]);
        case.reading.power_events = 0x2;
        let out = case.run();
        assert_eq!(out.alarms.len(), 2);
        assert_eq!(
            out.alarms.severity(AlarmTag::HighVoltage),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn alarms_never_suppress_each_other() {
        let mut case = Case::new(4.0, -3.0, &[3.70, 2.40, 3.30]);
        case.reading.system_fault = 0xC00;
        let out = case.run();
        for tag in [
            AlarmTag::HighVoltage,
            AlarmTag::LowCellVoltage,
            AlarmTag::LowSoc,
            AlarmTag::LowChargeTemperature,
            AlarmTag::LowTemperature,
            AlarmTag::CellImbalance,
            AlarmTag::ChargeMosFail,
            AlarmTag::DischargeMosFail,
        ] {
            assert!(out.alarms.contains(tag), "{tag} missing");
        }
        assert!(!out.allow_to_charge);
        assert!(!out.allow_to_discharge);
    }

    #[test]
    fn recovered_link_is_reported() {
        let mut case = Case::nominal(50.0);
        case.health.state = LinkState::Degraded;
        case.health.consecutive_failures = 3;
        let out = case.run();
        assert!(out.alarms.contains(AlarmTag::CommsDegraded));
        assert_eq!(out.max_charge_current, 40.0);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let mut case = Case::new(7.0, 46.0, &[3.30, 3.45, 3.31]);
        case.reading.power_events = 0x100 | 0x8000;
        let first = case.run();
        let second = case.run();
        assert_eq!(first, second);
        assert_eq!(format!("{first:?}"), format!("{second:?}"));
    }

    #[test]
    fn rule_order_does_not_matter() {
        let case = Case::new(7.0, 3.0, &[3.30, 3.70, 3.31]);
        let metrics = DerivedMetrics::from_reading(&case.reading);
        let alarms = events::translate(&case.reading);
        let input = ProtectionInput {
            reading: &case.reading,
            metrics: &metrics,
            alarms: &alarms,
            config: &case.config,
            health: &case.health,
        };
        let reversed = RULES
            .iter()
            .rev()
            .map(|(_, rule)| rule(&input))
            .fold(Verdict::permissive(), Verdict::combine)
            .resolve(&case.config);
        assert_eq!(reversed, evaluate(&input));
    }

    #[test]
    fn offline_module_blocks_everything() {
        let out = offline(3, &BatteryConfig::default());
        assert!(!out.allow_to_charge && !out.allow_to_discharge);
        assert_eq!(out.max_charge_current, 0.0);
        assert_eq!(out.max_discharge_current, 0.0);
        assert!(out.has_critical());
        assert!(out.alarms.contains(AlarmTag::ModuleOffline));
    }
}
