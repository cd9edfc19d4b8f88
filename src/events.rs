//! Manufacturer event bitfields.
//!
//! Every bitfield is described by a static table of `(bit, mapping,
//! description)` entries. A set bit maps to at most one alarm; status bits map
//! to none. Bits missing from a table are reported as a single
//! [`AlarmTag::UnknownFault`] per field so no fault information is dropped.

use crate::alarm::{Alarm, AlarmSet, AlarmTag, EventField, Severity};
use crate::protocol::BatteryReading;

pub struct EventBit {
    pub bit: u32,
    pub alarm: Option<(AlarmTag, Severity)>,
    pub description: &'static str,
}

const fn status(bit: u32, description: &'static str) -> EventBit {
    EventBit {
        bit,
        alarm: None,
        description,
    }
}

const fn warning(bit: u32, tag: AlarmTag, description: &'static str) -> EventBit {
    EventBit {
        bit,
        alarm: Some((tag, Severity::Warning)),
        description,
    }
}

const fn critical(bit: u32, tag: AlarmTag, description: &'static str) -> EventBit {
    EventBit {
        bit,
        alarm: Some((tag, Severity::Critical)),
        description,
    }
}

pub static POWER_EVENTS: &[EventBit] = &[
    warning(0x1, AlarmTag::Overvoltage, "Overvoltage alarm"),
    warning(0x2, AlarmTag::HighVoltage, "High voltage alarm"),
    status(0x4, "Voltage is normal"),
    warning(0x8, AlarmTag::LowVoltage, "Low voltage alarm"),
    warning(0x10, AlarmTag::LowCellVoltage, "Under voltage alarm"),
    status(0x20, "Cell sleep"),
    warning(0x40, AlarmTag::BatteryLife, "Battery life alarm 1"),
    status(0x80, "System startup"),
    warning(0x100, AlarmTag::HighTemperature, "Over temperature alarm"),
    warning(0x200, AlarmTag::HighTemperature, "High temperature alarm"),
    status(0x400, "Temperature is normal"),
    warning(0x800, AlarmTag::LowTemperature, "Low temperature alarm"),
    warning(0x1000, AlarmTag::LowTemperature, "Under temperature alarm"),
    status(0x2000, "Full charge"),
    status(0x4000, "Normal power"),
    warning(0x8000, AlarmTag::LowSoc, "Low power"),
    warning(0x10000, AlarmTag::FuseBlown, "Short circuit protection"),
    warning(0x20000, AlarmTag::HighDischargeCurrent, "Discharge overcurrent protection 2"),
    warning(0x40000, AlarmTag::HighChargeCurrent, "Charging overcurrent protection 2"),
    warning(0x80000, AlarmTag::HighDischargeCurrent, "Discharge overcurrent protection"),
    warning(0x100000, AlarmTag::HighChargeCurrent, "Charging overcurrent protection"),
    status(0x200000, "System idle"),
    status(0x400000, "Charging"),
    status(0x800000, "Discharging"),
    warning(0x1000000, AlarmTag::SystemError, "System power failure"),
    status(0x2000000, "System idle"),
    status(0x4000000, "Charging"),
    status(0x8000000, "Discharging"),
    warning(0x10000000, AlarmTag::SystemError, "System error"),
    status(0x20000000, "System hibernation"),
    status(0x40000000, "System shutdown"),
    warning(0x80000000, AlarmTag::BatteryLife, "Battery life alarm 2"),
];

// Bat Events share the power event dictionary, any warning there points at a
// cell level problem.
pub static BAT_EVENTS: &[EventBit] = &[
    warning(0x1, AlarmTag::CellImbalance, "Cell overvoltage alarm"),
    warning(0x2, AlarmTag::CellImbalance, "Cell high voltage alarm"),
    status(0x4, "Cell voltage is normal"),
    warning(0x8, AlarmTag::CellImbalance, "Cell low voltage alarm"),
    warning(0x10, AlarmTag::CellImbalance, "Cell under voltage alarm"),
    warning(0x20, AlarmTag::CellImbalance, "Cell sleep"),
    warning(0x40, AlarmTag::CellImbalance, "Battery life alarm 1"),
    warning(0x80, AlarmTag::CellImbalance, "System startup"),
    warning(0x100, AlarmTag::CellImbalance, "Cell over temperature alarm"),
    warning(0x200, AlarmTag::CellImbalance, "Cell high temperature alarm"),
    status(0x400, "Cell temperature is normal"),
    warning(0x800, AlarmTag::CellImbalance, "Cell low temperature alarm"),
    warning(0x1000, AlarmTag::CellImbalance, "Cell under temperature alarm"),
    warning(0x2000, AlarmTag::CellImbalance, "Full charge"),
    warning(0x4000, AlarmTag::CellImbalance, "Normal power"),
    warning(0x8000, AlarmTag::CellImbalance, "Low power"),
    warning(0x10000, AlarmTag::CellImbalance, "Short circuit protection"),
    warning(0x20000, AlarmTag::CellImbalance, "Discharge overcurrent protection 2"),
    warning(0x40000, AlarmTag::CellImbalance, "Charging overcurrent protection 2"),
    warning(0x80000, AlarmTag::CellImbalance, "Discharge overcurrent protection"),
    warning(0x100000, AlarmTag::CellImbalance, "Charging overcurrent protection"),
    status(0x200000, "System idle"),
    status(0x400000, "Charging"),
    status(0x800000, "Discharging"),
    warning(0x1000000, AlarmTag::CellImbalance, "System power failure"),
    warning(0x2000000, AlarmTag::CellImbalance, "System idle"),
    warning(0x4000000, AlarmTag::CellImbalance, "Charging"),
    warning(0x8000000, AlarmTag::CellImbalance, "Discharging"),
    warning(0x10000000, AlarmTag::CellImbalance, "System error"),
    warning(0x20000000, AlarmTag::CellImbalance, "System hibernation"),
    warning(0x40000000, AlarmTag::CellImbalance, "System shutdown"),
    warning(0x80000000, AlarmTag::CellImbalance, "Battery life alarm 2"),
];

pub static SYSTEM_FAULTS: &[EventBit] = &[
    warning(0x1, AlarmTag::FuseBlown, "Reverse connection of external power input"),
    warning(0x2, AlarmTag::FuseBlown, "External power input overvoltage"),
    warning(0x4, AlarmTag::FuseBlown, "Current detection error"),
    warning(0x8, AlarmTag::FuseBlown, "OZ abnormal"),
    warning(0x10, AlarmTag::FuseBlown, "Sleep module abnormal"),
    warning(0x20, AlarmTag::FuseBlown, "Temperature sensor error"),
    warning(0x40, AlarmTag::FuseBlown, "Voltage detection error"),
    warning(0x80, AlarmTag::FuseBlown, "I2C bus error"),
    warning(0x100, AlarmTag::FuseBlown, "CAN bus address assignment error"),
    warning(0x200, AlarmTag::FuseBlown, "Internal CAN bus communication error"),
    critical(0x400, AlarmTag::ChargeMosFail, "Charge MOS FAIL"),
    critical(0x800, AlarmTag::DischargeMosFail, "Discharge MOS FAIL"),
];

pub fn table(field: EventField) -> &'static [EventBit] {
    match field {
        EventField::BatEvents => BAT_EVENTS,
        EventField::PowerEvents => POWER_EVENTS,
        EventField::SystemFault => SYSTEM_FAULTS,
    }
}

/// Translates one bitfield value into alarms.
pub fn translate_field(field: EventField, value: u32) -> AlarmSet {
    let entries = table(field);
    let mut alarms = AlarmSet::new();
    let mut unknown = 0u32;
    for bit in (0..u32::BITS).map(|n| 1u32 << n).filter(|b| value & b != 0) {
        match entries.iter().find(|e| e.bit == bit) {
            Some(EventBit {
                alarm: Some((tag, severity)),
                description,
                ..
            }) => {
                log::debug!("{field:?} bit {bit:#x}: {description} -> {tag}");
                alarms.raise(Alarm {
                    tag: *tag,
                    severity: *severity,
                    cause: format!("{description} ({field:?} {bit:#x})"),
                });
            }
            Some(entry) => log::trace!("{field:?} bit {bit:#x}: {}", entry.description),
            None => unknown |= bit,
        }
    }
    if unknown != 0 {
        log::warn!("{field:?} carries unmapped bits {unknown:#x}");
        alarms.raise(Alarm::warning(
            AlarmTag::UnknownFault {
                field,
                mask: unknown,
            },
            format!("unmapped {field:?} bits {unknown:#x}"),
        ));
    }
    alarms
}

/// Translates all event bitfields of a reading.
pub fn translate(reading: &BatteryReading) -> AlarmSet {
    translate_field(EventField::BatEvents, reading.bat_events)
        .union(translate_field(EventField::PowerEvents, reading.power_events))
        .union(translate_field(EventField::SystemFault, reading.system_fault))
}
