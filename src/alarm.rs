use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// Which manufacturer bitfield a fault bit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventField {
    BatEvents,
    PowerEvents,
    SystemFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlarmTag {
    Overvoltage,
    HighVoltage,
    LowVoltage,
    LowCellVoltage,
    LowSoc,
    HighChargeCurrent,
    HighDischargeCurrent,
    CellImbalance,
    HighChargeTemperature,
    LowChargeTemperature,
    HighTemperature,
    LowTemperature,
    FuseBlown,
    BatteryLife,
    SystemError,
    ChargeMosFail,
    DischargeMosFail,
    CommsDegraded,
    ModuleOffline,
    UnknownFault { field: EventField, mask: u32 },
}

impl AlarmTag {
    /// Whether a Critical alarm with this tag blocks (charge, discharge).
    pub fn blocks(&self) -> (bool, bool) {
        match self {
            AlarmTag::ChargeMosFail => (true, false),
            AlarmTag::DischargeMosFail => (false, true),
            AlarmTag::ModuleOffline => (true, true),
            _ => (false, false),
        }
    }
}

impl fmt::Display for AlarmTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlarmTag::UnknownFault { field, mask } => {
                write!(f, "UnknownFault({field:?}:{mask:#x})")
            }
            other => write!(f, "{other:?}"),
        }
    }
}

impl Serialize for AlarmTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    #[serde(rename = "name")]
    pub tag: AlarmTag,
    pub severity: Severity,
    pub cause: String,
}

impl Alarm {
    pub fn warning(tag: AlarmTag, cause: impl Into<String>) -> Self {
        Self {
            tag,
            severity: Severity::Warning,
            cause: cause.into(),
        }
    }

    pub fn critical(tag: AlarmTag, cause: impl Into<String>) -> Self {
        Self {
            tag,
            severity: Severity::Critical,
            cause: cause.into(),
        }
    }
}

/// Alarms active this cycle, one entry per tag.
///
/// Raising a tag that is already present keeps the higher severity; causes of
/// equal severity are joined so nothing raised is lost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmSet(BTreeMap<AlarmTag, Alarm>);

impl AlarmSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, alarm: Alarm) {
        match self.0.get_mut(&alarm.tag) {
            Some(existing) if alarm.severity > existing.severity => *existing = alarm,
            Some(existing) if alarm.severity == existing.severity => {
                if !existing.cause.contains(&alarm.cause) {
                    existing.cause = format!("{}; {}", existing.cause, alarm.cause);
                }
            }
            Some(_) => {}
            None => {
                self.0.insert(alarm.tag, alarm);
            }
        }
    }

    pub fn union(mut self, other: AlarmSet) -> AlarmSet {
        for alarm in other.0.into_values() {
            self.raise(alarm);
        }
        self
    }

    pub fn get(&self, tag: AlarmTag) -> Option<&Alarm> {
        self.0.get(&tag)
    }

    pub fn contains(&self, tag: AlarmTag) -> bool {
        self.0.contains_key(&tag)
    }

    pub fn severity(&self, tag: AlarmTag) -> Option<Severity> {
        self.get(tag).map(|a| a.severity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alarm> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn critical(&self) -> impl Iterator<Item = &Alarm> {
        self.iter().filter(|a| a.severity == Severity::Critical)
    }
}

impl FromIterator<Alarm> for AlarmSet {
    fn from_iter<I: IntoIterator<Item = Alarm>>(iter: I) -> Self {
        let mut set = AlarmSet::new();
        for alarm in iter {
            set.raise(alarm);
        }
        set
    }
}

impl Serialize for AlarmSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}
