use crate::{DecodeError, Section};
use serde::{Deserialize, Serialize};
use std::fmt;

// Pylontech style wake-up frame, sent at 1200 baud to switch the port into
// the 19200 baud debug console.
pub const WAKEUP_FRAME: &[u8] = b"~20014682C0048520FCC3\r";
pub const WAKEUP_BAUD_RATE: u32 = 1200;
pub const CONSOLE_BAUD_RATE: u32 = 19200;
pub const LOGIN: &[u8] = b"\nlogin debug\n";

// Minimum pause between two commands on the half-duplex line.
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

pub const TERMINATOR: &str = "Command completed";

// Cell table rows carry at least: index volt curr tempr base volt.st curr.st temp.st soc coulomb
const CELL_ROW_MIN_COLUMNS: usize = 10;

/// One console command addressed to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power(u8),
    Cells(u8),
    Info(u8),
}

impl Command {
    pub fn address(&self) -> u8 {
        match *self {
            Command::Power(address) | Command::Cells(address) | Command::Info(address) => address,
        }
    }

    pub fn section(&self) -> Section {
        match self {
            Command::Power(_) => Section::Power,
            Command::Cells(_) => Section::Cells,
            Command::Info(_) => Section::Info,
        }
    }

    pub fn request(&self) -> Vec<u8> {
        format!("{self}\n").into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.section(), self.address())
    }
}

/// Returns true once `reply` holds the line that ends a console reply.
pub fn is_complete(reply: &[u8]) -> bool {
    reply
        .windows(TERMINATOR.len())
        .any(|w| w == TERMINATOR.as_bytes())
}

// The console speaks latin-1, every byte maps to one char.
fn to_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Splits a reply into the lines before the terminator.
fn reply_lines(bytes: &[u8], section: Section) -> Result<Vec<String>, DecodeError> {
    let text = to_text(bytes);
    let mut lines = Vec::new();
    for line in text.lines() {
        if line.contains(TERMINATOR) {
            return Ok(lines);
        }
        lines.push(line.trim().to_string());
    }
    Err(DecodeError::Truncated { section })
}

/// Splits a `Key : value unit` line. Lines without a colon are skipped.
fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, rest) = line.split_once(':')?;
    let value = rest.split_whitespace().next()?;
    Some((key.trim(), value))
}

fn invalid(field: &str, value: &str) -> DecodeError {
    DecodeError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn parse_scaled(field: &str, value: &str, divisor: f32) -> Result<f32, DecodeError> {
    value
        .trim_end_matches('%')
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v / divisor)
        .ok_or_else(|| invalid(field, value))
}

fn parse_percent(field: &str, value: &str) -> Result<f32, DecodeError> {
    match parse_scaled(field, value, 1.0)? {
        v if (0.0..=100.0).contains(&v) => Ok(v),
        _ => Err(invalid(field, value)),
    }
}

fn parse_hex(field: &str, value: &str) -> Result<u32, DecodeError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| invalid(field, value))
}

/// The two replies that make up one module frame.
#[derive(Debug, Clone, Default)]
pub struct RawFrame {
    pub address: u8,
    pub power: Vec<u8>,
    pub cells: Vec<u8>,
}

/// One decoded module reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub address: u8,
    pub voltage: f32,
    pub current: f32, // positive=charging, negative=discharging
    pub temperature: f32,
    pub soc_percent: f32,
    pub soh_percent: Option<f32>,
    pub installed_capacity_ah: Option<f32>,
    pub cycle_count: u32,
    pub cell_voltages: Vec<f32>,
    pub cell_temperatures: Vec<f32>,
    pub bat_events: u32,
    pub power_events: u32,
    pub system_fault: u32,
}

impl BatteryReading {
    /// All temperature probes, pack probe first.
    pub fn temperatures(&self) -> impl Iterator<Item = f32> + '_ {
        std::iter::once(self.temperature).chain(self.cell_temperatures.iter().copied())
    }
}

#[derive(Debug, Default)]
struct PowerSection {
    voltage: Option<f32>,
    current: Option<f32>,
    temperature: Option<f32>,
    soc_percent: Option<f32>,
    soh_percent: Option<f32>,
    installed_capacity_ah: Option<f32>,
    cycle_count: u32,
    bat_events: u32,
    power_events: u32,
    system_fault: u32,
}

impl PowerSection {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut section = Self::default();
        for line in reply_lines(bytes, Section::Power)? {
            let Some((key, value)) = key_value(&line) else {
                continue;
            };
            match key {
                "Voltage" => section.voltage = Some(parse_scaled(key, value, 1000.0)?),
                "Current" => section.current = Some(parse_scaled(key, value, 1000.0)?),
                "Temperature" => section.temperature = Some(parse_scaled(key, value, 1000.0)?),
                "Coulomb" => section.soc_percent = Some(parse_percent(key, value)?),
                "SOH" => section.soh_percent = Some(parse_scaled(key, value, 1.0)?),
                "Total Coulomb" => {
                    section.installed_capacity_ah = Some(parse_scaled(key, value, 1000.0)?)
                }
                "Charge Times" => {
                    section.cycle_count = value.parse().map_err(|_| invalid(key, value))?
                }
                "Bat Events" => section.bat_events = parse_hex(key, value)?,
                "Power Events" => section.power_events = parse_hex(key, value)?,
                "System Fault" => section.system_fault = parse_hex(key, value)?,
                _ => {}
            }
            log::trace!("pwr {key}={value}");
        }
        Ok(section)
    }
}

struct CellRow {
    voltage: f32,
    temperature: f32,
}

fn decode_cells(bytes: &[u8]) -> Result<Vec<CellRow>, DecodeError> {
    let mut rows = Vec::new();
    for line in reply_lines(bytes, Section::Cells)? {
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < CELL_ROW_MIN_COLUMNS {
            continue;
        }
        let index: usize = parts[0].parse().map_err(|_| invalid("cell index", parts[0]))?;
        if index != rows.len() {
            log::warn!(
                "Cell row out of order - expected={} received={}",
                rows.len(),
                index
            );
            return Err(DecodeError::CellOutOfOrder {
                expected: rows.len(),
                received: index,
            });
        }
        let row = CellRow {
            voltage: parse_scaled("cell voltage", parts[1], 1000.0)?,
            temperature: parse_scaled("cell temperature", parts[3], 1000.0)?,
        };
        log::trace!(
            "cell #{} volt={} °C={}",
            index,
            row.voltage,
            row.temperature
        );
        rows.push(row);
    }
    Ok(rows)
}

impl RawFrame {
    pub fn decode(&self, num_cells: usize) -> Result<BatteryReading, DecodeError> {
        let power = PowerSection::decode(&self.power)?;
        let cells = decode_cells(&self.cells)?;
        if cells.len() != num_cells {
            log::warn!(
                "Cell count mismatch - configured={} received={}",
                num_cells,
                cells.len()
            );
            return Err(DecodeError::CellCountMismatch {
                expected: num_cells,
                actual: cells.len(),
            });
        }
        Ok(BatteryReading {
            address: self.address,
            voltage: power.voltage.ok_or(DecodeError::MissingField { field: "Voltage" })?,
            current: power.current.ok_or(DecodeError::MissingField { field: "Current" })?,
            temperature: power.temperature.ok_or(DecodeError::MissingField {
                field: "Temperature",
            })?,
            soc_percent: power
                .soc_percent
                .ok_or(DecodeError::MissingField { field: "Coulomb" })?,
            soh_percent: power.soh_percent,
            installed_capacity_ah: power.installed_capacity_ah,
            cycle_count: power.cycle_count,
            cell_voltages: cells.iter().map(|c| c.voltage).collect(),
            cell_temperatures: cells.iter().map(|c| c.temperature).collect(),
            bat_events: power.bat_events,
            power_events: power.power_events,
            system_fault: power.system_fault,
        })
    }
}

/// Static module description returned by `info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub max_charge_current: Option<f32>,
    pub max_discharge_current: Option<f32>,
    pub barcode: Option<String>,
    pub cell_count: Option<usize>,
}

impl ModuleInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut info = Self::default();
        for line in reply_lines(bytes, Section::Info)? {
            let Some((key, value)) = key_value(&line) else {
                continue;
            };
            match key {
                "Max Charge Curr" => {
                    info.max_charge_current = Some(parse_scaled(key, value, 1000.0)?)
                }
                "Max Dischg Curr" => {
                    info.max_discharge_current = Some(parse_scaled(key, value, 1000.0)?.abs())
                }
                "Barcode" => info.barcode = Some(value.to_string()),
                "Cell Count" => info.cell_count = Some(value.parse().map_err(|_| invalid(key, value))?),
                _ => {}
            }
        }
        Ok(info)
    }
}
