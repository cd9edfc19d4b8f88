#![cfg_attr(docsrs, feature(doc_cfg))]
//! # extrabms_lib
//!
//! Polls lithium battery modules over their serial debug console, decodes the
//! replies and turns every reading into charge/discharge limits and alarms an
//! inverter (DVCC) can obey.
//!
//! The pipeline for one module and one cycle is:
//!
//! 1. [`protocol`] decodes the `pwr`/`bat` replies into a [`protocol::BatteryReading`].
//! 2. [`metrics`] derives power, cell extremes and capacity figures.
//! 3. [`events`] translates the manufacturer event bitfields into an [`alarm::AlarmSet`].
//! 4. [`protection`] folds the rule groups into a [`protection::ProtectionOutput`].
//!
//! [`poller`] runs that pipeline for every configured address, tracks link
//! health through [`health`] and hands the results to a [`poller::Sink`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, used to build the `extrabms` daemon.
//! - `serialport`: Enables the serial console transport using the `serialport` crate.

/// Alarm tags, severities and alarm sets.
pub mod alarm;
/// Consolidated view over all modules of one cycle.
pub mod aggregate;
/// Battery and protection settings.
pub mod config;
/// Contains error types for the library.
mod error;
/// Manufacturer event bitfield tables.
pub mod events;
/// Communication health tracking.
pub mod health;
/// Quantities derived from a reading.
pub mod metrics;
/// Polling cycle orchestration.
pub mod poller;
/// The protection rule engine.
pub mod protection;
/// Console protocol: requests and reply decoding.
pub mod protocol;
/// Published telemetry records.
pub mod telemetry;

pub use error::{DecodeError, Error, Section};

/// Serial console transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
