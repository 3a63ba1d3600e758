#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bmsrtu_lib
//!
//! This crate talks Modbus-RTU to a master/slave battery management system:
//! one master board at address `0x01` and up to 35 slave boards behind it,
//! reached over a single 115200 baud serial link.
//!
//! ## Layers
//!
//! - [`crc`] and [`frame`]: CRC-16 and wire framing.
//! - [`protocol`]: the closed command table, requests and decoded replies.
//! - [`convert`]: register values to volts, amperes and °C.
//! - [`transport`]: the serial session, one exchange at a time.
//! - [`client`]: [`Bms`], retrying logical calls with typed results.
//! - [`poll`]: periodic telemetry over a chain of boards.
//! - [`sim`]: an in-memory BMS for tests and dry runs.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bmsrtu` command-line tool.
//! - `serialport`: Opens real serial ports through the `serialport` crate.
//! - `serde`: Enables `serde` support for readings and exchange events.
//! - `bin-dependencies`: Enables all features required by the `bmsrtu` binary executable.
//!
//! ## Example
//!
//! ```
//! use bmsrtu_lib::{sim::SimulatedBms, Bms, Device};
//!
//! let sim = SimulatedBms::new();
//! let bms = Bms::default();
//! bms.connect_link("simulator", sim.link())?;
//! let reading = bms.telemetry(Device::MASTER)?;
//! assert_eq!(reading.cell_voltages.len(), 16);
//! bms.disconnect();
//! # Ok::<(), bmsrtu_lib::Error>(())
//! ```

/// Contains error types for the library.
mod error;

pub mod client;
pub mod convert;
pub mod crc;
pub mod frame;
pub mod poll;
/// Defines the command set and wire layout of the BMS.
pub mod protocol;
pub mod sim;
pub mod telemetry;
pub mod transport;

pub use client::Bms;
pub use error::{Error, Result};
pub use protocol::{Command, Device, Reply, Request, Telemetry};
