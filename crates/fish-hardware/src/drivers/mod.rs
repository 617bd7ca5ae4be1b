//! Device drivers, one module per vendor protocol.
//!
//! | Role | Device type | Module |
//! |------|-------------|--------|
//! | pump | `REGLO DIGITAL` | [`reglo`] |
//! | pump | `BT100` | [`bt100`] |
//! | pump | `ASCII SPEED` | [`ascii_pump`] |
//! | valve | `HAMILTON MVP` | [`hamilton_mvp`] |
//! | valve | `AMC RVM` | [`amc_rvm`] |
//! | plate | `GRBL` | [`grbl`] |
//! | flow sensor | `SENSIRION CSV` | [`sensirion`] |
//!
//! [`demo`] holds the simulated drivers used when `demo = true`.

pub mod amc_rvm;
pub mod ascii_pump;
pub mod bt100;
pub mod demo;
pub mod grbl;
pub mod hamilton_mvp;
pub mod reglo;
pub mod sensirion;

#[cfg(test)]
pub mod mock_serial;
