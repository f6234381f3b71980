// SPDX-License-Identifier: AGPL-3.0-only

//! Card backends
//!
//! Vendor drivers plug in by implementing [`DmaCard`](crate::card::DmaCard).
//! The crate ships one backend of its own:
//! - **Emulated**: a software card writing a synthetic block stream into
//!   host memory, for tests and for exercising the full readout chain
//!   without hardware.

pub mod emulated;

pub use emulated::{EmulatedCard, EmulatorConfig, UNKNOWN_ELINK};
