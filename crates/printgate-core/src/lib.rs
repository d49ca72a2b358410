// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printgate — Core types, constants, and error definitions shared across all crates.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{PrintgateError, Result};
pub use types::*;
