// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use serde::{Deserialize, Serialize};

use crate::constants;

/// Persistent application settings for the trust broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Whether the embedded built-in trust anchor participates in chain
    /// validation. Toggleable at runtime; override anchors are load-once.
    pub trust_builtin: bool,
    /// Filename of the operator override anchor, looked up next to the
    /// installation directory.
    pub override_cert: String,
    /// Freshness window for signed message timestamps, in milliseconds,
    /// applied symmetrically around "now".
    pub signing_window_ms: i64,
    /// Maximum number of registered device fingerprints.
    pub device_limit: usize,
    /// Maximum number of registered printer fingerprints.
    pub printer_limit: usize,
    /// Maximum number of registered server identities.
    pub server_limit: usize,
    /// Enable the SQLite trust audit log.
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trust_builtin: true,
            override_cert: constants::OVERRIDE_CERT.to_owned(),
            signing_window_ms: constants::VALID_SIGNING_PERIOD_MS,
            device_limit: 5,
            printer_limit: 5,
            server_limit: 10,
            audit_enabled: true,
        }
    }
}
