// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Access registry — registered device/printer/server fingerprints counted
// against per-kind limits. Registration state is independent of certificate
// trust: a fingerprint is either registered or it is not.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use printgate_core::config::AppConfig;
use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::RegistrationKind;

/// A single registered identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub fingerprint: String,
    pub name: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a validation query, carrying one descriptive reason on
/// rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    valid: bool,
    reason: Option<String>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Per-kind limits, taken from [`AppConfig`].
#[derive(Debug, Clone, Copy)]
struct Limits {
    device: usize,
    printer: usize,
    server: usize,
}

impl Limits {
    fn for_kind(&self, kind: RegistrationKind) -> usize {
        match kind {
            RegistrationKind::Device => self.device,
            RegistrationKind::Printer => self.printer,
            RegistrationKind::Server => self.server,
        }
    }
}

/// Registered fingerprints per kind, each kind independently
/// capacity-limited.
///
/// One mutex guards all three sets so every check-then-act (capacity check
/// plus insert) is a single critical section.
pub struct AccessRegistry {
    entries: Mutex<HashMap<RegistrationKind, HashMap<String, Registration>>>,
    limits: Limits,
}

impl AccessRegistry {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limits: Limits {
                device: config.device_limit,
                printer: config.printer_limit,
                server: config.server_limit,
            },
        }
    }

    /// Register a fingerprint. Idempotent on an already-present fingerprint;
    /// fails with `CapacityExceeded` when the kind's limit is reached.
    pub fn register(
        &self,
        kind: RegistrationKind,
        fingerprint: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let set = entries.entry(kind).or_default();

        if set.contains_key(fingerprint) {
            debug!(%kind, fingerprint, "fingerprint already registered");
            return Ok(());
        }

        let limit = self.limits.for_kind(kind);
        if set.len() >= limit {
            warn!(%kind, fingerprint, limit, "registration limit reached");
            return Err(PrintgateError::CapacityExceeded {
                kind: kind.to_string(),
                limit,
            });
        }

        info!(%kind, fingerprint, name = name.unwrap_or("auto-generated"), "fingerprint registered");
        set.insert(
            fingerprint.to_owned(),
            Registration {
                fingerprint: fingerprint.to_owned(),
                name: name.map(str::to_owned),
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Unregister a fingerprint. An absent fingerprint fails softly: the
    /// return value signals "not found", never an error.
    pub fn unregister(&self, kind: RegistrationKind, fingerprint: &str) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let removed = entries
            .get_mut(&kind)
            .is_some_and(|set| set.remove(fingerprint).is_some());
        if removed {
            info!(%kind, fingerprint, "fingerprint unregistered");
        } else {
            debug!(%kind, fingerprint, "fingerprint not found for unregistration");
        }
        removed
    }

    /// Whether a single fingerprint is registered for the given kind.
    pub fn validate(&self, kind: RegistrationKind, fingerprint: &str) -> ValidationOutcome {
        if fingerprint.is_empty() {
            return ValidationOutcome::rejected(format!("No {kind} fingerprint supplied"));
        }
        let entries = self.entries.lock().expect("registry lock poisoned");
        if entries
            .get(&kind)
            .is_some_and(|set| set.contains_key(fingerprint))
        {
            ValidationOutcome::ok()
        } else {
            ValidationOutcome::rejected(format!("{kind} fingerprint is not registered"))
        }
    }

    /// Validate a device/printer fingerprint pair together, failing closed:
    /// a missing required fingerprint or any single failure rejects the
    /// whole batch with one descriptive reason.
    pub fn validate_pair(
        &self,
        device_fingerprint: &str,
        printer_fingerprint: Option<&str>,
    ) -> ValidationOutcome {
        let device = self.validate(RegistrationKind::Device, device_fingerprint);
        if !device.is_valid() {
            return device;
        }
        if let Some(printer) = printer_fingerprint {
            let outcome = self.validate(RegistrationKind::Printer, printer);
            if !outcome.is_valid() {
                return outcome;
            }
        }
        ValidationOutcome::ok()
    }

    /// Current registration count for a kind.
    pub fn count(&self, kind: RegistrationKind) -> usize {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.get(&kind).map_or(0, HashMap::len)
    }

    /// Configured limit for a kind.
    pub fn limit(&self, kind: RegistrationKind) -> usize {
        self.limits.for_kind(kind)
    }

    /// Snapshot of the registrations for a kind, for display surfaces.
    pub fn registrations(&self, kind: RegistrationKind) -> Vec<Registration> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .get(&kind)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_limits(device: usize, printer: usize, server: usize) -> AccessRegistry {
        let config = AppConfig {
            device_limit: device,
            printer_limit: printer,
            server_limit: server,
            ..AppConfig::default()
        };
        AccessRegistry::new(&config)
    }

    #[test]
    fn register_and_validate() {
        let registry = registry_with_limits(2, 2, 2);
        registry
            .register(RegistrationKind::Device, "aa11", Some("Laptop"))
            .expect("register failed");

        assert!(registry.validate(RegistrationKind::Device, "aa11").is_valid());
        assert!(!registry.validate(RegistrationKind::Device, "bb22").is_valid());
        assert!(!registry.validate(RegistrationKind::Printer, "aa11").is_valid());
        assert_eq!(registry.count(RegistrationKind::Device), 1);
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = registry_with_limits(1, 1, 1);
        registry
            .register(RegistrationKind::Printer, "pp00", None)
            .expect("first register failed");
        registry
            .register(RegistrationKind::Printer, "pp00", None)
            .expect("idempotent re-register must succeed");
        assert_eq!(registry.count(RegistrationKind::Printer), 1);
    }

    #[test]
    fn capacity_is_enforced_per_kind() {
        let registry = registry_with_limits(1, 1, 1);
        registry
            .register(RegistrationKind::Device, "aa", None)
            .expect("register failed");

        let err = registry
            .register(RegistrationKind::Device, "bb", None)
            .unwrap_err();
        assert!(matches!(
            err,
            PrintgateError::CapacityExceeded { limit: 1, .. }
        ));

        // A different kind has its own independent budget.
        registry
            .register(RegistrationKind::Printer, "bb", None)
            .expect("printer register failed");
    }

    #[test]
    fn unregister_then_reregister_succeeds() {
        let registry = registry_with_limits(1, 1, 1);
        registry
            .register(RegistrationKind::Device, "aa", None)
            .expect("register failed");
        assert!(registry.unregister(RegistrationKind::Device, "aa"));
        registry
            .register(RegistrationKind::Device, "bb", None)
            .expect("re-register after unregister failed");
    }

    #[test]
    fn unregister_absent_fails_softly() {
        let registry = registry_with_limits(1, 1, 1);
        assert!(!registry.unregister(RegistrationKind::Device, "ghost"));
    }

    #[test]
    fn batch_validation_fails_closed() {
        let registry = registry_with_limits(2, 2, 2);
        registry
            .register(RegistrationKind::Device, "dev1", None)
            .expect("register failed");
        registry
            .register(RegistrationKind::Printer, "prn1", None)
            .expect("register failed");

        assert!(registry.validate_pair("dev1", Some("prn1")).is_valid());
        assert!(registry.validate_pair("dev1", None).is_valid());

        let missing_device = registry.validate_pair("", Some("prn1"));
        assert!(!missing_device.is_valid());
        assert!(!missing_device.reason().is_empty());

        let bad_printer = registry.validate_pair("dev1", Some("prn-unknown"));
        assert!(!bad_printer.is_valid());
        assert!(bad_printer.reason().contains("printer"));
    }
}
