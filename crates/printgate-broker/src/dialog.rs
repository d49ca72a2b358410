// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trust-on-first-use arbitration. One prompt on screen at a time, across
// all connections; approvals are remembered as server registrations, and
// denials are not remembered at all.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use printgate_access::{AccessRegistry, TrustAudit};
use printgate_auth::RequestState;
use printgate_core::types::{Position, RegistrationKind};
use tracing::{debug, info, warn};

use crate::hooks::PromptHook;

/// Serializes user-facing trust prompts and decides first-use outcomes.
///
/// The registry is the TOFU memory: an approved display name is registered
/// under the `server` kind, keyed by the base64 of the name itself (display
/// names are not certificates and have no DER to digest).
pub struct DialogGate {
    token: tokio::sync::Mutex<()>,
    prompt: Arc<dyn PromptHook>,
    registry: Arc<AccessRegistry>,
    blocked: Mutex<HashSet<String>>,
    audit: Option<Arc<TrustAudit>>,
}

impl DialogGate {
    pub fn new(prompt: Arc<dyn PromptHook>, registry: Arc<AccessRegistry>) -> Self {
        Self {
            token: tokio::sync::Mutex::new(()),
            prompt,
            registry,
            blocked: Mutex::new(HashSet::new()),
            audit: None,
        }
    }

    /// Attach a trust log; every prompt outcome gets one entry.
    pub fn with_audit(mut self, audit: Arc<TrustAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Mark a certificate fingerprint as blocked. Blocked senders are
    /// denied without a prompt.
    pub fn block(&self, fingerprint: &str) {
        self.blocked
            .lock()
            .expect("block list poisoned")
            .insert(fingerprint.to_owned());
    }

    pub fn is_blocked(&self, fingerprint: &str) -> bool {
        self.blocked
            .lock()
            .expect("block list poisoned")
            .contains(fingerprint)
    }

    /// The identity key a display name is remembered under.
    pub fn server_fingerprint(display_name: &str) -> String {
        BASE64.encode(display_name.as_bytes())
    }

    /// Decide whether the sender behind `request` may proceed, prompting
    /// the user when no prior decision covers it.
    ///
    /// The declared origin wins over the certificate common name as the
    /// identity shown to the user. `reason` is recorded in the trust log,
    /// not shown by the prompt itself.
    pub async fn allowed_from_dialog(
        &self,
        request: &RequestState,
        origin: Option<&str>,
        reason: &str,
        position: Position,
    ) -> bool {
        let display_name = origin
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| request.cert_name());

        if self.is_blocked(request.cert().fingerprint()) {
            info!(display_name, "sender is blocked, denying without prompt");
            self.log_outcome(display_name, false, reason);
            return false;
        }

        let server_fp = Self::server_fingerprint(display_name);

        // A verified sender with a remembered approval skips the queue.
        if request.is_verified() && self.registry.validate(RegistrationKind::Server, &server_fp).is_valid() {
            debug!(display_name, "verified and remembered, allowing without prompt");
            return true;
        }

        // Wait until previous prompts are closed.
        let _guard = self.token.lock().await;

        // A remembered name only skips the prompt when the sender either
        // proved the identity (verified) or never claimed one (anonymous).
        // A certificate that failed validation re-prompts every time.
        let remembered = (request.is_verified() || !request.has_certificate())
            && self
                .registry
                .validate(RegistrationKind::Server, &server_fp)
                .is_valid();
        let allowed = if remembered {
            debug!(display_name, "already registered, allowing without prompt");
            true
        } else {
            let shown = catch_unwind(AssertUnwindSafe(|| {
                self.prompt.prompt(display_name, position)
            }));
            match shown {
                Ok(allowed) => allowed,
                Err(_) => {
                    warn!(display_name, "prompt provider panicked, treating as denial");
                    false
                }
            }
        };

        if allowed && !remembered {
            // Remember the approval. A full server table does not retract
            // what the user just said yes to.
            if let Err(e) =
                self.registry
                    .register(RegistrationKind::Server, &server_fp, Some(display_name))
            {
                warn!(display_name, error = %e, "unable to remember server approval");
            }
        }
        if !remembered {
            self.log_outcome(display_name, allowed, reason);
        }

        allowed
    }

    fn log_outcome(&self, display_name: &str, allowed: bool, reason: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record("prompt", display_name, allowed, Some(reason)) {
                warn!(error = %e, "unable to record trust log entry");
            }
        }
    }
}
