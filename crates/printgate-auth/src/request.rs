// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-message request state — the ephemeral validity verdict attached to a
// single inbound message, never persisted.

use chrono::Utc;
use serde_json::Value;

use crate::certificate::Certificate;

/// The closed set of per-message validity verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Valid certificate and, where required, a fresh valid signature.
    Trusted,
    /// Message timestamp outside the freshness window.
    Expired,
    /// Signature missing or failed verification.
    Unsigned,
    /// Bound certificate past its not-after date.
    ExpiredCert,
    /// Bound certificate before its not-before date.
    FutureCert,
    /// Bound certificate failed chain validation.
    InvalidCert,
    /// Nothing known yet; the initial state.
    Unknown,
}

impl Validity {
    /// Human-facing label used by the prompt UI.
    pub fn formatted(&self) -> &'static str {
        match self {
            Self::Trusted => "Valid",
            Self::Expired => "Expired Signature",
            Self::Unsigned => "Invalid Signature",
            Self::ExpiredCert => "Expired Certificate",
            Self::FutureCert => "Future Certificate",
            Self::InvalidCert => "Invalid Certificate",
            Self::Unknown => "Invalid",
        }
    }
}

/// Ephemeral, per-message view of the sender: the certificate bound to the
/// connection, the raw parsed message, and the validity verdict. Computed
/// fresh for every message.
#[derive(Debug, Clone)]
pub struct RequestState {
    cert: Certificate,
    data: Value,
    initial_connect: bool,
    status: Validity,
}

impl RequestState {
    pub fn new(cert: Certificate, data: Value) -> Self {
        Self {
            cert,
            data,
            initial_connect: false,
            status: Validity::Unknown,
        }
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn is_initial_connect(&self) -> bool {
        self.initial_connect
    }

    /// Rebind to a freshly presented certificate and recompute the verdict.
    pub fn mark_new_connection(&mut self, cert: Certificate) {
        self.cert = cert;
        self.initial_connect = true;
        self.check_certificate_state();
    }

    /// Recompute the verdict from the bound certificate, in precedence
    /// order: trusted, expired, future, invalid, unknown.
    pub fn check_certificate_state(&mut self) {
        let now = Utc::now();
        self.status = if self.cert.is_trusted() {
            Validity::Trusted
        } else if self.cert.valid_to() < now {
            Validity::ExpiredCert
        } else if self.cert.valid_from() > now {
            Validity::FutureCert
        } else if !self.cert.is_valid() {
            Validity::InvalidCert
        } else {
            Validity::Unknown
        };
    }

    pub fn status(&self) -> Validity {
        self.status
    }

    /// Override the verdict for this message only (signature freshness
    /// checks). Does not touch the bound certificate.
    pub fn set_status(&mut self, status: Validity) {
        self.status = status;
    }

    /// Whether a real (non-sentinel) certificate is bound.
    pub fn has_certificate(&self) -> bool {
        !self.cert.is_unknown()
    }

    pub fn cert_name(&self) -> &str {
        self.cert.common_name()
    }

    /// A request is verified iff its certificate is trusted AND its verdict
    /// is exactly `Trusted`.
    pub fn is_verified(&self) -> bool {
        self.cert.is_trusted() && self.status == Validity::Trusted
    }

    pub fn is_sponsored(&self) -> bool {
        self.cert.is_sponsored()
    }
}
