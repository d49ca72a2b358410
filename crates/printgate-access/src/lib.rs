// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printgate-access — Registered identity tracking for the Printgate broker.
//
// Tracks device/printer/server fingerprints against configured limits,
// independent of certificate trust, and keeps an append-only audit trail of
// every trust-relevant decision.

pub mod audit;
pub mod registry;

pub use audit::TrustAudit;
pub use registry::{AccessRegistry, ValidationOutcome};
