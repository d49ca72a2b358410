// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printgate-auth — Trust and authorization core for the Printgate broker.
//
// This crate decides who a remote sender is and whether a given message may
// be believed: X.509 parsing and chaining against configurable trust anchors,
// per-message RSA signature verification within a freshness window, and the
// per-request validity state machine.

pub mod certificate;
pub mod request;
pub mod signing;
pub mod truststore;

// PUBLIC API: re-export the trust primitives
pub use certificate::Certificate;
pub use request::{RequestState, Validity};
pub use signing::{SigningAlgorithm, canonical_payload};
pub use truststore::TrustStore;
