// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printgate.

use thiserror::Error;

/// Top-level error type for all Printgate operations.
///
/// Per-message failures are converted into error replies at the dispatch
/// boundary; none of these variants ever tears down a connection or the
/// process on its own.
#[derive(Debug, Error)]
pub enum PrintgateError {
    // -- Certificate / trust errors --
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("certificate chain validation failed: {0}")]
    ChainValidation(String),

    // -- Registration errors --
    #[error("{kind} registration limit of {limit} reached")]
    CapacityExceeded { kind: String, limit: usize },

    #[error("{0} not found")]
    NotFound(String),

    // -- Protocol errors --
    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintgateError>;
