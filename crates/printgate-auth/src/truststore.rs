// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trust store — an ordered set of anchor certificates and the chain
// validation that decides whether a presented certificate is trusted.
//
// Path building follows PKIX shape ([end-entity, intermediate?, anchor]) with
// revocation checking disabled by operator policy. Chain failure is expected
// during normal multi-CA operation and only ever logged at warn level.

use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, warn};
use x509_parser::prelude::*;

use printgate_core::constants::OVERRIDE_CERT;
use printgate_core::error::{PrintgateError, Result};

use crate::certificate::Certificate;

/// An explicit, injectable collection of trust anchors.
///
/// The built-in anchor (when supplied) always occupies position 0 while its
/// trust toggle is on. Override anchors loaded from disk are load-once and
/// never removed. The toggle is the only steady-state mutator and is atomic
/// with respect to concurrent chain validation.
pub struct TrustStore {
    anchors: RwLock<Vec<Certificate>>,
    builtin: Option<Certificate>,
    trust_builtin: AtomicBool,
}

impl TrustStore {
    /// Create a store around an optional built-in anchor, trusted by default.
    pub fn new(builtin: Option<Certificate>) -> Self {
        let builtin = builtin.map(|mut cert| {
            cert.set_root_ca(true);
            cert.set_valid(true);
            cert
        });

        let store = Self {
            anchors: RwLock::new(Vec::new()),
            builtin,
            trust_builtin: AtomicBool::new(false),
        };
        store.set_trust_builtin(true);
        store
    }

    /// Convenience constructor from a PEM-encoded built-in anchor.
    pub fn with_builtin_pem(pem: &str) -> Result<Self> {
        Ok(Self::new(Some(Certificate::parse(pem)?)))
    }

    /// An empty store with no anchors at all.
    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Add or remove the built-in anchor from the active set.
    pub fn set_trust_builtin(&self, trust: bool) {
        let Some(builtin) = &self.builtin else {
            self.trust_builtin.store(false, Ordering::SeqCst);
            return;
        };

        let mut anchors = self.anchors.write().expect("anchor list lock poisoned");
        let present = anchors.iter().any(|a| a == builtin);
        if trust && !present {
            debug!(
                cn = builtin.common_name(),
                fingerprint = builtin.fingerprint(),
                "adding built-in CA certificate"
            );
            anchors.insert(0, builtin.clone());
        } else if !trust && present {
            debug!(
                cn = builtin.common_name(),
                fingerprint = builtin.fingerprint(),
                "removing built-in CA certificate"
            );
            anchors.retain(|a| a != builtin);
        }
        self.trust_builtin.store(trust, Ordering::SeqCst);
    }

    pub fn is_trust_builtin(&self) -> bool {
        self.trust_builtin.load(Ordering::SeqCst)
    }

    /// Add an operator anchor. Duplicates (by identity) are skipped with a
    /// warning. Returns whether the anchor was added.
    pub fn add_anchor(&self, mut cert: Certificate) -> bool {
        cert.set_root_ca(true);
        cert.set_valid(true);

        let mut anchors = self.anchors.write().expect("anchor list lock poisoned");
        if anchors.iter().any(|a| a == &cert) {
            warn!(fingerprint = cert.fingerprint(), "CA cert exists, skipping");
            return false;
        }
        debug!(
            cn = cert.common_name(),
            org = cert.organization(),
            fingerprint = cert.fingerprint(),
            "adding CA certificate"
        );
        anchors.push(cert);
        true
    }

    /// Look for an operator `override.crt` beside the installation and load
    /// it as an anchor. A missing file is quietly skipped; a malformed one
    /// is logged and skipped.
    pub fn load_override_anchors(&self, install_dir: &Path) {
        let path = install_dir.join(OVERRIDE_CERT);
        if !path.exists() {
            return;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => match Certificate::parse(&contents) {
                Ok(cert) => {
                    self.add_anchor(cert);
                }
                Err(e) => error!(path = %path.display(), error = %e, "error loading CA cert"),
            },
            Err(e) => error!(path = %path.display(), error = %e, "error reading CA cert"),
        }
    }

    /// Whether any anchors beyond the built-in one are configured.
    pub fn has_additional_anchors(&self) -> bool {
        let anchors = self.anchors.read().expect("anchor list lock poisoned");
        anchors.len() > usize::from(self.is_trust_builtin())
    }

    /// Snapshot of the current anchor set, in order.
    pub fn anchors(&self) -> Vec<Certificate> {
        self.anchors
            .read()
            .expect("anchor list lock poisoned")
            .clone()
    }

    /// Decide trust and expiry for a freshly parsed certificate.
    ///
    /// Order matters and mirrors the original contract: attempt a chain to
    /// each anchor in order (first success wins), then apply the expiry
    /// override, then re-assert trust for certificates that *are* an anchor
    /// or that chained to a non-built-in (operator) anchor. An expired
    /// certificate can end up `valid` again here, but `is_trusted()` still
    /// reports false because it requires `!expired`.
    pub fn evaluate(&self, cert: &mut Certificate) {
        let anchors = self.anchors();

        let mut found_root: Option<&Certificate> = None;
        if !cert.is_root_ca() {
            for anchor in &anchors {
                match chain_validates(cert, anchor) {
                    Ok(()) => {
                        debug!(
                            cn = cert.common_name(),
                            org = cert.organization(),
                            fingerprint = cert.fingerprint(),
                            "successfully chained certificate"
                        );
                        cert.set_valid(true);
                        found_root = Some(anchor);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            "problem building certificate chain (normal if multiple CAs are in use)"
                        );
                    }
                }
            }
        }

        let now = Utc::now();
        if cert.valid_from() > now || cert.valid_to() < now {
            warn!(
                cn = cert.common_name(),
                org = cert.organization(),
                fingerprint = cert.fingerprint(),
                "certificate is expired"
            );
            cert.set_expired(true);
            cert.set_valid(false);
        }

        // A certificate that is literally one of the anchors is trusted
        // without path building; one chained to an operator (non-built-in)
        // anchor is trusted unconditionally as well.
        for anchor in &anchors {
            let is_builtin = self.builtin.as_ref().is_some_and(|b| b == anchor);
            if anchor == &*cert || (found_root == Some(anchor) && !is_builtin) {
                debug!(anchor = %anchor, "certificate is chained to trusted root CA");
                cert.set_valid(true);
                break;
            }
        }
    }
}

/// Attempt to validate the path [end-entity, intermediate?, anchor].
///
/// Checks issuer/subject linkage, signatures, the CA constraint on the
/// intermediate, and the validity windows of the issuing certificates.
/// Revocation is not checked (operator policy).
fn chain_validates(cert: &Certificate, anchor: &Certificate) -> Result<()> {
    let leaf_der = cert.der();
    if leaf_der.is_empty() {
        return Err(PrintgateError::ChainValidation(
            "no encoded certificate to chain".into(),
        ));
    }
    if anchor.der().is_empty() {
        return Err(PrintgateError::ChainValidation(
            "anchor has no encoded certificate".into(),
        ));
    }

    let (_, leaf) = parse_x509_certificate(leaf_der)
        .map_err(|e| PrintgateError::ChainValidation(e.to_string()))?;
    let (_, root) = parse_x509_certificate(anchor.der())
        .map_err(|e| PrintgateError::ChainValidation(e.to_string()))?;

    match cert.intermediate_der() {
        Some(inter_der) => {
            let (_, inter) = parse_x509_certificate(inter_der)
                .map_err(|e| PrintgateError::ChainValidation(e.to_string()))?;
            if !inter.is_ca() {
                return Err(PrintgateError::ChainValidation(
                    "intermediate is not a CA certificate".into(),
                ));
            }
            verify_link(&leaf, &inter)?;
            verify_link(&inter, &root)?;
            check_issuer_window(&inter)?;
        }
        None => {
            verify_link(&leaf, &root)?;
        }
    }
    check_issuer_window(&root)?;

    Ok(())
}

/// Verify that `child` was issued and signed by `parent`.
fn verify_link(child: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> Result<()> {
    if child.issuer().as_raw() != parent.subject().as_raw() {
        return Err(PrintgateError::ChainValidation(format!(
            "issuer mismatch: {} not issued by {}",
            child.subject(),
            parent.subject()
        )));
    }
    child
        .verify_signature(Some(parent.public_key()))
        .map_err(|e| PrintgateError::ChainValidation(format!("signature check failed: {e}")))
}

/// An issuing certificate must itself be within its validity window.
fn check_issuer_window(issuer: &X509Certificate<'_>) -> Result<()> {
    if issuer.validity().is_valid() {
        Ok(())
    } else {
        Err(PrintgateError::ChainValidation(format!(
            "issuing certificate outside validity window: {}",
            issuer.subject()
        )))
    }
}
