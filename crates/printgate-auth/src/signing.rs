// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Detached message signature verification.
//
// Wire compatibility note: senders sign the SHA-256 *hex digest* of the
// canonical payload, not the payload itself. The canonical payload is the
// compact JSON of the `{call, params, timestamp}` subset with escaped-slash
// sequences normalized back to plain slashes. Both quirks must be reproduced
// exactly for interoperability with existing clients.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::signature::{
    RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY, RSA_PKCS1_2048_8192_SHA256,
    RSA_PKCS1_2048_8192_SHA512, RsaParameters, UnparsedPublicKey,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::certificate::Certificate;

/// The three supported RSA/SHA signature algorithm selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    /// Legacy default when the sender names no algorithm.
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl SigningAlgorithm {
    /// Resolve a wire name, case-insensitively. Unknown names yield `None`;
    /// the caller decides whether that means "unsupported" or "default".
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    fn verification(&self) -> &'static RsaParameters {
        match self {
            Self::Sha1 => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &RSA_PKCS1_2048_8192_SHA256,
            Self::Sha512 => &RSA_PKCS1_2048_8192_SHA512,
        }
    }
}

impl Certificate {
    /// Check the given base64 signature over `data` against this
    /// certificate's public key.
    ///
    /// The signed bytes are the UTF-8 encoding of the lowercase SHA-256 hex
    /// digest of `data`. Any cryptographic failure (bad key, malformed
    /// signature) yields `false`, never an error.
    pub fn is_signature_valid(
        &self,
        algorithm: SigningAlgorithm,
        signature: &str,
        data: &str,
    ) -> bool {
        if signature.is_empty() {
            return false;
        }

        // On errors, assume failure.
        let Ok(sig_bytes) = BASE64.decode(signature.as_bytes()) else {
            error!("unable to verify signature: signature is not valid base64");
            return false;
        };

        let digest_hex = hex::encode(Sha256::digest(data.as_bytes()));
        let key = UnparsedPublicKey::new(algorithm.verification(), self.public_key());
        match key.verify(digest_hex.as_bytes(), &sig_bytes) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "unable to verify signature");
                false
            }
        }
    }
}

/// The canonical byte sequence a sender signs: the compact JSON of the
/// `call`, `params`, and `timestamp` fields (in that order, absent fields
/// omitted). serde_json emits plain slashes, which matches the normalized
/// form of the original escaped-slash encoding byte-for-byte.
pub fn canonical_payload(message: &Value) -> String {
    let mut subset = Map::new();
    for field in ["call", "params", "timestamp"] {
        if let Some(value) = message.get(field) {
            subset.insert(field.to_owned(), value.clone());
        }
    }
    Value::Object(subset).to_string()
}
