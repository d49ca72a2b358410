// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Certificate model — parses a PEM-encoded certificate (plus optional
// intermediate), extracts identity fields, and computes the SHA-1 fingerprint
// used as the identity key everywhere else.
//
// Trust flags (`valid`, `expired`, `root_ca`) are computed by the
// `TrustStore` during evaluation; the parsed fields themselves are immutable
// after construction.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sha1::{Digest, Sha1};
use tracing::warn;
use x509_parser::prelude::*;

use printgate_core::error::{PrintgateError, Result};

/// Literal separating the end-entity block from an intermediate block in a
/// presented certificate string.
pub const INTERMEDIATE_SEPARATOR: &str = "--START INTERMEDIATE CERT--";

/// Common-name prefix marking a sponsored certificate. Stripped from the
/// display name; cosmetic only, no bearing on trust.
pub const SPONSORED_CN_PREFIX: &str = "Sponsored:";

/// Fingerprint of the sentinel certificate bound to connections that have
/// not presented one.
pub const UNKNOWN_FINGERPRINT: &str = "UNKNOWN REQUEST";

/// Subject attribute (id-at-description) carrying renewal information.
const RENEWAL_OID: &str = "2.5.4.13";
const RENEWAL_PREFIX: &str = "renewal-of-";

/// Display format for validity dates.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fields persisted for the saved-sites screen, in order.
pub const SAVE_FIELDS: [&str; 6] = [
    "fingerprint",
    "commonName",
    "organization",
    "validFrom",
    "validTo",
    "valid",
];

/// A parsed sender certificate.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// DER encoding of the end-entity certificate. Empty for synthetic
    /// certificates rebuilt from saved fields.
    der: Vec<u8>,
    /// DER encoding of the presented intermediate, if any.
    intermediate_der: Option<Vec<u8>>,
    /// Raw RSA public key bits (PKCS#1) from the SubjectPublicKeyInfo.
    public_key: Vec<u8>,
    fingerprint: String,
    common_name: String,
    organization: String,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    sponsored: bool,
    /// Fingerprint of a prior certificate this one renews, if declared.
    renewed_from: Option<String>,
    // Computed at evaluation time, not parsed attributes.
    valid: bool,
    expired: bool,
    root_ca: bool,
}

impl Certificate {
    /// Decode a certificate (and optional intermediate) from the given
    /// string.
    ///
    /// The input is a PEM block, optionally followed by
    /// [`INTERMEDIATE_SEPARATOR`] and a second block. Headerless base64 is
    /// accepted for either block.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.splitn(2, INTERMEDIATE_SEPARATOR);
        let leaf = decode_block(parts.next().unwrap_or_default())?;
        let intermediate = match parts.next() {
            Some(block) => Some(decode_block(block)?),
            None => None,
        };
        Self::from_der(leaf, intermediate)
    }

    /// Build the model from raw DER bytes.
    pub fn from_der(der: Vec<u8>, intermediate_der: Option<Vec<u8>>) -> Result<Self> {
        let (_, x509) = parse_x509_certificate(&der)
            .map_err(|e| PrintgateError::MalformedCertificate(e.to_string()))?;

        let mut common_name = first_attr(x509.subject().iter_common_name());
        if common_name.is_empty() {
            return Err(PrintgateError::MalformedCertificate(
                "Common Name cannot be blank".into(),
            ));
        }

        // Strip "Sponsored:" from the CN; the UI swaps the trusted icon
        // instead.
        let sponsored = common_name.starts_with(SPONSORED_CN_PREFIX);
        if sponsored {
            common_name = common_name[SPONSORED_CN_PREFIX.len()..].trim().to_owned();
        }

        let organization = first_attr(x509.subject().iter_organization());
        let fingerprint = make_thumbprint(&der);
        let valid_from = asn1_to_utc(&x509.validity().not_before);
        let valid_to = asn1_to_utc(&x509.validity().not_after);
        let renewed_from = read_renewal_info(x509.subject());
        let public_key = x509.public_key().subject_public_key.data.to_vec();

        Ok(Self {
            der,
            intermediate_der,
            public_key,
            fingerprint,
            common_name,
            organization,
            valid_from,
            valid_to,
            sponsored,
            renewed_from,
            valid: false,
            expired: false,
            root_ca: false,
        })
    }

    /// The well-known sentinel bound to connections that have not presented
    /// a certificate.
    pub fn unknown() -> Self {
        Self {
            der: Vec::new(),
            intermediate_der: None,
            public_key: Vec::new(),
            fingerprint: UNKNOWN_FINGERPRINT.to_owned(),
            common_name: "An anonymous request".to_owned(),
            organization: "Unknown".to_owned(),
            valid_from: DateTime::<Utc>::MIN_UTC,
            valid_to: DateTime::<Utc>::MAX_UTC,
            sponsored: false,
            renewed_from: None,
            valid: false,
            expired: false,
            root_ca: false,
        }
    }

    /// Rebuild a certificate from its persisted fields (the saved-sites
    /// screen) without re-parsing the original encoding.
    ///
    /// Unparseable dates fall back to the sentinel pair, which renders as
    /// "Not Provided".
    pub fn from_saved(data: &HashMap<String, String>) -> Self {
        let field = |k: &str| data.get(k).cloned().unwrap_or_default();

        let (valid_from, valid_to) = match (
            parse_cert_date(&field("validFrom")),
            parse_cert_date(&field("validTo")),
        ) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                warn!("unable to parse saved certificate dates, using sentinel range");
                (DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            }
        };

        Self {
            der: Vec::new(),
            intermediate_der: None,
            public_key: Vec::new(),
            fingerprint: field("fingerprint"),
            common_name: field("commonName"),
            organization: field("organization"),
            valid_from,
            valid_to,
            sponsored: false,
            renewed_from: None,
            valid: field("valid") == "true",
            expired: false,
            root_ca: false,
        }
    }

    /// Export the persisted field set.
    pub fn saved_fields(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("fingerprint".into(), self.fingerprint.clone());
        map.insert("commonName".into(), self.common_name.clone());
        map.insert("organization".into(), self.organization.clone());
        map.insert("validFrom".into(), self.valid_from_display());
        map.insert("validTo".into(), self.valid_to_display());
        map.insert("valid".into(), self.is_trusted().to_string());
        map
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    /// Display form of the not-before date; sentinel dates render as
    /// "Not Provided".
    pub fn valid_from_display(&self) -> String {
        if self.valid_from > DateTime::<Utc>::MIN_UTC {
            self.valid_from.format(DATE_FORMAT).to_string()
        } else {
            "Not Provided".to_owned()
        }
    }

    /// Display form of the not-after date; sentinel dates render as
    /// "Not Provided".
    pub fn valid_to_display(&self) -> String {
        if self.valid_to < DateTime::<Utc>::MAX_UTC {
            self.valid_to.format(DATE_FORMAT).to_string()
        } else {
            "Not Provided".to_owned()
        }
    }

    /// Valid chain AND not expired.
    pub fn is_trusted(&self) -> bool {
        self.valid && !self.expired
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn is_sponsored(&self) -> bool {
        self.sponsored
    }

    pub fn is_root_ca(&self) -> bool {
        self.root_ca
    }

    /// Whether this is the sentinel certificate.
    pub fn is_unknown(&self) -> bool {
        self.fingerprint == UNKNOWN_FINGERPRINT
    }

    /// Fingerprint of the certificate this one declares itself a renewal of.
    pub fn renewed_from(&self) -> Option<&str> {
        self.renewed_from.as_deref()
    }

    pub(crate) fn der(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn intermediate_der(&self) -> Option<&[u8]> {
        self.intermediate_der.as_deref()
    }

    pub(crate) fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub(crate) fn set_expired(&mut self, expired: bool) {
        self.expired = expired;
    }

    pub(crate) fn set_root_ca(&mut self, root_ca: bool) {
        self.root_ca = root_ca;
    }
}

/// Equality covers identity fields only, never the computed trust flags:
/// two structurally identical certificates must deduplicate whether or not
/// trust evaluation has run on either of them.
impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.common_name == other.common_name
            && self.organization == other.organization
            && self.valid_from == other.valid_from
            && self.valid_to == other.valid_to
    }
}

impl Eq for Certificate {}

impl std::fmt::Display for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.organization, self.common_name)
    }
}

/// SHA-1 digest of the DER encoding as a 40-character lowercase hex string.
pub fn make_thumbprint(der: &[u8]) -> String {
    hex::encode(Sha1::digest(der))
}

/// Decode one certificate block: proper PEM when markers are present,
/// headerless base64 otherwise.
fn decode_block(block: &str) -> Result<Vec<u8>> {
    let trimmed = block.trim();
    if trimmed.contains("-----BEGIN") {
        // Leading `::` keeps the external crate visible past the
        // x509-parser prelude glob, which has a `pem` module of its own.
        let parsed = ::pem::parse(trimmed)
            .map_err(|e| PrintgateError::MalformedCertificate(e.to_string()))?;
        Ok(parsed.contents().to_vec())
    } else {
        let compact: String = trimmed.split_whitespace().collect();
        BASE64
            .decode(compact.as_bytes())
            .map_err(|e| PrintgateError::MalformedCertificate(e.to_string()))
    }
}

/// First matching subject attribute as an owned string, or empty.
fn first_attr<'a, I>(mut attrs: I) -> String
where
    I: Iterator<Item = &'a AttributeTypeAndValue<'a>>,
{
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Scan the subject for the id-at-description renewal attribute.
/// Malformed values are warned about and skipped, never fatal.
fn read_renewal_info(subject: &X509Name<'_>) -> Option<String> {
    for attr in subject.iter_attributes() {
        if attr.attr_type().to_id_string() != RENEWAL_OID {
            continue;
        }
        let Ok(value) = attr.as_str() else { continue };

        let Some(previous) = value.strip_prefix(RENEWAL_PREFIX) else {
            warn!(value, "malformed renewal info");
            continue;
        };
        if previous.len() != 40 || !previous.bytes().all(|b| b.is_ascii_hexdigit()) {
            warn!(fingerprint = previous, "malformed renewal fingerprint");
            continue;
        }
        return Some(previous.to_owned());
    }
    None
}

fn asn1_to_utc(time: &ASN1Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Lenient date parsing for saved fields: ISO with or without `T`/`Z`,
/// fractional seconds, or the display format.
fn parse_cert_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        DATE_FORMAT,
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    None
}
