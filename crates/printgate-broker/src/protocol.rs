// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Wire-envelope helpers: reply construction, origin normalization, and the
// small field extractions the dispatcher needs from inbound messages.

use printgate_core::types::Position;
use serde_json::{Map, Value, json};

/// Build a `{uid, result}` success reply. `result` may be `Null`; the key
/// is always present so callers can distinguish success from error.
pub fn result_reply(uid: Option<&str>, result: Value) -> String {
    let mut reply = Map::new();
    if let Some(uid) = uid {
        reply.insert("uid".to_owned(), json!(uid));
    }
    reply.insert("result".to_owned(), result);
    Value::Object(reply).to_string()
}

/// Build a `{uid, error}` reply.
pub fn error_reply(uid: Option<&str>, message: &str) -> String {
    let mut reply = Map::new();
    if let Some(uid) = uid {
        reply.insert("uid".to_owned(), json!(uid));
    }
    reply.insert("error".to_owned(), json!(message));
    Value::Object(reply).to_string()
}

/// Reduce a declared origin to a bare hostname.
///
/// Malformed values are left as supplied rather than dropped; a wrong
/// display name in the prompt beats no prompt at all.
pub fn origin_host(origin: &str) -> String {
    let rest = origin
        .split_once("://")
        .map_or(origin, |(_, after)| after);
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(rest);

    // Bracketed IPv6 literals keep their colons.
    let host = if let Some(end) = authority.strip_prefix('[').and_then(|a| a.find(']')) {
        &authority[..end + 2]
    } else {
        authority.split(':').next().unwrap_or(authority)
    };

    if host.is_empty() {
        origin.to_owned()
    } else {
        host.to_owned()
    }
}

/// Non-empty string at `key` inside a JSON object.
fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str().filter(|s| !s.is_empty())
}

/// The sender's device fingerprint: `params.data[0].deviceFingerprint`,
/// falling back to the top-level `hostInfo.fingerprint`.
pub fn device_fingerprint(message: &Value) -> Option<String> {
    let from_data = message
        .get("params")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.get(0))
        .and_then(|obj| non_empty_str(obj, "deviceFingerprint"));
    if let Some(fp) = from_data {
        return Some(fp.to_owned());
    }

    message
        .get("hostInfo")
        .and_then(|info| non_empty_str(info, "fingerprint"))
        .map(str::to_owned)
}

/// The optional printer fingerprint riding alongside the device one.
pub fn printer_fingerprint(message: &Value) -> Option<String> {
    message
        .get("params")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.get(0))
        .and_then(|obj| non_empty_str(obj, "printerFingerprint"))
        .map(str::to_owned)
}

/// Where to draw the trust prompt. Client-suggested positions are honored
/// only for loopback peers; everyone else gets the default.
pub fn dialog_position(message: &Value, is_local: bool) -> Position {
    if !is_local {
        return Position::default();
    }
    let Some(pos) = message.get("position") else {
        return Position::default();
    };
    match (
        pos.get("x").and_then(Value::as_i64),
        pos.get("y").and_then(Value::as_i64),
    ) {
        (Some(x), Some(y)) => Position::new(x as i32, y as i32),
        _ => Position::default(),
    }
}
