// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printgate trust broker.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three kinds of identity a client can register against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationKind {
    Device,
    Printer,
    Server,
}

impl RegistrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Printer => "printer",
            Self::Server => "server",
        }
    }

    /// Resolve a kind from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "device" => Some(Self::Device),
            "printer" => Some(Self::Printer),
            "server" => Some(Self::Server),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegistrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suggested screen position for a trust prompt, supplied by the client.
///
/// Only honored for loopback connections; remote clients get the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_kind_round_trip() {
        for kind in [
            RegistrationKind::Device,
            RegistrationKind::Printer,
            RegistrationKind::Server,
        ] {
            assert_eq!(RegistrationKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(RegistrationKind::from_name("toaster"), None);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
