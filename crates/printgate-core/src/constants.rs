// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Protocol-level constants shared by the broker and its clients.

/// Product name shown in prompts and replies.
pub const ABOUT_TITLE: &str = "Printgate";

/// Reserved literal sent by a second starting instance to probe for a
/// running one.
pub const PROBE_REQUEST: &str = "getProgramName";

/// Fixed literal reply to [`PROBE_REQUEST`].
pub const PROBE_RESPONSE: &str = "tray";

/// Reserved keep-alive literal; elicits no reply.
pub const KEEP_ALIVE: &str = "ping";

/// Symmetric freshness window for signed message timestamps, in milliseconds.
/// A signature timestamped further than this from "now" (either direction)
/// is rejected as expired.
pub const VALID_SIGNING_PERIOD_MS: i64 = 15 * 60 * 1000;

/// Filename of the operator-supplied override trust anchor, looked up next
/// to the installation.
pub const OVERRIDE_CERT: &str = "override.crt";

/// Close code sent when a client speaks no resolvable capability and has no
/// uid to reply to.
pub const CLOSE_INCOMPATIBLE: u16 = 4003;
