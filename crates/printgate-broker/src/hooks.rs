// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator seams. The broker owns trust decisions and dispatch; the
// transport, the prompt UI, the tray, and the print backend all live behind
// these traits and are injected at construction time.

use printgate_core::Result;
use printgate_core::types::{ConnectionId, Position};
use serde_json::Value;

/// Outbound side of a transport session. One per live connection, handed to
/// the dispatcher with each inbound message.
pub trait ReplySink: Send + Sync {
    /// Queue a text frame for delivery. Delivery failures are the
    /// transport's problem; the dispatcher never retries.
    fn send(&self, payload: String);

    /// Close the session with the given close code and reason.
    fn close(&self, code: u16, reason: &str);

    /// Whether the peer is on a loopback address. Controls whether a
    /// client-suggested prompt position is honored.
    fn is_local(&self) -> bool {
        false
    }
}

/// Shows the yes/no trust prompt. Implemented by the GUI layer.
pub trait PromptHook: Send + Sync {
    /// Ask the user whether `display_name` may talk to us. Blocking is
    /// fine: the dialog gate serializes callers and runs one prompt at a
    /// time.
    fn prompt(&self, display_name: &str, position: Position) -> bool;
}

/// Tray / notification surface.
pub trait TrayHook: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);

    /// Whether an operator session is active. Calls with `requires_auth`
    /// are rejected while this is false.
    fn is_logged_in(&self) -> bool;

    /// Cancel any pending idle shutdown. Called for every real capability
    /// except version probes.
    fn void_idle_actions(&self) {}
}

/// Handle to an active device-status subscription. Dropped or closed when
/// its connection goes away.
pub trait DeviceListener: Send + Sync {
    fn close(&self);
}

/// Observer notified after each dispatched, non-keepalive call. Used by
/// display surfaces to refresh.
pub trait MessageProcessedListener: Send + Sync {
    fn on_message_processed(&self, call: &str);
}

/// The print backend. Everything driver-shaped lives behind this seam.
pub trait PrintHook: Send + Sync {
    /// Resolve a printer by fuzzy query, returning its canonical name.
    fn find_printer(&self, query: &str) -> Option<String>;

    /// Canonical names of all attached printers.
    fn list_printers(&self) -> Vec<String>;

    /// Render and submit a print job. The error message, if any, is
    /// relayed verbatim to the client.
    fn process_print(&self, params: &Value) -> Result<Value>;

    /// Begin streaming status events for the given connection. Returns
    /// false when the requested printers cannot be watched.
    fn start_listening(&self, connection: ConnectionId, params: &Value) -> bool;

    fn is_listening(&self, connection: ConnectionId) -> bool;

    /// Push a snapshot of current statuses to an already-listening
    /// connection.
    fn send_statuses(&self, connection: ConnectionId);

    fn stop_listening(&self, connection: ConnectionId);
}
