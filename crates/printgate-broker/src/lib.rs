// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printgate-broker — Connection tracking, trust prompts, and message
// dispatch.
//
// This crate is the seam between the transport and the trust core: it binds
// each live session to a certificate, arbitrates trust-on-first-use prompts
// one at a time, and routes every validated message to its capability
// handler. The transport, prompt UI, tray, and print backend plug in
// through the traits in [`hooks`].

pub mod connection;
pub mod dialog;
pub mod dispatch;
pub mod hooks;
pub mod method;
pub mod protocol;

// PUBLIC API: the dispatcher and its collaborator seams
pub use connection::{Connection, ConnectionRegistry};
pub use dialog::DialogGate;
pub use dispatch::ProtocolDispatcher;
pub use hooks::{
    DeviceListener, MessageProcessedListener, PrintHook, PromptHook, ReplySink, TrayHook,
};
pub use method::SocketMethod;
