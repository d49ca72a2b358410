// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The closed set of capabilities a client may call, with their per-call
// policy flags. Unknown call names resolve to `Invalid`, never an error.

/// A capability resolvable from a message's `call` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMethod {
    PrintersFind,
    PrintersStartListening,
    PrintersGetStatus,
    PrintersStopListening,
    Print,
    FingerprintRegisterDevice,
    FingerprintUnregisterDevice,
    FingerprintRegisterPrinter,
    FingerprintUnregisterPrinter,
    GetVersion,
    /// Sentinel for unresolvable call names.
    Invalid,
}

impl SocketMethod {
    /// Resolve a capability from its wire name. Unknown names map to
    /// [`SocketMethod::Invalid`].
    pub fn from_call(call: &str) -> Self {
        match call {
            "printers.find" => Self::PrintersFind,
            "printers.startListening" => Self::PrintersStartListening,
            "printers.getStatus" => Self::PrintersGetStatus,
            "printers.stopListening" => Self::PrintersStopListening,
            "print" => Self::Print,
            "fingerprint.registerDevice" => Self::FingerprintRegisterDevice,
            "fingerprint.unregisterDevice" => Self::FingerprintUnregisterDevice,
            "fingerprint.registerPrinter" => Self::FingerprintRegisterPrinter,
            "fingerprint.unregisterPrinter" => Self::FingerprintUnregisterPrinter,
            "getVersion" => Self::GetVersion,
            _ => Self::Invalid,
        }
    }

    pub fn call_name(&self) -> &'static str {
        match self {
            Self::PrintersFind => "printers.find",
            Self::PrintersStartListening => "printers.startListening",
            Self::PrintersGetStatus => "printers.getStatus",
            Self::PrintersStopListening => "printers.stopListening",
            Self::Print => "print",
            Self::FingerprintRegisterDevice => "fingerprint.registerDevice",
            Self::FingerprintUnregisterDevice => "fingerprint.unregisterDevice",
            Self::FingerprintRegisterPrinter => "fingerprint.registerPrinter",
            Self::FingerprintUnregisterPrinter => "fingerprint.unregisterPrinter",
            Self::GetVersion => "getVersion",
            Self::Invalid => "",
        }
    }

    /// Whether the call must carry a registered device fingerprint and a
    /// fresh signature.
    pub fn fingerprint_required(&self) -> bool {
        matches!(self, Self::Print)
    }

    /// Whether the call is gated behind a logged-in operator.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::GetVersion | Self::Invalid)
    }

    /// Template for the trust prompt shown when this call triggers a
    /// first-use decision. `print` interpolates the target printer.
    pub fn prompt_message(&self) -> &'static str {
        match self {
            Self::PrintersFind => "access connected printers",
            Self::PrintersStartListening => "listen for printer status",
            Self::Print => "print to %s",
            Self::FingerprintRegisterDevice => "register a device fingerprint",
            Self::FingerprintUnregisterDevice => "unregister a device fingerprint",
            Self::FingerprintRegisterPrinter => "register a printer fingerprint",
            Self::FingerprintUnregisterPrinter => "unregister a printer fingerprint",
            _ => "access local resources",
        }
    }
}
