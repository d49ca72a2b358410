// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Top-level message router. Validation (fingerprints, certificates,
// signatures) happens inline in message-arrival order; the resolved handler
// then runs on its own task so a slow print job never blocks intake.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use printgate_access::{AccessRegistry, TrustAudit};
use printgate_auth::{Certificate, RequestState, SigningAlgorithm, TrustStore, Validity, canonical_payload};
use printgate_core::constants::{
    ABOUT_TITLE, CLOSE_INCOMPATIBLE, KEEP_ALIVE, PROBE_REQUEST, PROBE_RESPONSE,
    VALID_SIGNING_PERIOD_MS,
};
use printgate_core::types::{ConnectionId, RegistrationKind};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::connection::ConnectionRegistry;
use crate::dialog::DialogGate;
use crate::hooks::{MessageProcessedListener, PrintHook, ReplySink, TrayHook};
use crate::method::SocketMethod;
use crate::protocol;

/// Routes every inbound message: validates, authorizes, and dispatches to a
/// capability handler, emitting structured success or error replies.
pub struct ProtocolDispatcher {
    connections: ConnectionRegistry,
    trust: Arc<TrustStore>,
    access: Arc<AccessRegistry>,
    dialog: DialogGate,
    tray: Arc<dyn TrayHook>,
    print: Arc<dyn PrintHook>,
    listeners: Mutex<Vec<Arc<dyn MessageProcessedListener>>>,
    audit: Option<Arc<TrustAudit>>,
}

impl ProtocolDispatcher {
    pub fn new(
        trust: Arc<TrustStore>,
        access: Arc<AccessRegistry>,
        dialog: DialogGate,
        tray: Arc<dyn TrayHook>,
        print: Arc<dyn PrintHook>,
    ) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            trust,
            access,
            dialog,
            tray,
            print,
            listeners: Mutex::new(Vec::new()),
            audit: None,
        }
    }

    /// Attach a trust log; registration changes get an entry each.
    pub fn with_audit(mut self, audit: Arc<TrustAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    fn log_registration(&self, action: &str, kind: RegistrationKind, fingerprint: &str, ok: bool) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(action, fingerprint, ok, Some(kind.as_str())) {
                warn!(error = %e, "unable to record trust log entry");
            }
        }
    }

    /// Observe successfully dispatched calls (keep-alives excluded).
    pub fn add_message_processed_listener(&self, listener: Arc<dyn MessageProcessedListener>) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    fn notify_message_processed(&self, call: SocketMethod) {
        if call == SocketMethod::Invalid {
            return;
        }
        let listeners = self.listeners.lock().expect("listener list poisoned").clone();
        for listener in listeners {
            listener.on_message_processed(call.call_name());
        }
    }

    /// A transport session opened. `origin_header` is the raw declared
    /// origin, reduced here to a bare hostname.
    #[instrument(skip(self, origin_header))]
    pub fn on_connect(&self, id: ConnectionId, origin_header: Option<&str>) {
        let origin = origin_header.map(protocol::origin_host);
        info!(?origin, "client connected");
        self.tray.info("Client connected");
        self.connections.connect(id, origin);
    }

    /// A transport session closed; release everything it held.
    #[instrument(skip(self))]
    pub fn on_close(&self, id: ConnectionId) {
        self.tray.info("Client disconnected");
        self.print.stop_listening(id);
        self.connections.close(id);
    }

    /// The transport reported an error for a session.
    pub fn on_error(&self, id: ConnectionId, message: &str) {
        error!(%id, message, "connection error");
        self.tray.error(message);
    }

    /// Handle one inbound text frame.
    ///
    /// Returns the handle of the spawned handler task when one was started,
    /// so the transport can track in-flight work. Reserved literals, setup
    /// calls, and validation rejections are handled inline and return
    /// `None`.
    pub async fn on_message(
        self: Arc<Self>,
        id: ConnectionId,
        sink: Arc<dyn ReplySink>,
        raw: &str,
    ) -> Option<JoinHandle<()>> {
        if raw.is_empty() {
            warn!(%id, "received empty message");
            self.send_error(&*sink, None, "Message is empty");
            return None;
        }
        if raw == PROBE_REQUEST {
            sink.send(PROBE_RESPONSE.to_owned());
            warn!("second instance of {ABOUT_TITLE} likely detected, asking it to close");
            return None;
        }
        if raw == KEEP_ALIVE {
            trace!(%id, "keep-alive");
            return None;
        }

        let mut json: Value = match serde_json::from_str(raw) {
            Ok(json) => json,
            Err(e) => {
                error!(%id, error = %e, "bad JSON");
                self.send_error(&*sink, None, &e.to_string());
                return None;
            }
        };
        if !json.is_object() {
            self.send_error(&*sink, None, "Message must be a JSON object");
            return None;
        }
        cleanup_message(&mut json);
        debug!(%id, message = %json, "message received");

        let uid = json.get("uid").and_then(Value::as_str).map(str::to_owned);
        let call_attr = json.get("call").and_then(Value::as_str).unwrap_or("");
        let call = SocketMethod::from_call(call_attr);

        let Some(connection) = self.connections.get(id) else {
            warn!(%id, "message for unknown connection");
            self.send_error(&*sink, uid.as_deref(), "Unknown connection");
            return None;
        };
        let (bound_cert, origin) = {
            let conn = connection.lock().expect("connection poisoned");
            (conn.certificate().clone(), conn.origin().map(str::to_owned))
        };
        let mut request = RequestState::new(bound_cert, json.clone());

        if call.fingerprint_required() {
            let Some(device_fp) = protocol::device_fingerprint(&json) else {
                self.send_error(&*sink, uid.as_deref(), "UNKNOWN_CLIENT");
                return None;
            };
            let printer_fp = protocol::printer_fingerprint(&json);
            let outcome = self.access.validate_pair(&device_fp, printer_fp.as_deref());
            if !outcome.is_valid() {
                warn!(%id, reason = outcome.reason(), "fingerprint validation failed");
                self.send_error(&*sink, uid.as_deref(), outcome.reason());
                return None;
            }
        }

        // A presented certificate makes this a setup call: rebind, decide
        // trust once, reply, and stop.
        if let Some(presented) = json.get("certificate").and_then(Value::as_str) {
            match Certificate::parse(presented) {
                Ok(mut certificate) => {
                    self.trust.evaluate(&mut certificate);
                    connection
                        .lock()
                        .expect("connection poisoned")
                        .set_certificate(certificate.clone());
                    request.mark_new_connection(certificate);
                    debug!(%id, "received new certificate from connection");
                }
                Err(e) => {
                    warn!(%id, error = %e, "unable to parse presented certificate");
                    request.mark_new_connection(Certificate::unknown());
                }
            }

            let position = protocol::dialog_position(&json, sink.is_local());
            let reason = format!("connect to {ABOUT_TITLE}");
            if self
                .dialog
                .allowed_from_dialog(&request, origin.as_deref(), &reason, position)
                .await
            {
                self.send_result(&*sink, uid.as_deref(), Value::Null);
            } else {
                self.send_error(&*sink, uid.as_deref(), "Connection blocked by client");
                sink.close(1000, "Connection blocked by client");
            }
            return None;
        }

        if request.has_certificate() && call.fingerprint_required() {
            request.set_status(signature_verdict(request.cert(), &json));
        }

        // Hand the validated call to its own task.
        let dispatcher = Arc::clone(&self);
        let task_sink = Arc::clone(&sink);
        let task_uid = uid.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = dispatcher
                .process_message(id, &task_sink, json, request, origin)
                .await
            {
                error!(%id, error = %e, "problem processing message");
                dispatcher.send_error(&*task_sink, task_uid.as_deref(), &e.to_string());
            }
        }))
    }

    /// Authorize and execute one resolved capability call.
    async fn process_message(
        &self,
        id: ConnectionId,
        sink: &Arc<dyn ReplySink>,
        json: Value,
        request: RequestState,
        origin: Option<String>,
    ) -> printgate_core::Result<()> {
        let uid = json.get("uid").and_then(Value::as_str).map(str::to_owned);
        let uid = uid.as_deref();
        let call_attr = json.get("call").and_then(Value::as_str).unwrap_or("");
        let call = SocketMethod::from_call(call_attr);
        let params = json.get("params").cloned().unwrap_or_else(|| json!({}));
        let fingerprint = params
            .get("fingerprint")
            .and_then(Value::as_str)
            .unwrap_or("");

        // No resolvable capability and nothing to reply to: the peer speaks
        // a different protocol version entirely.
        if call == SocketMethod::Invalid && uid.is_none_or(str::is_empty) {
            sink.close(
                CLOSE_INCOMPATIBLE,
                &format!("Connected to incompatible {ABOUT_TITLE} version"),
            );
            return Ok(());
        }

        if call.requires_auth() && !self.tray.is_logged_in() {
            warn!(call = call.call_name(), "rejecting request, user not authenticated");
            self.send_error(
                &**sink,
                uid,
                "Authentication required. Please log in to use this feature.",
            );
            return Ok(());
        }

        let mut reason = call.prompt_message().to_owned();
        if call == SocketMethod::Print {
            let Some(printer) = params.get("printer").filter(|p| p.is_object()) else {
                self.send_error(&**sink, uid, "A printer must be specified before printing");
                return Ok(());
            };
            let target = ["name", "file", "host"]
                .iter()
                .find_map(|key| printer.get(*key).and_then(Value::as_str))
                .unwrap_or("an undefined location");
            reason = reason.replace("%s", target);
        }

        if call.fingerprint_required() {
            let position = protocol::dialog_position(&json, sink.is_local());
            if !self
                .dialog
                .allowed_from_dialog(&request, origin.as_deref(), &reason, position)
                .await
            {
                self.send_error(&**sink, uid, "Request blocked");
                return Ok(());
            }
        }

        if call != SocketMethod::GetVersion {
            self.tray.void_idle_actions();
        }

        match call {
            SocketMethod::FingerprintRegisterDevice => {
                self.handle_register(&**sink, uid, RegistrationKind::Device, fingerprint, &params);
            }
            SocketMethod::FingerprintUnregisterDevice => {
                self.handle_unregister(&**sink, uid, RegistrationKind::Device, fingerprint);
            }
            SocketMethod::FingerprintRegisterPrinter => {
                self.handle_register(&**sink, uid, RegistrationKind::Printer, fingerprint, &params);
            }
            SocketMethod::FingerprintUnregisterPrinter => {
                self.handle_unregister(&**sink, uid, RegistrationKind::Printer, fingerprint);
            }
            SocketMethod::PrintersFind => {
                if let Some(query) = params.get("query").and_then(Value::as_str) {
                    match self.print.find_printer(query) {
                        Some(name) => self.send_result(&**sink, uid, json!(name)),
                        None => {
                            self.send_error(&**sink, uid, "Specified printer could not be found.")
                        }
                    }
                } else {
                    self.send_result(
                        &**sink,
                        uid,
                        json!({
                            "printers": self.print.list_printers(),
                            "currentPrinters": self.access.count(RegistrationKind::Printer),
                            "maxPrinters": self.access.limit(RegistrationKind::Printer),
                        }),
                    );
                }
            }
            SocketMethod::PrintersStartListening => {
                if self.print.start_listening(id, &params) {
                    self.send_result(&**sink, uid, Value::Null);
                } else {
                    self.send_error(&**sink, uid, "Listening failed.");
                }
            }
            SocketMethod::PrintersGetStatus => {
                if self.print.is_listening(id) {
                    self.print.send_statuses(id);
                    self.send_result(&**sink, uid, Value::Null);
                } else {
                    self.send_error(&**sink, uid, "No printer listeners started for this client.");
                }
            }
            SocketMethod::PrintersStopListening => {
                self.print.stop_listening(id);
                self.send_result(&**sink, uid, Value::Null);
            }
            SocketMethod::Print => {
                let outcome = self.print.process_print(&params)?;
                self.send_result(&**sink, uid, outcome);
            }
            SocketMethod::GetVersion => {
                self.send_result(&**sink, uid, json!(env!("CARGO_PKG_VERSION")));
            }
            SocketMethod::Invalid => {
                let name = if call_attr.is_empty() { "NONE" } else { call_attr };
                self.send_error(&**sink, uid, &format!("Invalid function call: {name}"));
            }
        }

        self.notify_message_processed(call);
        Ok(())
    }

    fn handle_register(
        &self,
        sink: &dyn ReplySink,
        uid: Option<&str>,
        kind: RegistrationKind,
        fingerprint: &str,
        params: &Value,
    ) {
        if fingerprint.is_empty() {
            warn!(%kind, "registration fingerprint missing");
            self.send_error(sink, uid, &format!("{} fingerprint is required", kind_label(kind)));
            return;
        }
        let name = params.get("name").and_then(Value::as_str);
        match self.access.register(kind, fingerprint, name) {
            Ok(()) => {
                self.log_registration("register", kind, fingerprint, true);
                self.send_result(sink, uid, json!(true));
            }
            Err(e) => {
                error!(%kind, fingerprint, error = %e, "registration failed");
                self.log_registration("register", kind, fingerprint, false);
                self.send_error(sink, uid, &format!("Failed to register {kind} fingerprint"));
            }
        }
    }

    fn handle_unregister(
        &self,
        sink: &dyn ReplySink,
        uid: Option<&str>,
        kind: RegistrationKind,
        fingerprint: &str,
    ) {
        if fingerprint.is_empty() {
            warn!(%kind, "unregistration fingerprint missing");
            self.send_error(sink, uid, &format!("{} fingerprint is required", kind_label(kind)));
            return;
        }
        if self.access.unregister(kind, fingerprint) {
            self.log_registration("unregister", kind, fingerprint, true);
            self.send_result(sink, uid, json!(true));
        } else {
            self.send_result(
                sink,
                uid,
                json!(format!(
                    "{} not found or already unregistered",
                    kind_label(kind)
                )),
            );
        }
    }

    fn send_result(&self, sink: &dyn ReplySink, uid: Option<&str>, result: Value) {
        let reply = protocol::result_reply(uid, result);
        debug!(%reply, "sent result");
        sink.send(reply);
    }

    fn send_error(&self, sink: &dyn ReplySink, uid: Option<&str>, message: &str) {
        debug!(message, "sent error");
        sink.send(protocol::error_reply(uid, message));
    }
}

/// Display form of a kind inside client-facing error strings.
fn kind_label(kind: RegistrationKind) -> &'static str {
    match kind {
        RegistrationKind::Device => "Device",
        RegistrationKind::Printer => "Printer",
        RegistrationKind::Server => "Server",
    }
}

/// Strip transport-only fields, plus stale signature fields on calls that
/// never use them.
fn cleanup_message(json: &mut Value) {
    let Some(obj) = json.as_object_mut() else {
        return;
    };
    obj.remove("promise");
    let call = SocketMethod::from_call(obj.get("call").and_then(Value::as_str).unwrap_or(""));
    if !call.fingerprint_required() {
        obj.remove("signature");
        obj.remove("signAlgorithm");
    }
}

/// The per-message signature verdict: freshness first, then the signature
/// itself. Supersedes the certificate verdict for this message only.
fn signature_verdict(cert: &Certificate, message: &Value) -> Validity {
    let now = Utc::now().timestamp_millis();
    let timestamp = message
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    // Saturating: an extreme client-supplied timestamp must land in
    // Expired, not overflow.
    if timestamp.saturating_add(VALID_SIGNING_PERIOD_MS) < now
        || timestamp.saturating_sub(VALID_SIGNING_PERIOD_MS) > now
    {
        warn!("expired signature on request");
        return Validity::Expired;
    }

    let signature = message
        .get("signature")
        .and_then(Value::as_str)
        .unwrap_or("");
    let algorithm_name = message
        .get("signAlgorithm")
        .and_then(Value::as_str)
        .unwrap_or("SHA1");
    let valid = match SigningAlgorithm::from_name(algorithm_name) {
        Some(algorithm) => {
            cert.is_signature_valid(algorithm, signature, &canonical_payload(message))
        }
        None => {
            warn!(algorithm_name, "unsupported signing algorithm");
            false
        }
    };
    if valid {
        trace!(cn = cert.common_name(), "valid signature");
        Validity::Trusted
    } else {
        warn!("bad signature on request");
        Validity::Unsigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use printgate_core::AppConfig;
    use printgate_core::types::Position;
    use sha2::{Digest, Sha256};

    use crate::hooks::PromptHook;

    const ROOT_PEM: &str = include_str!("../../printgate-auth/testdata/root.pem");
    const SELFSIGNED_PEM: &str = include_str!("../../printgate-auth/testdata/selfsigned.pem");
    const LEAF_PEM: &str = include_str!("../../printgate-auth/testdata/leaf.pem");
    const LEAF_KEY_PK8: &[u8] = include_bytes!("../../printgate-auth/testdata/leaf-key.pk8");

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        closed: Mutex<Option<(u16, String)>>,
        local: bool,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        fn closed(&self) -> Option<(u16, String)> {
            self.closed.lock().unwrap().clone()
        }
    }

    impl ReplySink for RecordingSink {
        fn send(&self, payload: String) {
            self.sent.lock().unwrap().push(payload);
        }

        fn close(&self, code: u16, reason: &str) {
            *self.closed.lock().unwrap() = Some((code, reason.to_owned()));
        }

        fn is_local(&self) -> bool {
            self.local
        }
    }

    struct StubTray {
        logged_in: bool,
    }

    impl TrayHook for StubTray {
        fn info(&self, _message: &str) {}
        fn error(&self, _message: &str) {}
        fn is_logged_in(&self) -> bool {
            self.logged_in
        }
    }

    struct FixedPrompt {
        allow: bool,
        calls: AtomicUsize,
    }

    impl PromptHook for FixedPrompt {
        fn prompt(&self, _display_name: &str, _position: Position) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.allow
        }
    }

    /// Answers prompts from a prepared script, front to back.
    struct ScriptedPrompt {
        answers: Mutex<Vec<bool>>,
        calls: AtomicUsize,
    }

    impl PromptHook for ScriptedPrompt {
        fn prompt(&self, _display_name: &str, _position: Position) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().remove(0)
        }
    }

    struct StubPrint {
        printers: Vec<String>,
        listening: Mutex<HashSet<ConnectionId>>,
        printed: Mutex<Vec<Value>>,
    }

    impl StubPrint {
        fn new() -> Self {
            Self {
                printers: vec!["Office Laser".to_owned(), "Receipt-1".to_owned()],
                listening: Mutex::new(HashSet::new()),
                printed: Mutex::new(Vec::new()),
            }
        }
    }

    impl PrintHook for StubPrint {
        fn find_printer(&self, query: &str) -> Option<String> {
            self.printers.iter().find(|p| p.contains(query)).cloned()
        }

        fn list_printers(&self) -> Vec<String> {
            self.printers.clone()
        }

        fn process_print(&self, params: &Value) -> printgate_core::Result<Value> {
            if params["printer"]["name"] == json!("Broken") {
                return Err(printgate_core::PrintgateError::Protocol(
                    "print data could not be rendered".into(),
                ));
            }
            self.printed.lock().unwrap().push(params.clone());
            Ok(Value::Null)
        }

        fn start_listening(&self, connection: ConnectionId, _params: &Value) -> bool {
            self.listening.lock().unwrap().insert(connection)
        }

        fn is_listening(&self, connection: ConnectionId) -> bool {
            self.listening.lock().unwrap().contains(&connection)
        }

        fn send_statuses(&self, _connection: ConnectionId) {}

        fn stop_listening(&self, connection: ConnectionId) {
            self.listening.lock().unwrap().remove(&connection);
        }
    }

    struct CountingListener {
        calls: Mutex<Vec<String>>,
    }

    impl MessageProcessedListener for CountingListener {
        fn on_message_processed(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }
    }

    struct Harness {
        dispatcher: Arc<ProtocolDispatcher>,
        prompt: Arc<FixedPrompt>,
        print: Arc<StubPrint>,
        access: Arc<AccessRegistry>,
    }

    fn harness(prompt_allow: bool, logged_in: bool, trust: TrustStore) -> Harness {
        let access = Arc::new(AccessRegistry::new(&AppConfig::default()));
        let prompt = Arc::new(FixedPrompt {
            allow: prompt_allow,
            calls: AtomicUsize::new(0),
        });
        let print = Arc::new(StubPrint::new());
        let dialog = DialogGate::new(prompt.clone(), Arc::clone(&access));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            Arc::new(trust),
            Arc::clone(&access),
            dialog,
            Arc::new(StubTray { logged_in }),
            print.clone(),
        ));
        Harness {
            dispatcher,
            prompt,
            print,
            access,
        }
    }

    async fn send(
        harness: &Harness,
        id: ConnectionId,
        sink: &Arc<RecordingSink>,
        message: &str,
    ) {
        let sink: Arc<dyn ReplySink> = Arc::clone(sink) as Arc<dyn ReplySink>;
        if let Some(handle) = Arc::clone(&harness.dispatcher)
            .on_message(id, sink, message)
            .await
        {
            handle.await.unwrap();
        }
    }

    fn register_device(harness: &Harness, fingerprint: &str) {
        harness
            .access
            .register(RegistrationKind::Device, fingerprint, Some("test device"))
            .unwrap();
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, "").await;
        assert_eq!(sink.sent(), vec![r#"{"error":"Message is empty"}"#.to_owned()]);
    }

    #[tokio::test]
    async fn probe_elicits_fixed_reply() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, PROBE_REQUEST).await;
        assert_eq!(sink.sent(), vec![PROBE_RESPONSE.to_owned()]);
    }

    #[tokio::test]
    async fn keep_alive_elicits_no_reply() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, KEEP_ALIVE).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn setup_call_with_anchor_equal_certificate() {
        let h = harness(true, true, TrustStore::with_builtin_pem(ROOT_PEM).unwrap());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, Some("https://demo.example.com"));
        let sink = Arc::new(RecordingSink::default());

        let message = json!({"uid": "1", "certificate": ROOT_PEM}).to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(sink.sent(), vec![r#"{"uid":"1","result":null}"#.to_owned()]);
        let connection = h.dispatcher.connections().get(id).unwrap();
        assert!(connection.lock().unwrap().certificate().is_trusted());
    }

    #[tokio::test]
    async fn denied_setup_call_disconnects() {
        let h = harness(false, true, TrustStore::with_builtin_pem(ROOT_PEM).unwrap());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, Some("https://shady.example.com"));
        let sink = Arc::new(RecordingSink::default());

        let message = json!({"uid": "1", "certificate": SELFSIGNED_PEM}).to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"1","error":"Connection blocked by client"}"#.to_owned()]
        );
        assert!(sink.closed().is_some());

        // The certificate was still rebound, and it is not trusted.
        let connection = h.dispatcher.connections().get(id).unwrap();
        let conn = connection.lock().unwrap();
        assert!(!conn.certificate().is_unknown());
        assert!(!conn.certificate().is_trusted());
    }

    #[tokio::test]
    async fn self_signed_setup_then_print_blocked_pending_prompt() {
        let access = Arc::new(AccessRegistry::new(&AppConfig::default()));
        let prompt = Arc::new(ScriptedPrompt {
            answers: Mutex::new(vec![true, false]),
            calls: AtomicUsize::new(0),
        });
        let print = Arc::new(StubPrint::new());
        let dialog = DialogGate::new(prompt.clone(), Arc::clone(&access));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            Arc::new(TrustStore::with_builtin_pem(ROOT_PEM).unwrap()),
            Arc::clone(&access),
            dialog,
            Arc::new(StubTray { logged_in: true }),
            print.clone(),
        ));
        access
            .register(RegistrationKind::Device, "dev-1", None)
            .unwrap();

        let id = ConnectionId::new();
        dispatcher.on_connect(id, Some("https://standalone.example.com"));
        let sink = Arc::new(RecordingSink::default());

        // Setup with an unchained self-signed certificate; the user
        // approves the connection itself.
        let setup = json!({"uid": "1", "certificate": SELFSIGNED_PEM}).to_string();
        let dyn_sink: Arc<dyn ReplySink> = Arc::clone(&sink) as Arc<dyn ReplySink>;
        if let Some(handle) = Arc::clone(&dispatcher).on_message(id, dyn_sink, &setup).await {
            handle.await.unwrap();
        }
        assert_eq!(sink.sent(), vec![r#"{"uid":"1","result":null}"#.to_owned()]);

        // The bound certificate never validated.
        let connection = dispatcher.connections().get(id).unwrap();
        let cert = connection.lock().unwrap().certificate().clone();
        assert!(!cert.is_trusted());
        let mut request = RequestState::new(cert, json!({}));
        request.check_certificate_state();
        assert_eq!(request.status(), Validity::InvalidCert);

        // A fingerprint-required call on the same connection needs a fresh
        // decision; the user denies it.
        let message = json!({
            "uid": "2",
            "call": "print",
            "params": {
                "printer": {"name": "Office Laser"},
                "data": [{"deviceFingerprint": "dev-1"}]
            }
        })
        .to_string();
        let dyn_sink: Arc<dyn ReplySink> = Arc::clone(&sink) as Arc<dyn ReplySink>;
        if let Some(handle) = Arc::clone(&dispatcher).on_message(id, dyn_sink, &message).await {
            handle.await.unwrap();
        }

        assert_eq!(sink.sent()[1], r#"{"uid":"2","error":"Request blocked"}"#);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
        assert!(print.printed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fingerprint_required_call_blocked_pending_prompt() {
        let h = harness(false, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, Some("https://demo.example.com"));
        let sink = Arc::new(RecordingSink::default());
        register_device(&h, "dev-1");

        let message = json!({
            "uid": "9",
            "call": "print",
            "params": {
                "printer": {"name": "Office Laser"},
                "data": [{"deviceFingerprint": "dev-1"}]
            }
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"9","error":"Request blocked"}"#.to_owned()]
        );
        assert_eq!(h.prompt.calls.load(Ordering::SeqCst), 1);
        assert!(h.print.printed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn print_without_printer_is_rejected_before_side_effects() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());
        register_device(&h, "dev-1");

        let message = json!({
            "uid": "3",
            "call": "print",
            "params": {"data": [{"deviceFingerprint": "dev-1"}]}
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"3","error":"A printer must be specified before printing"}"#.to_owned()]
        );
        assert!(h.print.printed.lock().unwrap().is_empty());
        assert_eq!(h.prompt.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn print_without_device_fingerprint_is_unknown_client() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        let message = json!({
            "uid": "4",
            "call": "print",
            "params": {"printer": {"name": "Office Laser"}}
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"4","error":"UNKNOWN_CLIENT"}"#.to_owned()]
        );
    }

    #[tokio::test]
    async fn unregistered_device_fingerprint_is_rejected() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        let message = json!({
            "uid": "5",
            "call": "print",
            "params": {
                "printer": {"name": "Office Laser"},
                "data": [{"deviceFingerprint": "never-registered"}]
            }
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"5","error":"device fingerprint is not registered"}"#.to_owned()]
        );
    }

    #[tokio::test]
    async fn authorized_print_reaches_the_backend() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, Some("https://demo.example.com"));
        let sink = Arc::new(RecordingSink::default());
        register_device(&h, "dev-1");

        let message = json!({
            "uid": "6",
            "call": "print",
            "params": {
                "printer": {"name": "Office Laser"},
                "data": [{"deviceFingerprint": "dev-1"}]
            }
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(sink.sent(), vec![r#"{"uid":"6","result":null}"#.to_owned()]);
        assert_eq!(h.print.printed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_handler_becomes_an_error_reply() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, Some("https://demo.example.com"));
        let sink = Arc::new(RecordingSink::default());
        register_device(&h, "dev-1");

        let message = json!({
            "uid": "13",
            "call": "print",
            "params": {
                "printer": {"name": "Broken"},
                "data": [{"deviceFingerprint": "dev-1"}]
            }
        })
        .to_string();
        send(&h, id, &sink, &message).await;

        assert_eq!(
            sink.sent(),
            vec![
                r#"{"uid":"13","error":"malformed request: print data could not be rendered"}"#
                    .to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn get_version_works_while_logged_out() {
        let h = harness(true, false, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"uid": "7", "call": "getVersion"}).to_string()).await;
        let expected = format!(r#"{{"uid":"7","result":"{}"}}"#, env!("CARGO_PKG_VERSION"));
        assert_eq!(sink.sent(), vec![expected]);
    }

    #[tokio::test]
    async fn logged_out_operator_blocks_authed_calls() {
        let h = harness(true, false, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"uid": "8", "call": "printers.find"}).to_string()).await;
        assert_eq!(
            sink.sent(),
            vec![
                r#"{"uid":"8","error":"Authentication required. Please log in to use this feature."}"#
                    .to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn printers_find_by_query_and_listing() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(
            &h,
            id,
            &sink,
            &json!({"uid": "10", "call": "printers.find", "params": {"query": "Laser"}}).to_string(),
        )
        .await;
        send(
            &h,
            id,
            &sink,
            &json!({"uid": "11", "call": "printers.find", "params": {"query": "Inkjet"}}).to_string(),
        )
        .await;
        send(&h, id, &sink, &json!({"uid": "12", "call": "printers.find"}).to_string()).await;

        let sent = sink.sent();
        assert_eq!(sent[0], r#"{"uid":"10","result":"Office Laser"}"#);
        assert_eq!(sent[1], r#"{"uid":"11","error":"Specified printer could not be found."}"#);
        let listing: Value = serde_json::from_str(&sent[2]).unwrap();
        assert_eq!(listing["result"]["printers"], json!(["Office Laser", "Receipt-1"]));
        assert_eq!(listing["result"]["maxPrinters"], json!(5));
    }

    #[tokio::test]
    async fn status_listening_lifecycle() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"uid": "1", "call": "printers.getStatus"}).to_string()).await;
        send(&h, id, &sink, &json!({"uid": "2", "call": "printers.startListening"}).to_string())
            .await;
        send(&h, id, &sink, &json!({"uid": "3", "call": "printers.getStatus"}).to_string()).await;
        send(&h, id, &sink, &json!({"uid": "4", "call": "printers.stopListening"}).to_string())
            .await;

        assert_eq!(
            sink.sent(),
            vec![
                r#"{"uid":"1","error":"No printer listeners started for this client."}"#.to_owned(),
                r#"{"uid":"2","result":null}"#.to_owned(),
                r#"{"uid":"3","result":null}"#.to_owned(),
                r#"{"uid":"4","result":null}"#.to_owned(),
            ]
        );
        assert!(!h.print.is_listening(id));
    }

    #[tokio::test]
    async fn register_and_unregister_round_trip() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(
            &h,
            id,
            &sink,
            &json!({
                "uid": "1",
                "call": "fingerprint.registerDevice",
                "params": {"fingerprint": "dev-9", "name": "Kiosk"}
            })
            .to_string(),
        )
        .await;
        send(
            &h,
            id,
            &sink,
            &json!({
                "uid": "2",
                "call": "fingerprint.unregisterDevice",
                "params": {"fingerprint": "dev-9"}
            })
            .to_string(),
        )
        .await;
        send(
            &h,
            id,
            &sink,
            &json!({
                "uid": "3",
                "call": "fingerprint.unregisterDevice",
                "params": {"fingerprint": "dev-9"}
            })
            .to_string(),
        )
        .await;
        send(
            &h,
            id,
            &sink,
            &json!({"uid": "4", "call": "fingerprint.registerPrinter", "params": {}}).to_string(),
        )
        .await;

        assert_eq!(
            sink.sent(),
            vec![
                r#"{"uid":"1","result":true}"#.to_owned(),
                r#"{"uid":"2","result":true}"#.to_owned(),
                r#"{"uid":"3","result":"Device not found or already unregistered"}"#.to_owned(),
                r#"{"uid":"4","error":"Printer fingerprint is required"}"#.to_owned(),
            ]
        );
        assert_eq!(h.access.count(RegistrationKind::Device), 0);
    }

    #[tokio::test]
    async fn unknown_call_with_uid_gets_error_reply() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"uid": "1", "call": "hid.openDevice"}).to_string()).await;
        assert_eq!(
            sink.sent(),
            vec![r#"{"uid":"1","error":"Invalid function call: hid.openDevice"}"#.to_owned()]
        );
        assert!(sink.closed().is_none());
    }

    #[tokio::test]
    async fn unknown_call_without_uid_closes_the_connection() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"call": "hid.openDevice"}).to_string()).await;
        assert!(sink.sent().is_empty());
        assert_eq!(
            sink.closed(),
            Some((CLOSE_INCOMPATIBLE, "Connected to incompatible Printgate version".to_owned()))
        );
    }

    #[tokio::test]
    async fn listeners_hear_dispatched_calls() {
        let h = harness(true, true, TrustStore::empty());
        let listener = Arc::new(CountingListener {
            calls: Mutex::new(Vec::new()),
        });
        h.dispatcher.add_message_processed_listener(listener.clone());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, KEEP_ALIVE).await;
        send(&h, id, &sink, &json!({"uid": "1", "call": "getVersion"}).to_string()).await;
        send(&h, id, &sink, &json!({"uid": "2", "call": "hid.openDevice"}).to_string()).await;

        assert_eq!(*listener.calls.lock().unwrap(), vec!["getVersion".to_owned()]);
    }

    #[tokio::test]
    async fn registrations_reach_the_trust_log() {
        let audit = Arc::new(TrustAudit::open_in_memory().unwrap());
        let access = Arc::new(AccessRegistry::new(&AppConfig::default()));
        let prompt = Arc::new(FixedPrompt {
            allow: true,
            calls: AtomicUsize::new(0),
        });
        let dialog = DialogGate::new(prompt, Arc::clone(&access));
        let dispatcher = Arc::new(
            ProtocolDispatcher::new(
                Arc::new(TrustStore::empty()),
                Arc::clone(&access),
                dialog,
                Arc::new(StubTray { logged_in: true }),
                Arc::new(StubPrint::new()),
            )
            .with_audit(Arc::clone(&audit)),
        );
        let id = ConnectionId::new();
        dispatcher.on_connect(id, None);
        let sink: Arc<dyn ReplySink> = Arc::new(RecordingSink::default());

        let message = json!({
            "uid": "1",
            "call": "fingerprint.registerDevice",
            "params": {"fingerprint": "dev-1"}
        })
        .to_string();
        if let Some(handle) = Arc::clone(&dispatcher).on_message(id, sink, &message).await {
            handle.await.unwrap();
        }

        let entries = audit.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "register");
        assert_eq!(entries[0].subject, "dev-1");
        assert!(entries[0].allowed);
        assert_eq!(entries[0].details.as_deref(), Some("device"));
    }

    #[tokio::test]
    async fn close_releases_listening_state() {
        let h = harness(true, true, TrustStore::empty());
        let id = ConnectionId::new();
        h.dispatcher.on_connect(id, None);
        let sink = Arc::new(RecordingSink::default());

        send(&h, id, &sink, &json!({"uid": "1", "call": "printers.startListening"}).to_string())
            .await;
        assert!(h.print.is_listening(id));

        h.dispatcher.on_close(id);
        assert!(!h.print.is_listening(id));
        assert!(h.dispatcher.connections().is_empty());
    }

    #[test]
    fn cleanup_strips_signature_from_unsigned_calls() {
        let mut message = json!({
            "call": "getVersion",
            "promise": {},
            "signature": "abc",
            "signAlgorithm": "SHA512"
        });
        cleanup_message(&mut message);
        assert_eq!(message, json!({"call": "getVersion"}));

        let mut print = json!({"call": "print", "signature": "abc", "promise": {}});
        cleanup_message(&mut print);
        assert_eq!(print, json!({"call": "print", "signature": "abc"}));
    }

    fn client_sign(data: &str) -> String {
        use base64::Engine;
        use ring::rand::SystemRandom;
        use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};

        let key_pair = RsaKeyPair::from_pkcs8(LEAF_KEY_PK8).expect("key load failed");
        let digest_hex = hex::encode(Sha256::digest(data.as_bytes()));
        let mut signature = vec![0; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                digest_hex.as_bytes(),
                &mut signature,
            )
            .expect("signing failed");
        base64::engine::general_purpose::STANDARD.encode(&signature)
    }

    #[test]
    fn signature_verdict_checks_freshness_then_signature() {
        let cert = Certificate::parse(LEAF_PEM).unwrap();
        let now = Utc::now().timestamp_millis();

        let mut message = json!({
            "call": "print",
            "params": {"printer": {"name": "Office Laser"}},
            "timestamp": now,
            "signAlgorithm": "SHA256"
        });
        let signature = client_sign(&canonical_payload(&message));
        message["signature"] = json!(signature);
        assert_eq!(signature_verdict(&cert, &message), Validity::Trusted);

        // Stale timestamp loses even with a valid signature.
        let mut stale = message.clone();
        stale["timestamp"] = json!(now - VALID_SIGNING_PERIOD_MS - 1000);
        assert_eq!(signature_verdict(&cert, &stale), Validity::Expired);

        let mut future = message.clone();
        future["timestamp"] = json!(now + VALID_SIGNING_PERIOD_MS + 1000);
        assert_eq!(signature_verdict(&cert, &future), Validity::Expired);

        let mut tampered = message.clone();
        tampered["params"]["printer"]["name"] = json!("Another Printer");
        assert_eq!(signature_verdict(&cert, &tampered), Validity::Unsigned);

        let mut unsigned = message.clone();
        unsigned["signature"] = json!("");
        assert_eq!(signature_verdict(&cert, &unsigned), Validity::Unsigned);

        let mut unsupported = message;
        unsupported["signAlgorithm"] = json!("MD5");
        assert_eq!(signature_verdict(&cert, &unsupported), Validity::Unsigned);
    }

    #[test]
    fn extreme_timestamps_are_expired() {
        let cert = Certificate::parse(LEAF_PEM).unwrap();
        for timestamp in [i64::MAX, i64::MIN] {
            let message = json!({"call": "print", "timestamp": timestamp});
            assert_eq!(signature_verdict(&cert, &message), Validity::Expired);
        }
    }
}
