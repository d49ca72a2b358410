// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Live-session bookkeeping: each transport session binds exactly one
// certificate (the anonymous sentinel until one is presented) and at most
// one declared origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use printgate_auth::Certificate;
use printgate_core::types::ConnectionId;
use tracing::{debug, info, warn};

use crate::hooks::DeviceListener;

/// State bound to one live transport session.
pub struct Connection {
    certificate: Certificate,
    origin: Option<String>,
    device_listener: Option<Box<dyn DeviceListener>>,
}

impl Connection {
    /// New sessions are anonymous until they present a certificate.
    pub fn new(origin: Option<String>) -> Self {
        Self {
            certificate: Certificate::unknown(),
            origin,
            device_listener: None,
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Rebind the session to a freshly presented certificate. Last
    /// certificate wins; no credential history is kept.
    pub fn set_certificate(&mut self, certificate: Certificate) {
        self.certificate = certificate;
    }

    /// The bare hostname declared in the transport handshake, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn is_device_listening(&self) -> bool {
        self.device_listener.is_some()
    }

    pub fn start_device_listening(&mut self, listener: Box<dyn DeviceListener>) {
        self.device_listener = Some(listener);
    }

    pub fn stop_device_listening(&mut self) {
        if let Some(listener) = self.device_listener.take() {
            listener.close();
        }
    }

    /// Release everything held on behalf of the session.
    pub fn disconnect(&mut self) {
        debug!(cn = self.certificate.common_name(), "closing connection resources");
        self.stop_device_listening();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("certificate", &self.certificate.fingerprint())
            .field("origin", &self.origin)
            .field("device_listening", &self.device_listener.is_some())
            .finish()
    }
}

/// Map of live sessions. Connect and close mutate; dispatch reads.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Arc<Mutex<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened session. The origin, when present, has
    /// already been reduced to a bare hostname.
    pub fn connect(&self, id: ConnectionId, origin: Option<String>) -> Arc<Mutex<Connection>> {
        let connection = Arc::new(Mutex::new(Connection::new(origin)));
        let mut map = self.inner.write().expect("connection map poisoned");
        if map.insert(id, Arc::clone(&connection)).is_some() {
            warn!(%id, "replacing existing connection entry");
        }
        info!(%id, total = map.len(), "connection opened");
        connection
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Mutex<Connection>>> {
        let map = self.inner.read().expect("connection map poisoned");
        map.get(&id).cloned()
    }

    /// Remove a closed session and release its resources.
    pub fn close(&self, id: ConnectionId) {
        let removed = {
            let mut map = self.inner.write().expect("connection map poisoned");
            let removed = map.remove(&id);
            info!(%id, remaining = map.len(), "connection closed");
            removed
        };
        match removed {
            Some(connection) => {
                let mut conn = connection.lock().expect("connection poisoned");
                conn.disconnect();
            }
            None => warn!(%id, "no connection found during close"),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("connection map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagListener(Arc<AtomicBool>);

    impl DeviceListener for FlagListener {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn new_connection_is_anonymous() {
        let conn = Connection::new(Some("demo.example.com".into()));
        assert!(conn.certificate().is_unknown());
        assert_eq!(conn.origin(), Some("demo.example.com"));
        assert!(!conn.is_device_listening());
    }

    #[test]
    fn rebinding_discards_prior_certificate() {
        let mut conn = Connection::new(None);
        let mut saved = std::collections::HashMap::new();
        saved.insert("fingerprint".to_owned(), "b".repeat(40));
        saved.insert("commonName".to_owned(), "a.example.com".to_owned());
        conn.set_certificate(Certificate::from_saved(&saved));
        assert_eq!(conn.certificate().fingerprint(), "b".repeat(40));

        conn.set_certificate(Certificate::unknown());
        assert!(conn.certificate().is_unknown());
    }

    #[test]
    fn close_releases_device_listener() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let closed = Arc::new(AtomicBool::new(false));

        let conn = registry.connect(id, None);
        conn.lock()
            .unwrap()
            .start_device_listening(Box::new(FlagListener(Arc::clone(&closed))));
        assert_eq!(registry.len(), 1);

        registry.close(id);
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn close_of_unknown_id_is_harmless() {
        let registry = ConnectionRegistry::new();
        registry.close(ConnectionId::new());
        assert!(registry.is_empty());
    }
}
