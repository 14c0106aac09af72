//! In-memory / no-op collaborator implementations, used by the test suite
//! and by the `mta-deliver` demo binary. None of this is meant to stand
//! in for a production queue or route manager — it is a harness.

use super::queue::{ContentHandle, QueueHandle};
use super::route::{Relay, Route, RouteManager};
use super::tls_authority::{CertAuthority, CertMaterial, VerifyOutcome};
use crate::error::{MtaError, Result};
use crate::smtp::task::{Task, Verdict};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// A queue backed by an in-memory map of message bytes, and a log of the
/// verdicts it was handed back.
pub struct InMemoryQueue {
    content: HashMap<Uuid, Vec<u8>>,
    pub reports: AsyncMutex<Vec<(Uuid, Uuid, Verdict, String)>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            content: HashMap::new(),
            reports: AsyncMutex::new(Vec::new()),
        }
    }

    pub fn with_message(mut self, message_id: Uuid, body: Vec<u8>) -> Self {
        self.content.insert(message_id, body);
        self
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueHandle for InMemoryQueue {
    async fn open_content(&self, message_id: Uuid) -> Result<ContentHandle> {
        let bytes = self
            .content
            .get(&message_id)
            .cloned()
            .ok_or_else(|| MtaError::Collaborator("queue", format!("no content for {}", message_id)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn report(
        &self,
        message_id: Uuid,
        envelope_id: Uuid,
        verdict: Verdict,
        error_text: &str,
    ) -> Result<()> {
        self.reports
            .lock()
            .await
            .push((message_id, envelope_id, verdict, error_text.to_string()));
        Ok(())
    }
}

/// A route manager that hands out tasks from a fixed list, one per call,
/// and records `route_ok`/`route_error`/`source_error` notifications for
/// assertions in tests.
pub struct OneShotRouteManager {
    tasks: Mutex<Vec<Task>>,
    pub events: Mutex<Vec<String>>,
}

impl OneShotRouteManager {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl RouteManager for OneShotRouteManager {
    fn next_task(&self, _relay: &Relay, _route: &Route) -> Option<Task> {
        self.tasks.lock().expect("lock poisoned").pop()
    }

    fn route_ok(&self, _relay: &Relay, _route: &Route) {
        self.events.lock().expect("lock poisoned").push("route_ok".to_string());
    }

    fn route_error(&self, _relay: &Relay, _route: &Route, message: &str) {
        self.events
            .lock()
            .expect("lock poisoned")
            .push(format!("route_error: {}", message));
    }

    fn source_error(&self, _relay: &Relay, _route: &Route, message: &str) {
        self.events
            .lock()
            .expect("lock poisoned")
            .push(format!("source_error: {}", message));
    }

    fn route_collect(&self, _relay: &Relay, _route: &Route) {
        self.events.lock().expect("lock poisoned").push("route_collect".to_string());
    }
}

/// A CA helper that never has a client certificate and always trusts the
/// peer. Fine for cleartext/opportunistic-TLS tests; tests exercising
/// `ForceTls`+verification supply their own fake.
pub struct NullCertAuthority;

#[async_trait]
impl CertAuthority for NullCertAuthority {
    async fn init_cert(&self, name: &str) -> Result<CertMaterial> {
        Err(MtaError::Collaborator("ca", format!("no certificate named {}", name)))
    }

    async fn verify_peer(&self, _leaf_der: Vec<u8>, _chain_der: Vec<Vec<u8>>) -> Result<VerifyOutcome> {
        Ok(VerifyOutcome { verified: true })
    }
}

/// A PTR resolver that always returns the same canned name (or none).
pub struct StaticPtrResolver(pub Option<String>);

#[async_trait]
impl super::PtrResolver for StaticPtrResolver {
    async fn resolve_ptr(&self, _addr: IpAddr) -> Option<String> {
        self.0.clone()
    }
}
