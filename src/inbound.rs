//! Inbound (webhook) bot responses
//!
//! Payloads pushed by the bot arrive at a shared `InboundHub`, are routed to
//! the sessions whose selector matches, and pass through a per-session
//! `Debouncer` before the connector turns them into bot messages.

mod debounce;
pub mod server;

pub use debounce::{sort_events, Debouncer, OrderKey};
pub use server::InboundServer;

use crate::error::{TestError, TestResult};
use crate::json_query::JsonQuery;
use crate::template::value_to_text;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Correlates a payload with one session: JSONPath plus expected value
#[derive(Debug, Clone)]
pub struct InboundSelector {
    query: JsonQuery,
    value: String,
}

impl InboundSelector {
    pub fn new(path: &str, value: impl Into<String>) -> TestResult<Self> {
        Ok(Self {
            query: JsonQuery::parse(path)?,
            value: value.into(),
        })
    }

    /// True if any selected node equals the expected value
    pub fn matches(&self, payload: &Value) -> bool {
        self.query
            .query(payload)
            .into_iter()
            .any(|node| value_to_text(node) == self.value)
    }
}

struct Route {
    selector: Option<InboundSelector>,
    sink: mpsc::UnboundedSender<Value>,
}

/// Session registry shared by the webhook server and all connectors
#[derive(Clone, Default)]
pub struct InboundHub {
    routes: Arc<Mutex<HashMap<u64, Route>>>,
    next_id: Arc<AtomicU64>,
}

impl InboundHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// A session without a selector receives every payload, so it must be
    /// the only session on the hub.
    pub fn register(&self, selector: Option<InboundSelector>) -> TestResult<InboundSubscription> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let catch_all_present = routes.values().any(|route| route.selector.is_none());
        if catch_all_present || (selector.is_none() && !routes.is_empty()) {
            return Err(TestError::configuration(
                "Inbound sessions sharing one endpoint need SIMPLEREST_INBOUND_SELECTOR_JSONPATH",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, events) = mpsc::unbounded_channel();
        routes.insert(id, Route { selector, sink });
        drop(routes);
        tracing::debug!(route_id = id, "Inbound session registered");
        Ok(InboundSubscription {
            events,
            registration: InboundRegistration {
                hub: self.clone(),
                id,
            },
        })
    }

    /// Forward a payload to every matching session; returns how many accepted it
    pub fn accept(&self, payload: &Value) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut accepted = 0;
        for route in routes.values() {
            let selected = route.selector.as_ref().map_or(true, |s| s.matches(payload));
            if selected && route.sink.send(payload.clone()).is_ok() {
                accepted += 1;
            }
        }
        if accepted == 0 {
            tracing::debug!(sessions = routes.len(), "Inbound payload matched no session");
        }
        accepted
    }

    pub fn session_count(&self) -> usize {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn unregister(&self, id: u64) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        tracing::debug!(route_id = id, "Inbound session unregistered");
    }
}

impl fmt::Debug for InboundHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundHub")
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Receiving end of a registration
#[derive(Debug)]
pub struct InboundSubscription {
    pub events: mpsc::UnboundedReceiver<Value>,
    pub registration: InboundRegistration,
}

/// Removes the session from the hub when dropped
#[derive(Debug)]
pub struct InboundRegistration {
    hub: InboundHub,
    id: u64,
}

impl Drop for InboundRegistration {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
