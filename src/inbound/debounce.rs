//! Per-session debounce and ordering of inbound events

use crate::capabilities::{Capabilities, Capability};
use crate::error::TestResult;
use crate::json_query::JsonQuery;
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_WINDOW: Duration = Duration::from_millis(500);

/// Ordering key of an event: numbers first (numerically), then strings
/// (lexically), then events without a key
#[derive(Debug, Clone)]
pub enum OrderKey {
    Number(f64),
    Text(String),
    Missing,
}

impl OrderKey {
    pub fn of(order_by: &JsonQuery, event: &Value) -> Self {
        match order_by.first(event) {
            Some(Value::Number(n)) => n.as_f64().map_or(Self::Missing, Self::Number),
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Self::Number(n),
                _ => Self::Text(s.clone()),
            },
            Some(Value::Null) | None => Self::Missing,
            Some(other) => Self::Text(other.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Text(_) => 1,
            Self::Missing => 2,
        }
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

/// Stable sort by ordering key: ties keep arrival order
pub fn sort_events(order_by: &JsonQuery, events: Vec<Value>) -> Vec<Value> {
    let mut keyed: Vec<(OrderKey, Value)> = events
        .into_iter()
        .map(|event| (OrderKey::of(order_by, &event), event))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, event)| event).collect()
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    order_by: Option<JsonQuery>,
}

impl Debouncer {
    pub fn new(window: Duration, order_by: Option<JsonQuery>) -> Self {
        Self { window, order_by }
    }

    pub fn from_caps(caps: &Capabilities) -> TestResult<Self> {
        let window = caps
            .get_millis(Capability::SIMPLEREST_INBOUND_DEBOUNCE_TIMEOUT)?
            .unwrap_or(DEFAULT_WINDOW);
        let order_by = caps
            .get_str(Capability::SIMPLEREST_INBOUND_ORDER_UNSETTLED_EVENTS_JSONPATH)
            .map(|path| JsonQuery::parse(&path))
            .transpose()?;
        Ok(Self::new(window, order_by))
    }

    /// Run until the input closes or `cancel` fires, forwarding events to `deliver`
    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<Value>,
        deliver: mpsc::UnboundedSender<Value>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            match &self.order_by {
                Some(order_by) => self.debounce(order_by, events, &deliver, &cancel).await,
                None => forward(events, &deliver, &cancel).await,
            }
        })
    }

    async fn debounce(
        &self,
        order_by: &JsonQuery,
        mut events: mpsc::UnboundedReceiver<Value>,
        deliver: &mpsc::UnboundedSender<Value>,
        cancel: &CancellationToken,
    ) {
        let mut buffer: Vec<Value> = Vec::new();
        loop {
            if buffer.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => buffer.push(event),
                        None => return,
                    },
                }
                continue;
            }

            // A fresh sleep per iteration: every arrival restarts the window
            tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => buffer.push(event),
                    None => {
                        flush(order_by, std::mem::take(&mut buffer), deliver);
                        return;
                    }
                },
                () = tokio::time::sleep(self.window) => {
                    if !flush(order_by, std::mem::take(&mut buffer), deliver) {
                        return;
                    }
                }
            }
        }
    }
}

/// Deliver a settled batch in key order; false if the consumer is gone
fn flush(order_by: &JsonQuery, batch: Vec<Value>, deliver: &mpsc::UnboundedSender<Value>) -> bool {
    tracing::debug!(events = batch.len(), "Delivering settled inbound events");
    sort_events(order_by, batch)
        .into_iter()
        .all(|event| deliver.send(event).is_ok())
}

async fn forward(
    mut events: mpsc::UnboundedReceiver<Value>,
    deliver: &mpsc::UnboundedSender<Value>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => {
                    if deliver.send(event).is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
