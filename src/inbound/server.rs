//! Webhook endpoint feeding the inbound hub

use super::InboundHub;
use crate::capabilities::{Capabilities, Capability};
use crate::error::{TestError, TestResult};
use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Create the webhook router: `POST <endpoint>` with a JSON payload
pub fn create_router(hub: InboundHub, endpoint: &str) -> Router {
    let endpoint = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };
    Router::new()
        .route(&endpoint, post(receive_event))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn receive_event(State(hub): State<InboundHub>, Json(payload): Json<Value>) -> Json<Value> {
    let accepted = hub.accept(&payload);
    tracing::debug!(accepted, "Inbound event received");
    Json(json!({ "accepted": accepted }))
}

/// Running webhook server
#[derive(Debug)]
pub struct InboundServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl InboundServer {
    /// Start the server if `SIMPLEREST_INBOUND_PORT` is configured
    pub async fn from_caps(hub: InboundHub, caps: &Capabilities) -> TestResult<Option<Self>> {
        let Some(port) = caps.get_u64(Capability::SIMPLEREST_INBOUND_PORT)? else {
            return Ok(None);
        };
        let port = u16::try_from(port).map_err(|_| {
            TestError::configuration(format!("SIMPLEREST_INBOUND_PORT {port} out of range"))
        })?;
        let endpoint = caps
            .get_str(Capability::SIMPLEREST_INBOUND_ENDPOINT)
            .unwrap_or_else(|| "/".to_string());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Self::bind(hub, addr, &endpoint).await.map(Some)
    }

    pub async fn bind(hub: InboundHub, addr: SocketAddr, endpoint: &str) -> TestResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TestError::configuration(format!("Cannot bind inbound port {addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TestError::configuration(format!("Inbound listener has no address: {e}")))?;
        let router = create_router(hub, endpoint);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tracing::info!(%addr, endpoint, "Inbound webhook listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Inbound webhook server failed");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Inbound webhook task ended abnormally");
        }
    }
}
