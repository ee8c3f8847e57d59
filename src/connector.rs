//! Bot connectors
//!
//! A connector carries one test session to the bot under test: it starts a
//! session, sends user messages and yields the bot's messages in order.

pub mod hooks;
pub mod rate_limit;
pub mod request;
pub mod response;
mod simple_rest;
pub mod state;

pub use hooks::{CustomHook, CustomHookEvent, HookRegistry, LifecycleHook, RequestHook, ResponseHook};
pub use rate_limit::RateLimiter;
pub use simple_rest::{SimpleRestBuilder, SimpleRestConnector};
pub use state::{ConnectorPhase, PhaseError};

use crate::convo::{BotMsg, MeMsg};
use crate::error::TestResult;
use async_trait::async_trait;
use std::time::Duration;

/// One bot session
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the session. Fails at most once; a failed connector stays failed.
    async fn start(&mut self) -> TestResult<()>;

    /// Send one user message
    async fn user_says(&mut self, msg: MeMsg) -> TestResult<()>;

    /// Next bot message, in arrival order
    async fn wait_bot_says(&mut self, timeout: Duration) -> TestResult<BotMsg>;

    /// Close the session. Never fails; problems are logged.
    async fn stop(&mut self);

    /// Health check, usable before `start`
    async fn ping(&self) -> TestResult<()>;

    fn phase(&self) -> ConnectorPhase;
}

/// Logging wrapper for connectors
pub struct LoggingConnector {
    inner: Box<dyn Connector>,
    session: String,
}

impl LoggingConnector {
    pub fn new(inner: Box<dyn Connector>, session: impl Into<String>) -> Self {
        Self {
            inner,
            session: session.into(),
        }
    }
}

#[async_trait]
impl Connector for LoggingConnector {
    async fn start(&mut self) -> TestResult<()> {
        let start = std::time::Instant::now();
        let result = self.inner.start().await;
        let duration = start.elapsed();

        match &result {
            Ok(()) => tracing::info!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                "Connector started"
            ),
            Err(e) => tracing::error!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                error = %e.message,
                kind = ?e.kind,
                "Connector start failed"
            ),
        }
        result
    }

    async fn user_says(&mut self, msg: MeMsg) -> TestResult<()> {
        let text = msg.message_text.clone().unwrap_or_default();
        let start = std::time::Instant::now();
        let result = self.inner.user_says(msg).await;
        let duration = start.elapsed();

        match &result {
            Ok(()) => tracing::info!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                text = %text,
                "User message sent"
            ),
            Err(e) => tracing::error!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                error = %e.message,
                retryable = e.kind.is_retryable(),
                "User message failed"
            ),
        }
        result
    }

    async fn wait_bot_says(&mut self, timeout: Duration) -> TestResult<BotMsg> {
        let start = std::time::Instant::now();
        let result = self.inner.wait_bot_says(timeout).await;
        let duration = start.elapsed();

        match &result {
            Ok(msg) => tracing::info!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                text = msg.message_text.as_deref().unwrap_or(""),
                buttons = msg.buttons.len(),
                media = msg.media.len(),
                "Bot message received"
            ),
            Err(e) => tracing::warn!(
                session = %self.session,
                duration_ms = %duration.as_millis(),
                error = %e.message,
                "No bot message"
            ),
        }
        result
    }

    async fn stop(&mut self) {
        let start = std::time::Instant::now();
        self.inner.stop().await;
        tracing::info!(
            session = %self.session,
            duration_ms = %start.elapsed().as_millis(),
            "Connector stopped"
        );
    }

    async fn ping(&self) -> TestResult<()> {
        let result = self.inner.ping().await;
        if let Err(e) = &result {
            tracing::warn!(session = %self.session, error = %e.message, "Ping failed");
        }
        result
    }

    fn phase(&self) -> ConnectorPhase {
        self.inner.phase()
    }
}
