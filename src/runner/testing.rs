//! Mock connector for runner tests

use crate::connector::state::{transition, PhaseEffect, PhaseEvent};
use crate::connector::{Connector, ConnectorPhase};
use crate::convo::{BotMsg, MeMsg};
use crate::error::{TestError, TestResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Connector answering from a queue of canned bot messages
pub struct MockConnector {
    replies: Mutex<VecDeque<BotMsg>>,
    /// Record of all user messages
    sent: Mutex<Vec<MeMsg>>,
    start_error: Option<TestError>,
    start_delay: Option<Duration>,
    phase: ConnectorPhase,
    stop_calls: usize,
    stop_requests: usize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            start_error: None,
            start_delay: None,
            phase: ConnectorPhase::New,
            stop_calls: 0,
            stop_requests: 0,
        }
    }

    /// Make `start` fail with the given error
    pub fn failing_start(mut self, error: TestError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Make `start` take this long before succeeding
    pub fn slow_start(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn queue_reply(&self, msg: BotMsg) {
        self.replies.lock().unwrap().push_back(msg);
    }

    pub fn sent(&self) -> Vec<MeMsg> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| m.message_text)
            .collect()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls
    }

    /// How many stops reached the bot, as opposed to only releasing the session
    pub fn stop_requests(&self) -> usize {
        self.stop_requests
    }

    fn advance(&mut self, event: PhaseEvent) -> TestResult<()> {
        let result = transition(self.phase, event).map_err(|e| TestError::configuration(e.to_string()))?;
        self.phase = result.phase;
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn start(&mut self) -> TestResult<()> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.start_error.clone() {
            self.advance(PhaseEvent::StartFailed)?;
            return Err(error);
        }
        self.advance(PhaseEvent::StartSucceeded)
    }

    async fn user_says(&mut self, msg: MeMsg) -> TestResult<()> {
        self.advance(PhaseEvent::Sent)?;
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    async fn wait_bot_says(&mut self, timeout: Duration) -> TestResult<BotMsg> {
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(msg) => Ok(msg),
            None => {
                tokio::time::sleep(timeout).await;
                Err(TestError::timeout(format!(
                    "Bot did not respond within {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn stop(&mut self) {
        self.stop_calls += 1;
        if let Ok(result) = transition(self.phase, PhaseEvent::StopRequested) {
            self.phase = result.phase;
            if result.effects.contains(&PhaseEffect::RunStopRequest) {
                self.stop_requests += 1;
            }
        }
    }

    async fn ping(&self) -> TestResult<()> {
        Ok(())
    }

    fn phase(&self) -> ConnectorPhase {
        self.phase
    }
}
