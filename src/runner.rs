//! Convo runner
//!
//! Drives one connector session through a convo, step by step: `me` steps
//! become user messages, `bot` steps wait for the next bot message and check
//! it. The connector is always stopped, whatever the outcome.

#[cfg(test)]
pub mod testing;

use crate::capabilities::Capabilities;
use crate::connector::Connector;
use crate::convo::{BotMsg, Convo, ConvoStep, MeMsg, Sender};
use crate::error::{TestError, TestResult};
use crate::scripting::{ScriptingRegistry, ScriptingSession};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One message exchanged during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub step_tag: String,
    pub sender: Sender,
    pub message_text: Option<String>,
}

/// Result of running one convo
#[derive(Debug)]
pub struct ConvoOutcome {
    pub convo: String,
    pub started_at: DateTime<Utc>,
    pub transcript: Vec<TranscriptEntry>,
    pub error: Option<TestError>,
    pub duration: Duration,
}

impl ConvoOutcome {
    /// Outcome of a convo that could not be set up
    pub fn failed(convo: impl Into<String>, error: TestError) -> Self {
        Self {
            convo: convo.into(),
            started_at: Utc::now(),
            transcript: Vec::new(),
            error: Some(error),
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Report entry: name, verdict, timing, transcript and failure
    pub fn summary(&self) -> Value {
        json!({
            "convo": self.convo,
            "success": self.is_success(),
            "startedAt": self.started_at.to_rfc3339(),
            "durationMs": u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            "transcript": self.transcript,
            "error": self.error.as_ref().map(|e| json!({
                "kind": e.kind,
                "message": e.message,
                "context": e.context(),
            })),
        })
    }
}

pub struct ConvoRunner {
    scripting: ScriptingSession,
    wait_timeout: Duration,
    cancel: CancellationToken,
}

impl ConvoRunner {
    pub fn new(scripting: ScriptingSession, wait_timeout: Duration) -> Self {
        Self {
            scripting,
            wait_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Runner with the built-in components plus those configured in `caps`
    pub fn from_caps(registry: &ScriptingRegistry, caps: Arc<Capabilities>) -> TestResult<Self> {
        let wait_timeout = caps.wait_for_bot_timeout()?;
        let scripting = ScriptingSession::build(registry, caps)?;
        Ok(Self::new(scripting, wait_timeout))
    }

    /// Abort the run when `cancel` fires
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the convo to its end, first failure, or cancellation.
    ///
    /// A cancellation that lands while `start()` is still pending leaves the
    /// connector in `New`, so the final `stop()` only releases local
    /// resources and no stop request reaches the bot.
    pub async fn run(&self, convo: &Convo, connector: &mut dyn Connector) -> ConvoOutcome {
        let convo = convo.clone().with_default_step_tags();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut transcript = Vec::new();

        tracing::info!(convo = %convo.name, steps = convo.steps.len(), "Running convo");
        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(TestError::cancelled(format!(
                "Convo \"{}\" cancelled",
                convo.name
            ))),
            result = self.drive(&convo, &mut *connector, &mut transcript) => result,
        };
        connector.stop().await;

        let duration = started.elapsed();
        match &result {
            Ok(()) => tracing::info!(
                convo = %convo.name,
                duration_ms = %duration.as_millis(),
                "Convo passed"
            ),
            Err(e) => tracing::error!(
                convo = %convo.name,
                duration_ms = %duration.as_millis(),
                kind = ?e.kind,
                error = %e.message,
                "Convo failed"
            ),
        }

        ConvoOutcome {
            convo: convo.name,
            started_at,
            transcript,
            error: result.err(),
            duration,
        }
    }

    async fn drive(
        &self,
        convo: &Convo,
        connector: &mut dyn Connector,
        transcript: &mut Vec<TranscriptEntry>,
    ) -> TestResult<()> {
        connector.start().await?;
        for step in &convo.steps {
            match step.sender {
                Sender::Me => {
                    let msg = self.me_step(step, connector).await?;
                    transcript.push(TranscriptEntry {
                        step_tag: step.step_tag.clone(),
                        sender: Sender::Me,
                        message_text: msg.message_text,
                    });
                }
                Sender::Bot => {
                    let bot_msg = connector
                        .wait_bot_says(self.wait_timeout)
                        .await
                        .map_err(|e| e.tagged(&step.step_tag))?;
                    transcript.push(TranscriptEntry {
                        step_tag: step.step_tag.clone(),
                        sender: Sender::Bot,
                        message_text: bot_msg.message_text.clone(),
                    });
                    self.bot_step(step, &bot_msg).await?;
                }
            }
        }
        Ok(())
    }

    /// Build and send the user message; returns what was sent
    async fn me_step(&self, step: &ConvoStep, connector: &mut dyn Connector) -> TestResult<MeMsg> {
        let mut msg = MeMsg {
            message_text: step.message_text.clone(),
            ..MeMsg::default()
        };
        self.scripting.apply_user_inputs(step, &mut msg).await?;
        self.scripting.run_me_hooks(step, &mut msg).await?;
        connector
            .user_says(msg.clone())
            .await
            .map_err(|e| e.tagged(&step.step_tag))?;
        Ok(msg)
    }

    async fn bot_step(&self, step: &ConvoStep, bot_msg: &BotMsg) -> TestResult<()> {
        if let Some(expected) = step.message_text.as_deref().filter(|t| !t.is_empty()) {
            let actual = bot_msg.message_text.as_deref().unwrap_or("");
            self.scripting
                .matcher()
                .check(actual, expected, step.not, "Bot response")
                .map_err(|e| e.tagged(&step.step_tag))?;
        }
        self.scripting.run_asserters(step, bot_msg).await?;
        self.scripting.run_bot_hooks(step, bot_msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockConnector;
    use super::*;
    use crate::capabilities::Capability;
    use crate::connector::ConnectorPhase;
    use crate::convo::StepRef;
    use crate::error::TestErrorKind;

    fn runner(caps: Capabilities) -> ConvoRunner {
        ConvoRunner::from_caps(&ScriptingRegistry::builtin(), Arc::new(caps)).unwrap()
    }

    fn greeting() -> Convo {
        Convo::new(
            "greeting",
            vec![
                ConvoStep::me("hello"),
                ConvoStep::bot().expecting("Hi there"),
            ],
        )
    }

    #[tokio::test]
    async fn test_passing_convo() {
        let mut connector = MockConnector::new();
        connector.queue_reply(BotMsg::text("Hi there, how can I help?"));

        let outcome = runner(Capabilities::new()).run(&greeting(), &mut connector).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(connector.sent_texts(), vec!["hello"]);
        assert_eq!(outcome.transcript.len(), 2);
        assert_eq!(outcome.transcript[0].step_tag, "#1");
        assert_eq!(connector.phase(), ConnectorPhase::Stopped);

        let summary = outcome.summary();
        assert_eq!(summary["success"], true);
        assert_eq!(summary["transcript"][1]["sender"], "bot");
    }

    #[tokio::test]
    async fn test_text_mismatch_is_tagged_assertion() {
        let mut connector = MockConnector::new();
        connector.queue_reply(BotMsg::text("Goodbye"));

        let outcome = runner(Capabilities::new()).run(&greeting(), &mut connector).await;
        assert_eq!(outcome.summary()["error"]["context"]["cause"]["actual"], "Goodbye");
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, TestErrorKind::Assertion);
        assert!(err.message.starts_with("#2: Bot response \"Goodbye\""));
        assert_eq!(err.cause.unwrap().expected, "Hi there");
        assert_eq!(connector.phase(), ConnectorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_negated_text_expectation() {
        let mut connector = MockConnector::new();
        connector.queue_reply(BotMsg::text("Goodbye"));
        let mut step = ConvoStep::bot().expecting("Hi");
        step.not = true;
        let convo = Convo::new("negated", vec![ConvoStep::me("hello"), step]);

        let outcome = runner(Capabilities::new()).run(&convo, &mut connector).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_json_path_asserter_on_source_data() {
        let mut connector = MockConnector::new();
        connector.queue_reply(BotMsg::with_source(json!({ "intent": { "name": "greet" } })));
        let convo = Convo::new(
            "intent",
            vec![
                ConvoStep::me("hello"),
                ConvoStep::bot()
                    .with_asserter(StepRef::new("JSON_PATH", vec!["$.intent.name".into(), "farewell".into()])),
            ],
        );

        let outcome = runner(Capabilities::new()).run(&convo, &mut connector).await;
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, TestErrorKind::Assertion);
        assert!(err.message.contains("Expected: farewell in jsonPath $.intent.name"));
    }

    #[tokio::test]
    async fn test_user_input_and_hook_shape_message() {
        let mut connector = MockConnector::new();
        let convo = Convo::new(
            "button",
            vec![ConvoStep::me("")
                .with_user_input(StepRef::new("BUTTON", vec!["ORDER_PIZZA".into()]))
                .with_logic_hook(StepRef::new("UPDATE_CUSTOM", vec!["channel".into(), "web".into()]))],
        );

        let outcome = runner(Capabilities::new()).run(&convo, &mut connector).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        let sent = connector.sent();
        assert_eq!(sent[0].buttons[0].payload, Some(json!("ORDER_PIZZA")));
        assert_eq!(sent[0].custom["channel"], "web");
    }

    #[tokio::test]
    async fn test_missing_reply_times_out() {
        let mut connector = MockConnector::new();
        let caps = Capabilities::new().with(Capability::WAITFORBOTTIMEOUT, 20);

        let outcome = runner(caps).run(&greeting(), &mut connector).await;
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, TestErrorKind::Timeout);
        assert!(err.message.starts_with("#2: "));
        assert_eq!(connector.phase(), ConnectorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_start_failure_still_stops() {
        let mut connector = MockConnector::new().failing_start(TestError::transport("refused"));

        let outcome = runner(Capabilities::new()).run(&greeting(), &mut connector).await;
        assert_eq!(outcome.error.unwrap().kind, TestErrorKind::Transport);
        assert!(connector.sent().is_empty());
        assert_eq!(connector.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_connector() {
        let mut connector = MockConnector::new();
        let cancel = CancellationToken::new();
        let runner = runner(Capabilities::new().with(Capability::WAITFORBOTTIMEOUT, 60_000))
            .with_cancel(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let outcome = runner.run(&greeting(), &mut connector).await;
        trigger.await.unwrap();

        assert_eq!(outcome.error.unwrap().kind, TestErrorKind::Cancelled);
        assert_eq!(connector.stop_calls(), 1);
        assert_eq!(connector.stop_requests(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_start_releases_without_stop_request() {
        let mut connector = MockConnector::new().slow_start(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let runner = runner(Capabilities::new()).with_cancel(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let outcome = runner.run(&greeting(), &mut connector).await;
        trigger.await.unwrap();

        assert_eq!(outcome.error.unwrap().kind, TestErrorKind::Cancelled);
        assert!(outcome.transcript.is_empty());
        assert_eq!(connector.stop_calls(), 1);
        assert_eq!(connector.stop_requests(), 0);
        assert_eq!(connector.phase(), ConnectorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_asserter_is_configuration_error() {
        let mut connector = MockConnector::new();
        connector.queue_reply(BotMsg::text("hi"));
        let convo = Convo::new(
            "unknown",
            vec![
                ConvoStep::me("hello"),
                ConvoStep::bot().with_asserter(StepRef::new("NO_SUCH_ASSERTER", Vec::new())),
            ],
        );
        let outcome = runner(Capabilities::new()).run(&convo, &mut connector).await;
        assert_eq!(outcome.error.unwrap().kind, TestErrorKind::Configuration);
    }
}
