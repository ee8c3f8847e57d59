//! Built-in logic hooks

use super::{Binding, HookPhase, LogicHook, LogicHookContext};
use crate::error::{TestError, TestResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Sleeps `args[0]` milliseconds, before sending or after receiving
#[derive(Debug)]
pub struct PauseLogicHook {
    name: String,
}

impl PauseLogicHook {
    pub fn new(binding: Binding) -> Self {
        Self {
            name: binding.name_or("PauseLogicHook"),
        }
    }

    fn duration(&self, ctx: &LogicHookContext<'_>) -> TestResult<Duration> {
        let step_tag = ctx.convo_step.step_tag.as_str();
        let [millis] = ctx.args else {
            return Err(TestError::configuration(format!(
                "{}: exactly 1 argument expected (milliseconds)",
                self.name
            ))
            .tagged(step_tag));
        };
        millis.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
            TestError::configuration(format!(
                "{}: argument \"{millis}\" is not a number of milliseconds",
                self.name
            ))
            .tagged(step_tag)
        })
    }
}

#[async_trait]
impl LogicHook for PauseLogicHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: LogicHookContext<'_>) -> TestResult<()> {
        let pause = self.duration(&ctx)?;
        tracing::debug!(
            step_tag = %ctx.convo_step.step_tag,
            pause_ms = pause.as_millis(),
            "Pausing"
        );
        tokio::time::sleep(pause).await;
        Ok(())
    }
}

/// Sets `msg.<args[0]> = args[1]` on the outgoing message
///
/// The value is taken as JSON when it parses, as a plain string otherwise.
#[derive(Debug)]
pub struct UpdateCustomLogicHook {
    name: String,
}

impl UpdateCustomLogicHook {
    pub fn new(binding: Binding) -> Self {
        Self {
            name: binding.name_or("UpdateCustomLogicHook"),
        }
    }
}

#[async_trait]
impl LogicHook for UpdateCustomLogicHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: LogicHookContext<'_>) -> TestResult<()> {
        let HookPhase::MePrepare { msg } = ctx.phase else {
            return Ok(());
        };
        let [key, value] = ctx.args else {
            return Err(TestError::configuration(format!(
                "{}: exactly 2 arguments expected (name, value)",
                self.name
            ))
            .tagged(&ctx.convo_step.step_tag));
        };
        let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.clone()));
        msg.custom.insert(key.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convo::{BotMsg, ConvoStep, MeMsg};
    use crate::error::TestErrorKind;
    use serde_json::json;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_pause_sleeps() {
        let hook = PauseLogicHook::new(Binding::default());
        let step = ConvoStep::bot();
        let msg = BotMsg::default();
        let args = args(&["50"]);
        let started = std::time::Instant::now();
        hook.run(LogicHookContext {
            convo_step: &step,
            args: &args,
            phase: HookPhase::BotEnd { bot_msg: &msg },
        })
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pause_rejects_non_number() {
        let hook = PauseLogicHook::new(Binding::default());
        let step = ConvoStep::bot().tagged("wait");
        let msg = BotMsg::default();
        let args = args(&["soon"]);
        let err = hook
            .run(LogicHookContext {
                convo_step: &step,
                args: &args,
                phase: HookPhase::BotEnd { bot_msg: &msg },
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Configuration);
        assert!(err.message.starts_with("wait: PauseLogicHook"));
    }

    #[tokio::test]
    async fn test_update_custom_parses_json_values() {
        let hook = UpdateCustomLogicHook::new(Binding::default());
        let step = ConvoStep::me("hi");
        let mut msg = MeMsg::text("hi");
        for pair in [["channel", "web"], ["retries", "3"], ["meta", "{\"a\":1}"]] {
            let pair = args(&pair);
            hook.run(LogicHookContext {
                convo_step: &step,
                args: &pair,
                phase: HookPhase::MePrepare { msg: &mut msg },
            })
            .await
            .unwrap();
        }
        assert_eq!(msg.custom["channel"], json!("web"));
        assert_eq!(msg.custom["retries"], json!(3));
        assert_eq!(msg.custom["meta"], json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn test_update_custom_wrong_arity() {
        let hook = UpdateCustomLogicHook::new(Binding::default());
        let step = ConvoStep::me("hi");
        let mut msg = MeMsg::text("hi");
        let one = args(&["channel"]);
        let result = hook
            .run(LogicHookContext {
                convo_step: &step,
                args: &one,
                phase: HookPhase::MePrepare { msg: &mut msg },
            })
            .await;
        assert!(result.is_err());
    }
}
