//! Text asserters over `BotMsg::message_text` with a fixed match mode

use super::{AssertContext, Asserter, Binding};
use crate::error::{AssertionCause, TestError, TestResult};
use crate::matching::{MatchMode, Matcher};
use async_trait::async_trait;

/// How many of the step arguments have to match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextQuantifier {
    Any,
    All,
}

#[derive(Debug)]
pub struct TextAsserter {
    name: String,
    matcher: Matcher,
    quantifier: TextQuantifier,
}

impl TextAsserter {
    pub fn new(binding: Binding, class: &str, mode: MatchMode, quantifier: TextQuantifier) -> Self {
        Self {
            name: binding.name_or(class),
            matcher: Matcher::new(mode),
            quantifier,
        }
    }

    fn satisfied(&self, actual: &str, args: &[String]) -> TestResult<bool> {
        let mut hits = 0;
        for expected in args {
            if self.matcher.matches(actual, expected)? {
                hits += 1;
            }
        }
        Ok(match self.quantifier {
            TextQuantifier::Any => hits > 0,
            TextQuantifier::All => hits == args.len(),
        })
    }

    fn evaluate(&self, ctx: &AssertContext<'_>, not: bool) -> TestResult<()> {
        if ctx.args.is_empty() {
            return Ok(());
        }
        let step_tag = ctx.convo_step.step_tag.as_str();
        let actual = ctx.bot_msg.message_text.clone().unwrap_or_default();
        if self.satisfied(&actual, ctx.args).map_err(|e| e.tagged(step_tag))? != not {
            return Ok(());
        }

        let quantifier = match self.quantifier {
            TextQuantifier::Any => "one of",
            TextQuantifier::All => "all of",
        };
        let verb = if not { "not to match" } else { "to match" };
        let expected = ctx.args.join(", ");
        Err(TestError::assertion(format!(
            "{}: Expected bot response \"{actual}\" {verb} {quantifier} [{expected}] ({})",
            self.name,
            self.matcher.mode()
        ))
        .with_cause(AssertionCause::new(expected, actual, not))
        .tagged(step_tag))
    }
}

#[async_trait]
impl Asserter for TextAsserter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assert_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        self.evaluate(ctx, false)
    }

    async fn assert_not_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        self.evaluate(ctx, true)
    }
}
