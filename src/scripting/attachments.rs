//! Asserters over structured bot output: buttons and media

use super::{AssertContext, Asserter, Binding, ScriptingContext};
use crate::error::{AssertionCause, TestError, TestResult};
use crate::matching::Matcher;
use async_trait::async_trait;

/// Shared check: every expected arg must match one of the candidates.
///
/// Negated: none of the args may match. Without args the check is about
/// presence only (any candidate at all, or none when negated).
fn check_attachments(
    name: &str,
    matcher: Matcher,
    what: &str,
    candidates: &[String],
    ctx: &AssertContext<'_>,
    not: bool,
) -> TestResult<()> {
    let step_tag = ctx.convo_step.step_tag.as_str();
    let actual = candidates.join(", ");

    if ctx.args.is_empty() {
        if candidates.is_empty() == not {
            return Ok(());
        }
        let message = if not {
            format!("{name}: Expected no {what} in bot response, got [{actual}]")
        } else {
            format!("{name}: Expected {what} in bot response")
        };
        return Err(TestError::assertion(message).tagged(step_tag));
    }

    let mut offending = Vec::new();
    for expected in ctx.args {
        let mut found = false;
        for candidate in candidates {
            if matcher.matches(candidate, expected).map_err(|e| e.tagged(step_tag))? {
                found = true;
                break;
            }
        }
        if found == not {
            offending.push(expected.as_str());
        }
    }
    if offending.is_empty() {
        return Ok(());
    }

    let expected = offending.join(", ");
    let message = if not {
        format!("{name}: Not expected {what} [{expected}] in bot response: [{actual}]")
    } else {
        format!("{name}: Expected {what} [{expected}] in bot response: [{actual}]")
    };
    Err(TestError::assertion(message)
        .with_cause(AssertionCause::new(expected, actual, not))
        .tagged(step_tag))
}

/// Matches args against button texts and payloads
#[derive(Debug)]
pub struct ButtonsAsserter {
    name: String,
    matcher: Matcher,
}

impl ButtonsAsserter {
    pub fn new(ctx: &ScriptingContext, binding: Binding) -> Self {
        Self {
            name: binding.name_or("ButtonsAsserter"),
            matcher: ctx.matcher,
        }
    }

    fn candidates(ctx: &AssertContext<'_>) -> Vec<String> {
        ctx.bot_msg
            .buttons
            .iter()
            .flat_map(|b| {
                let payload = b.payload.as_ref().map(crate::template::value_to_text);
                b.text.clone().into_iter().chain(payload)
            })
            .collect()
    }
}

#[async_trait]
impl Asserter for ButtonsAsserter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assert_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        check_attachments(&self.name, self.matcher, "buttons", &Self::candidates(ctx), ctx, false)
    }

    async fn assert_not_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        check_attachments(&self.name, self.matcher, "buttons", &Self::candidates(ctx), ctx, true)
    }
}

/// Matches args against media URIs
#[derive(Debug)]
pub struct MediaAsserter {
    name: String,
    matcher: Matcher,
}

impl MediaAsserter {
    pub fn new(ctx: &ScriptingContext, binding: Binding) -> Self {
        Self {
            name: binding.name_or("MediaAsserter"),
            matcher: ctx.matcher,
        }
    }

    fn candidates(ctx: &AssertContext<'_>) -> Vec<String> {
        ctx.bot_msg.media.iter().map(|m| m.media_uri.clone()).collect()
    }
}

#[async_trait]
impl Asserter for MediaAsserter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assert_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        check_attachments(&self.name, self.matcher, "media", &Self::candidates(ctx), ctx, false)
    }

    async fn assert_not_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        check_attachments(&self.name, self.matcher, "media", &Self::candidates(ctx), ctx, true)
    }
}
