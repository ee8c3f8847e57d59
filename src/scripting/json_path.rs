//! JSONPath asserter: checks existence or value of elements in the raw
//! bot payload (`BotMsg::source_data`).

use super::{AssertContext, Asserter, Binding, GlobalArgs, ScriptingContext};
use crate::error::{AssertionCause, TestError, TestResult};
use crate::json_query::{looks_like_json_path, JsonQuery};
use crate::matching::Matcher;
use crate::template::{value_to_text, Template};
use async_trait::async_trait;

pub const DEFAULT_NAME: &str = "JsonPathAsserter";

#[derive(Debug)]
pub struct JsonPathAsserter {
    name: String,
    matcher: Matcher,
    arg_count: Option<usize>,
    path_template: Option<Template>,
    assert_template: Option<Template>,
    default_path: Option<String>,
}

/// Path and expected value for one invocation
#[derive(Debug, PartialEq, Eq)]
struct Target {
    path: String,
    expected: Option<String>,
}

impl JsonPathAsserter {
    pub fn new(ctx: &ScriptingContext, binding: Binding) -> TestResult<Self> {
        let global_args = GlobalArgs::from_binding(&binding)?;
        let name = binding.name_or(DEFAULT_NAME);
        let compile = |source: Option<&String>| source.map(|s| Template::compile(s)).transpose();
        Ok(Self {
            path_template: compile(global_args.path_template.as_ref())?,
            assert_template: compile(global_args.assert_template.as_ref())?,
            arg_count: global_args.arg_count,
            default_path: global_args.path,
            matcher: ctx.matcher,
            name,
        })
    }

    /// Work out which path to query and what to expect there.
    ///
    /// `None` means there is nothing to check.
    fn resolve(&self, args: &[String]) -> TestResult<Option<Target>> {
        let Some(target) = self.select_path(args)? else {
            return Ok(None);
        };
        match &self.assert_template {
            Some(assert_template) => Ok(Some(Target {
                expected: Some(assert_template.render_args(args)?),
                ..target
            })),
            None => Ok(Some(target)),
        }
    }

    /// Path plus the expected value taken verbatim from the arguments
    fn select_path(&self, args: &[String]) -> TestResult<Option<Target>> {
        if let Some(path_template) = &self.path_template {
            if let Some(expected_count) = self.arg_count {
                if args.len() != expected_count {
                    return Err(TestError::configuration(format!(
                        "{} {expected_count} arguments expected",
                        self.name
                    )));
                }
            }
            return Ok(Some(Target {
                path: path_template.render_args(args)?,
                expected: None,
            }));
        }

        match (args.first(), &self.default_path) {
            (Some(first), _) if looks_like_json_path(first) => Ok(Some(Target {
                path: first.clone(),
                expected: args.get(1).cloned(),
            })),
            (first, Some(default_path)) => Ok(Some(Target {
                path: default_path.clone(),
                expected: first.cloned(),
            })),
            (Some(first), None) => Ok(Some(Target {
                path: first.clone(),
                expected: args.get(1).cloned(),
            })),
            (None, None) => Ok(None),
        }
    }

    fn query(path: &str) -> TestResult<JsonQuery> {
        if looks_like_json_path(path) {
            JsonQuery::parse(path)
        } else {
            // bare member names are read relative to the root
            JsonQuery::parse(&format!("$.{path}"))
        }
    }
}

#[async_trait]
impl Asserter for JsonPathAsserter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assert_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        let step_tag = ctx.convo_step.step_tag.as_str();
        let Some(target) = self.resolve(ctx.args).map_err(|e| e.tagged(step_tag))? else {
            return Ok(());
        };
        let query = Self::query(&target.path).map_err(|e| e.tagged(step_tag))?;

        let Some(found) = query.first(&ctx.bot_msg.source_data) else {
            return Err(TestError::assertion(format!(
                "Could not find any element in jsonPath {}",
                target.path
            ))
            .tagged(step_tag));
        };
        let Some(expected) = target.expected else {
            return Ok(());
        };

        let actual = value_to_text(found);
        if self.matcher.matches(&actual, &expected).map_err(|e| e.tagged(step_tag))? {
            return Ok(());
        }
        Err(TestError::assertion(format!(
            "Expected: {expected} in jsonPath {}: Actual: {actual}",
            target.path
        ))
        .with_cause(AssertionCause::new(expected, actual, false))
        .tagged(step_tag))
    }

    async fn assert_not_convo_step(&self, ctx: &AssertContext<'_>) -> TestResult<()> {
        let step_tag = ctx.convo_step.step_tag.as_str();
        let Some(target) = self.resolve(ctx.args).map_err(|e| e.tagged(step_tag))? else {
            return Ok(());
        };
        let query = Self::query(&target.path).map_err(|e| e.tagged(step_tag))?;

        let Some(found) = query.first(&ctx.bot_msg.source_data) else {
            return Ok(());
        };
        let actual = value_to_text(found);
        let Some(expected) = target.expected else {
            return Err(TestError::assertion(format!(
                "Not expected element in jsonPath {}: {actual}",
                target.path
            ))
            .tagged(step_tag));
        };

        if !self.matcher.matches(&actual, &expected).map_err(|e| e.tagged(step_tag))? {
            return Ok(());
        }
        Err(TestError::assertion(format!(
            "Not expected: {expected} in jsonPath {}: Actual: {actual}",
            target.path
        ))
        .with_cause(AssertionCause::new(expected, actual, true))
        .tagged(step_tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Capabilities, Capability};
    use crate::convo::{BotMsg, ConvoStep};
    use crate::error::TestErrorKind;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn context() -> ScriptingContext {
        let caps = Capabilities::new().with(Capability::SCRIPTING_MATCHING_MODE, "includeIgnoreCase");
        ScriptingContext::new(Arc::new(caps)).unwrap()
    }

    fn asserter(global_args: Option<Value>) -> JsonPathAsserter {
        let binding = Binding {
            name: None,
            global_args,
        };
        JsonPathAsserter::new(&context(), binding).unwrap()
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    async fn check(a: &JsonPathAsserter, args: &[String], source: Value) -> TestResult<()> {
        let step = ConvoStep::bot().tagged("test");
        let msg = BotMsg::with_source(source);
        a.assert_convo_step(&AssertContext {
            convo_step: &step,
            args,
            bot_msg: &msg,
        })
        .await
    }

    async fn check_not(a: &JsonPathAsserter, args: &[String], source: Value) -> TestResult<()> {
        let step = ConvoStep::bot().tagged("test");
        let msg = BotMsg::with_source(source);
        a.assert_not_convo_step(&AssertContext {
            convo_step: &step,
            args,
            bot_msg: &msg,
        })
        .await
    }

    #[tokio::test]
    async fn test_no_args_is_noop() {
        let a = asserter(None);
        assert!(check(&a, &[], Value::Null).await.is_ok());
        assert!(check_not(&a, &[], Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_existing_path() {
        let a = asserter(None);
        assert!(check(&a, &args(&["$.test"]), json!({ "test": true })).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_path() {
        let a = asserter(None);
        let err = check(&a, &args(&["$.test"]), json!({ "other": true }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Assertion);
        assert_eq!(err.message, "test: Could not find any element in jsonPath $.test");
    }

    #[tokio::test]
    async fn test_matching_value() {
        let a = asserter(None);
        assert!(check(&a, &args(&["$.test", "test"]), json!({ "test": "test" })).await.is_ok());
    }

    #[tokio::test]
    async fn test_matching_array_element() {
        let a = asserter(None);
        let source = json!({ "test": ["test", "test1"] });
        assert!(check(&a, &args(&["$.test[0]", "test"]), source).await.is_ok());
    }

    #[tokio::test]
    async fn test_mismatch_reports_cause() {
        let a = asserter(None);
        let err = check(&a, &args(&["$.test", "test2"]), json!({ "test": "test1" }))
            .await
            .unwrap_err();
        assert!(err.message.find("Expected: test2 in jsonPath $.test").unwrap() > 0);
        let ctx = err.context().unwrap();
        assert_eq!(ctx["cause"]["expected"], "test2");
        assert_eq!(ctx["cause"]["actual"], "test1");
        assert_eq!(ctx["cause"]["not"], false);
    }

    #[tokio::test]
    async fn test_non_string_values_compare_as_json() {
        let a = asserter(None);
        assert!(check(&a, &args(&["$.count", "42"]), json!({ "count": 42 })).await.is_ok());
        assert!(check(&a, &args(&["$.flag", "true"]), json!({ "flag": true })).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_succeeds_on_missing_path() {
        let a = asserter(None);
        assert!(check_not(&a, &args(&["$.test"]), json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_fails_on_present_path_without_value() {
        let a = asserter(None);
        let err = check_not(&a, &args(&["$.test"]), json!({ "test": "x" }))
            .await
            .unwrap_err();
        assert_eq!(err.message, "test: Not expected element in jsonPath $.test: x");
    }

    #[tokio::test]
    async fn test_not_succeeds_on_non_matching_value() {
        let a = asserter(None);
        assert!(check_not(&a, &args(&["$.test", "test2"]), json!({ "test": "test1" }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_not_fails_on_matching_value() {
        let a = asserter(None);
        let err = check_not(&a, &args(&["$.test", "test1"]), json!({ "test": "test1" }))
            .await
            .unwrap_err();
        assert!(err.message.find("Not expected: test1 in jsonPath $.test").unwrap() > 0);
        let cause = err.cause.unwrap();
        assert!(cause.not);
        assert_eq!(cause.expected, "test1");
        assert_eq!(cause.actual, "test1");
    }

    #[tokio::test]
    async fn test_fixed_path_existence() {
        let a = asserter(Some(json!({ "path": "$.test" })));
        assert!(check(&a, &[], json!({ "test": true })).await.is_ok());
        let err = check(&a, &[], json!({ "other": true })).await.unwrap_err();
        assert!(err.message.contains("Could not find any element in jsonPath $.test"));
    }

    #[tokio::test]
    async fn test_fixed_path_takes_expected_from_first_arg() {
        let a = asserter(Some(json!({ "path": "$.test" })));
        let err = check(&a, &args(&["test2"]), json!({ "test": "test1" }))
            .await
            .unwrap_err();
        assert!(err.message.find("Expected: test2 in jsonPath $.test").unwrap() > 0);
        assert_eq!(err.cause.unwrap().actual, "test1");
    }

    #[tokio::test]
    async fn test_dollar_arg_overrides_fixed_path() {
        let a = asserter(Some(json!({ "path": "$.test" })));
        let source = json!({ "test": "a", "other": "b" });
        assert!(check(&a, &args(&["$.other", "b"]), source).await.is_ok());
    }

    #[tokio::test]
    async fn test_bare_member_name_is_a_path() {
        let a = asserter(None);
        assert!(check(&a, &args(&["test"]), json!({ "test": "test" })).await.is_ok());
    }

    #[tokio::test]
    async fn test_path_template_argument_count() {
        let a = asserter(Some(json!({ "argCount": 0, "pathTemplate": "$.test" })));
        let err = check(&a, &args(&["test2"]), json!({ "test": "test1" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Configuration);
        assert!(err.message.find("JsonPathAsserter 0 arguments expected").unwrap() > 0);
    }

    #[tokio::test]
    async fn test_path_template_existence() {
        let a = asserter(Some(json!({ "argCount": 1, "pathTemplate": "$.{{args.0}}" })));
        assert!(check(&a, &args(&["test"]), json!({ "test": "x" })).await.is_ok());
    }

    #[tokio::test]
    async fn test_path_and_assert_template() {
        let a = asserter(Some(json!({
            "argCount": 2,
            "pathTemplate": "$.{{args.0}}",
            "assertTemplate": "{{args.1}}"
        })));
        assert!(check(&a, &args(&["test", "value"]), json!({ "test": "value" }))
            .await
            .is_ok());
        let err = check(&a, &args(&["test", "value"]), json!({ "test": "other" }))
            .await
            .unwrap_err();
        assert!(err.message.find("Expected: value in jsonPath $.test").unwrap() > 0);
    }

    fn equals_asserter(global_args: Value) -> JsonPathAsserter {
        let caps = Capabilities::new().with(Capability::SCRIPTING_MATCHING_MODE, "equals");
        let ctx = ScriptingContext::new(Arc::new(caps)).unwrap();
        JsonPathAsserter::new(&ctx, Binding::named("t", Some(global_args))).unwrap()
    }

    #[tokio::test]
    async fn test_assert_template_with_fixed_path() {
        let a = equals_asserter(json!({ "path": "$.status", "assertTemplate": "state-{{args.0}}" }));
        assert!(check(&a, &args(&["ok"]), json!({ "status": "state-ok" })).await.is_ok());
        let err = check(&a, &args(&["ok"]), json!({ "status": "ok" })).await.unwrap_err();
        assert_eq!(err.message, "test: Expected: state-ok in jsonPath $.status: Actual: ok");
    }

    #[tokio::test]
    async fn test_assert_template_with_dollar_arg() {
        let a = equals_asserter(json!({ "assertTemplate": "{{args.1}}-x" }));
        let source = json!({ "code": "7-x" });
        assert!(check(&a, &args(&["$.code", "7"]), source.clone()).await.is_ok());
        assert!(check_not(&a, &args(&["$.code", "7"]), source).await.is_err());
    }

    #[tokio::test]
    async fn test_path_template_without_arg_count_accepts_any_args() {
        let a = asserter(Some(json!({ "pathTemplate": "$.{{args.0}}" })));
        let source = json!({ "test": "x" });
        assert!(check(&a, &args(&["test"]), source.clone()).await.is_ok());
        assert!(check(&a, &args(&["test", "ignored"]), source).await.is_ok());
    }

    #[tokio::test]
    async fn test_path_template_takes_precedence_over_dollar_arg() {
        let a = asserter(Some(json!({ "argCount": 1, "pathTemplate": "$.items[{{args.0}}]" })));
        let source = json!({ "items": ["first"] });
        assert!(check(&a, &args(&["0"]), source).await.is_ok());
    }

    #[tokio::test]
    async fn test_custom_name_in_count_error() {
        let binding = Binding::named(
            "HAS_ORDER",
            Some(json!({ "argCount": 1, "pathTemplate": "$.orders[{{args.0}}]" })),
        );
        let a = JsonPathAsserter::new(&context(), binding).unwrap();
        let err = check(&a, &[], json!({})).await.unwrap_err();
        assert_eq!(err.message, "test: HAS_ORDER 1 arguments expected");
    }

    #[test]
    fn test_malformed_template_rejected_at_construction() {
        let binding = Binding {
            name: None,
            global_args: Some(json!({ "pathTemplate": "$.{{args.0" })),
        };
        assert!(JsonPathAsserter::new(&context(), binding).is_err());
    }

    proptest! {
        #[test]
        fn prop_assert_and_assert_not_are_dual(key in "[a-z]{1,6}", value in "[a-z]{0,6}", expected in "[a-z]{1,4}", present: bool) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let a = asserter(None);
            let source = if present { json!({ key.clone(): value }) } else { json!({}) };
            let call = args(&[&format!("$.{key}"), &expected]);
            let positive = rt.block_on(check(&a, &call, source.clone())).is_ok();
            let negative = rt.block_on(check_not(&a, &call, source)).is_ok();
            prop_assert_ne!(positive, negative);
        }
    }
}
