//! Pluggable scripting components: asserters, logic hooks, user inputs
//!
//! Every component family has one fixed async contract. Components are
//! selected by capability name through a closed dispatch table
//! (`ScriptingRegistry`) and instantiated once per test session
//! (`ScriptingSession`).

mod attachments;
pub mod json_path;
mod logic_hooks;
mod text;
mod user_inputs;

pub use attachments::{ButtonsAsserter, MediaAsserter};
pub use json_path::JsonPathAsserter;
pub use logic_hooks::{PauseLogicHook, UpdateCustomLogicHook};
pub use text::{TextAsserter, TextQuantifier};
pub use user_inputs::{ButtonInput, MediaInput};

use crate::capabilities::{Capabilities, Capability};
use crate::convo::{BotMsg, ConvoStep, MeMsg, StepRef};
use crate::error::{TestError, TestResult};
use crate::matching::{MatchMode, Matcher};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an asserter sees for one step
#[derive(Debug, Clone, Copy)]
pub struct AssertContext<'a> {
    pub convo_step: &'a ConvoStep,
    pub args: &'a [String],
    pub bot_msg: &'a BotMsg,
}

/// Asserter contract
#[async_trait]
pub trait Asserter: Send + Sync {
    /// Display name used in diagnostics
    fn name(&self) -> &str;

    async fn assert_convo_step(&self, _ctx: &AssertContext<'_>) -> TestResult<()> {
        Ok(())
    }

    async fn assert_not_convo_step(&self, _ctx: &AssertContext<'_>) -> TestResult<()> {
        Ok(())
    }
}

/// Point in the step lifecycle where a logic hook runs
#[derive(Debug)]
pub enum HookPhase<'a> {
    /// Before a user message is sent; the message may be modified
    MePrepare { msg: &'a mut MeMsg },
    /// After a bot message was received and asserted
    BotEnd { bot_msg: &'a BotMsg },
}

#[derive(Debug)]
pub struct LogicHookContext<'a> {
    pub convo_step: &'a ConvoStep,
    pub args: &'a [String],
    pub phase: HookPhase<'a>,
}

/// Logic hook contract
#[async_trait]
pub trait LogicHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: LogicHookContext<'_>) -> TestResult<()>;
}

#[derive(Debug)]
pub struct UserInputContext<'a> {
    pub convo_step: &'a ConvoStep,
    pub args: &'a [String],
    pub msg: &'a mut MeMsg,
}

/// User input contract: shapes the outgoing message
#[async_trait]
pub trait UserInput: Send + Sync {
    fn name(&self) -> &str;

    async fn set_user_input(&self, ctx: UserInputContext<'_>) -> TestResult<()>;
}

/// Session-wide dependencies injected into every component
#[derive(Debug, Clone)]
pub struct ScriptingContext {
    pub matcher: Matcher,
    pub caps: Arc<Capabilities>,
}

impl ScriptingContext {
    pub fn new(caps: Arc<Capabilities>) -> TestResult<Self> {
        Ok(Self {
            matcher: caps.matcher()?,
            caps,
        })
    }
}

/// Instance-level configuration: display name override and global args
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub name: Option<String>,
    pub global_args: Option<Value>,
}

impl Binding {
    pub fn named(name: impl Into<String>, global_args: Option<Value>) -> Self {
        Self {
            name: Some(name.into()),
            global_args,
        }
    }

    pub fn name_or(&self, default: &str) -> String {
        self.name.clone().unwrap_or_else(|| default.to_string())
    }
}

/// Global args shared by the JSONPath asserter family
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalArgs {
    /// Exact number of step arguments a `path_template` binding takes.
    /// Without it the argument count is not checked.
    #[serde(default)]
    pub arg_count: Option<usize>,
    #[serde(default)]
    pub path_template: Option<String>,
    /// Rendered from the step arguments into the expected value, whichever
    /// way the path was chosen
    #[serde(default)]
    pub assert_template: Option<String>,
    /// Fixed default path; step args then carry only the expected value
    #[serde(default)]
    pub path: Option<String>,
}

impl GlobalArgs {
    pub fn from_binding(binding: &Binding) -> TestResult<Self> {
        match &binding.global_args {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                TestError::configuration(format!(
                    "{} has invalid global args: {e}",
                    binding.name_or("asserter")
                ))
            }),
        }
    }
}

pub type AsserterCtor = fn(&ScriptingContext, Binding) -> TestResult<Arc<dyn Asserter>>;
pub type LogicHookCtor = fn(&ScriptingContext, Binding) -> TestResult<Arc<dyn LogicHook>>;
pub type UserInputCtor = fn(&ScriptingContext, Binding) -> TestResult<Arc<dyn UserInput>>;

struct Entry<C> {
    reference: &'static str,
    class: &'static str,
    ctor: C,
}

/// Closed dispatch table from capability name to constructor
pub struct ScriptingRegistry {
    asserters: Vec<Entry<AsserterCtor>>,
    logic_hooks: Vec<Entry<LogicHookCtor>>,
    user_inputs: Vec<Entry<UserInputCtor>>,
}

impl ScriptingRegistry {
    /// Registry of all built-in components
    pub fn builtin() -> Self {
        Self {
            asserters: vec![
                entry("JSON_PATH", "JsonPathAsserter", json_path_asserter),
                entry("TEXT_CONTAINS_ANY", "TextContainsAnyAsserter", text_contains_any),
                entry("TEXT_CONTAINS_ANY_IC", "TextContainsAnyICAsserter", text_contains_any_ic),
                entry("TEXT_CONTAINS_ALL", "TextContainsAllAsserter", text_contains_all),
                entry("TEXT_WILDCARD_ANY", "TextWildcardAnyAsserter", text_wildcard_any),
                entry("TEXT_REGEX_ANY", "TextRegexpAnyAsserter", text_regexp_any),
                entry("TEXT_EQUALS", "TextEqualsAsserter", text_equals),
                entry("BUTTONS", "ButtonsAsserter", buttons_asserter),
                entry("MEDIA", "MediaAsserter", media_asserter),
            ],
            logic_hooks: vec![
                entry("PAUSE", "PauseLogicHook", pause_hook),
                entry("UPDATE_CUSTOM", "UpdateCustomLogicHook", update_custom_hook),
            ],
            user_inputs: vec![
                entry("BUTTON", "ButtonInput", button_input),
                entry("MEDIA", "MediaInput", media_input),
            ],
        }
    }

    /// Built-in asserter references
    pub fn asserter_names(&self) -> Vec<&'static str> {
        self.asserters.iter().map(|e| e.reference).collect()
    }

    fn find<'a, C>(entries: &'a [Entry<C>], src: &str) -> Option<&'a Entry<C>> {
        entries
            .iter()
            .find(|e| e.reference == src || e.class == src)
    }
}

fn entry<C>(reference: &'static str, class: &'static str, ctor: C) -> Entry<C> {
    Entry {
        reference,
        class,
        ctor,
    }
}

fn json_path_asserter(ctx: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    Ok(Arc::new(JsonPathAsserter::new(ctx, binding)?))
}

fn text_asserter(
    binding: Binding,
    class: &str,
    mode: MatchMode,
    quantifier: TextQuantifier,
) -> TestResult<Arc<dyn Asserter>> {
    Ok(Arc::new(TextAsserter::new(binding, class, mode, quantifier)))
}

fn text_contains_any(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(binding, "TextContainsAnyAsserter", MatchMode::Include, TextQuantifier::Any)
}

fn text_contains_any_ic(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(
        binding,
        "TextContainsAnyICAsserter",
        MatchMode::IncludeIgnoreCase,
        TextQuantifier::Any,
    )
}

fn text_contains_all(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(binding, "TextContainsAllAsserter", MatchMode::Include, TextQuantifier::All)
}

fn text_wildcard_any(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(binding, "TextWildcardAnyAsserter", MatchMode::Wildcard, TextQuantifier::Any)
}

fn text_regexp_any(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(binding, "TextRegexpAnyAsserter", MatchMode::Regexp, TextQuantifier::Any)
}

fn text_equals(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    text_asserter(binding, "TextEqualsAsserter", MatchMode::Equals, TextQuantifier::Any)
}

fn buttons_asserter(ctx: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    Ok(Arc::new(ButtonsAsserter::new(ctx, binding)))
}

fn media_asserter(ctx: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn Asserter>> {
    Ok(Arc::new(MediaAsserter::new(ctx, binding)))
}

fn pause_hook(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn LogicHook>> {
    Ok(Arc::new(PauseLogicHook::new(binding)))
}

fn update_custom_hook(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn LogicHook>> {
    Ok(Arc::new(UpdateCustomLogicHook::new(binding)))
}

fn button_input(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn UserInput>> {
    Ok(Arc::new(ButtonInput::new(binding)))
}

fn media_input(_: &ScriptingContext, binding: Binding) -> TestResult<Arc<dyn UserInput>> {
    Ok(Arc::new(MediaInput::new(binding)))
}

/// One `{ref, src, args}` entry of the ASSERTERS / LOGIC_HOOKS / USER_INPUTS capabilities
#[derive(Debug, Clone, Deserialize)]
struct ComponentConfig {
    #[serde(rename = "ref")]
    reference: String,
    src: String,
    #[serde(default)]
    args: Option<Value>,
}

fn component_configs(caps: &Capabilities, cap: Capability) -> TestResult<Vec<ComponentConfig>> {
    let Some(value) = caps.get_json(cap)? else {
        return Ok(Vec::new());
    };
    let value = match value {
        Value::Array(_) => value,
        single @ Value::Object(_) => Value::Array(vec![single]),
        _ => {
            return Err(TestError::configuration(format!(
                "Capability {} must be a list of {{ref, src, args}} entries",
                cap.as_str()
            )))
        }
    };
    serde_json::from_value(value).map_err(|e| {
        TestError::configuration(format!("Capability {} is malformed: {e}", cap.as_str()))
    })
}

fn instantiate<C, T>(
    ctx: &ScriptingContext,
    entries: &[Entry<C>],
    custom: Vec<ComponentConfig>,
    family: Capability,
) -> TestResult<HashMap<String, T>>
where
    C: Fn(&ScriptingContext, Binding) -> TestResult<T>,
{
    let mut instances = HashMap::new();
    for entry in entries {
        instances.insert(
            entry.reference.to_string(),
            (entry.ctor)(ctx, Binding::default())?,
        );
    }
    for config in custom {
        let entry = ScriptingRegistry::find(entries, &config.src).ok_or_else(|| {
            TestError::configuration(format!(
                "{} entry \"{}\": unknown src \"{}\"",
                family.as_str(),
                config.reference,
                config.src
            ))
        })?;
        tracing::debug!(
            family = family.as_str(),
            reference = %config.reference,
            src = %config.src,
            "Registering custom component"
        );
        let binding = Binding::named(config.reference.clone(), config.args);
        instances.insert(config.reference, (entry.ctor)(ctx, binding)?);
    }
    Ok(instances)
}

/// Component instances for one test session
pub struct ScriptingSession {
    context: ScriptingContext,
    asserters: HashMap<String, Arc<dyn Asserter>>,
    logic_hooks: HashMap<String, Arc<dyn LogicHook>>,
    user_inputs: HashMap<String, Arc<dyn UserInput>>,
    collect_all_failures: bool,
}

impl ScriptingSession {
    pub fn build(registry: &ScriptingRegistry, caps: Arc<Capabilities>) -> TestResult<Self> {
        let context = ScriptingContext::new(caps.clone())?;
        let asserters = instantiate(
            &context,
            &registry.asserters,
            component_configs(&caps, Capability::ASSERTERS)?,
            Capability::ASSERTERS,
        )?;
        let logic_hooks = instantiate(
            &context,
            &registry.logic_hooks,
            component_configs(&caps, Capability::LOGIC_HOOKS)?,
            Capability::LOGIC_HOOKS,
        )?;
        let user_inputs = instantiate(
            &context,
            &registry.user_inputs,
            component_configs(&caps, Capability::USER_INPUTS)?,
            Capability::USER_INPUTS,
        )?;

        Ok(Self {
            collect_all_failures: caps.flag(Capability::SCRIPTING_ENABLE_MULTIPLE_ASSERT_ERRORS),
            context,
            asserters,
            logic_hooks,
            user_inputs,
        })
    }

    pub fn matcher(&self) -> Matcher {
        self.context.matcher
    }

    pub fn asserter(&self, name: &str) -> TestResult<&Arc<dyn Asserter>> {
        self.asserters
            .get(name)
            .ok_or_else(|| TestError::configuration(format!("Asserter \"{name}\" not registered")))
    }

    pub fn logic_hook(&self, name: &str) -> TestResult<&Arc<dyn LogicHook>> {
        self.logic_hooks
            .get(name)
            .ok_or_else(|| TestError::configuration(format!("Logic hook \"{name}\" not registered")))
    }

    pub fn user_input(&self, name: &str) -> TestResult<&Arc<dyn UserInput>> {
        self.user_inputs
            .get(name)
            .ok_or_else(|| TestError::configuration(format!("User input \"{name}\" not registered")))
    }

    /// Run one asserter reference against a bot message
    pub async fn run_asserter(&self, step_ref: &StepRef, step: &ConvoStep, bot_msg: &BotMsg) -> TestResult<()> {
        let asserter = self
            .asserter(&step_ref.name)
            .map_err(|e| e.tagged(&step.step_tag))?;
        let ctx = AssertContext {
            convo_step: step,
            args: &step_ref.args,
            bot_msg,
        };
        if step_ref.not {
            asserter.assert_not_convo_step(&ctx).await
        } else {
            asserter.assert_convo_step(&ctx).await
        }
    }

    /// Run all asserters of a bot step.
    ///
    /// Stops at the first failure unless multiple assert errors are enabled,
    /// in which case all failures are joined into one (the first cause is kept).
    pub async fn run_asserters(&self, step: &ConvoStep, bot_msg: &BotMsg) -> TestResult<()> {
        let mut failures: Vec<TestError> = Vec::new();
        for step_ref in &step.asserters {
            if let Err(e) = self.run_asserter(step_ref, step, bot_msg).await {
                if !self.collect_all_failures {
                    return Err(e);
                }
                failures.push(e);
            }
        }
        join_failures(failures)
    }

    pub async fn apply_user_inputs(&self, step: &ConvoStep, msg: &mut MeMsg) -> TestResult<()> {
        for step_ref in &step.user_inputs {
            let input = self
                .user_input(&step_ref.name)
                .map_err(|e| e.tagged(&step.step_tag))?;
            input
                .set_user_input(UserInputContext {
                    convo_step: step,
                    args: &step_ref.args,
                    msg: &mut *msg,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn run_me_hooks(&self, step: &ConvoStep, msg: &mut MeMsg) -> TestResult<()> {
        for step_ref in &step.logic_hooks {
            let hook = self
                .logic_hook(&step_ref.name)
                .map_err(|e| e.tagged(&step.step_tag))?;
            hook.run(LogicHookContext {
                convo_step: step,
                args: &step_ref.args,
                phase: HookPhase::MePrepare { msg: &mut *msg },
            })
            .await?;
        }
        Ok(())
    }

    pub async fn run_bot_hooks(&self, step: &ConvoStep, bot_msg: &BotMsg) -> TestResult<()> {
        for step_ref in &step.logic_hooks {
            let hook = self
                .logic_hook(&step_ref.name)
                .map_err(|e| e.tagged(&step.step_tag))?;
            hook.run(LogicHookContext {
                convo_step: step,
                args: &step_ref.args,
                phase: HookPhase::BotEnd { bot_msg },
            })
            .await?;
        }
        Ok(())
    }
}

fn join_failures(mut failures: Vec<TestError>) -> TestResult<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => {
            let message = failures
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let first = failures.remove(0);
            Err(TestError {
                kind: first.kind,
                message,
                cause: first.cause,
            })
        }
    }
}
