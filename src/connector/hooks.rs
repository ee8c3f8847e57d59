//! Connector hooks, registered in code and selected by capability value
//!
//! A `*_HOOK` capability holds the name under which a hook was registered in
//! the `HookRegistry`. Naming a hook that is not registered is a
//! configuration error.

use super::request::HttpRequest;
use crate::capabilities::{Capabilities, Capability};
use crate::convo::{BotMsg, MeMsg};
use crate::error::{TestError, TestResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Rewrites an outgoing request before it is sent
#[async_trait]
pub trait RequestHook: Send + Sync {
    /// `view` is the template view the request was rendered from
    async fn rewrite(&self, request: &mut HttpRequest, view: &Value) -> TestResult<()>;
}

/// Pre-processes a response body before context and message extraction
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn process(&self, body: &mut Value, context: &Value) -> TestResult<()>;
}

/// Runs at session start or stop with mutable access to the session context
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self, context: &mut Value) -> TestResult<()>;
}

/// Point in the session a `CUSTOMHOOK_*` hook is called at
#[derive(Debug)]
pub enum CustomHookEvent<'a> {
    /// Session opened, before any user message
    Start { context: &'a mut Value },
    /// User message about to be sent
    UserSays { msg: &'a mut MeMsg, context: &'a Value },
    /// Bot message about to reach the test
    BotResponse { msg: &'a mut BotMsg, context: &'a Value },
    /// Session stopped
    Stop { context: &'a Value },
}

/// Hook around the conversation itself, selected by the `CUSTOMHOOK_*` capabilities
#[async_trait]
pub trait CustomHook: Send + Sync {
    async fn run(&self, event: CustomHookEvent<'_>) -> TestResult<()>;
}

#[async_trait]
impl<F> CustomHook for F
where
    F: for<'a> Fn(CustomHookEvent<'a>) -> TestResult<()> + Send + Sync,
{
    async fn run(&self, event: CustomHookEvent<'_>) -> TestResult<()> {
        self(event)
    }
}

/// The `CUSTOMHOOK_*` hooks configured for one session
#[derive(Clone, Default)]
pub struct CustomHooks {
    pub on_start: Option<Arc<dyn CustomHook>>,
    pub on_user_says: Option<Arc<dyn CustomHook>>,
    pub on_bot_response: Option<Arc<dyn CustomHook>>,
    pub on_stop: Option<Arc<dyn CustomHook>>,
}

impl fmt::Debug for CustomHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_user_says", &self.on_user_says.is_some())
            .field("on_bot_response", &self.on_bot_response.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

#[async_trait]
impl<F> RequestHook for F
where
    F: Fn(&mut HttpRequest, &Value) -> TestResult<()> + Send + Sync,
{
    async fn rewrite(&self, request: &mut HttpRequest, view: &Value) -> TestResult<()> {
        self(request, view)
    }
}

#[async_trait]
impl<F> ResponseHook for F
where
    F: Fn(&mut Value, &Value) -> TestResult<()> + Send + Sync,
{
    async fn process(&self, body: &mut Value, context: &Value) -> TestResult<()> {
        self(body, context)
    }
}

#[async_trait]
impl<F> LifecycleHook for F
where
    F: Fn(&mut Value) -> TestResult<()> + Send + Sync,
{
    async fn run(&self, context: &mut Value) -> TestResult<()> {
        self(context)
    }
}

/// Closed table of named hooks
#[derive(Default, Clone)]
pub struct HookRegistry {
    request: HashMap<String, Arc<dyn RequestHook>>,
    response: HashMap<String, Arc<dyn ResponseHook>>,
    lifecycle: HashMap<String, Arc<dyn LifecycleHook>>,
    custom: HashMap<String, Arc<dyn CustomHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_request_hook(mut self, name: impl Into<String>, hook: impl RequestHook + 'static) -> Self {
        self.request.insert(name.into(), Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_response_hook(mut self, name: impl Into<String>, hook: impl ResponseHook + 'static) -> Self {
        self.response.insert(name.into(), Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_lifecycle_hook(mut self, name: impl Into<String>, hook: impl LifecycleHook + 'static) -> Self {
        self.lifecycle.insert(name.into(), Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_custom_hook(mut self, name: impl Into<String>, hook: impl CustomHook + 'static) -> Self {
        self.custom.insert(name.into(), Arc::new(hook));
        self
    }

    pub fn request_hook(&self, caps: &Capabilities, cap: Capability) -> TestResult<Option<Arc<dyn RequestHook>>> {
        lookup(&self.request, caps, cap)
    }

    pub fn response_hook(&self, caps: &Capabilities, cap: Capability) -> TestResult<Option<Arc<dyn ResponseHook>>> {
        lookup(&self.response, caps, cap)
    }

    pub fn lifecycle_hook(&self, caps: &Capabilities, cap: Capability) -> TestResult<Option<Arc<dyn LifecycleHook>>> {
        lookup(&self.lifecycle, caps, cap)
    }

    /// Resolve all `CUSTOMHOOK_*` capabilities at once
    pub fn custom_hooks(&self, caps: &Capabilities) -> TestResult<CustomHooks> {
        Ok(CustomHooks {
            on_start: lookup(&self.custom, caps, Capability::CUSTOMHOOK_ONSTART)?,
            on_user_says: lookup(&self.custom, caps, Capability::CUSTOMHOOK_ONUSERSAYS)?,
            on_bot_response: lookup(&self.custom, caps, Capability::CUSTOMHOOK_ONBOTRESPONSE)?,
            on_stop: lookup(&self.custom, caps, Capability::CUSTOMHOOK_ONSTOP)?,
        })
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("request", &self.request.keys().collect::<Vec<_>>())
            .field("response", &self.response.keys().collect::<Vec<_>>())
            .field("lifecycle", &self.lifecycle.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lookup<T: ?Sized>(
    table: &HashMap<String, Arc<T>>,
    caps: &Capabilities,
    cap: Capability,
) -> TestResult<Option<Arc<T>>> {
    let Some(name) = caps.get_str(cap) else {
        return Ok(None);
    };
    table.get(&name).cloned().map(Some).ok_or_else(|| {
        TestError::configuration(format!(
            "Capability {} names hook \"{name}\", which is not registered",
            cap.as_str()
        ))
    })
}
