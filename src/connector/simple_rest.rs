//! Connector for bots exposing a JSON-over-HTTP API
//!
//! Bot messages reach the test through one inbox, whatever their source:
//! synchronous responses, the poll loop, or inbound webhook events.

use super::hooks::{CustomHookEvent, CustomHooks, HookRegistry};
use super::rate_limit::RateLimiter;
use super::request::{execute, Endpoint, HttpResponse};
use super::response::{ContextUpdate, ContextUpdates, ResponseParser};
use super::state::{transition, ConnectorPhase, PhaseEffect, PhaseEvent};
use super::Connector;
use crate::capabilities::{Capabilities, Capability};
use crate::convo::{BotMsg, MeMsg};
use crate::error::{TestError, TestErrorKind, TestResult};
use crate::inbound::{Debouncer, InboundHub, InboundRegistration, InboundSelector};
use crate::template::Template;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INBOUND_SELECTOR_VALUE: &str = "{{botium.conversationId}}";

#[derive(Debug, Default)]
struct Session {
    context: Value,
    conversation_id: String,
}

/// State shared with the background tasks
struct Shared {
    caps: Capabilities,
    client: Client,
    hooks: HookRegistry,
    custom: CustomHooks,
    parser: ResponseParser,
    updates: ContextUpdates,
    session: Mutex<Session>,
    outbox: mpsc::UnboundedSender<BotMsg>,
}

/// Poll loop and inbound delivery of a running session
struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    registration: Option<InboundRegistration>,
}

pub struct SimpleRestBuilder {
    caps: Capabilities,
    hooks: HookRegistry,
    rate_limiter: Option<Arc<RateLimiter>>,
    inbound: Option<InboundHub>,
}

impl SimpleRestBuilder {
    #[must_use]
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share a process-wide limiter instead of one built from this session's capabilities
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn inbound(mut self, hub: InboundHub) -> Self {
        self.inbound = Some(hub);
        self
    }

    pub fn build(self) -> TestResult<SimpleRestConnector> {
        if !Endpoint::UserSays.is_configured(&self.caps) {
            return Err(TestError::configuration(
                "Capability SIMPLEREST_URL is required",
            ));
        }
        let client = build_client(&self.caps)?;
        let parser = ResponseParser::from_caps(&self.caps)?;
        let updates = ContextUpdates::from_caps(&self.caps)?;
        let custom = self.hooks.custom_hooks(&self.caps)?;
        let rate_limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => Arc::new(RateLimiter::from_caps(&self.caps)?),
        };
        let (outbox, inbox) = mpsc::unbounded_channel();

        Ok(SimpleRestConnector {
            shared: Arc::new(Shared {
                caps: self.caps,
                client,
                hooks: self.hooks,
                custom,
                parser,
                updates,
                session: Mutex::new(Session::default()),
                outbox,
            }),
            phase: ConnectorPhase::New,
            inbox,
            rate_limiter,
            inbound: self.inbound,
            background: None,
        })
    }
}

fn build_client(caps: &Capabilities) -> TestResult<Client> {
    let mut builder = Client::builder();
    if let Some(proxy) = caps.get_str(Capability::SIMPLEREST_PROXY_URL) {
        let proxy = reqwest::Proxy::all(&proxy)
            .map_err(|e| TestError::configuration(format!("Invalid SIMPLEREST_PROXY_URL \"{proxy}\": {e}")))?;
        builder = builder.proxy(proxy);
    }
    if caps.get_bool(Capability::SIMPLEREST_STRICT_SSL) == Some(false) {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|e| TestError::configuration(format!("Failed to create HTTP client: {e}")))
}

pub struct SimpleRestConnector {
    shared: Arc<Shared>,
    phase: ConnectorPhase,
    inbox: mpsc::UnboundedReceiver<BotMsg>,
    rate_limiter: Arc<RateLimiter>,
    inbound: Option<InboundHub>,
    background: Option<Background>,
}

impl SimpleRestConnector {
    pub fn builder(caps: Capabilities) -> SimpleRestBuilder {
        SimpleRestBuilder {
            caps,
            hooks: HookRegistry::new(),
            rate_limiter: None,
            inbound: None,
        }
    }

    /// Current session context
    pub async fn context(&self) -> Value {
        self.shared.session.lock().await.context.clone()
    }

    pub async fn conversation_id(&self) -> String {
        self.shared.session.lock().await.conversation_id.clone()
    }

    /// Poll until a qualifying response arrives; the messages it carries
    pub async fn poll_for_response(&self) -> TestResult<Vec<BotMsg>> {
        self.shared.poll_for_response().await
    }

    fn apply(&mut self, event: PhaseEvent) -> TestResult<Vec<PhaseEffect>> {
        let result = transition(self.phase, event)
            .map_err(|e| TestError::configuration(e.to_string()))?;
        if result.phase != self.phase {
            tracing::debug!(from = %self.phase, to = %result.phase, ?event, "Connector phase changed");
        }
        self.phase = result.phase;
        Ok(result.effects)
    }

    async fn open_session(&mut self) -> TestResult<()> {
        let shared = &self.shared;
        let caps = &shared.caps;

        let mut context = caps
            .get_json(Capability::SIMPLEREST_INIT_CONTEXT)?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let conversation_id = match caps.get_str(Capability::SIMPLEREST_CONVERSATION_ID_TEMPLATE) {
            Some(template) => Template::compile(&template)?.render(&json!({
                "context": context,
                "uuid": Uuid::new_v4().to_string(),
            })),
            None => Uuid::new_v4().to_string(),
        };
        if let Some(hook) = shared
            .hooks
            .lifecycle_hook(caps, Capability::SIMPLEREST_START_HOOK)?
        {
            hook.run(&mut context).await?;
        }
        *shared.session.lock().await = Session {
            context,
            conversation_id: conversation_id.clone(),
        };

        let view = shared.view(None, None).await;
        if let Some(response) = shared.request(Endpoint::Start, &view).await? {
            let messages = shared
                .process_response(response.body, &shared.updates.start)
                .await?;
            if caps.flag(Capability::SIMPLEREST_START_PROCESS_RESPONSE) {
                shared.deliver(messages).await?;
            }
        }
        if let Some(hook) = &shared.custom.on_start {
            let mut session = shared.session.lock().await;
            hook.run(CustomHookEvent::Start {
                context: &mut session.context,
            })
            .await?;
        }

        // Inbound registration can be refused, so it goes before any task is spawned
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let registration = match &self.inbound {
            Some(hub) => Some(self.join_inbound(hub, &view, &cancel, &mut tasks)?),
            None => None,
        };
        if Endpoint::Poll.is_configured(caps) {
            tasks.push(tokio::spawn(poll_loop(shared.clone(), cancel.clone())));
        }
        self.background = Some(Background {
            cancel,
            tasks,
            registration,
        });

        tracing::info!(conversation_id = %conversation_id, "Session opened");
        Ok(())
    }

    fn join_inbound(
        &self,
        hub: &InboundHub,
        view: &Value,
        cancel: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> TestResult<InboundRegistration> {
        let caps = &self.shared.caps;
        let selector = match caps.get_str(Capability::SIMPLEREST_INBOUND_SELECTOR_JSONPATH) {
            Some(path) => {
                let value = caps
                    .get_str(Capability::SIMPLEREST_INBOUND_SELECTOR_VALUE)
                    .unwrap_or_else(|| DEFAULT_INBOUND_SELECTOR_VALUE.to_string());
                let value = Template::compile(&value)?.render(view);
                Some(InboundSelector::new(&path, value)?)
            }
            None => None,
        };
        let debouncer = Debouncer::from_caps(caps)?;

        let subscription = hub.register(selector)?;
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        tasks.push(debouncer.spawn(subscription.events, settled_tx, cancel.clone()));
        tasks.push(tokio::spawn(inbound_loop(
            self.shared.clone(),
            settled_rx,
            cancel.clone(),
        )));
        Ok(subscription.registration)
    }

    async fn send(&mut self, mut msg: MeMsg) -> TestResult<()> {
        let shared = &self.shared;
        if let Some(hook) = &shared.custom.on_user_says {
            let context = shared.session.lock().await.context.clone();
            hook.run(CustomHookEvent::UserSays {
                msg: &mut msg,
                context: &context,
            })
            .await?;
        }
        let _admission = self.rate_limiter.acquire().await?;

        let step_id = match shared.caps.get_str(Capability::SIMPLEREST_STEP_ID_TEMPLATE) {
            Some(template) => {
                let conversation_id = shared.session.lock().await.conversation_id.clone();
                Template::compile(&template)?.render(&json!({
                    "conversationId": conversation_id,
                    "uuid": Uuid::new_v4().to_string(),
                }))
            }
            None => Uuid::new_v4().to_string(),
        };
        let view = shared.view(Some(&msg), Some(&step_id)).await;
        let Some(response) = shared.request(Endpoint::UserSays, &view).await? else {
            return Err(TestError::configuration(
                "Capability SIMPLEREST_URL is required",
            ));
        };
        let messages = shared
            .process_response(response.body, &ContextUpdate::Selected)
            .await?;
        shared.deliver(messages).await
    }

    async fn send_stop_request(&self) {
        let shared = &self.shared;
        let caps = &shared.caps;

        let hook = match shared.hooks.lifecycle_hook(caps, Capability::SIMPLEREST_STOP_HOOK) {
            Ok(hook) => hook,
            Err(e) => {
                tracing::warn!(error = %e.message, "Stop hook unavailable");
                None
            }
        };
        if let Some(hook) = hook {
            let mut session = shared.session.lock().await;
            if let Err(e) = hook.run(&mut session.context).await {
                let e = TestError::cleanup(format!("Stop hook failed: {}", e.message));
                tracing::warn!(error = %e.message, "Cleanup problem");
            }
        }

        let view = shared.view(None, None).await;
        if let Err(e) = shared.request(Endpoint::Stop, &view).await {
            let e = TestError::cleanup(format!("Stop request failed: {}", e.message));
            tracing::warn!(error = %e.message, "Cleanup problem");
        }

        if let Some(hook) = &shared.custom.on_stop {
            let session = shared.session.lock().await;
            if let Err(e) = hook.run(CustomHookEvent::Stop { context: &session.context }).await {
                let e = TestError::cleanup(format!("Custom stop hook failed: {}", e.message));
                tracing::warn!(error = %e.message, "Cleanup problem");
            }
        }
    }

    async fn release(&mut self) {
        let Some(background) = self.background.take() else {
            return;
        };
        background.cancel.cancel();
        drop(background.registration);
        for task in background.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

impl Shared {
    async fn view(&self, msg: Option<&MeMsg>, step_id: Option<&str>) -> Value {
        let session = self.session.lock().await;
        json!({
            "context": session.context,
            "msg": msg.map_or(Value::Null, MeMsg::to_view),
            "botium": {
                "conversationId": session.conversation_id,
                "stepId": step_id,
            },
        })
    }

    /// Build, rewrite and execute one request; `None` if the endpoint has no URL
    async fn request(&self, endpoint: Endpoint, view: &Value) -> TestResult<Option<HttpResponse>> {
        let Some(mut request) = endpoint.build(&self.caps, view)? else {
            return Ok(None);
        };
        if let Some(hook) = self.hooks.request_hook(&self.caps, endpoint.request_hook())? {
            hook.rewrite(&mut request, view).await?;
        }
        let policy = endpoint.policy(&self.caps)?;
        execute(&self.client, &request, policy, endpoint).await.map(Some)
    }

    /// Run response hooks, update the context, extract messages
    async fn process_response(&self, mut body: Value, update: &ContextUpdate) -> TestResult<Vec<BotMsg>> {
        let context = self.session.lock().await.context.clone();
        for cap in [Capability::SIMPLEREST_PARSER_HOOK, Capability::SIMPLEREST_RESPONSE_HOOK] {
            if let Some(hook) = self.hooks.response_hook(&self.caps, cap)? {
                hook.process(&mut body, &context).await?;
            }
        }
        {
            let mut session = self.session.lock().await;
            self.parser.update_context(&mut session.context, &body, update);
        }
        Ok(self.parser.messages(&body))
    }

    /// Hand bot messages to the inbox, through the bot response hook
    async fn deliver(&self, messages: Vec<BotMsg>) -> TestResult<()> {
        let context = match &self.custom.on_bot_response {
            Some(_) if !messages.is_empty() => self.session.lock().await.context.clone(),
            _ => Value::Null,
        };
        for mut msg in messages {
            if let Some(hook) = &self.custom.on_bot_response {
                hook.run(CustomHookEvent::BotResponse {
                    msg: &mut msg,
                    context: &context,
                })
                .await?;
            }
            if self.outbox.send(msg).is_err() {
                tracing::debug!("Bot message dropped, connector gone");
                break;
            }
        }
        Ok(())
    }

    async fn poll_for_response(&self) -> TestResult<Vec<BotMsg>> {
        let caps = &self.caps;
        let interval = caps
            .get_millis(Capability::SIMPLEREST_POLL_INTERVAL)?
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let timeout = caps
            .get_millis(Capability::SIMPLEREST_POLL_TIMEOUT)?
            .unwrap_or(DEFAULT_POLL_TIMEOUT);
        let selector = caps
            .get_str(Capability::SIMPLEREST_POLL_SELECTOR_JSONPATH)
            .map(|path| crate::json_query::JsonQuery::parse(&path))
            .transpose()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.view(None, None).await;
            let Some(response) = self.request(Endpoint::Poll, &view).await? else {
                return Err(TestError::configuration(
                    "Capability SIMPLEREST_POLL_URL is required for polling",
                ));
            };
            let qualifies = match &selector {
                Some(selector) => selector.exists(&response.body),
                None => !response.body.is_null(),
            };
            if qualifies {
                return self.process_response(response.body, &self.updates.poll).await;
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(TestError::timeout(format!(
                    "No poll response within {} ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            result = shared.poll_for_response() => match result {
                Ok(messages) => {
                    if let Err(e) = shared.deliver(messages).await {
                        tracing::warn!(error = %e.message, "Polled response rejected");
                    }
                }
                Err(e) if e.kind == TestErrorKind::Timeout => {
                    tracing::debug!(error = %e.message, "Poll window elapsed");
                }
                Err(e) if e.kind == TestErrorKind::Configuration => {
                    tracing::error!(error = %e.message, "Polling stopped");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e.message, "Poll failed");
                    let interval = shared
                        .caps
                        .get_millis(Capability::SIMPLEREST_POLL_INTERVAL)
                        .ok()
                        .flatten()
                        .unwrap_or(DEFAULT_POLL_INTERVAL);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }
}

async fn inbound_loop(
    shared: Arc<Shared>,
    mut settled: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            event = settled.recv() => match event {
                Some(event) => {
                    let delivered = match shared.process_response(event, &shared.updates.inbound).await {
                        Ok(messages) => shared.deliver(messages).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = delivered {
                        tracing::warn!(error = %e.message, "Inbound event rejected");
                    }
                }
                None => return,
            },
        }
    }
}

#[async_trait]
impl Connector for SimpleRestConnector {
    async fn start(&mut self) -> TestResult<()> {
        // Reject a second start before touching the session
        transition(self.phase, PhaseEvent::StartSucceeded)
            .map_err(|e| TestError::configuration(e.to_string()))?;

        match self.open_session().await {
            Ok(()) => {
                self.apply(PhaseEvent::StartSucceeded)?;
            }
            Err(mut e) => {
                self.apply(PhaseEvent::StartFailed)?;
                e.message = format!("Connector start failed: {}", e.message);
                return Err(e);
            }
        }

        if let Some(text) = self.shared.caps.get_str(Capability::SIMPLEREST_INIT_TEXT) {
            self.user_says(MeMsg::text(text)).await?;
        }
        Ok(())
    }

    async fn user_says(&mut self, msg: MeMsg) -> TestResult<()> {
        if !self.phase.accepts_input() {
            let e = transition(self.phase, PhaseEvent::Sent)
                .err()
                .map_or_else(|| format!("Connector is {}", self.phase), |e| e.to_string());
            return Err(TestError::configuration(e));
        }

        match self.send(msg).await {
            Ok(()) => {
                self.apply(PhaseEvent::Sent)?;
                Ok(())
            }
            Err(e) => {
                if e.kind.aborts_session() {
                    self.apply(PhaseEvent::SendFailed)?;
                }
                Err(e)
            }
        }
    }

    async fn wait_bot_says(&mut self, timeout: Duration) -> TestResult<BotMsg> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TestError::transport("Bot message channel closed")),
            Err(_) => Err(TestError::timeout(format!(
                "Bot did not respond within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn stop(&mut self) {
        let effects = match self.apply(PhaseEvent::StopRequested) {
            Ok(effects) => effects,
            Err(e) => {
                tracing::warn!(error = %e.message, "Stop ignored");
                return;
            }
        };
        for effect in effects {
            match effect {
                PhaseEffect::RunStopRequest => self.send_stop_request().await,
                PhaseEffect::ReleaseSession => self.release().await,
            }
        }
    }

    async fn ping(&self) -> TestResult<()> {
        let shared = &self.shared;
        let view = shared.view(None, None).await;
        let Some(response) = shared.request(Endpoint::Ping, &view).await? else {
            return Ok(());
        };
        let messages = shared
            .process_response(response.body, &shared.updates.ping)
            .await?;
        if shared.caps.flag(Capability::SIMPLEREST_PING_PROCESS_RESPONSE) {
            shared.deliver(messages).await?;
        }
        Ok(())
    }

    fn phase(&self) -> ConnectorPhase {
        self.phase
    }
}
