//! Outbound HTTP requests: templated construction from capabilities and
//! execution with per-attempt timeout and retries

use crate::capabilities::{Capabilities, Capability};
use crate::error::{TestError, TestResult};
use crate::template::{render_json, value_to_text, Template};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The request kinds a REST connector issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Ping,
    Start,
    UserSays,
    Poll,
    Stop,
}

/// Capability keys configuring one endpoint
struct EndpointCaps {
    url: Capability,
    verbs: &'static [Capability],
    body: Capability,
    body_raw: Capability,
    headers: Capability,
    request_hook: Capability,
    retries: Option<Capability>,
    timeout: Option<Capability>,
}

impl Endpoint {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Start => "start",
            Self::UserSays => "user_says",
            Self::Poll => "poll",
            Self::Stop => "stop",
        }
    }

    fn caps(self) -> EndpointCaps {
        use Capability as C;
        match self {
            Self::Ping => EndpointCaps {
                url: C::SIMPLEREST_PING_URL,
                verbs: &[C::SIMPLEREST_PING_VERB],
                body: C::SIMPLEREST_PING_BODY,
                body_raw: C::SIMPLEREST_PING_BODY_RAW,
                headers: C::SIMPLEREST_PING_HEADERS,
                request_hook: C::SIMPLEREST_PING_REQUEST_HOOK,
                retries: Some(C::SIMPLEREST_PING_RETRIES),
                timeout: Some(C::SIMPLEREST_PING_TIMEOUT),
            },
            Self::Start => EndpointCaps {
                url: C::SIMPLEREST_START_URL,
                verbs: &[C::SIMPLEREST_START_VERB],
                body: C::SIMPLEREST_START_BODY,
                body_raw: C::SIMPLEREST_START_BODY_RAW,
                headers: C::SIMPLEREST_START_HEADERS,
                request_hook: C::SIMPLEREST_START_REQUEST_HOOK,
                retries: Some(C::SIMPLEREST_START_RETRIES),
                timeout: Some(C::SIMPLEREST_START_TIMEOUT),
            },
            Self::UserSays => EndpointCaps {
                url: C::SIMPLEREST_URL,
                verbs: &[C::SIMPLEREST_METHOD, C::SIMPLEREST_VERB],
                body: C::SIMPLEREST_BODY_TEMPLATE,
                body_raw: C::SIMPLEREST_BODY_RAW,
                headers: C::SIMPLEREST_HEADERS_TEMPLATE,
                request_hook: C::SIMPLEREST_REQUEST_HOOK,
                retries: Some(C::SIMPLEREST_RETRIES),
                timeout: Some(C::SIMPLEREST_TIMEOUT),
            },
            Self::Poll => EndpointCaps {
                url: C::SIMPLEREST_POLL_URL,
                verbs: &[C::SIMPLEREST_POLL_VERB],
                body: C::SIMPLEREST_POLL_BODY,
                body_raw: C::SIMPLEREST_POLL_BODY_RAW,
                headers: C::SIMPLEREST_POLL_HEADERS,
                request_hook: C::SIMPLEREST_POLL_REQUEST_HOOK,
                retries: None,
                timeout: Some(C::SIMPLEREST_TIMEOUT),
            },
            Self::Stop => EndpointCaps {
                url: C::SIMPLEREST_STOP_URL,
                verbs: &[C::SIMPLEREST_STOP_VERB],
                body: C::SIMPLEREST_STOP_BODY,
                body_raw: C::SIMPLEREST_STOP_BODY_RAW,
                headers: C::SIMPLEREST_STOP_HEADERS,
                request_hook: C::SIMPLEREST_STOP_REQUEST_HOOK,
                retries: Some(C::SIMPLEREST_STOP_RETRIES),
                timeout: Some(C::SIMPLEREST_STOP_TIMEOUT),
            },
        }
    }

    fn default_attempts(self) -> u32 {
        match self {
            Self::Ping | Self::Start | Self::Stop => 6,
            Self::UserSays | Self::Poll => 1,
        }
    }

    pub fn is_configured(self, caps: &Capabilities) -> bool {
        caps.contains(self.caps().url)
    }

    /// Capability naming the request hook for this endpoint
    pub fn request_hook(self) -> Capability {
        self.caps().request_hook
    }

    pub fn policy(self, caps: &Capabilities) -> TestResult<RequestPolicy> {
        let keys = self.caps();
        let attempts = match keys.retries {
            Some(cap) => caps
                .get_u64(cap)?
                .map_or(self.default_attempts(), |n| u32::try_from(n).unwrap_or(u32::MAX)),
            None => self.default_attempts(),
        };
        let timeout = match keys.timeout {
            Some(cap) => caps.get_millis(cap)?.unwrap_or(DEFAULT_TIMEOUT),
            None => DEFAULT_TIMEOUT,
        };
        Ok(RequestPolicy {
            attempts: attempts.max(1),
            timeout,
        })
    }

    /// Build the request for this endpoint against a template view.
    ///
    /// Returns `None` when the endpoint has no URL configured.
    pub fn build(self, caps: &Capabilities, view: &Value) -> TestResult<Option<HttpRequest>> {
        let keys = self.caps();
        let Some(url) = caps.get_str(keys.url) else {
            return Ok(None);
        };
        let url = Template::compile(&url)?.render(view);

        let verb = keys
            .verbs
            .iter()
            .find_map(|cap| caps.get_str(*cap))
            .unwrap_or_else(|| "GET".to_string());
        let method = Method::from_bytes(verb.to_ascii_uppercase().as_bytes()).map_err(|_| {
            TestError::configuration(format!("Invalid HTTP verb \"{verb}\" for {} request", self.label()))
        })?;

        let headers = match caps.get_json(keys.headers)? {
            None => Vec::new(),
            Some(Value::Object(map)) => match render_json(&Value::Object(map), view)? {
                Value::Object(rendered) => rendered
                    .into_iter()
                    .map(|(name, value)| (name, value_to_text(&value)))
                    .collect(),
                _ => Vec::new(),
            },
            Some(_) => {
                return Err(TestError::configuration(format!(
                    "Capability {} must be a JSON object",
                    keys.headers.as_str()
                )))
            }
        };

        let body = if caps.flag(keys.body_raw) {
            match caps.get_str(keys.body) {
                Some(raw) => RequestBody::Raw(Template::compile(&raw)?.render(view)),
                None => RequestBody::None,
            }
        } else {
            match caps.get_json(keys.body)? {
                Some(template) => RequestBody::Json(render_json(&template, view)?),
                None => RequestBody::None,
            }
        };

        Ok(Some(HttpRequest {
            method,
            url,
            headers,
            body,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Json(Value),
    Raw(String),
}

/// A fully rendered request, open to rewriting by request hooks
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON, or the raw text as a JSON string when not JSON
    pub body: Value,
}

enum Failure {
    Retryable(TestError),
    Fatal(TestError),
}

fn retry_delay(attempt: u32) -> Duration {
    // Linear backoff: 100ms, 200ms, 300ms, ...
    Duration::from_millis(100 * u64::from(attempt))
}

/// Execute a request under a retry policy.
///
/// Network errors, timeouts, 429 and 5xx responses are retried; any other
/// non-success status fails immediately.
pub async fn execute(
    client: &Client,
    request: &HttpRequest,
    policy: RequestPolicy,
    endpoint: Endpoint,
) -> TestResult<HttpResponse> {
    let mut last_error = None;
    for attempt in 1..=policy.attempts {
        let start = Instant::now();
        let result = send_once(client, request, policy.timeout).await;
        let duration = start.elapsed();

        match result {
            Ok(response) => {
                tracing::info!(
                    endpoint = endpoint.label(),
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    attempt,
                    duration_ms = %duration.as_millis(),
                    "Request completed"
                );
                return Ok(response);
            }
            Err(Failure::Fatal(e)) => {
                tracing::error!(
                    endpoint = endpoint.label(),
                    url = %request.url,
                    attempt,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    "Request failed"
                );
                return Err(e);
            }
            Err(Failure::Retryable(e)) => {
                tracing::warn!(
                    endpoint = endpoint.label(),
                    url = %request.url,
                    attempt,
                    max_attempts = policy.attempts,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    "Request attempt failed"
                );
                last_error = Some(e);
                if attempt < policy.attempts {
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
        }
    }

    let reason = last_error.map_or_else(String::new, |e| e.message);
    Err(TestError::transport(format!(
        "{} request to {} failed after {} attempt(s): {reason}",
        endpoint.label(),
        request.url,
        policy.attempts
    )))
}

async fn send_once(client: &Client, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, Failure> {
    let mut builder = client
        .request(request.method.clone(), &request.url)
        .timeout(timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = match &request.body {
        RequestBody::None => builder,
        RequestBody::Json(body) => builder.json(body),
        RequestBody::Raw(body) => builder.body(body.clone()),
    };

    let response = builder.send().await.map_err(|e| {
        let message = if e.is_timeout() {
            format!("Request timeout: {e}")
        } else if e.is_connect() {
            format!("Connection failed: {e}")
        } else {
            format!("Request failed: {e}")
        };
        Failure::Retryable(TestError::transport(message))
    })?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| Failure::Retryable(TestError::transport(format!("Failed to read response: {e}"))))?;

    if status.is_success() {
        return Ok(HttpResponse {
            status: status.as_u16(),
            body: parse_body(&text),
        });
    }

    let error = TestError::transport(format!("HTTP {status}: {text}"));
    if status.as_u16() == 429 || status.is_server_error() {
        Err(Failure::Retryable(error))
    } else {
        Err(Failure::Fatal(error))
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TestErrorKind;
    use axum::{extract::State, http::StatusCode, routing::any, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Server answering with `fail_status` for the first `failures` calls
    async fn flaky_server(failures: usize, fail_status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/",
                any(
                    move |State(calls): State<Arc<AtomicUsize>>| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures {
                            (fail_status, Json(json!({ "error": "nope" })))
                        } else {
                            (StatusCode::OK, Json(json!({ "ok": true, "call": n })))
                        }
                    },
                ),
            )
            .with_state(calls.clone());
        (serve(router).await, calls)
    }

    fn request(url: String) -> HttpRequest {
        HttpRequest {
            method: Method::POST,
            url,
            headers: Vec::new(),
            body: RequestBody::Json(json!({ "text": "hi" })),
        }
    }

    fn policy(attempts: u32) -> RequestPolicy {
        RequestPolicy {
            attempts,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_build_renders_templates() {
        let caps = Capabilities::new()
            .with(Capability::SIMPLEREST_URL, "http://bot/{{botium.conversationId}}")
            .with(Capability::SIMPLEREST_METHOD, "post")
            .with(Capability::SIMPLEREST_HEADERS_TEMPLATE, json!({ "x-session": "{{context.sid}}" }))
            .with(
                Capability::SIMPLEREST_BODY_TEMPLATE,
                json!({ "text": "{{msg.messageText}}", "n": 1 }),
            );
        let view = json!({
            "context": { "sid": "s1" },
            "msg": { "messageText": "hello" },
            "botium": { "conversationId": "c1" }
        });
        let built = Endpoint::UserSays.build(&caps, &view).unwrap().unwrap();
        assert_eq!(built.method, Method::POST);
        assert_eq!(built.url, "http://bot/c1");
        assert_eq!(built.headers, vec![("x-session".to_string(), "s1".to_string())]);
        assert_eq!(built.body, RequestBody::Json(json!({ "text": "hello", "n": 1 })));
    }

    #[test]
    fn test_build_raw_body() {
        let caps = Capabilities::new()
            .with(Capability::SIMPLEREST_START_URL, "http://bot/start")
            .with(Capability::SIMPLEREST_START_BODY, "user={{context.user}}")
            .with(Capability::SIMPLEREST_START_BODY_RAW, true);
        let built = Endpoint::Start
            .build(&caps, &json!({ "context": { "user": "u1" } }))
            .unwrap()
            .unwrap();
        assert_eq!(built.method, Method::GET);
        assert_eq!(built.body, RequestBody::Raw("user=u1".to_string()));
    }

    #[test]
    fn test_build_without_url() {
        assert!(Endpoint::Stop.build(&Capabilities::new(), &Value::Null).unwrap().is_none());
    }

    #[test]
    fn test_invalid_verb() {
        let caps = Capabilities::new()
            .with(Capability::SIMPLEREST_PING_URL, "http://bot")
            .with(Capability::SIMPLEREST_PING_VERB, "NOT A VERB");
        let err = Endpoint::Ping.build(&caps, &Value::Null).unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Configuration);
    }

    #[test]
    fn test_policy_defaults() {
        let caps = Capabilities::new().with(Capability::SIMPLEREST_START_TIMEOUT, 2500);
        let start = Endpoint::Start.policy(&caps).unwrap();
        assert_eq!(start.attempts, 6);
        assert_eq!(start.timeout, Duration::from_millis(2500));
        assert_eq!(Endpoint::UserSays.policy(&caps).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let (url, calls) = flaky_server(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let response = execute(&Client::new(), &request(url), policy(3), Endpoint::Start)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["ok"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_transport_error() {
        let (url, calls) = flaky_server(10, StatusCode::BAD_GATEWAY).await;
        let err = execute(&Client::new(), &request(url), policy(2), Endpoint::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Transport);
        assert!(err.message.contains("failed after 2 attempt(s)"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let (url, calls) = flaky_server(10, StatusCode::NOT_FOUND).await;
        let err = execute(&Client::new(), &request(url), policy(5), Endpoint::UserSays)
            .await
            .unwrap_err();
        assert!(err.message.contains("404"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retried_then_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let err = execute(&Client::new(), &request(url), policy(2), Endpoint::Ping)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_slow_attempts_cut_off_and_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/",
                any(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Json(json!({ "late": true }))
                }),
            )
            .with_state(calls.clone());
        let url = serve(router).await;
        let policy = RequestPolicy {
            attempts: 3,
            timeout: Duration::from_millis(100),
        };

        let started = Instant::now();
        let err = execute(&Client::new(), &request(url), policy, Endpoint::UserSays)
            .await
            .unwrap_err();
        // three cut-off attempts plus 100ms and 200ms of backoff
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(err.kind, TestErrorKind::Transport);
        assert!(err.message.contains("failed after 3 attempt(s)"));
        assert!(err.message.contains("Request timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({ "a": 1 }));
        assert_eq!(parse_body("plain text"), json!("plain text"));
    }
}
