//! botcheck - run convo files against a bot
//!
//! Usage: `botcheck <convo.json>...` with the capability file named by
//! `BOTCHECK_CAPS` (default `botcheck.json`). Capability keys set as
//! environment variables override the file.

use botcheck::{
    load_convos, Capabilities, Convo, ConvoOutcome, ConvoRunner, InboundHub, InboundServer, LoggingConnector,
    RateLimiter, ScriptingRegistry, SimpleRestConnector, TestResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Process-wide resources shared by all sessions
struct Shared {
    caps: Arc<Capabilities>,
    registry: ScriptingRegistry,
    rate_limiter: Arc<RateLimiter>,
    inbound: Option<InboundHub>,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "botcheck=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let caps_path = std::env::var("BOTCHECK_CAPS").unwrap_or_else(|_| "botcheck.json".to_string());
    let caps = Capabilities::load(Path::new(&caps_path))?.with_env_overrides();
    tracing::info!(path = %caps_path, keys = ?caps.keys(), "Capabilities loaded");

    let mut convo_paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if convo_paths.is_empty() {
        if let Some(paths) = std::env::var_os("BOTCHECK_CONVOS") {
            convo_paths = std::env::split_paths(&paths).collect();
        }
    }
    if convo_paths.is_empty() {
        return Err("No convo files given (arguments or BOTCHECK_CONVOS)".into());
    }
    let mut convos = Vec::new();
    for path in &convo_paths {
        convos.extend(load_convos(path)?);
    }
    tracing::info!(convos = convos.len(), "Convos loaded");

    // Inbound webhook, shared by all sessions
    let hub = InboundHub::new();
    let server = InboundServer::from_caps(hub.clone(), &caps).await?;

    let shared = Shared {
        rate_limiter: Arc::new(RateLimiter::from_caps(&caps)?),
        caps: Arc::new(caps),
        registry: ScriptingRegistry::builtin(),
        inbound: server.as_ref().map(|_| hub),
        cancel: CancellationToken::new(),
    };

    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling running convos");
            cancel.cancel();
        }
    });

    let outcomes = futures::future::join_all(convos.iter().map(|convo| run_convo(&shared, convo))).await;

    if let Some(server) = server {
        server.shutdown().await;
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    let report: Vec<_> = outcomes.iter().map(ConvoOutcome::summary).collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(total = outcomes.len(), failed, "Test run finished");

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_convo(shared: &Shared, convo: &Convo) -> ConvoOutcome {
    match prepare(shared, convo) {
        Ok((runner, mut connector)) => runner.run(convo, &mut connector).await,
        Err(e) => {
            tracing::error!(convo = %convo.name, error = %e.message, "Convo setup failed");
            ConvoOutcome::failed(convo.name.clone(), e)
        }
    }
}

fn prepare(shared: &Shared, convo: &Convo) -> TestResult<(ConvoRunner, LoggingConnector)> {
    let runner = ConvoRunner::from_caps(&shared.registry, shared.caps.clone())?.with_cancel(shared.cancel.clone());
    let mut builder = SimpleRestConnector::builder((*shared.caps).clone()).rate_limiter(shared.rate_limiter.clone());
    if let Some(hub) = &shared.inbound {
        builder = builder.inbound(hub.clone());
    }
    let connector = LoggingConnector::new(Box::new(builder.build()?), convo.name.clone());
    Ok((runner, connector))
}
