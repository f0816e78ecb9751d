//! Demo agent with a local status view.
//!
//! Run with: cargo run -p agent-cli -- --config agent.toml
//!
//! Connects to the controller named in the config (default
//! ws://localhost:8765/browser) and serves http://localhost:3000 with the
//! session state, recent tasks, and a live event stream.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::State,
    response::{
        Html, IntoResponse,
        sse::{KeepAlive, Sse},
    },
    routing::get,
};
use clap::Parser;
use control_link_agent::Agent;
use control_link_core::{OperationError, load_config, operation_fn};
use control_link_executor::{AllOf, InputScreen, RequireUrl};
use control_link_transport::{AccessPolicy, AllowAll, HostPolicy, WsConnector};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Remote automation agent")]
struct Args {
    /// TOML config file; CONTROL_LINK__* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the local status view.
    #[arg(long, default_value = "127.0.0.1:3000")]
    status_addr: SocketAddr,

    /// Only connect to these controller hosts (repeatable).
    #[arg(long = "allow-host")]
    allow_hosts: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("loading configuration")?;

    let policy: Arc<dyn AccessPolicy> = if args.allow_hosts.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(
            args.allow_hosts
                .iter()
                .fold(HostPolicy::new(), |policy, host| policy.allow(host.as_str())),
        )
    };

    let agent = Arc::new(
        Agent::builder(config, Arc::new(WsConnector))
            .policy(policy)
            .build(),
    );
    register_demo_operations(&agent);

    if let Err(e) = agent.start().await {
        tracing::warn!("Initial connection failed: {e}");
    }

    let state = AppState {
        agent: Arc::clone(&agent),
    };
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.status_addr)
        .await
        .with_context(|| format!("binding {}", args.status_addr))?;
    tracing::info!("Status view on http://{}", args.status_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .context("serving status view")?;

    agent.shutdown().await;
    Ok(())
}

fn register_demo_operations(agent: &Agent) {
    agent.register("echo", operation_fn(|params| async move { Ok(params) }));

    agent.register(
        "sleep",
        operation_fn(|params: Value| async move {
            let ms = params["ms"].as_u64().unwrap_or(1_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        }),
    );

    agent.register(
        "fail",
        operation_fn(|params: Value| async move {
            let message = params["message"].as_str().unwrap_or("requested failure");
            Err(OperationError::new(message))
        }),
    );

    agent.register_validated(
        "navigate",
        operation_fn(|params: Value| async move {
            Ok(json!({ "url": params["url"], "loaded": true }))
        }),
        AllOf::new().with(RequireUrl::new("url")).with(InputScreen::new()),
    );
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agent = &state.agent;
    Json(json!({
        "session": agent.session().snapshot(),
        "last_status": agent.events().last_status(),
        "tasks": agent.history().list(),
        "queues": agent.queues().list(),
    }))
}

async fn events_handler(State(state): State<AppState>) -> impl IntoResponse {
    Sse::new(state.agent.events().sse_stream()).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Agent Status</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin-bottom: 10px; }
        .status { font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        pre { background: #111; padding: 10px; height: calc(100vh - 160px); overflow: auto; }
    </style>
</head>
<body>
    <h1>Agent</h1>
    <div class="status" id="status">Waiting for events...</div>
    <pre id="log"></pre>

    <script>
        const status = document.getElementById('status');
        const log = document.getElementById('log');
        const events = new EventSource('/events');

        function append(kind, data) {
            log.textContent = `[${kind}] ${data}\n` + log.textContent;
        }

        events.addEventListener('status', (event) => {
            const msg = JSON.parse(event.data);
            status.textContent = msg.status;
            status.className = 'status ' + (msg.status === 'connected' ? 'connected' : 'disconnected');
            append('status', event.data);
        });
        ['session', 'task', 'queue_finished'].forEach((kind) => {
            events.addEventListener(kind, (event) => append(kind, event.data));
        });
    </script>
</body>
</html>
"#;
