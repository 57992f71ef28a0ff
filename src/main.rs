mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quorum_core::events::EventType;
use quorum_core::provider::{LlmProvider, StreamOptions};
use quorum_core::retry::RetryPolicy;
use quorum_engine::{HttpWorkspace, LlmSpecialist, RemoteSpecialist, RunnerConfig, SpecialistAgent};
use quorum_llm::{OpenAiProvider, ReliableProvider};
use quorum_server::{AppState, OrchestratorConfig, ResearchOrchestrator, ServerConfig};
use quorum_store::SessionStore;
use quorum_telemetry::{LogAnalyticsStore, PollerConfig, TracePoller, TraceStore};
use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::settings::{Settings, SpecialistSettings};

#[derive(Parser)]
#[command(name = "quorum", version, about = "Multi-agent research orchestrator with live event streaming")]
struct Cli {
    /// Settings file. Defaults to ~/.quorum/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the session API over HTTP with SSE event streams.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one session locally and print its event stream to stdout.
    Ask {
        query: String,
        /// Extra context as a JSON object.
        #[arg(long)]
        context: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings(&path)?;
    quorum_telemetry::init_logging(&settings.logging)?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await
        }
        Command::Ask { query, context } => ask(settings, query, context).await,
    }
}

/// The orchestrating agent's model with rate-limit retries.
type OrchestratingModel = ReliableProvider<Arc<dyn LlmProvider>>;

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let (orchestrator, model) = build_orchestrator(&settings)?;
    let mut state = AppState::new(orchestrator);
    state.event_buffer = settings.agent.event_buffer;
    if let Some((store, poller)) = trace_store(&settings)? {
        state = state.with_traces(store, poller);
    }

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
    };
    let handle = quorum_server::start(&config, state)
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    tracing::info!(addr = %handle.addr, "quorum ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    tracing::info!(model_retries = model.total_retries(), "quorum stopped");
    Ok(())
}

async fn ask(settings: Settings, query: String, context: Option<String>) -> anyhow::Result<()> {
    let context = context
        .map(|raw| serde_json::from_str::<Map<String, Value>>(&raw))
        .transpose()
        .context("--context must be a JSON object")?;

    let (orchestrator, model) = build_orchestrator(&settings)?;
    let session = orchestrator.store().create(query, context);
    let started = orchestrator.begin(&session.id)?;

    let poller = trace_store(&settings)?.map(|(store, config)| {
        TracePoller::new(
            store,
            config,
            started.session_id.clone(),
            started.operation_id.clone(),
        )
    });
    let events = orchestrator.run(started);
    let mut rx = quorum_server::spawn_run(events, poller, settings.agent.event_buffer);

    let mut failed = false;
    let mut cancelled = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    failed |= event.event_type == EventType::WorkflowFailed;
                    print!("{}", quorum_server::frame(&event));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = orchestrator.cancel(&session.id);
            }
        }
    }

    tracing::info!(session_id = %session.id, model_retries = model.total_retries(), "session finished");
    if failed {
        anyhow::bail!("session {} failed", session.id);
    }
    Ok(())
}

fn build_orchestrator(
    settings: &Settings,
) -> anyhow::Result<(Arc<ResearchOrchestrator>, Arc<OrchestratingModel>)> {
    let api_key = std::env::var(&settings.model.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .map(SecretString::from);
    if api_key.is_none() {
        tracing::warn!(env = %settings.model.api_key_env, "no model API key set");
    }

    let model: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(
        &settings.model.base_url,
        &settings.model.model,
        api_key,
    )?);
    let reliable = Arc::new(ReliableProvider::new(Arc::clone(&model), settings.retry.clone()));
    let orchestrating: Arc<dyn LlmProvider> = reliable.clone();

    let specialists = settings
        .specialists
        .iter()
        .map(|spec| build_specialist(spec, &model, &settings.retry))
        .collect::<anyhow::Result<Vec<_>>>()?;
    tracing::info!(count = specialists.len(), model = %settings.model.model, "specialists configured");

    let config = OrchestratorConfig {
        runner: RunnerConfig {
            max_turns: settings.agent.max_turns,
            stream_options: StreamOptions {
                max_tokens: settings.model.max_tokens,
                temperature: settings.model.temperature,
            },
        },
        queue_capacity: settings.agent.queue_capacity,
        tool_timeout: settings.agent.tool_timeout_secs.map(Duration::from_secs),
    };
    let mut orchestrator =
        ResearchOrchestrator::new(Arc::new(SessionStore::new()), orchestrating, specialists)
            .with_config(config);
    if let Some(endpoint) = &settings.workspace.endpoint {
        orchestrator = orchestrator.with_workspace(Arc::new(HttpWorkspace::new(endpoint.clone())?));
    }
    Ok((Arc::new(orchestrator), reliable))
}

fn build_specialist(
    spec: &SpecialistSettings,
    model: &Arc<dyn LlmProvider>,
    retry: &RetryPolicy,
) -> anyhow::Result<Arc<dyn SpecialistAgent>> {
    match (&spec.endpoint, &spec.system_prompt) {
        (Some(endpoint), _) => {
            let mut remote =
                RemoteSpecialist::new(&spec.name, &spec.description, endpoint, retry.clone())?;
            if let Some(key) = spec.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()) {
                remote = remote.with_api_key(SecretString::from(key));
            }
            Ok(Arc::new(remote))
        }
        (None, Some(prompt)) => Ok(Arc::new(LlmSpecialist::new(
            &spec.name,
            &spec.description,
            prompt,
            Arc::clone(model),
            retry.clone(),
        ))),
        (None, None) => anyhow::bail!(
            "specialist {} needs either an endpoint or a system_prompt",
            spec.name
        ),
    }
}

fn trace_store(settings: &Settings) -> anyhow::Result<Option<(Arc<dyn TraceStore>, PollerConfig)>> {
    let Some(endpoint) = &settings.trace.endpoint else {
        return Ok(None);
    };
    let token = std::env::var(&settings.trace.token_env).with_context(|| {
        format!("{} must be set when trace.endpoint is configured", settings.trace.token_env)
    })?;
    let store = LogAnalyticsStore::new(
        endpoint,
        &settings.trace.workspace_id,
        SecretString::from(token),
    )?;
    Ok(Some((Arc::new(store), settings.trace.poller.clone())))
}
