mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use brewva_channels::telegram::api::TelegramApi;
use brewva_channels::telegram::webhook::serve_ingress;
use brewva_channels::telegram::{
    resolve_webhook_config, update_to_turn, EnvOverlay, TelegramWebhookTransport, UpdateHandler,
};
use brewva_core::{
    ChannelCoordinator, Gateway, Orchestrator, StubTaskRunner,
};
use brewva_events::EventStore;
use brewva_registry::AgentRegistry;
use brewva_runtime::{RuntimeConfig, RuntimeManager, StubRuntimeFactory};

use crate::config::{load_config, BrewvaConfig};

#[derive(Parser)]
#[command(name = "brewva", version, about = "Multi-agent orchestration service for chat channels")]
struct Cli {
    #[arg(long, default_value = ".", help = "Workspace root (holds .brewva/ state)")]
    workspace: PathBuf,

    #[arg(long, help = "Config file path (defaults to <workspace>/brewva.yaml)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the channel ingress and serve turns")]
    Serve,
    #[command(about = "List registered agents")]
    Agents,
    #[command(about = "Validate the config file")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.workspace.join("brewva.yaml"));
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Validate => {
            println!(
                "Config valid. {} owners, fanout limit {}, pool size {}.",
                config.gateway.owners.len(),
                config.limits.fanout_max_agents,
                config.runtime_pool.max_live_runtimes
            );
        }
        Commands::Agents => {
            let registry = AgentRegistry::open(&cli.workspace).await?;
            for agent in registry.list().await {
                let model = agent.model.as_deref().unwrap_or("-");
                println!("@{}  model={}", agent.agent_id, model);
            }
        }
        Commands::Serve => {
            serve(&cli.workspace, config).await?;
        }
    }

    Ok(())
}

/// Bridges the transport to the gateway: update in, reply out.
struct GatewayUpdateHandler {
    gateway: Arc<Gateway>,
    api: Option<Arc<TelegramApi>>,
}

#[async_trait]
impl UpdateHandler for GatewayUpdateHandler {
    async fn on_update(&self, update: serde_json::Value) -> Result<()> {
        let Some(turn) = update_to_turn(&update) else {
            tracing::debug!("ignoring telegram update without text");
            return Ok(());
        };
        let Some(reply) = self.gateway.handle_turn(&turn).await? else {
            return Ok(());
        };
        if reply.is_empty() {
            return Ok(());
        }
        match &self.api {
            Some(api) => {
                api.send_message(&turn.conversation_id, &reply).await?;
            }
            None => {
                tracing::info!(conversation = %turn.conversation_key(), "reply: {reply}");
            }
        }
        Ok(())
    }
}

async fn serve(workspace: &Path, config: BrewvaConfig) -> Result<()> {
    let telegram = &config.channels.telegram;
    if !telegram.enabled {
        bail!("no channel enabled; set channels.telegram.enabled: true");
    }
    if !telegram.webhook.enabled {
        bail!("telegram webhook is not enabled; set channels.telegram.webhook.enabled: true");
    }
    let webhook = resolve_webhook_config(&telegram.webhook, &EnvOverlay::from_process_env())?;

    let registry = Arc::new(AgentRegistry::open(workspace).await?);
    let runtimes = Arc::new(RuntimeManager::new(
        workspace,
        RuntimeConfig::default(),
        config.runtime_pool.clone(),
        Arc::new(StubRuntimeFactory),
    ));
    let events = Arc::new(EventStore::new(workspace.join(".brewva").join("events")));
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        runtimes,
        events,
        Arc::new(StubTaskRunner),
    ));

    let cancel = CancellationToken::new();
    let coordinator = ChannelCoordinator::new(config.limits.clone(), orchestrator.clone())
        .with_forbid_self_a2a(config.forbid_self_a2a)
        .with_cancellation(cancel.clone());
    let gateway = Arc::new(Gateway::new(
        registry,
        orchestrator,
        coordinator,
        config.gateway.clone(),
    ));

    let api = telegram
        .bot_token
        .as_ref()
        .map(|token| Arc::new(TelegramApi::new(token)));
    if api.is_none() {
        tracing::warn!("channels.telegram.bot_token not set; replies will only be logged");
    }

    let transport = Arc::new(TelegramWebhookTransport::new());
    transport
        .set_error_hook(Arc::new(|e| {
            tracing::error!("telegram update handler failed: {e}");
        }))
        .await;
    transport
        .start(Arc::new(GatewayUpdateHandler { gateway, api }))
        .await;

    let ingress = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_ingress(&webhook, transport, cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    transport.stop().await;
    ingress.await??;
    Ok(())
}
