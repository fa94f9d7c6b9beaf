//! agentdeck - Live agent session orchestrator

use agentdeck::{
    agent::{AdapterFactory, ClaudeCliFactory, ScriptedFactory},
    config::{AgentdeckConfig, EngineKind},
    protocol::EventBroadcaster,
    session::{ActorSettings, SessionRegistry},
    store::Storage,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentdeck")]
#[command(version)]
#[command(about = "Live agent session orchestrator")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Directory for session records and message logs
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Agent engine for new sessions
        #[arg(long, value_enum)]
        engine: Option<EngineKind>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentdeck={},tower_http={}", log_level, log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => AgentdeckConfig::load(path)?,
        None => AgentdeckConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
            engine,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(dir) = data_dir {
                config.storage.base_dir = dir;
            }
            if let Some(engine) = engine {
                config.agent.engine = engine;
            }
            run_gateway(config).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_gateway(config: AgentdeckConfig) -> Result<()> {
    tracing::info!(
        engine = ?config.agent.engine,
        data_dir = %config.storage.base_dir.display(),
        persist = config.storage.persist,
        "Starting agentdeck"
    );

    let storage = Storage::open(&config.storage).await?;
    let events = EventBroadcaster::new(config.gateway.event_buffer);
    let factory: Arc<dyn AdapterFactory> = match config.agent.engine {
        EngineKind::Claude => Arc::new(ClaudeCliFactory::new(&config.agent)),
        EngineKind::Echo => Arc::new(ScriptedFactory::echo()),
    };

    let registry = Arc::new(
        SessionRegistry::new(factory, storage, events, ActorSettings::from_config(&config))
            .with_default_model(config.agent.default_model.clone()),
    );
    let sweeper = registry.spawn_retention_sweeper(&config.storage);

    tracing::info!("agentdeck is running. Press Ctrl+C to stop.");
    agentdeck::gateway::serve(&config.gateway, registry).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}

fn show_config(config: Option<&AgentdeckConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    println!("{}", config.to_toml()?);
    Ok(())
}
