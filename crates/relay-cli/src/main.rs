//! relay: run streaming model turns against MCP tool servers
//!
//! Every push event of a turn is printed on stdout as one JSON object per
//! line; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_cli::events;
use relay_cli::mcp::{ServerConnectionManager, ToolCatalog};
use relay_cli::{AbortReason, AppConfig, Session, SessionContext, SessionRegistry, TurnOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(about = "Streaming model turns with MCP tool servers", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: search for relay.toml)
    #[arg(short, long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Model to use (overrides config)
    #[arg(short, long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one turn and print its events
    Ask {
        /// The prompt to send
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Tools to offer: encoded tool names or server keys (default: all)
        #[arg(long, value_delimiter = ',')]
        tools: Option<Vec<String>>,

        /// Load the session from this file and save it back afterwards
        #[arg(long)]
        session_file: Option<PathBuf>,
    },

    /// Run one turn per line of stdin in a single session
    Chat {
        /// Tools to offer: encoded tool names or server keys (default: all)
        #[arg(long, value_delimiter = ',')]
        tools: Option<Vec<String>>,
    },

    /// Start all servers and show their status
    Servers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start all servers and list the tools they offer
    Tools {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Everything a command needs once configuration is loaded
struct Relay {
    manager: Arc<ServerConnectionManager>,
    orchestrator: TurnOrchestrator,
    sessions: SessionRegistry,
    system_prompt: Option<String>,
}

impl Relay {
    async fn start(config: AppConfig, model: Option<String>) -> Result<Self> {
        let backend = relay_core::build_backend(&config.backend)?;
        let manager = Arc::new(start_servers(&config).await?);

        let model = model.unwrap_or_else(|| config.backend.model());
        let orchestrator = TurnOrchestrator::new(backend, manager.clone(), config.turn.clone())
            .with_model(model)
            .with_sampling(config.backend.max_tokens, config.backend.temperature);

        Ok(Self {
            manager,
            orchestrator,
            sessions: SessionRegistry::new(),
            system_prompt: config.turn.system_prompt,
        })
    }

    async fn catalog(&self, tools: Option<&[String]>) -> ToolCatalog {
        ToolCatalog::build(&self.manager).await.select(tools)
    }

    /// Run one turn, printing events until its terminal event. Ctrl-C stops
    /// the turn and drops the exchange from the session.
    async fn turn(&self, context: &SessionContext, prompt: String, catalog: &ToolCatalog) -> Result<()> {
        let (tx, mut rx) = events::channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                }
            }
        });

        let turn = self.orchestrator.run_turn(context, prompt, catalog, tx);
        tokio::pin!(turn);

        let mut stopped = false;
        let result = loop {
            tokio::select! {
                result = &mut turn => break result,
                _ = tokio::signal::ctrl_c(), if !stopped => {
                    info!(session_id = %context.id(), "Interrupted; stopping generation");
                    context.cancel_turn(AbortReason::Caller);
                    stopped = true;
                }
            }
        };
        printer.await.context("Event printer failed")?;

        if stopped {
            self.sessions.stop_generation(context.id()).await?;
        }
        result.map(|_| ()).map_err(Into::into)
    }

    async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}

async fn start_servers(config: &AppConfig) -> Result<ServerConnectionManager> {
    let manager = ServerConnectionManager::new(config.registry()?);
    let failed = manager.start_all().await;
    if !failed.is_empty() {
        warn!(servers = ?failed, "Some MCP servers failed to start");
    }
    Ok(manager)
}

async fn ask(relay: &Relay, prompt: String, tools: Option<Vec<String>>, session_file: Option<PathBuf>) -> Result<()> {
    let session = match &session_file {
        Some(path) if path.exists() => Session::load(path)?,
        _ => match &relay.system_prompt {
            Some(system) => Session::with_system_prompt(system),
            None => Session::new(),
        },
    };
    let context = relay.sessions.insert(session);
    let catalog = relay.catalog(tools.as_deref()).await;

    let result = relay.turn(&context, prompt, &catalog).await;

    if let Some(path) = &session_file {
        context.lock().await.save(path)?;
    }
    result
}

async fn chat(relay: &Relay, tools: Option<Vec<String>>) -> Result<()> {
    let context = relay.sessions.create(relay.system_prompt.as_deref());
    let catalog = relay.catalog(tools.as_deref()).await;
    info!(session_id = %context.id(), tools = catalog.len(), "Chat session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // A failed turn is already reported as an error event
        if let Err(e) = relay.turn(&context, line.to_string(), &catalog).await {
            warn!(error = %e, "Turn failed");
        }
    }
    Ok(())
}

async fn list_servers(config: &AppConfig, json: bool) -> Result<()> {
    let manager = start_servers(config).await?;
    let summary = manager.summary().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if summary.is_empty() {
        println!("No MCP servers configured");
    } else {
        println!("{:<24} {:<16} {:<10} ERROR", "SERVER", "TRANSPORT", "STATE");
        for server in &summary {
            let transport = server.transport.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "{:<24} {:<16} {:<10} {}",
                server.key,
                transport,
                server.state.to_string(),
                server.last_error.as_deref().unwrap_or("")
            );
        }
    }

    manager.stop_all().await;
    Ok(())
}

async fn list_tools(config: &AppConfig, json: bool) -> Result<()> {
    let manager = start_servers(config).await?;
    let catalog = ToolCatalog::build(&manager).await;

    if json {
        let tools: Vec<_> = catalog.iter().collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else if catalog.is_empty() {
        println!("No tools available");
    } else {
        for tool in catalog.iter() {
            println!("{:<40} {}", tool.name, tool.description);
        }
    }

    manager.stop_all().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            prompt,
            tools,
            session_file,
        } => {
            let relay = Relay::start(config, cli.model).await?;
            let result = ask(&relay, prompt.join(" "), tools, session_file).await;
            relay.shutdown().await;
            result
        }
        Commands::Chat { tools } => {
            let relay = Relay::start(config, cli.model).await?;
            let result = chat(&relay, tools).await;
            relay.shutdown().await;
            result
        }
        Commands::Servers { json } => list_servers(&config, json).await,
        Commands::Tools { json } => list_tools(&config, json).await,
    }
}
