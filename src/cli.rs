//! Command-line interface.

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ai_client::{
    AssistantClient, ClaudeCodeClient, ClaudeCodeConfig, CodexClient, CodexConfig,
};

use crate::config::ArchonConfig;
use crate::error::Result;
use crate::isolation::{CleanupScheduler, IsolationProvider};
use crate::orchestrator::Orchestrator;
use crate::platform::console::ConsoleAdapter;
use crate::platform::InboundMessage;
use crate::storage::Store;

#[derive(Parser)]
#[command(name = "archon", about = "Remote agentic coding orchestrator", version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat with the orchestrator on stdin/stdout
    Serve,
    /// Show known codebases
    Status,
    /// Inspect or clean isolation environments
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Run one cleanup sweep and exit
    Cleanup,
}

#[derive(Subcommand)]
pub enum WorktreeAction {
    List,
    Clean,
}

/// Wires the store, clients, and orchestrator together for the CLI.
pub struct CliRunner {
    config: Arc<ArchonConfig>,
    orchestrator: Arc<Orchestrator>,
}

impl CliRunner {
    pub async fn new() -> Result<Self> {
        let config = Arc::new(ArchonConfig::from_env());
        let store = Store::open(&config.database_path()).await?;

        let mut clients: HashMap<String, Arc<dyn AssistantClient>> = HashMap::new();
        clients.insert(
            "claude".to_string(),
            Arc::new(ClaudeCodeClient::new(ClaudeCodeConfig::default())),
        );
        clients.insert(
            "codex".to_string(),
            Arc::new(CodexClient::new(CodexConfig::default())),
        );

        let orchestrator = Arc::new(Orchestrator::new(store, config.clone(), clients));
        Ok(Self {
            config,
            orchestrator,
        })
    }

    pub async fn run(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Serve => self.serve().await,
            Commands::Status => self.status().await,
            Commands::Worktree { action } => self.worktree(action).await,
            Commands::Cleanup => self.cleanup().await,
        }
    }

    async fn serve(&self) -> Result<()> {
        let adapter = Arc::new(ConsoleAdapter::new());
        let shutdown = CancellationToken::new();

        let scheduler = CleanupScheduler::new(
            self.orchestrator.store().clone(),
            self.orchestrator.provider(),
            self.config.clone(),
        );
        let scheduler_token = shutdown.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(scheduler_token).await;
        });

        info!("archon ready; type a message or /help");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let message = InboundMessage::text_only(ConsoleAdapter::CONVERSATION_ID, text);
            self.orchestrator
                .handle_message(adapter.clone(), message)
                .await?;
        }

        shutdown.cancel();
        let _ = scheduler_handle.await;
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let codebases = self.orchestrator.store().list_codebases().await?;
        if codebases.is_empty() {
            println!("No codebases known. Use /clone from a connected platform.");
            return Ok(());
        }
        for codebase in codebases {
            println!(
                "{}  {}  ({} commands)",
                codebase.name,
                codebase.default_cwd,
                codebase.command_registry().len()
            );
        }
        Ok(())
    }

    async fn worktree(&self, action: &WorktreeAction) -> Result<()> {
        match action {
            WorktreeAction::List => {
                let environments = self.orchestrator.provider().list(None).await?;
                if environments.is_empty() {
                    println!("No active isolation environments.");
                }
                for env in environments {
                    println!(
                        "{}  [{}]  {}",
                        env.branch_name, env.workflow_type, env.working_path
                    );
                }
                Ok(())
            }
            WorktreeAction::Clean => self.cleanup().await,
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let scheduler = CleanupScheduler::new(
            self.orchestrator.store().clone(),
            self.orchestrator.provider(),
            self.config.clone(),
        );
        let report = scheduler.sweep().await?;
        println!(
            "Cleanup finished: {} removed, {} kept, {} errors.",
            report.removed,
            report.skipped,
            report.errors.len()
        );
        for error in report.errors {
            println!("  error: {}", error);
        }
        Ok(())
    }
}
