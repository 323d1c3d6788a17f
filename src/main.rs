use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use refsmith::config::{EngineConfig, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "refsmith")]
#[command(version, about = "Run coding agents against isolated git refs and integrate their changes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "REFSMITH_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Log output format: pretty or json. Overrides refsmith.toml.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a refsmith project, optionally creating refs
    Init {
        /// Ref to create under the refs root (repeatable)
        #[arg(long = "ref", value_name = "REF")]
        refs: Vec<String>,
    },
    /// Request an execution, run an agent command in its workspace and
    /// integrate the result
    Run {
        /// Ref the agent may read (repeatable)
        #[arg(long, value_name = "REF")]
        read: Vec<String>,
        /// Ref the agent may change (repeatable)
        #[arg(long, value_name = "REF")]
        write: Vec<String>,
        /// New ref to create for the agent (repeatable)
        #[arg(long, value_name = "REF")]
        create: Vec<String>,
        #[arg(long, default_value = "custom")]
        agent_type: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Leave changes on the execution branches
        #[arg(long)]
        no_integrate: bool,
        /// Remove worktrees after a clean finish
        #[arg(long)]
        auto_cleanup: bool,
        /// Don't echo agent output
        #[arg(short, long)]
        quiet: bool,
        /// Program and arguments to run
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// List executions, or show one in detail
    Status { execution_id: Option<String> },
    /// Show persisted output of an execution
    Logs {
        execution_id: String,
        /// Only the most recent N lines
        #[arg(short = 'n', long)]
        limit: Option<u32>,
    },
    /// Commit and sync an execution's write refs
    Integrate {
        execution_id: String,
        #[arg(short, long)]
        message: Option<String>,
        /// Commit only; leave mainline alone
        #[arg(long)]
        no_merge: bool,
        /// Fail instead of creating merge commits
        #[arg(long)]
        ff_only: bool,
    },
    /// Remove an execution's workspace
    Cleanup {
        execution_id: String,
        /// Clean up even while the execution is active
        #[arg(long)]
        force: bool,
        /// Also delete the execution branches
        #[arg(long)]
        delete_branches: bool,
        #[arg(long)]
        keep_workspace: bool,
    },
    /// Discard an execution's branches and workspace
    Rollback {
        execution_id: String,
        #[arg(long, default_value = "rolled back by operator")]
        reason: String,
    },
    /// Remove workspaces of finished executions idle past the threshold
    Sweep {
        /// Defaults to lifecycle.orphan_age_hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// List port allocations
    Ports {
        /// Release allocations whose preview is gone or stopped
        #[arg(long)]
        cleanup_stale: bool,
    },
}

fn load_config(cli: &Cli, project_dir: &std::path::Path) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(project_dir)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = load_config(&cli, &project_dir)?;
    let _log_guard = refsmith::logging::init(&config.logging, &config.logs_dir(), cli.verbose)?;

    match &cli.command {
        Commands::Init { refs } => cmd::cmd_init(&project_dir, refs)?,
        Commands::Run {
            read,
            write,
            create,
            agent_type,
            session_id,
            no_integrate,
            auto_cleanup,
            quiet,
            command,
        } => {
            let mut config = config;
            if *no_integrate {
                config.lifecycle.auto_integrate = false;
            }
            if *auto_cleanup {
                config.lifecycle.auto_cleanup = true;
            }
            let request = cmd::RunRequest {
                read: read.clone(),
                write: write.clone(),
                create: create.clone(),
                agent_type: agent_type.clone(),
                session_id: session_id.clone(),
                command: command.clone(),
                quiet: *quiet,
            };
            cmd::cmd_run(config, request, cli.json).await?;
        }
        Commands::Status { execution_id } => {
            cmd::cmd_status(config, execution_id.as_deref(), cli.json).await?
        }
        Commands::Logs {
            execution_id,
            limit,
        } => cmd::cmd_logs(config, execution_id, *limit, cli.json).await?,
        Commands::Integrate {
            execution_id,
            message,
            no_merge,
            ff_only,
        } => {
            cmd::cmd_integrate(
                config,
                execution_id,
                message.clone(),
                !*no_merge,
                *ff_only,
                cli.json,
            )
            .await?
        }
        Commands::Cleanup {
            execution_id,
            force,
            delete_branches,
            keep_workspace,
        } => {
            let options = refsmith::cleanup::CleanupOptions {
                force: *force,
                keep_branches: !*delete_branches,
                keep_workspace: *keep_workspace,
                update_database: true,
            };
            cmd::cmd_cleanup(config, execution_id, options, cli.json).await?
        }
        Commands::Rollback {
            execution_id,
            reason,
        } => cmd::cmd_rollback(config, execution_id, reason, cli.json).await?,
        Commands::Sweep { older_than_hours } => {
            cmd::cmd_sweep(config, *older_than_hours, cli.json).await?
        }
        Commands::Ports { cleanup_stale } => {
            cmd::cmd_ports(config, *cleanup_stale, cli.json).await?
        }
    }

    Ok(())
}
