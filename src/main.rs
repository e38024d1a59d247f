use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "sliceforge")]
#[command(version, about = "Slice lifecycle engine: role agents in isolated worktrees, gated before review")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Acting user (defaults to $SLICEFORGE_USER, then $USER)
    #[arg(long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn operator(&self) -> Option<String> {
        self.user
            .clone()
            .or_else(|| std::env::var("SLICEFORGE_USER").ok())
            .or_else(|| std::env::var("USER").ok())
            .filter(|u| !u.trim().is_empty())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .sliceforge/ with a default config and database
    Init,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage projects and their members
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Manage slices
    Slice {
        #[command(subcommand)]
        command: SliceCommands,
    },
    /// Run the step that is due for one slice
    Step { slice: i64 },
    /// Drive slices until each is idle, parked or failed
    Run {
        /// Slices to drive (defaults to every slice with a step due)
        #[arg(long = "slice")]
        slices: Vec<i64>,
        /// Publish slices that reach ci_passed
        #[arg(long)]
        publish: bool,
    },
    /// Push a ci_passed slice's branch and open or update its PR
    Publish { slice: i64 },
    /// Mark Runs interrupted by a restart as errors
    Reconcile,
    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// View or set generation endpoint settings
    Llm {
        #[command(subcommand)]
        command: LlmCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default sliceforge.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    Add {
        name: String,
        repo_url: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        /// `owner/repo` on GitHub (derived from the URL when omitted)
        #[arg(long)]
        github_repo: Option<String>,
    },
    List,
    Remove {
        id: i64,
    },
    /// Add or update a member (`owner` or `member`)
    Member {
        project: i64,
        user_id: String,
        #[arg(long, default_value = "member")]
        role: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum SliceCommands {
    Create {
        project: i64,
        title: String,
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(long, default_value = "")]
        out_of_scope: String,
        #[arg(long, default_value = "medium")]
        risk: String,
        /// Acceptance criterion as `CODE:text` or `CODE:text:verification`
        #[arg(long = "ac")]
        acceptance: Vec<String>,
        #[command(flatten)]
        quadrants: QuadrantArgs,
    },
    List {
        #[arg(long)]
        project: Option<i64>,
    },
    Show {
        id: i64,
    },
    Abandon {
        id: i64,
    },
    /// Re-enter the failed step of a ci_failed slice
    Remediate {
        id: i64,
    },
    /// Show four-quadrant requirements, or set the given quadrants
    Quadrants {
        id: i64,
        #[command(flatten)]
        quadrants: QuadrantArgs,
    },
    /// Trace items, latest coverage report and control table
    Trace {
        id: i64,
    },
    /// Set a control item to `pending`, `verified` or `failed`
    Control {
        id: i64,
        item: i64,
        status: String,
    },
}

/// Four-quadrant requirements; blank quadrants are left unchanged.
#[derive(clap::Args, Clone, Default)]
pub struct QuadrantArgs {
    /// What the slice must do
    #[arg(long, default_value = "")]
    pub functional: String,
    /// Stack, performance and environment limits
    #[arg(long, default_value = "")]
    pub physical: String,
    /// Business rules that must hold
    #[arg(long, default_value = "")]
    pub semantic: String,
    /// Edge cases and failure behaviour
    #[arg(long, default_value = "")]
    pub exceptions: String,
}

#[derive(Subcommand, Clone)]
pub enum AuditCommands {
    Show {
        #[command(flatten)]
        subject: SubjectArgs,
    },
    Export {
        output: PathBuf,
        #[command(flatten)]
        subject: SubjectArgs,
    },
}

#[derive(clap::Args, Clone, Default)]
pub struct SubjectArgs {
    #[arg(long, conflicts_with_all = ["slice", "run"])]
    pub project: Option<i64>,
    #[arg(long, conflicts_with = "run")]
    pub slice: Option<i64>,
    #[arg(long)]
    pub run: Option<i64>,
}

#[derive(Subcommand, Clone)]
pub enum LlmCommands {
    /// Show each layer and the resolved configuration
    Show {
        #[arg(long)]
        project: Option<i64>,
    },
    /// Set the acting user's layer, or a project's layer with --project
    Set {
        #[arg(long)]
        project: Option<i64>,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        model: String,
        /// API key (defaults to $LLM_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value = "openai-compatible")]
        provider: String,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Store without checking that the endpoint is reachable
        #[arg(long)]
        no_probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    sliceforge::logging::init(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Project { command } => cmd::cmd_project(&project_dir, &cli, command).await?,
        Commands::Slice { command } => cmd::cmd_slice(&project_dir, &cli, command).await?,
        Commands::Step { slice } => cmd::cmd_step(&project_dir, &cli, *slice).await?,
        Commands::Run { slices, publish } => {
            cmd::cmd_run(&project_dir, &cli, slices, *publish).await?
        }
        Commands::Publish { slice } => cmd::cmd_publish(&project_dir, &cli, *slice).await?,
        Commands::Reconcile => cmd::cmd_reconcile(&project_dir, &cli).await?,
        Commands::Audit { command } => cmd::cmd_audit(&project_dir, command).await?,
        Commands::Llm { command } => cmd::cmd_llm(&project_dir, &cli, command).await?,
    }

    Ok(())
}
