//! `novel`: drive the planner, writer and reviewer agents from a terminal.

mod flows;
mod render;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use novel_stream::prelude::*;
use novel_stream::observability::init_observability_with_default;

#[derive(Debug, Parser)]
#[command(name = "novel", about = "Streamed multi-agent novel writing", version, long_about = None)]
struct Cli {
    /// Backend base URL. Overrides `NOVEL_API_BASE_URL`.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one agent and stream its output.
    Generate(GenerateArgs),
    /// Plan, write and review one section, saving each result.
    Section(SectionArgs),
    /// Create chapters from the titles in the project outline.
    Chapters {
        /// Project name.
        #[arg(long)]
        project: String,
    },
    /// Create sections from the titles in a chapter outline.
    Sections {
        /// Project name.
        #[arg(long)]
        project: String,
        /// Chapter id.
        #[arg(long)]
        chapter: String,
    },
}

#[derive(Debug, Args)]
pub(crate) struct GenerateArgs {
    /// Agent to run: planner, writer or reviewer.
    #[arg(long)]
    pub agent: AgentRole,
    /// Project name.
    #[arg(long)]
    pub project: String,
    /// Scope of the request: novel, chapter or section.
    #[arg(long, default_value_t = Granularity::Novel)]
    pub granularity: Granularity,
    /// Free-text instruction.
    #[arg(long, default_value = "")]
    pub topic: String,
    /// Chapter id, for chapter and section scopes.
    #[arg(long)]
    pub chapter: Option<String>,
    /// Section id, for the section scope.
    #[arg(long)]
    pub section: Option<String>,
    /// Prerequisite text (planner outline for the writer, draft for the
    /// reviewer) used instead of the stored one.
    #[arg(long)]
    pub prior: Option<String>,
    /// Save the finished artifact to the store.
    #[arg(long)]
    pub persist: bool,
}

#[derive(Debug, Args)]
pub(crate) struct SectionArgs {
    /// Project name.
    #[arg(long)]
    pub project: String,
    /// Chapter id.
    #[arg(long)]
    pub chapter: String,
    /// Section id.
    #[arg(long)]
    pub section: String,
    /// Extra instruction passed to every agent.
    #[arg(long, default_value = "")]
    pub topic: String,
    /// Re-plan even when the section already has an outline.
    #[arg(long)]
    pub replan: bool,
}

/// Shared collaborators for one CLI invocation.
pub(crate) struct Context {
    pub transport: Arc<HttpTransport>,
    pub store: Arc<HttpProjectStore>,
    pub buffer_capacity: usize,
}

fn load_env() {
    let _ = dotenvy::from_path(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.env")));
    dotenvy::dotenv().ok();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode, ClientError> {
    load_env();
    init_observability_with_default("warn");
    let cli = Cli::parse();

    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config = config.base_url(base_url);
    }
    let ctx = Context {
        transport: Arc::new(HttpTransport::new(config.clone())?),
        store: Arc::new(HttpProjectStore::new(config.clone())?),
        buffer_capacity: config.stream_buffer_capacity,
    };

    match cli.command {
        Command::Generate(args) => flows::generate(&ctx, args).await,
        Command::Section(args) => flows::section(&ctx, args).await,
        Command::Chapters { project } => flows::chapters(&ctx, &project).await,
        Command::Sections { project, chapter } => flows::sections(&ctx, &project, &chapter).await,
    }
}
