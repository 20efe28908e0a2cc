//! Review runner CLI
//!
//! ```bash
//! # Review a diff against a local OpenAI-compatible endpoint
//! REVIEW_LLM_URL=http://gpu-01:8080/v1 review-runner run --repo acme/widgets --id 42 --diff pr-42.diff
//!
//! # Continue an interrupted review
//! review-runner resume --repo acme/widgets --id 42 --diff-dir ./diffs
//!
//! # Drop stored state older than a week
//! review-runner purge --older-than-hours 168
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use review_coordination::{
    ContextProvider, JsonFileStatePersistence, ReviewKey, ReviewPhase, ReviewPipeline,
    ReviewPoster, ReviewState, StatePersistence,
};
use review_runner::{ChatCompletionsClient, DiffContextProvider, FilePoster, RunnerConfig, StdoutPoster};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (REVIEW_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a fresh review, replacing any stored state for it
    Run {
        #[command(flatten)]
        target: Target,

        /// Unified diff to review
        #[arg(long, conflicts_with = "diff_dir")]
        diff: Option<PathBuf>,

        /// Directory holding `<id>.diff`
        #[arg(long)]
        diff_dir: Option<PathBuf>,

        /// Title shown to the analysis tasks
        #[arg(long)]
        title: Option<String>,

        /// Print the review instead of writing it to the output directory
        #[arg(long, default_value_t = false)]
        stdout: bool,
    },

    /// Continue a stored review from its recorded phase
    Resume {
        #[command(flatten)]
        target: Target,

        /// Directory holding `<id>.diff`, needed if context was never gathered
        #[arg(long)]
        diff_dir: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        stdout: bool,
    },

    /// Print a stored review state as JSON
    Show {
        #[command(flatten)]
        target: Target,
    },

    /// Delete stored reviews not updated recently
    Purge {
        #[arg(long, default_value_t = 168)]
        older_than_hours: u64,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Repository, e.g. `acme/widgets`
    #[arg(long)]
    repo: String,

    /// Change identifier on the platform
    #[arg(long)]
    id: String,

    #[arg(long, default_value = "local")]
    platform: String,
}

impl Target {
    fn key(&self) -> ReviewKey {
        ReviewKey::new(&self.platform, &self.repo, &self.id)
    }
}

fn poster(config: &RunnerConfig, stdout: bool) -> Arc<dyn ReviewPoster> {
    if stdout {
        Arc::new(StdoutPoster)
    } else {
        Arc::new(FilePoster::new(&config.output_dir))
    }
}

fn build_pipeline(
    config: &RunnerConfig,
    store: Arc<JsonFileStatePersistence>,
    provider: Arc<dyn ContextProvider>,
    poster: Arc<dyn ReviewPoster>,
) -> Result<ReviewPipeline> {
    let client = ChatCompletionsClient::new(
        &config.llm.base_url,
        &config.llm.model,
        config.llm.api_key().as_deref(),
        config.llm.timeout(),
    )
    .context("Failed to build completions client")?
    .with_temperature(config.llm.temperature);

    ReviewPipeline::new(
        config.coordination.clone(),
        Arc::new(client),
        provider,
        poster,
        store,
    )
    .context("Invalid coordination configuration")
}

fn report(state: ReviewState) -> Result<()> {
    match state.phase {
        ReviewPhase::Completed => {
            let decision = state.synthesis.as_ref().map(|s| s.decision.decision);
            let posted = state.output.as_ref().is_some_and(|o| o.posted);
            info!(
                review = %state.key,
                decision = ?decision,
                posted,
                errors = state.errors.len(),
                "Review completed"
            );
            if let Some(decision) = decision {
                println!("{decision}");
            }
            Ok(())
        }
        phase => {
            let reason = state
                .errors
                .last()
                .map(|e| e.error.as_str())
                .unwrap_or("unknown error");
            bail!("review {} ended in phase {phase}: {reason}", state.key)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunnerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = Arc::new(
        JsonFileStatePersistence::open(&config.state_dir)
            .await
            .with_context(|| format!("Failed to open state dir {}", config.state_dir.display()))?,
    );
    info!(
        endpoint = %config.llm.base_url,
        model = %config.llm.model,
        state_dir = %config.state_dir.display(),
        "Review runner starting"
    );

    match cli.command {
        Command::Run {
            target,
            diff,
            diff_dir,
            title,
            stdout,
        } => {
            let provider = match (diff, diff_dir) {
                (Some(file), _) => DiffContextProvider::from_file(file),
                (None, Some(dir)) => DiffContextProvider::from_dir(dir),
                (None, None) => bail!("either --diff or --diff-dir is required"),
            };
            let provider = match title {
                Some(title) => provider.with_title(title),
                None => provider,
            };
            let pipeline = build_pipeline(&config, store, Arc::new(provider), poster(&config, stdout))?;
            report(pipeline.run(target.key()).await?)
        }
        Command::Resume {
            target,
            diff_dir,
            stdout,
        } => {
            let dir = diff_dir.unwrap_or_else(|| PathBuf::from("."));
            let provider = Arc::new(DiffContextProvider::from_dir(dir));
            let pipeline = build_pipeline(&config, store, provider, poster(&config, stdout))?;
            report(pipeline.resume(&target.key()).await?)
        }
        Command::Show { target } => {
            let key = target.key();
            let state = store
                .load(&key)
                .await?
                .with_context(|| format!("No stored review for {key}"))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::Purge { older_than_hours } => {
            let age = Duration::from_secs(older_than_hours * 3600);
            let removed = store.delete_older_than(age).await?;
            println!("removed {removed} review(s)");
            Ok(())
        }
    }
}
