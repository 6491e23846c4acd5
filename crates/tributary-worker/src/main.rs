//! Worker entry point.
//!
//! Runs the upload-processing pipeline on a single node with in-process
//! coordination: useful for development, demos, and driving the pipeline
//! end to end from a shell. Production deployments embed the same runtime
//! against their real broker and stores.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tributary::context::Services;
use tributary::gate::LoggingNotifier;
use tributary::metadata::{InMemoryMetadata, MetadataStore, pending_commit};
use tributary::provider::ScriptedProvider;
use tributary::report::{ArchiveReportStore, LineRecordParser};
use tributary::runner::RecordingRunner;
use tributary::storage::{FileStorage, InMemoryStorage, ObjectStore};
use tributary_config::UserConfig;
use tributary_kv::InMemoryKv;
use tributary_types::{CommitRef, ReportType};

mod runtime;

use runtime::WorkerRuntime;

#[derive(Parser)]
#[command(name = "tributary-worker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one commit's uploads and drain it to completion.
    Run(RunArgs),
    /// Validate a YAML config file.
    Check {
        /// Path to the config file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long)]
    repo_id: i64,
    #[arg(long)]
    commit_sha: String,
    #[arg(long, default_value = "main")]
    branch: String,
    #[arg(long, default_value = "")]
    message: String,
    /// Raw upload files to ingest (line-record format).
    #[arg(long = "upload", required = true)]
    uploads: Vec<PathBuf>,
    /// Installation config YAML.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Persist objects under this directory instead of in memory.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    /// CI outcome reported by the scripted provider.
    #[arg(long, default_value = "passed", value_parser = ["passed", "failed", "unknown"])]
    ci_status: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Check { config } => check(&config),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let install_config = match &args.config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            UserConfig::from_yaml(&source)?
        }
        None => UserConfig::default(),
    };

    let storage: Arc<dyn ObjectStore> = match &args.storage_dir {
        Some(dir) => Arc::new(FileStorage::new(dir.clone())),
        None => Arc::new(InMemoryStorage::new()),
    };

    let metadata = Arc::new(InMemoryMetadata::new());
    metadata.insert_commit(pending_commit(
        args.repo_id,
        &args.commit_sha,
        &args.branch,
        &args.message,
    ));

    let provider = Arc::new(ScriptedProvider::new());
    provider.set_ci_status(match args.ci_status.as_str() {
        "passed" => Some(true),
        "failed" => Some(false),
        _ => None,
    });

    let broker = Arc::new(RecordingRunner::new());
    let services = Arc::new(Services {
        kv: Arc::new(InMemoryKv::new()),
        storage: Arc::clone(&storage),
        metadata: metadata.clone(),
        provider,
        parser: Arc::new(LineRecordParser),
        reports: Arc::new(ArchiveReportStore::new(storage)),
        runner: broker.clone(),
        install_config,
        parallel_processing_repos: HashSet::new(),
    });
    let worker = WorkerRuntime::new(services, broker, Arc::new(LoggingNotifier));

    let commit = CommitRef::new(args.repo_id, args.commit_sha.clone());
    for path in &args.uploads {
        let content = std::fs::read(path)
            .with_context(|| format!("failed to read upload {}", path.display()))?;
        let stored = worker.ingest_upload(&commit, ReportType::Coverage, &content)?;
        tracing::info!(upload = %path.display(), %stored, "ingested upload");
    }

    worker.dispatch(&commit, ReportType::Coverage)?;
    worker.drain()?;

    let commit_row = metadata
        .fetch_commit(&commit)?
        .context("commit row vanished")?;
    let uploads = metadata.uploads_for_commit(&commit)?;
    let summary = serde_json::json!({
        "commit": commit.commit_sha,
        "state": commit_row.state,
        "notified": commit_row.notified,
        "sessions": commit_row.session_count,
        "uploads": uploads
            .iter()
            .map(|u| serde_json::json!({"upload_id": u.upload_id, "state": u.state}))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check(path: &PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = UserConfig::from_yaml(&source)?;
    println!(
        "ok: after_n_builds={} wait_for_ci={} require_ci_to_pass={} archive_uploads={}",
        config.after_n_builds(),
        config.wait_for_ci(),
        config.require_ci_to_pass(),
        config.archive_uploads(),
    );
    Ok(())
}
