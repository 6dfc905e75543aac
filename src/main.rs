//! Flowmill CLI: validate workflow files and dry-run them against the
//! scripted in-memory drivers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowmill::mock::{ScriptedBrowser, ScriptedReasoner};
use flowmill::{
    load_workflow_file, validate_workflow, EnvSecretProvider, ExecutorSet, InMemoryNodeStore,
    RunOptions, RunStatus, Runtime,
};

#[derive(Parser)]
#[command(name = "flowmill", version, about = "Workflow primitive execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow file without executing anything.
    Validate {
        /// Path to the workflow JSON document.
        file: PathBuf,
    },

    /// Execute a workflow file.
    Run {
        /// Path to the workflow JSON document.
        file: PathBuf,

        /// Execute against scripted in-memory drivers instead of a
        /// live session.
        #[arg(long)]
        dry_run: bool,

        /// Initial variable, `key=value` (value parsed as JSON, then
        /// as a plain string). Repeatable.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Start at this node position or alias.
        #[arg(long)]
        start_at: Option<String>,

        /// Stop after this node position or alias.
        #[arg(long)]
        stop_at: Option<String>,

        /// Write memory artifacts to this JSON file after the run.
        #[arg(long)]
        memory_out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Validate { file } => validate(file),
        Command::Run {
            file,
            dry_run,
            vars,
            start_at,
            stop_at,
            memory_out,
        } => run(file, dry_run, vars, start_at, stop_at, memory_out).await,
    }
}

fn validate(file: PathBuf) -> Result<()> {
    let (workflow, nodes) =
        load_workflow_file(&file).with_context(|| format!("loading {}", file.display()))?;
    validate_workflow(&nodes, &ExecutorSet::standard())
        .with_context(|| format!("workflow {workflow} failed validation"))?;
    println!("ok: {} nodes validated", nodes.len());
    Ok(())
}

async fn run(
    file: PathBuf,
    dry_run: bool,
    vars: Vec<String>,
    start_at: Option<String>,
    stop_at: Option<String>,
    memory_out: Option<PathBuf>,
) -> Result<()> {
    if !dry_run {
        bail!("live driver bindings are external; use --dry-run for the scripted drivers");
    }

    let (workflow, nodes) =
        load_workflow_file(&file).with_context(|| format!("loading {}", file.display()))?;
    let store = InMemoryNodeStore::new();
    store.insert_workflow(&workflow, nodes)?;

    let mut options = RunOptions::new();
    for var in vars {
        let (key, raw) = var
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{var}'"))?;
        let value: Value = serde_json::from_str(raw).unwrap_or_else(|_| json!(raw));
        options = options.with_var(key, value);
    }
    if let Some(start) = start_at {
        options = options.starting_at(start);
    }
    if let Some(stop) = stop_at {
        options = options.stopping_at(stop);
    }

    let runtime = Runtime::new(Arc::new(store)).with_secrets(Arc::new(EnvSecretProvider));
    let handle = runtime.start_run(
        workflow.clone(),
        Arc::new(ScriptedBrowser::new()),
        Arc::new(ScriptedReasoner::new()),
        options,
    );

    info!(workflow = %workflow, run = %handle.id(), "run started");
    let state = handle.wait().await;

    if let Some(path) = memory_out {
        let artifacts = handle.memory().list();
        std::fs::write(&path, serde_json::to_vec_pretty(&artifacts)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), artifacts = artifacts.len(), "memory written");
    }

    println!("status: {}", state.status);
    println!(
        "variables: {}",
        serde_json::to_string_pretty(&state.variables)?
    );
    match state.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => bail!("run cancelled"),
        _ => {
            if let Some(failure) = state.failure {
                bail!(
                    "run failed at {}: [{}] {}",
                    failure.node.as_deref().unwrap_or("<unknown>"),
                    failure.kind,
                    failure.message
                );
            }
            bail!("run did not complete");
        }
    }
}
