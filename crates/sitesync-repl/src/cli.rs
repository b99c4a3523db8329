//! Command line for inspecting replication configuration and stored tasks.

use crate::clock::SystemClock;
use crate::config::ReplicationProperties;
use crate::task::{PersistedTask, Task};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "sitesync")]
#[command(about = "SiteSync replication tools", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON.
    #[arg(long, env = "SITESYNC_LOG_JSON")]
    pub log_json: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a replication config file.
    CheckConfig {
        /// Path of a `.toml` or `.json` config.
        #[arg(short, long, env = "SITESYNC_CONFIG", default_value = "/etc/sitesync/replication.toml")]
        config: PathBuf,
    },
    /// Decode a stored task and print its state.
    InspectTask {
        /// Path of a JSON task document.
        path: PathBuf,
    },
}

impl Cli {
    /// Run the selected subcommand.
    pub fn run(&self) -> Result<()> {
        match &self.command {
            Command::CheckConfig { config } => check_config(config),
            Command::InspectTask { path } => inspect_task(path),
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let props = ReplicationProperties::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    props
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;

    println!("local site:      {}", props.local_site);
    if props.sites.is_empty() {
        println!("allowed sites:   all");
    } else {
        println!("allowed sites:   {}", props.sites.join(", "));
    }
    println!("queue capacity:  {}", props.queue_capacity);
    println!("monitor period:  {}s", props.monitor_period().as_secs());
    println!("sync period:     {}s", props.sync_period().as_secs());
    for r in &props.replicators {
        let arrow = if r.bidirectional { "<->" } else { "->" };
        let suspended = if r.suspended { " (suspended)" } else { "" };
        println!(
            "replicator {}: {} {} {} [{}]{}",
            r.name, r.source, arrow, r.destination, r.filter, suspended
        );
    }
    Ok(())
}

fn inspect_task(path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let task = PersistedTask::decode(&json, Arc::new(SystemClock))
        .with_context(|| format!("failed to decode task in {}", path.display()))?;
    print!("{}", describe(&task));
    Ok(())
}

/// Human-readable summary of a task.
pub fn describe(task: &Task) -> String {
    let mut out = format!("task {}\n", task.id());
    out.push_str(&format!("  intel id:   {}\n", task.intel_id()));
    out.push_str(&format!("  operation:  {}\n", task.operation()));
    out.push_str(&format!("  priority:   {}\n", task.priority()));
    out.push_str(&format!("  state:      {:?}\n", task.state()));
    out.push_str(&format!("  attempts:   {}\n", task.total_attempts()));
    out.push_str(&format!("  queued:     {}\n", task.original_queued_time()));
    out.push_str(&format!("  pending:    {:?}\n", task.pending_duration()));
    out.push_str(&format!("  active:     {:?}\n", task.active_duration()));
    if let Some(failure) = task.failure() {
        out.push_str(&format!("  failure:    {:?} {}\n", failure.code, failure.reason));
    }
    out
}
