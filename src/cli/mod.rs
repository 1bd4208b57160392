//! Command-line interface for the profiler.
//!
//! Provides commands for running the pipeline over a source manifest,
//! inspecting recorded runs, printing the stage graph, and managing the
//! result cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use uuid::Uuid;

use crate::adapters::OpenRouterProvider;
use crate::config::ResolvedConfig;
use crate::core::{signals, Orchestrator, PipelineError};
use crate::domain::{EventType, PipelineRun, Resolution, RunState, SourceArtifact};

/// profiler - Multi-stage behavioral profiling pipeline
#[derive(Parser, Debug)]
#[command(name = "profiler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over a source manifest
    Run {
        /// YAML or JSON manifest describing the prepared source files
        manifest: PathBuf,

        /// Write the synthesized profile here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the stage graph in execution order
    Graph,

    /// Inspect or maintain the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show entry count and location
    Stats,

    /// Drop entries older than the given age
    Evict {
        /// Maximum age in days (defaults to the configured value)
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// Drop every entry
    Clear,
}

/// Prepared source files handed over by media preparation.
///
/// Relative paths are resolved against the manifest's directory.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceManifest {
    /// Human-readable label (defaults to the video file name)
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub subject: Option<String>,

    pub video: PathBuf,

    #[serde(default)]
    pub audio: Option<PathBuf>,

    #[serde(default)]
    pub transcript: Option<PathBuf>,

    pub duration_seconds: f64,

    pub resolution: Resolution,
}

impl SourceManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Read every referenced file into a source artifact
    pub fn load_artifact(&self, base: &Path) -> Result<SourceArtifact> {
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

        let video_path = resolve(&self.video);
        let video = std::fs::read(&video_path)
            .with_context(|| format!("Failed to read video: {}", video_path.display()))?;

        let label = self.label.clone().unwrap_or_else(|| {
            video_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_string())
        });

        let mut artifact =
            SourceArtifact::new(label, video, self.duration_seconds, self.resolution);

        if let Some(audio) = &self.audio {
            let path = resolve(audio);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read audio: {}", path.display()))?;
            artifact = artifact.with_audio(bytes);
        }

        if let Some(transcript) = &self.transcript {
            let path = resolve(transcript);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read transcript: {}", path.display()))?;
            artifact = artifact.with_transcript(text);
        }

        Ok(artifact)
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = ResolvedConfig::load()?;

        match self.command {
            Commands::Run { manifest, output } => run_pipeline(&config, &manifest, output).await,
            Commands::Status { run_id } => show_status(&config, &run_id).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Graph => show_graph(&config),
            Commands::Cache { command } => manage_cache(&config, command),
            Commands::Config => show_config(&config),
        }
    }
}

/// Run the pipeline over a manifest, reporting progress on stderr
async fn run_pipeline(
    config: &ResolvedConfig,
    manifest_path: &Path,
    output: Option<PathBuf>,
) -> Result<()> {
    let manifest = SourceManifest::from_file(manifest_path)?;
    let base = manifest_path.parent().unwrap_or(Path::new("."));
    let source = manifest.load_artifact(base)?;

    let provider = Arc::new(OpenRouterProvider::new(config.provider.clone()));
    let orchestrator = Orchestrator::builder(provider)
        .definition(config.load_pipeline()?)
        .cache(config.open_cache()?)
        .limits(config.limits.clone())
        .resolver(config.resolver.clone())
        .sink(Arc::new(config.event_store()))
        .build()?;

    let run_id = orchestrator.start_run(source, manifest.subject.clone())?;
    eprintln!("[Run {} started]", run_id);

    let mut progress = orchestrator.subscribe(run_id)?;
    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let p = progress.borrow_and_update().clone();
                eprintln!(
                    "  [{:>3.0}%] {}/{} stages done, running: {}",
                    p.fraction() * 100.0,
                    p.completed,
                    p.total,
                    p.running.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                );
                if p.state.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling run {}...", run_id);
                orchestrator.cancel_run(run_id)?;
            }
        }
    }

    let run = match orchestrator.forget_run(run_id)? {
        Some(run) => run,
        None => {
            let state = orchestrator.get_progress(run_id)?.state;
            anyhow::bail!("Run {} still {}", run_id, state.label())
        }
    };

    if let Some(profile) = &run.profile {
        let json = serde_json::to_string_pretty(profile)?;
        match output {
            Some(path) => std::fs::write(&path, json)
                .with_context(|| format!("Failed to write profile: {}", path.display()))?,
            None => println!("{}", json),
        }
    }

    print_failures(&run);

    match PipelineError::from_run(&run) {
        None => {
            eprintln!("\n[Run {} completed successfully]", run.id);
            Ok(())
        }
        Some(error) => {
            eprintln!("\n[Run {} {}: {}]", run.id, run.state.label(), error);
            std::process::exit(1);
        }
    }
}

fn print_failures(run: &PipelineRun) {
    if run.failures.is_empty() {
        return;
    }

    eprintln!("\nFailures:");
    for note in &run.failures {
        let task = note.task.as_deref().unwrap_or("-");
        let kind = note
            .kind
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| "-".to_string());
        eprintln!("  {}/{} [{}]: {}", note.stage, task, kind, note.message);
    }
}

/// Show the status of a recorded run
async fn show_status(config: &ResolvedConfig, run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;
    let store = config.event_store();

    if let Some(run) = store.load_run(run_id).await? {
        println!("Run ID: {}", run.id);
        println!("Source: {} ({})", run.source.label, run.source.content_hash);
        if let Some(subject) = &run.subject_id {
            println!("Subject: {}", subject);
        }
        println!("State: {}", run.state.label());
        if let RunState::Failed { kind, error, .. } = &run.state {
            println!("Failure: {:?}: {}", kind, error);
        }
        println!("Started: {}", run.started_at);
        if let Some(completed) = run.completed_at {
            println!("Completed: {}", completed);
        }
        println!("\nStage statuses:");
        for (stage, status) in &run.stages {
            println!("  {}: {:?}", stage, status);
        }
        if let Some(profile) = &run.profile {
            println!(
                "\nProfile: confidence {:.2} ({:?}), {} conflicts, {} corroborated moments{}",
                profile.overall_confidence,
                profile.confidence_level,
                run.conflicts().len(),
                signals::corroborated(&profile.moments).len(),
                if profile.partial { ", partial" } else { "" }
            );
        }
        return Ok(());
    }

    // Interrupted runs only have their event log
    let timeline = store
        .timeline(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", timeline.run_id);
    println!("State: {} (from event log)", timeline.state.label());
    println!("Started: {}", timeline.started_at);
    println!(
        "Tasks: {} succeeded, {} cached, {} failed",
        timeline.tasks_succeeded, timeline.tasks_cached, timeline.tasks_failed
    );
    println!("\nStage statuses:");
    for (stage, status) in &timeline.stages {
        println!("  {}: {:?}", stage, status);
    }

    let failures = store
        .find_events(run_id, |e| e.event_type == EventType::TaskFailed)
        .await?;
    if !failures.is_empty() {
        println!("\nFailed tasks:");
        for event in failures {
            println!(
                "  {}/{}: {}",
                event.stage.map(|s| s.as_str()).unwrap_or("-"),
                event.task.as_deref().unwrap_or("-"),
                event.error.as_deref().unwrap_or(&event.payload_summary)
            );
        }
    }
    if let Some(last) = store
        .last_event_of_type(run_id, EventType::StageStarted)
        .await?
    {
        println!(
            "\nLast stage started: {} at {}",
            last.stage.map(|s| s.as_str()).unwrap_or("-"),
            last.timestamp
        );
    }

    Ok(())
}

/// List recent runs
async fn list_runs(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let store = config.event_store();
    let mut runs = Vec::new();
    for run_id in store.list_runs().await? {
        if let Some(run) = store.load_run(run_id).await? {
            runs.push(run);
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<10} {:<10}", "RUN ID", "SOURCE", "STATE", "DEGRADED");
    println!("{}", "-".repeat(84));

    for run in runs {
        let degraded = run.degraded_stages().len();
        println!(
            "{:<38} {:<24} {:<10} {:<10}",
            run.id,
            truncate(&run.source.label, 24),
            run.state.label(),
            degraded
        );
    }

    Ok(())
}

/// Print stages in execution order with their tasks
fn show_graph(config: &ResolvedConfig) -> Result<()> {
    let definition = config.load_pipeline()?;
    let graph = definition.validate()?;

    println!("Pipeline: {}", definition.name);
    for stage in graph.topological_order() {
        let preds: Vec<String> = graph.predecessors(*stage).map(|s| s.to_string()).collect();
        if preds.is_empty() {
            println!("\n{}", stage);
        } else {
            println!("\n{} <- {}", stage, preds.join(", "));
        }

        if let Some(spec) = definition.stage(*stage) {
            for task in &spec.tasks {
                println!(
                    "  {:<28} {:<9} {:<24} {}",
                    task.name,
                    format!("{:?}", task.role).to_lowercase(),
                    task.template.key(),
                    task.models.join(" > ")
                );
            }
        }
    }

    Ok(())
}

fn manage_cache(config: &ResolvedConfig, command: CacheCommands) -> Result<()> {
    if !config.cache.persistent {
        println!("Persistent cache is disabled");
        return Ok(());
    }

    let cache = crate::core::ResultCache::open(&config.cache_dir())?;

    match command {
        CacheCommands::Stats => {
            let stats = cache.stats();
            println!("Cache directory: {}", config.cache_dir().display());
            println!("Entries:         {}", stats.entries);
            println!("Max age:         {} days", config.cache.max_age_days);
        }
        CacheCommands::Evict { days } => {
            let days = days.unwrap_or(config.cache.max_age_days);
            let evicted = cache.evict_expired(chrono::Duration::days(days));
            println!("Evicted {} entries older than {} days", evicted, days);
        }
        CacheCommands::Clear => {
            let removed = cache.invalidate_all();
            println!("Removed {} entries", removed);
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("Profiler Configuration");
    println!("======================");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", config.home.display());
    println!("  Runs:      {}", config.runs_dir().display());
    println!("  Cache:     {}", config.cache_dir().display());
    println!("  Templates: {}", config.provider.templates_dir.display());
    println!(
        "  Pipeline:  {}",
        config
            .pipeline_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in)".to_string())
    );
    println!();
    println!("Provider:");
    println!("  Base URL:  {}", config.provider.base_url);
    println!(
        "  API key:   {}",
        if config.provider.api_key.is_some() { "set" } else { "missing" }
    );
    println!(
        "  Rate:      {} rpm (burst {})",
        config.provider.requests_per_minute, config.provider.burst
    );
    println!();
    let limits = &config.limits;
    println!("Limits:");
    println!("  Call timeout:   {}s", limits.call_timeout_seconds);
    println!("  Stage timeout:  {}s", limits.stage_timeout_seconds);
    println!("  Run timeout:    {}s", limits.run_timeout_seconds);
    println!("  Max concurrent: {}", limits.max_concurrent_calls);
    println!("  Retry rounds:   {}", limits.stage_retry_rounds);
    println!(
        "  Source:         {}-{}s, <= {} bytes",
        limits.source.min_duration_seconds,
        limits.source.max_duration_seconds,
        limits.source.max_source_bytes
    );
    println!();
    println!("Resolver:");
    println!("  Precedence: {:?}", config.resolver.precedence);
    println!(
        "  Axes:       {}",
        config
            .resolver
            .axes
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_resolves_relative_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("clip.mp4"), b"video-bytes").unwrap();
        std::fs::write(temp.path().join("clip.txt"), "hello there").unwrap();
        let manifest_path = temp.path().join("source.yaml");
        std::fs::write(
            &manifest_path,
            "subject: s-1\nvideo: clip.mp4\ntranscript: clip.txt\nduration_seconds: 42.0\nresolution: {width: 1280, height: 720}\n",
        )
        .unwrap();

        let manifest = SourceManifest::from_file(&manifest_path).unwrap();
        let artifact = manifest.load_artifact(temp.path()).unwrap();

        assert_eq!(manifest.subject.as_deref(), Some("s-1"));
        assert_eq!(artifact.label(), "clip.mp4");
        assert_eq!(artifact.size_bytes(), 11);
        assert_eq!(artifact.transcript(), Some("hello there"));
        assert!(artifact.audio().is_none());
    }

    #[test]
    fn test_manifest_missing_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let manifest: SourceManifest = serde_json::from_str(
            r#"{"video": "absent.mp4", "duration_seconds": 30, "resolution": {"width": 640, "height": 480}}"#,
        )
        .unwrap();

        assert!(manifest.load_artifact(temp.path()).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-label", 8), "a-ver...");
    }
}
