//! stepflow-traces: inspect and maintain a stepflow trace store.
//!
//! Replays JSONL event files into the configured store, evicts old traces,
//! and prints traces, groups, search results and statistics as JSON.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stepflow_config::{MonitorConfig, StoreConfig};
use stepflow_monitor::{ObservabilityEvent, ObservabilityService, TimeRange, TraceFilter, TraceStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepflow-traces")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding traces (overrides the config file)
    #[arg(long, global = true, env = "STEPFLOW_STORE_PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a file of newline-delimited observability events
    Ingest {
        /// JSONL file, one event per line
        file: PathBuf,
    },

    /// Print a single trace
    Show { trace_id: String },

    /// Print a trace group with its member traces
    Group { correlation_id: String },

    /// Search traces and groups
    Search {
        /// Substring of the flow name
        #[arg(long)]
        flow: Option<String>,

        /// running, completed or failed
        #[arg(long)]
        status: Option<TraceStatus>,

        /// Substring of any step name
        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,

        /// Earliest start time (Unix ms)
        #[arg(long)]
        from: Option<i64>,

        /// Latest start time (Unix ms)
        #[arg(long)]
        to: Option<i64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print aggregate statistics
    Stats,

    /// Evict traces older than the configured maximum age
    Cleanup {
        /// Maximum trace age in milliseconds
        #[arg(long)]
        max_age_ms: Option<u64>,
    },
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    processed: usize,
    skipped: usize,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    let config = match &cli.config {
        Some(path) => MonitorConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    let mut config = config.apply_env()?;

    if let Some(path) = &cli.store {
        config.store = StoreConfig::Sqlite { path: path.clone() };
    }
    if config.store == StoreConfig::Memory {
        tracing::warn!("No store path configured; traces will not outlive this command");
    }
    Ok(config)
}

/// Applies every parseable line of `reader` in order. Blank lines are ignored.
async fn ingest(service: &ObservabilityService, reader: impl BufRead) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ObservabilityEvent>(&line) {
            Ok(event) => {
                service.process_event(&event).await;
                summary.processed += 1;
            }
            Err(e) => {
                tracing::warn!(line = index + 1, "Skipping malformed event: {}", e);
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

fn open_events(path: &Path) -> Result<std::io::BufReader<std::fs::File>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(std::io::BufReader::new(file))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(&cli)?;
    if let Commands::Cleanup {
        max_age_ms: Some(ms),
    } = &cli.command
    {
        config = config.with_max_trace_age_ms(*ms);
    }
    let service = ObservabilityService::from_config(config)?;

    match cli.command {
        Commands::Ingest { file } => {
            let summary = ingest(&service, open_events(&file)?).await?;
            tracing::info!(
                processed = summary.processed,
                skipped = summary.skipped,
                "Ingested {}",
                file.display()
            );
            print_json(&summary)?;
        }
        Commands::Show { trace_id } => match service.get_trace(&trace_id).await {
            Some(trace) => print_json(&trace)?,
            None => anyhow::bail!("Trace not found: {}", trace_id),
        },
        Commands::Group { correlation_id } => match service.get_trace_group(&correlation_id).await {
            Some(group) => print_json(&group)?,
            None => anyhow::bail!("Trace group not found: {}", correlation_id),
        },
        Commands::Search {
            flow,
            status,
            step,
            correlation_id,
            from,
            to,
            limit,
        } => {
            let filter = TraceFilter {
                flow_name: flow,
                status,
                step_name: step,
                correlation_id,
                start_time: (from.is_some() || to.is_some()).then_some(TimeRange { from, to }),
                limit,
            };
            print_json(&service.search_traces(&filter).await)?;
        }
        Commands::Stats => print_json(&service.get_stats().await)?,
        Commands::Cleanup { .. } => print_json(&service.cleanup_old_traces().await)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use stepflow_monitor::MemoryStore;

    #[tokio::test]
    async fn test_ingest_skips_malformed_lines() {
        let service = ObservabilityService::new(Arc::new(MemoryStore::new()), MonitorConfig::default());
        let input = concat!(
            r#"{"eventType":"step_start","traceId":"t1","stepName":"api-step","timestamp":1000}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"eventType":"step_end","traceId":"t1","stepName":"api-step","timestamp":1500,"duration":500,"metadata":{"success":true}}"#,
            "\n",
        );

        let summary = ingest(&service, Cursor::new(input)).await.unwrap();
        assert_eq!(summary, IngestSummary { processed: 2, skipped: 1 });

        let trace = service.get_trace("t1").await.unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
        assert_eq!(trace.duration, Some(500));
    }

    #[test]
    fn test_store_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "stepflow-traces",
            "--store",
            dir.path().join("t.db").to_str().unwrap(),
            "stats",
        ]);
        let config = load_config(&cli).unwrap();
        assert!(matches!(config.store, StoreConfig::Sqlite { .. }));
    }

    #[test]
    fn test_parse_search_flags() {
        let cli = Cli::parse_from([
            "stepflow-traces",
            "search",
            "--status",
            "failed",
            "--from",
            "10",
        ]);
        match cli.command {
            Commands::Search { status, from, to, .. } => {
                assert_eq!(status, Some(TraceStatus::Failed));
                assert_eq!(from, Some(10));
                assert!(to.is_none());
            }
            _ => panic!("expected search"),
        }
    }
}
