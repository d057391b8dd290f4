//! metricpost - send application events to an ingestion endpoint
//!
//! This tool provides commands for:
//! - Checking publisher configuration
//! - Sending one-off events
//! - Streaming JSON-lines events from stdin through the batching publisher
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/metricpost/config.toml (~/.config/metricpost/config.toml)
//! - Logs: $XDG_STATE_HOME/metricpost/metricpost.log (~/.local/state/metricpost/metricpost.log)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metricpost_core::publish::AttributeInput;
use metricpost_core::{Config, FlushOutcome, LifecycleSignal, Publisher};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How often `drain` re-checks for in-flight work
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "metricpost")]
#[command(about = "Send application events to an ingestion endpoint in batches")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the XDG default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show publisher configuration and status
    Status,

    /// Record one event (optionally repeated) and deliver it
    Send {
        /// Metric name
        #[arg(short, long)]
        metric: String,

        /// Numeric value
        #[arg(long)]
        value: Option<f64>,

        /// Identifier of the measured subject
        #[arg(long)]
        content_id: Option<String>,

        /// Attributes as a JSON object
        #[arg(long)]
        attributes: Option<String>,

        /// Experiment cohort
        #[arg(long)]
        experiment_group: Option<String>,

        /// Number of copies to record
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Read JSON-lines events from stdin until EOF or Ctrl-C
    Pipe,
}

/// One line of `pipe` input
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputEvent {
    metric_name: String,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    content_id: Option<String>,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
    #[serde(default)]
    experiment_group: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    if let Some(endpoint) = args.endpoint {
        config.publisher.endpoint = Some(endpoint);
    }

    let _log_guard = if args.verbose {
        Some(
            metricpost_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Send {
            metric,
            value,
            content_id,
            attributes,
            experiment_group,
            count,
        } => {
            cmd_send(
                &config,
                &metric,
                value,
                content_id.as_deref(),
                attributes,
                experiment_group.as_deref(),
                count,
            )
            .await
        }
        Command::Pipe => cmd_pipe(&config).await,
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("metricpost Publisher Configuration");
    println!("==================================");
    println!();

    let publisher = &config.publisher;

    println!("Config File:     {}", Config::config_path().display());
    println!("Log Files:       {}.*", Config::log_path().display());
    println!("Enabled:         {}", publisher.enabled);

    if !publisher.enabled {
        println!();
        println!("Publisher is disabled. Enable it in config.toml:");
        println!();
        println!("  [publisher]");
        println!("  enabled = true");
        println!("  endpoint = \"https://your-ingest-endpoint.example.com/events\"");
        return Ok(());
    }

    println!(
        "Endpoint:        {}",
        publisher.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!("Batch Size:      {}", publisher.batch_size);
    println!("Batch Timeout:   {}ms", publisher.batch_timeout_ms);
    println!("Max Retries:     {}", publisher.max_retries);
    println!("Timeout:         {}s", publisher.timeout_secs);

    if !publisher.context.is_empty() {
        let keys: Vec<&str> = publisher.context.keys().map(String::as_str).collect();
        println!("Context Keys:    {}", keys.join(", "));
    }

    println!();
    if !publisher.is_ready() {
        println!("Status: Not ready (missing required configuration)");
    } else if let Err(e) = publisher.validate() {
        println!("Status: Invalid configuration ({})", e);
    } else {
        println!("Status: Ready to publish");
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_send(
    config: &Config,
    metric: &str,
    value: Option<f64>,
    content_id: Option<&str>,
    attributes: Option<String>,
    experiment_group: Option<&str>,
    count: usize,
) -> Result<()> {
    let Some(publisher) = build_publisher(config)? else {
        return Ok(());
    };

    for _ in 0..count {
        publisher.track(
            metric,
            value,
            content_id,
            attributes.clone().map(AttributeInput::from),
            experiment_group,
        );
    }

    println!("Sending {} event(s)...", count);
    drain(&publisher).await;
    report(&publisher);
    publisher.shutdown();

    Ok(())
}

async fn cmd_pipe(config: &Config) -> Result<()> {
    let Some(publisher) = build_publisher(config)? else {
        return Ok(());
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tracked = 0usize;
    let mut skipped = 0usize;
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InputEvent>(line) {
                    Ok(event) => {
                        publisher.track(
                            &event.metric_name,
                            event.value,
                            event.content_id.as_deref(),
                            event.attributes.map(AttributeInput::from),
                            event.experiment_group.as_deref(),
                        );
                        tracked += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping invalid input line");
                        skipped += 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }

    println!("Read {} event(s), skipped {} invalid line(s)", tracked, skipped);

    if interrupted {
        // Process is exiting: hand what is left to the teardown path
        publisher.handle_signal(LifecycleSignal::Unload);
    } else {
        drain(&publisher).await;
    }
    report(&publisher);
    publisher.shutdown();

    Ok(())
}

/// Returns None (after telling the user) when publishing is not configured
fn build_publisher(config: &Config) -> Result<Option<Publisher>> {
    if !config.publisher.is_ready() {
        println!("Publisher is not configured. Run 'status' for details.");
        return Ok(None);
    }

    let publisher =
        Publisher::with_http(config.publisher.clone()).context("failed to create publisher")?;
    Ok(Some(publisher))
}

/// Flush until the queue is empty and no retries are pending
async fn drain(publisher: &Publisher) {
    loop {
        let outcome = publisher.flush().await;
        tracing::debug!(?outcome, "Drain flush");

        if outcome != FlushOutcome::Busy
            && publisher.queue_len() == 0
            && publisher.pending_retries() == 0
        {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

fn report(publisher: &Publisher) {
    let stats = publisher.stats();
    let failed = publisher.failed_batches();

    println!();
    if stats.events_sent > 0 {
        println!("Delivered {} event(s)", stats.events_sent);
    } else {
        println!("No events delivered");
    }
    if !failed.is_empty() {
        let events: usize = failed.iter().map(|f| f.batch.len()).sum();
        println!(
            "Archived {} batch(es) ({} event(s)) after exhausting retries",
            failed.len(),
            events
        );
    }

    if stats.api_calls > 0 || stats.teardown_sends > 0 {
        println!();
        println!("Stats:");
        println!("  Session:    {}", publisher.session_id());
        println!("  API Calls:  {}", stats.api_calls);
        println!("  Failures:   {}", stats.api_failures);
        println!("  Retries:    {}", stats.retries_scheduled);
        println!("  Teardown:   {}", stats.teardown_sends);
    }
}
