use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::aggregate::{write_report, AggregateOutcome, Aggregator};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{summary_context, EchoSummarizer, Notifier, StdoutNotifier, Summarizer};
use crate::config::{load_config, DigestConfig};
use crate::errors::DigestError;
use crate::event::Provider;
use crate::fetch::resolve_sources;
use crate::pipeline::{AggregationStatus, FetchStatus, Pipeline, RunResult};

/// Top-level CLI for the daily cloud audit digest
#[derive(Parser)]
#[command(
    name = "cloudlog_digest",
    version,
    about = "Fetch, compress and summarize cloud audit logs"
)]
pub struct Cli {
    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch every configured provider, aggregate, and print the summary
    Run {
        /// TOML configuration file (defaults to ./cloudlog.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        window_hours: Option<u32>,
        /// Cap on listed read groups, for every provider
        #[arg(long)]
        read_cap: Option<usize>,
        /// Print the run result as JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Re-aggregate an existing raw event sink
    Aggregate {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        provider: Provider,
        #[arg(long)]
        read_cap: Option<usize>,
        /// Write the report here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration with secrets redacted
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn apply_overrides(
    config: &mut DigestConfig,
    output_dir: Option<PathBuf>,
    window_hours: Option<u32>,
    read_cap: Option<usize>,
) {
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    if let Some(hours) = window_hours {
        config.window_hours = hours;
    }
    if let Some(cap) = read_cap {
        config.aws.read_cap = cap;
        config.azure.read_cap = cap;
    }
}

fn print_status(result: &RunResult) {
    for run in &result.providers {
        let name = run.provider.display_name();
        match &run.fetch {
            FetchStatus::Completed => println!("✅ {name}: Received {} events", run.events),
            FetchStatus::Failed { error } => {
                println!("⚠️  {name}: Received {} events before failing: {error}", run.events)
            }
            FetchStatus::Skipped { reason } => println!("ℹ️  {name}: skipped ({reason})"),
        }
        if let AggregationStatus::Failed { error } = &run.aggregation {
            println!("❌ {name}: filtering failed: {error}");
        }
    }
}

async fn run_pipeline(config: DigestConfig, json: bool) -> anyhow::Result<ExitCode> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    println!("🔍 Step 1: Fetching raw logs from cloud providers...");
    let sources =
        resolve_sources(&config, Arc::clone(&clock)).context("preparing provider sources")?;
    let pipeline = Arc::new(Pipeline::new(&config, clock));

    let interrupt = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing with what has been fetched so far");
                pipeline.cancel();
            }
        })
    };
    let outcome = pipeline.run(sources).await;
    interrupt.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(DigestError::NoUsableData { failures, .. }) => {
            eprintln!("❌ No provider produced a usable report:");
            for failure in failures {
                eprintln!("   - {failure}");
            }
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(ExitCode::SUCCESS);
    }

    print_status(&result);
    println!("\n🧹 Step 2: Reports written to {}", pipeline.output_dir().display());

    let context = summary_context(&result);
    if context.is_empty() {
        println!("ℹ️ No activity logs found to analyze.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("\n🤖 Step 3: Summarizing filtered data...");
    let summary = EchoSummarizer.summarize(&context).await?;
    StdoutNotifier.notify(&summary).await?;
    Ok(ExitCode::SUCCESS)
}

fn aggregate_file(
    config: DigestConfig,
    input: PathBuf,
    provider: Provider,
    read_cap: Option<usize>,
    output: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let cap = read_cap.unwrap_or(match provider {
        Provider::Aws => config.aws.read_cap,
        Provider::Azure => config.azure.read_cap,
    });
    if cap == 0 {
        bail!("--read-cap must be greater than 0");
    }

    let report = match Aggregator::new(cap).aggregate_sink(provider, &input)? {
        AggregateOutcome::Report(report) => report,
        AggregateOutcome::NoInput => {
            eprintln!("❌ Error: {} not found.", input.display());
            return Ok(ExitCode::FAILURE);
        }
    };

    match output {
        Some(path) => {
            write_report(&report, &path)?;
            println!("✅ Filtering complete: {}", path.display());
        }
        None => print!("{}", report.render()),
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run {
            config,
            output_dir,
            window_hours,
            read_cap,
            json,
        } => {
            let mut cfg = load_config(config.as_deref()).context("loading configuration")?;
            apply_overrides(&mut cfg, output_dir, window_hours, read_cap);
            cfg.validate().context("validating configuration")?;
            run_pipeline(cfg, json).await
        }
        Commands::Aggregate {
            input,
            provider,
            read_cap,
            output,
            config,
        } => {
            let cfg = load_config(config.as_deref()).context("loading configuration")?;
            aggregate_file(cfg, input, provider, read_cap, output)
        }
        Commands::Config {
            action: ConfigAction::Show { config },
        } => {
            let cfg = load_config(config.as_deref()).context("loading configuration")?;
            print!("{}", toml::to_string_pretty(&cfg.redacted())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "cloudlog_digest",
            "-v",
            "run",
            "--output-dir",
            "/tmp/out",
            "--read-cap",
            "5",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                output_dir,
                read_cap,
                window_hours,
                json,
                ..
            } => {
                assert_eq!(output_dir, Some(PathBuf::from("/tmp/out")));
                assert_eq!(read_cap, Some(5));
                assert_eq!(window_hours, None);
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_aggregate_provider() {
        let cli = Cli::try_parse_from([
            "cloudlog_digest",
            "aggregate",
            "--input",
            "logs/azure_logs_24h.json",
            "--provider",
            "azure",
        ])
        .unwrap();
        match cli.command {
            Commands::Aggregate { provider, .. } => assert_eq!(provider, Provider::Azure),
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn rejects_unknown_provider() {
        let parsed = Cli::try_parse_from(["cloudlog_digest", "aggregate", "-i", "x.json", "-p", "gcp"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn read_cap_override_applies_to_every_provider() {
        let mut config = DigestConfig::default();
        apply_overrides(&mut config, None, Some(6), Some(3));
        assert_eq!(config.window_hours, 6);
        assert_eq!(config.aws.read_cap, 3);
        assert_eq!(config.azure.read_cap, 3);
    }

    #[test]
    fn oversized_window_override_is_rejected() {
        let mut config = DigestConfig::default();
        apply_overrides(&mut config, None, Some(u32::MAX), None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn aggregate_missing_input_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let code = aggregate_file(
            DigestConfig::default(),
            dir.path().join("missing.json"),
            Provider::Aws,
            None,
            None,
        )
        .unwrap();
        assert_eq!(code, ExitCode::FAILURE);
    }
}
