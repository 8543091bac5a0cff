//! Fetch-then-aggregate orchestration across providers.
//!
//! Each configured provider runs as its own tokio task: its fetcher pages into
//! the provider's sink, and once that fetch is over with events persisted the
//! same task aggregates the sink and writes the report document. Providers
//! share nothing but the run-level cancellation signal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{write_report, AggregateOutcome, Aggregator, Report};
use crate::clock::Clock;
use crate::config::DigestConfig;
use crate::errors::{error_chain, DigestError, DigestResult};
use crate::event::{Provider, TimeRange};
use crate::fetch::{Fetcher, PageSource, ProviderSource};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Completed,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregationStatus {
    Report { report: Report },
    NoInput,
    Failed { error: String },
    NotRun,
}

/// What happened to one provider during a run
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRun {
    pub provider: Provider,
    pub fetch: FetchStatus,
    pub events: usize,
    pub aggregation: AggregationStatus,
    pub sink_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

impl ProviderRun {
    fn skipped(provider: Provider, reason: String) -> Self {
        Self {
            provider,
            fetch: FetchStatus::Skipped { reason },
            events: 0,
            aggregation: AggregationStatus::NotRun,
            sink_path: None,
            report_path: None,
        }
    }

    pub fn report(&self) -> Option<&Report> {
        match &self.aggregation {
            AggregationStatus::Report { report } => Some(report),
            _ => None,
        }
    }

    /// One-line status used for logs and the no-usable-data error
    pub fn summary(&self) -> String {
        let fetch = match &self.fetch {
            FetchStatus::Completed => format!("fetched {} events", self.events),
            FetchStatus::Failed { error } => {
                format!("fetch failed after {} events ({error})", self.events)
            }
            FetchStatus::Skipped { reason } => format!("skipped ({reason})"),
        };
        let aggregation = match &self.aggregation {
            AggregationStatus::Report { .. } => "report ready".to_string(),
            AggregationStatus::NoInput => "no input".to_string(),
            AggregationStatus::Failed { error } => format!("aggregation failed ({error})"),
            AggregationStatus::NotRun => "not aggregated".to_string(),
        };
        format!("{}: {fetch}; {aggregation}", self.provider.display_name())
    }
}

/// Outcome of a run in which at least one provider produced a report
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub window: TimeRange,
    pub providers: Vec<ProviderRun>,
}

impl RunResult {
    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.providers.iter().filter_map(ProviderRun::report)
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderRun> {
        self.providers.iter().find(|run| run.provider == provider)
    }

    /// True when some provider has no report (skipped, or aggregation failed)
    pub fn is_partial(&self) -> bool {
        self.providers.iter().any(|run| run.report().is_none())
    }
}

/// Everything one provider task needs, owned
struct ProviderJob {
    source: Arc<dyn PageSource>,
    aggregator: Aggregator,
    fetcher: Fetcher,
    window: TimeRange,
    sink_path: PathBuf,
    report_path: PathBuf,
    cancel: watch::Receiver<bool>,
}

impl ProviderJob {
    async fn run(mut self) -> ProviderRun {
        let provider = self.source.provider();

        let outcome = self
            .fetcher
            .fetch(self.source.as_ref(), &self.window, &self.sink_path, &mut self.cancel)
            .await;
        let fetch = match &outcome.error {
            None => FetchStatus::Completed,
            Some(e) if e.is_configuration() => FetchStatus::Skipped {
                reason: error_chain(e),
            },
            Some(e) => FetchStatus::Failed {
                error: error_chain(e),
            },
        };

        // A provider that never delivered an event has nothing to report on
        if outcome.error.is_some() && outcome.count == 0 {
            warn!("{} produced no events, not aggregating", provider);
            return ProviderRun {
                provider,
                fetch,
                events: 0,
                aggregation: AggregationStatus::NotRun,
                sink_path: Some(self.sink_path),
                report_path: None,
            };
        }

        let mut report_path = None;
        let aggregation = match self.aggregator.aggregate_sink(provider, &self.sink_path) {
            Ok(AggregateOutcome::Report(mut report)) => {
                if let Some(e) = &outcome.error {
                    report.mark_partial(format!(
                        "fetch stopped after {} events ({})",
                        outcome.count,
                        error_chain(e)
                    ));
                }
                match write_report(&report, &self.report_path) {
                    Ok(()) => report_path = Some(self.report_path.clone()),
                    Err(e) => warn!(
                        "Report for {} kept in memory only: {}",
                        provider,
                        error_chain(&e)
                    ),
                }
                AggregationStatus::Report { report }
            }
            Ok(AggregateOutcome::NoInput) => AggregationStatus::NoInput,
            Err(e) => {
                warn!("❌ {} aggregation failed: {}", provider, error_chain(&e));
                AggregationStatus::Failed {
                    error: error_chain(&e),
                }
            }
        };

        ProviderRun {
            provider,
            fetch,
            events: outcome.count,
            aggregation,
            sink_path: Some(self.sink_path),
            report_path,
        }
    }
}

pub struct Pipeline {
    output_dir: PathBuf,
    window_hours: u32,
    request_timeout: Duration,
    run_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Pipeline {
    pub fn new(config: &DigestConfig, clock: Arc<dyn Clock>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            output_dir: config.output_dir.clone(),
            window_hours: config.window_hours,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            run_timeout: config.run_timeout_secs.map(Duration::from_secs),
            clock,
            cancel: Arc::new(cancel),
        }
    }

    /// Stop every fetcher from requesting further pages. Already persisted
    /// events are kept and still aggregated.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn sink_path(&self, provider: Provider) -> PathBuf {
        self.output_dir
            .join(format!("{}_logs_{}h.json", provider, self.window_hours))
    }

    pub fn report_path(&self, provider: Provider) -> PathBuf {
        self.output_dir
            .join(format!("{}_logs_filtered_{}hrs.md", provider, self.window_hours))
    }

    /// Fetch and aggregate every provider.
    ///
    /// Provider failures are recorded in the result. The only error is
    /// `NoUsableData`, returned when not a single provider produced a report.
    pub async fn run(&self, sources: Vec<ProviderSource>) -> DigestResult<RunResult> {
        let window = TimeRange::trailing(self.clock.now(), self.window_hours);
        let run_id = Uuid::new_v4().to_string();
        info!(
            "🔍 Run {} over {} .. {}",
            run_id,
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        let timer = self.run_timeout.map(|limit| {
            let cancel = Arc::clone(&self.cancel);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("⏱️  Run timeout of {}s reached, cancelling fetches", limit.as_secs());
                cancel.send_replace(true);
            })
        });

        let mut runs = Vec::new();
        let mut tasks: Vec<(Provider, JoinHandle<ProviderRun>)> = Vec::new();
        for source in sources {
            match source {
                ProviderSource::Skipped { provider, reason } => {
                    runs.push(ProviderRun::skipped(provider, reason));
                }
                ProviderSource::Ready { source, read_cap } => {
                    let provider = source.provider();
                    let job = ProviderJob {
                        source,
                        aggregator: Aggregator::new(read_cap),
                        fetcher: Fetcher::new(self.request_timeout),
                        window,
                        sink_path: self.sink_path(provider),
                        report_path: self.report_path(provider),
                        cancel: self.cancel.subscribe(),
                    };
                    tasks.push((provider, tokio::spawn(job.run())));
                }
            }
        }

        for (provider, task) in tasks {
            match task.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    error!("{} pipeline task aborted: {}", provider, e);
                    runs.push(ProviderRun {
                        provider,
                        fetch: FetchStatus::Failed {
                            error: format!("task aborted: {e}"),
                        },
                        events: 0,
                        aggregation: AggregationStatus::NotRun,
                        sink_path: Some(self.sink_path(provider)),
                        report_path: None,
                    });
                }
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        runs.sort_by_key(|run| run.provider);
        for run in &runs {
            info!("{}", run.summary());
        }

        if runs.iter().all(|run| run.report().is_none()) {
            return Err(DigestError::NoUsableData {
                attempted: runs.len(),
                failures: runs.iter().map(ProviderRun::summary).collect(),
            });
        }

        Ok(RunResult {
            run_id,
            window,
            providers: runs,
        })
    }
}
