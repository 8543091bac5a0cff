//! End-to-end orchestration tests with scripted providers
//!
//! These tests drive the whole fetch -> persist -> aggregate path:
//! - Provider failure isolation
//! - Partial data surviving a mid-pagination failure
//! - Cancellation and the no-usable-data outcome

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use cloudlog_digest::{
    clock::FixedClock,
    collaborators::summary_context,
    config::DigestConfig,
    event_sink::{marker_path, read_sink, SinkContents},
    fetch::{Page, PageSource, ProviderSource},
    pipeline::{AggregationStatus, FetchStatus, Pipeline},
    DigestError, DigestResult, Provider, RawEvent, TimeRange,
};

/// Serves `pages[i]` events per page, then fails at page `fail_at` if set
struct ScriptedProvider {
    provider: Provider,
    pages: Vec<usize>,
    fail_at: Option<usize>,
    rejected: bool,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(provider: Provider, pages: Vec<usize>) -> Self {
        Self {
            provider,
            pages,
            fail_at: None,
            rejected: false,
            delay: Duration::ZERO,
        }
    }

    fn failing_at(mut self, page: usize) -> Self {
        self.fail_at = Some(page);
        self
    }

    /// First page answers like an endpoint refusing the credentials
    fn rejecting_credentials(mut self) -> Self {
        self.fail_at = Some(0);
        self.rejected = true;
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn ready(self, read_cap: usize) -> ProviderSource {
        ProviderSource::Ready {
            source: Arc::new(self),
            read_cap,
        }
    }
}

#[async_trait]
impl PageSource for ScriptedProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch_page(&self, window: &TimeRange, token: Option<&str>) -> DigestResult<Page> {
        let index: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_at == Some(index) {
            if self.rejected {
                return Err(DigestError::configuration(
                    self.provider.as_str(),
                    "HTTP 403 Forbidden: UnrecognizedClientException",
                ));
            }
            return Err(DigestError::transient(self.provider, "HTTP 503: throttled"));
        }

        let events = (0..self.pages[index])
            .map(|i| {
                let event = RawEvent::new(self.provider, window.end, "svc-deploy", &format!("Describe{i}"));
                if i == 0 {
                    event.with_mutating(true)
                } else {
                    event
                }
            })
            .collect();
        let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(Page { events, next })
    }
}

fn pipeline_in(dir: &Path, tweak: impl FnOnce(&mut DigestConfig)) -> Pipeline {
    let mut config = DigestConfig {
        output_dir: dir.to_path_buf(),
        ..DigestConfig::default()
    };
    tweak(&mut config);
    let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()));
    Pipeline::new(&config, clock)
}

fn sink_events(path: &Path) -> Vec<RawEvent> {
    match read_sink(path).unwrap() {
        SinkContents::Events(events) => events,
        SinkContents::Missing => panic!("sink {} missing", path.display()),
    }
}

#[tokio::test]
async fn failing_provider_does_not_affect_the_other() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Aws, vec![5, 5, 2]).ready(10),
        ScriptedProvider::new(Provider::Azure, vec![4, 3, 9])
            .failing_at(2)
            .ready(15),
    ];

    let result = pipeline.run(sources).await.unwrap();
    assert_eq!(result.reports().count(), 2);
    assert!(!result.is_partial());

    let aws = result.provider(Provider::Aws).unwrap();
    assert!(matches!(aws.fetch, FetchStatus::Completed));
    assert_eq!(aws.events, 12);
    assert_eq!(aws.report().unwrap().total_events, 12);

    let azure = result.provider(Provider::Azure).unwrap();
    match &azure.fetch {
        FetchStatus::Failed { error } => assert!(error.contains("HTTP 503")),
        other => panic!("expected failed fetch, got {other:?}"),
    }
    assert_eq!(azure.events, 7);

    // the partial sink holds exactly the events fetched before the failure
    let azure_sink = pipeline.sink_path(Provider::Azure);
    assert_eq!(sink_events(&azure_sink).len(), 7);
    assert!(!marker_path(&azure_sink).exists());

    // and is still aggregated into a report that says it is incomplete
    let report = azure.report().unwrap();
    assert_eq!(report.total_events, 7);
    assert!(report.render().contains(
        "_Partial: fetch stopped after 7 events (Transient fetch error: azure - HTTP 503: throttled)_"
    ));
    assert!(aws.report().unwrap().partial.is_none());
    let context = summary_context(&result);
    assert!(context.contains("_Partial: fetch stopped after 7 events"));
    assert!(pipeline.report_path(Provider::Azure).exists());
    assert!(pipeline.report_path(Provider::Aws).exists());
}

#[tokio::test]
async fn providers_are_reported_in_stable_order() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Azure, vec![1]).ready(15),
        ScriptedProvider::new(Provider::Aws, vec![1]).ready(10),
    ];
    let result = pipeline.run(sources).await.unwrap();

    let order: Vec<Provider> = result.providers.iter().map(|run| run.provider).collect();
    assert_eq!(order, vec![Provider::Aws, Provider::Azure]);
    assert!(!result.is_partial());

    let context = summary_context(&result);
    let aws_at = context.find("--- AWS FILTERED LOGS ---").unwrap();
    let azure_at = context.find("--- AZURE FILTERED LOGS ---").unwrap();
    assert!(aws_at < azure_at);
}

#[tokio::test]
async fn rejected_credentials_skip_the_provider() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Aws, vec![3]).rejecting_credentials().ready(10),
        ScriptedProvider::new(Provider::Azure, vec![2]).ready(15),
    ];
    let result = pipeline.run(sources).await.unwrap();

    let aws = result.provider(Provider::Aws).unwrap();
    match &aws.fetch {
        FetchStatus::Skipped { reason } => assert!(reason.contains("HTTP 403")),
        other => panic!("expected skipped fetch, got {other:?}"),
    }
    assert!(matches!(aws.aggregation, AggregationStatus::NotRun));
    assert!(!pipeline.report_path(Provider::Aws).exists());
    assert!(result.is_partial());

    let context = summary_context(&result);
    assert!(!context.contains("AWS FILTERED LOGS"));
    assert!(context.contains("AZURE FILTERED LOGS"));
}

#[tokio::test]
async fn rejected_credentials_alone_are_no_usable_data() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Aws, vec![3]).rejecting_credentials().ready(10),
        ProviderSource::Skipped {
            provider: Provider::Azure,
            reason: "not configured".into(),
        },
    ];

    match pipeline.run(sources).await {
        Err(DigestError::NoUsableData { attempted, failures }) => {
            assert_eq!(attempted, 2);
            assert!(failures[0].starts_with("AWS: skipped ("));
            assert!(failures[0].contains("HTTP 403"));
        }
        other => panic!("expected NoUsableData, got {other:?}"),
    }
}

#[tokio::test]
async fn failure_before_any_event_is_not_a_report() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Aws, vec![3]).failing_at(0).ready(10),
        ScriptedProvider::new(Provider::Azure, vec![0]).ready(15),
    ];
    let result = pipeline.run(sources).await.unwrap();

    let aws = result.provider(Provider::Aws).unwrap();
    assert!(matches!(aws.fetch, FetchStatus::Failed { .. }));
    assert!(matches!(aws.aggregation, AggregationStatus::NotRun));
    assert!(aws.report().is_none());

    // a completed fetch of an empty window is still a usable report
    let azure = result.provider(Provider::Azure).unwrap().report().unwrap();
    assert!(azure.is_empty());
    assert!(azure.partial.is_none());
    assert!(azure.render().contains("_No activity recorded in this window._"));
}

#[tokio::test]
async fn failure_before_any_event_everywhere_is_no_usable_data() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ScriptedProvider::new(Provider::Aws, vec![3]).failing_at(0).ready(10),
        ScriptedProvider::new(Provider::Azure, vec![3]).failing_at(0).ready(15),
    ];
    assert!(matches!(
        pipeline.run(sources).await,
        Err(DigestError::NoUsableData { attempted: 2, .. })
    ));
}

#[tokio::test]
async fn nothing_configured_is_no_usable_data() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sources = vec![
        ProviderSource::Skipped {
            provider: Provider::Aws,
            reason: "not configured".into(),
        },
        ProviderSource::Skipped {
            provider: Provider::Azure,
            reason: "not configured".into(),
        },
    ];

    match pipeline.run(sources).await {
        Err(DigestError::NoUsableData { attempted, failures }) => {
            assert_eq!(attempted, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected NoUsableData, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_sink_from_a_previous_crash_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |_| {});

    let sink = pipeline.sink_path(Provider::Aws);
    std::fs::write(&sink, "[\n{\"half\": ").unwrap();
    std::fs::write(marker_path(&sink), "").unwrap();

    let result = pipeline
        .run(vec![ScriptedProvider::new(Provider::Aws, vec![2]).ready(10)])
        .await
        .unwrap();

    assert_eq!(result.provider(Provider::Aws).unwrap().events, 2);
    assert_eq!(sink_events(&sink).len(), 2);
}

#[tokio::test]
async fn cancellation_keeps_what_was_already_persisted() {
    let dir = TempDir::new().unwrap();
    let pipeline = Arc::new(pipeline_in(dir.path(), |_| {}));

    let slow = ScriptedProvider::new(Provider::Azure, vec![2, 2, 2, 2])
        .slow(Duration::from_millis(200))
        .ready(15);

    let canceller = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            pipeline.cancel();
        })
    };

    let result = pipeline.run(vec![slow]).await.unwrap();
    canceller.await.unwrap();

    let azure = result.provider(Provider::Azure).unwrap();
    match &azure.fetch {
        FetchStatus::Failed { error } => assert!(error.contains("cancelled")),
        other => panic!("expected cancelled fetch, got {other:?}"),
    }
    assert!(azure.events >= 2 && azure.events < 8);
    assert_eq!(
        sink_events(&pipeline.sink_path(Provider::Azure)).len(),
        azure.events
    );
    let report = azure.report().unwrap();
    assert_eq!(report.total_events, azure.events);
    assert!(report.partial.as_deref().unwrap().contains("run cancelled"));
}

#[tokio::test]
async fn run_timeout_cancels_slow_providers() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(dir.path(), |config| config.run_timeout_secs = Some(1));

    let slow = ScriptedProvider::new(Provider::Aws, vec![1; 20])
        .slow(Duration::from_millis(300))
        .ready(10);

    let result = pipeline.run(vec![slow]).await.unwrap();
    let aws = result.provider(Provider::Aws).unwrap();
    assert!(matches!(aws.fetch, FetchStatus::Failed { .. }));
    assert!(aws.events < 20);
}
