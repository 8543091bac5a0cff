//! Paginated retrieval of provider audit events.
//!
//! Every provider is a [`PageSource`]: it knows how to request one page for a
//! window and continuation token, and how long to wait between pages. The
//! [`Fetcher`] owns the single pagination loop: it streams each page into the
//! provider's sink, stops at the first error or on cancellation, and always
//! finalizes whatever it already persisted.

pub mod aws;
pub mod azure;
pub mod sigv4;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DigestConfig;
use crate::errors::{error_chain, DigestError, DigestResult};
use crate::event::{Provider, RawEvent, TimeRange};
use crate::event_sink::EventSinkWriter;

/// One page of normalized events plus the provider's continuation token
#[derive(Debug, Default)]
pub struct Page {
    pub events: Vec<RawEvent>,
    pub next: Option<String>,
}

/// Provider-specific half of paginated fetch.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn provider(&self) -> Provider;

    /// Minimum pause between consecutive page requests (provider rate limit)
    fn page_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Request the page following `token` (the first page when `None`).
    async fn fetch_page(&self, window: &TimeRange, token: Option<&str>) -> DigestResult<Page>;
}

/// Result of one provider fetch: what was persisted, and why it stopped early
#[derive(Debug)]
pub struct FetchOutcome {
    pub count: usize,
    pub error: Option<DigestError>,
}

/// Resolves once `cancel` flips to `true`; never resolves if the sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fetcher {
    request_timeout: Duration,
}

impl Fetcher {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Page through `source` for `window`, streaming every event into `sink_path`.
    ///
    /// Never fails as a whole: errors end up in [`FetchOutcome::error`] next to
    /// the number of events already written.
    pub async fn fetch(
        &self,
        source: &dyn PageSource,
        window: &TimeRange,
        sink_path: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> FetchOutcome {
        let provider = source.provider();

        let mut writer = match EventSinkWriter::create(sink_path) {
            Ok(writer) => writer,
            Err(e) => {
                return FetchOutcome {
                    count: 0,
                    error: Some(e.into_fetch_error(provider)),
                }
            }
        };

        let mut error = self.paginate(source, window, &mut writer, cancel).await.err();
        let count = writer.count();

        if let Err(e) = writer.finish() {
            warn!("Could not finalize {} sink {}: {}", provider, sink_path.display(), e);
            error.get_or_insert(e.into_fetch_error(provider));
        }

        match &error {
            None => info!("✅ {}: saved {} events to {}", provider, count, sink_path.display()),
            Some(e) => warn!(
                "❌ {}: fetch stopped after {} events: {}",
                provider,
                count,
                error_chain(e)
            ),
        }

        FetchOutcome { count, error }
    }

    async fn paginate(
        &self,
        source: &dyn PageSource,
        window: &TimeRange,
        writer: &mut EventSinkWriter,
        cancel: &mut watch::Receiver<bool>,
    ) -> DigestResult<()> {
        let provider = source.provider();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if *cancel.borrow() {
                return Err(DigestError::transient(provider, "run cancelled"));
            }

            let interval = source.page_interval();
            if pages > 0 && !interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancelled(cancel) => {
                        return Err(DigestError::transient(provider, "run cancelled"));
                    }
                }
            }

            debug!("📡 Fetching page {} from {}", pages + 1, provider);
            let request =
                tokio::time::timeout(self.request_timeout, source.fetch_page(window, token.as_deref()));
            let page = tokio::select! {
                result = request => match result {
                    Ok(page) => page.map_err(|e| e.into_fetch_error(provider))?,
                    Err(_) => {
                        return Err(DigestError::transient(
                            provider,
                            format!("page request timed out after {}s", self.request_timeout.as_secs_f64()),
                        ));
                    }
                },
                _ = cancelled(cancel) => {
                    return Err(DigestError::transient(provider, "run cancelled"));
                }
            };
            pages += 1;

            for event in &page.events {
                writer
                    .append(event)
                    .map_err(|e| e.into_fetch_error(provider))?;
            }
            debug!(
                provider = %provider,
                page = pages,
                events = page.events.len(),
                total = writer.count(),
                "page persisted"
            );

            match page.next.filter(|next| !next.is_empty()) {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }
}

/// A provider ready to be fetched, or the reason it will not be
pub enum ProviderSource {
    Ready {
        source: Arc<dyn PageSource>,
        read_cap: usize,
    },
    Skipped {
        provider: Provider,
        reason: String,
    },
}

impl ProviderSource {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderSource::Ready { source, .. } => source.provider(),
            ProviderSource::Skipped { provider, .. } => *provider,
        }
    }
}

fn resolved(provider: Provider, read_cap: usize, source: DigestResult<Option<Arc<dyn PageSource>>>) -> ProviderSource {
    match source {
        Ok(Some(source)) => ProviderSource::Ready { source, read_cap },
        Ok(None) => {
            info!("ℹ️  {} not configured, skipping", provider);
            ProviderSource::Skipped {
                provider,
                reason: "not configured".to_string(),
            }
        }
        Err(e) => {
            warn!("⚠️  {} skipped: {}", provider, e);
            ProviderSource::Skipped {
                provider,
                reason: e.to_string(),
            }
        }
    }
}

/// Build every provider source the configuration allows.
///
/// Missing or broken credentials only skip the affected provider; the error
/// returned here is reserved for failures that affect all providers. Nothing
/// here touches the network or spawns processes: token acquisition happens
/// inside each provider's own fetch.
pub fn resolve_sources(
    config: &DigestConfig,
    clock: Arc<dyn Clock>,
) -> DigestResult<Vec<ProviderSource>> {
    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| DigestError::network("building HTTP client", e))?;

    let aws = aws::CloudTrailSource::from_settings(&config.aws, client.clone(), clock)
        .map(|s| s.map(|s| Arc::new(s) as Arc<dyn PageSource>));
    let azure = azure::ActivityLogSource::from_settings(&config.azure, client, request_timeout)
        .map(|s| Arc::new(s) as Arc<dyn PageSource>);

    Ok(vec![
        resolved(Provider::Aws, config.aws.read_cap, aws),
        resolved(Provider::Azure, config.azure.read_cap, Ok(azure)),
    ])
}
