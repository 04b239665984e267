//! The crawl orchestrator.
//!
//! [`CrawlPipeline`] wires a [`Navigator`], the configured extractor, the
//! [`Normalizer`] and the [`StorageDispatcher`] together for one run and
//! owns the retry state machine:
//!
//! ```text
//! idle -> navigating -> extracting -> normalizing -> saving -> done
//!             ^   |          |
//!             |   v          v
//!             +-- retrying <-+
//! ```
//!
//! Every page of a run is one load -> wait -> scroll -> extract stage with
//! its own retry budget. The run always ends in [`CrawlOutcome`]; errors
//! never escape past [`CrawlPipeline::run`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CrawlError, ExtractionError};
use crate::extract::{Extractor, ExtractorFactory, PolicyExtractor};
use crate::models::{RawRecord, SaveSummary, SavedArtifact};
use crate::navigator::Navigator;
use crate::normalize::Normalizer;
use crate::policy::CrawlPolicy;
use crate::storage::StorageDispatcher;
use crate::traits::{BrowserDriver, ResourceFetcherFactory};

/// States of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Navigating,
    Retrying,
    Extracting,
    Normalizing,
    Saving,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Navigating => "navigating",
            PipelineState::Retrying => "retrying",
            PipelineState::Extracting => "extracting",
            PipelineState::Normalizing => "normalizing",
            PipelineState::Saving => "saving",
            PipelineState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    AttemptFailed {
        stage: PipelineState,
        page: u32,
        attempt: u32,
        error: &'a CrawlError,
        will_retry: bool,
        backoff: Duration,
    },
    PageExtracted {
        page: u32,
        url: &'a str,
        records: usize,
    },
    ArtifactSaved {
        artifact: &'a SavedArtifact,
    },
    ArtifactFailed {
        artifact: &'a SavedArtifact,
    },
    Finished {
        outcome: &'a CrawlOutcome,
    },
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl PipelineReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::StateChanged { from, to } => {
                tracing::debug!(%from, %to, "Pipeline state changed");
            }
            PipelineEvent::AttemptFailed {
                stage,
                page,
                attempt,
                error,
                will_retry,
                backoff,
            } => {
                tracing::warn!(
                    %stage,
                    page,
                    attempt,
                    %error,
                    will_retry,
                    backoff_ms = backoff.as_millis() as u64,
                    "Page attempt failed"
                );
            }
            PipelineEvent::PageExtracted { page, url, records } => {
                tracing::info!(page, %url, records, "Page extracted");
            }
            PipelineEvent::ArtifactSaved { artifact } => {
                tracing::debug!(
                    kind = %artifact.kind,
                    name = %artifact.name,
                    path = ?artifact.path,
                    "Artifact saved"
                );
            }
            PipelineEvent::ArtifactFailed { artifact } => {
                tracing::warn!(
                    kind = %artifact.kind,
                    name = %artifact.name,
                    error = ?artifact.error,
                    "Artifact failed"
                );
            }
            PipelineEvent::Finished { outcome } => match outcome {
                CrawlOutcome::Success(report) => {
                    tracing::info!(
                        pages = report.pages,
                        attempts = report.attempts,
                        saved = report.summary.succeeded(),
                        failed = report.summary.failed(),
                        interrupted = report.summary.interrupted(),
                        "Crawl finished"
                    );
                }
                CrawlOutcome::Failure(failure) => {
                    tracing::error!(
                        stage = %failure.stage,
                        page = failure.page,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Crawl failed"
                    );
                }
            },
        }
    }
}

/// What to crawl: the run URL, the section label used for naming and
/// storage, and extra template parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    pub url: String,
    pub section: String,
    pub params: BTreeMap<String, String>,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            section: section.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
pub struct CrawlReport {
    pub summary: SaveSummary,
    /// Pages loaded and extracted.
    pub pages: u32,
    /// Page attempts across the run, retries included.
    pub attempts: u32,
    pub transitions: Vec<PipelineState>,
}

#[derive(Debug)]
pub struct CrawlFailure {
    /// State the pipeline was in when the terminal error occurred.
    pub stage: PipelineState,
    pub page: u32,
    pub attempts: u32,
    pub error: CrawlError,
    pub transitions: Vec<PipelineState>,
}

/// Terminal result of a run.
#[derive(Debug)]
pub enum CrawlOutcome {
    Success(CrawlReport),
    Failure(CrawlFailure),
}

impl CrawlOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CrawlOutcome::Success(_))
    }

    pub fn summary(&self) -> Option<&SaveSummary> {
        match self {
            CrawlOutcome::Success(report) => Some(&report.summary),
            CrawlOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&CrawlError> {
        match self {
            CrawlOutcome::Success(_) => None,
            CrawlOutcome::Failure(failure) => Some(&failure.error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            CrawlOutcome::Success(report) => report.attempts,
            CrawlOutcome::Failure(failure) => failure.attempts,
        }
    }

    pub fn transitions(&self) -> &[PipelineState] {
        match self {
            CrawlOutcome::Success(report) => &report.transitions,
            CrawlOutcome::Failure(failure) => &failure.transitions,
        }
    }
}

/// One crawl run over an exclusively owned browser session.
pub struct CrawlPipeline<D, FF>
where
    D: BrowserDriver,
    FF: ResourceFetcherFactory,
{
    policy: CrawlPolicy,
    navigator: Navigator<D>,
    factory: FF,
    reporter: Box<dyn PipelineReporter>,
}

impl<D, FF> CrawlPipeline<D, FF>
where
    D: BrowserDriver,
    FF: ResourceFetcherFactory,
{
    pub fn new(policy: CrawlPolicy, driver: D, factory: FF) -> Self {
        let navigator = Navigator::new(driver, &policy);
        Self {
            policy,
            navigator,
            factory,
            reporter: Box::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: impl PipelineReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Run to completion. Consumes the pipeline; the browser session is
    /// closed on every exit path.
    pub async fn run(self, request: CrawlRequest) -> CrawlOutcome {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), also stopping when `cancel` fires.
    pub async fn run_with_cancel(
        self,
        request: CrawlRequest,
        cancel: CancellationToken,
    ) -> CrawlOutcome {
        let CrawlPipeline {
            policy,
            mut navigator,
            factory,
            reporter,
        } = self;

        // Validated up front so the timer below only sees checked durations.
        let validated = policy.validate();
        let cancel = cancel.child_token();
        let timer = policy.run_timeout().filter(|_| validated.is_ok()).map(|timeout| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Run timeout reached, cancelling");
                token.cancel();
            })
        });

        tracing::info!(url = %request.url, section = %request.section, "Starting crawl");

        let mut run = Run {
            policy: &policy,
            navigator: &mut navigator,
            factory: &factory,
            reporter: reporter.as_ref(),
            cancel: &cancel,
            fetcher: None,
            extractor: None,
            state: PipelineState::Idle,
            transitions: vec![PipelineState::Idle],
            attempts: 0,
        };
        let result = run.execute(&request, validated).await;
        let stage = run.state;
        run.transition(PipelineState::Done);
        let transitions = std::mem::take(&mut run.transitions);
        let attempts = run.attempts;

        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(path) = &policy.session_file {
            match navigator.session().await {
                Ok(snapshot) => {
                    if let Err(e) = snapshot.save(path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to write session file");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to read session for persistence"),
            }
        }
        if let Err(e) = navigator.close().await {
            tracing::warn!(error = %e, "Failed to close browser session");
        }

        let outcome = match result {
            Ok((summary, pages)) => CrawlOutcome::Success(CrawlReport {
                summary,
                pages,
                attempts,
                transitions,
            }),
            Err(abort) => CrawlOutcome::Failure(CrawlFailure {
                stage,
                page: abort.page,
                attempts,
                error: abort.error,
                transitions,
            }),
        };
        reporter.report(PipelineEvent::Finished { outcome: &outcome });
        outcome
    }
}

/// Terminal error of a run, with the page it happened on.
struct Abort {
    page: u32,
    error: CrawlError,
}

/// Mutable state of one run.
struct Run<'a, D: BrowserDriver, FF: ResourceFetcherFactory> {
    policy: &'a CrawlPolicy,
    navigator: &'a mut Navigator<D>,
    factory: &'a FF,
    reporter: &'a dyn PipelineReporter,
    cancel: &'a CancellationToken,
    /// Built from the browser session after the first successful load.
    fetcher: Option<FF::Fetcher>,
    extractor: Option<PolicyExtractor<FF::Fetcher>>,
    state: PipelineState,
    transitions: Vec<PipelineState>,
    attempts: u32,
}

impl<D: BrowserDriver, FF: ResourceFetcherFactory> Run<'_, D, FF> {
    fn transition(&mut self, to: PipelineState) {
        let from = self.state;
        self.state = to;
        self.transitions.push(to);
        self.reporter.report(PipelineEvent::StateChanged { from, to });
    }

    async fn execute(
        &mut self,
        request: &CrawlRequest,
        validated: Result<(), CrawlError>,
    ) -> Result<(SaveSummary, u32), Abort> {
        let policy = self.policy;
        let navigation = &policy.navigation;
        let first_page = navigation.start_page;
        validated.map_err(|error| Abort {
            page: first_page,
            error,
        })?;

        let mut records: Vec<RawRecord> = Vec::new();
        let mut pages = 0;

        for offset in 0..navigation.max_pages {
            let Some(page) = navigation.page_at(offset) else {
                break;
            };
            let page_records = self.crawl_page(request, page).await?;
            pages += 1;

            let empty = page_records.is_empty();
            records.extend(page_records);
            if empty && navigation.stop_on_empty {
                tracing::debug!(page, "Page yielded no records, stopping pagination");
                break;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Abort {
                page: first_page.saturating_add(pages),
                error: CrawlError::Cancelled,
            });
        }

        self.transition(PipelineState::Normalizing);
        let normalizer = Normalizer::new(policy.normalization.clone(), request.section.as_str());
        let items = normalizer.normalize(&records);

        self.transition(PipelineState::Saving);
        let fetcher = match self.fetcher.clone() {
            Some(fetcher) => fetcher,
            None => self.fetcher_from_session().await.map_err(|error| Abort {
                page: first_page,
                error,
            })?,
        };
        let dispatcher =
            StorageDispatcher::new(policy.storage.clone(), fetcher, policy.fetch_concurrency);
        let summary = dispatcher.save_many_until(&items, self.cancel).await;

        for artifact in summary.flatten() {
            let event = if artifact.success() {
                PipelineEvent::ArtifactSaved { artifact }
            } else {
                PipelineEvent::ArtifactFailed { artifact }
            };
            self.reporter.report(event);
        }

        Ok((summary, pages))
    }

    /// Load, wait, scroll and extract one page, retrying recoverable
    /// failures with linear backoff.
    async fn crawl_page(&mut self, request: &CrawlRequest, page: u32) -> Result<Vec<RawRecord>, Abort> {
        let mut retries = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Abort {
                    page,
                    error: CrawlError::Cancelled,
                });
            }

            self.transition(PipelineState::Navigating);
            self.attempts += 1;

            let error = match self.attempt_page(request, page).await {
                Ok(records) => {
                    let url = self.navigator.current_url().unwrap_or_default();
                    self.reporter.report(PipelineEvent::PageExtracted {
                        page,
                        url,
                        records: records.len(),
                    });
                    return Ok(records);
                }
                Err(error) => error,
            };

            let retryable = !matches!(error, CrawlError::Cancelled) && error.is_retryable();
            let will_retry = retryable && retries < self.policy.retries;
            let backoff = if will_retry {
                self.policy.backoff_for_attempt(retries + 1)
            } else {
                Duration::ZERO
            };
            self.reporter.report(PipelineEvent::AttemptFailed {
                stage: self.state,
                page,
                attempt: retries + 1,
                error: &error,
                will_retry,
                backoff,
            });

            if will_retry {
                self.transition(PipelineState::Retrying);
                retries += 1;
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Err(Abort { page, error: CrawlError::Cancelled });
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
                continue;
            }

            // A selector that never matched means the page has no records.
            if let CrawlError::Extraction(ExtractionError::SelectorNotFound { selector }) = &error {
                tracing::warn!(page, %selector, "Selector never matched, treating page as empty");
                return Ok(Vec::new());
            }
            return Err(Abort { page, error });
        }
    }

    async fn attempt_page(
        &mut self,
        request: &CrawlRequest,
        page: u32,
    ) -> Result<Vec<RawRecord>, CrawlError> {
        let policy = self.policy;
        let cancel = self.cancel;

        if page == policy.navigation.start_page {
            cancellable(cancel, self.navigator.load(&request.url, &request.params)).await?;
        } else {
            cancellable(cancel, self.navigator.paginate(page)).await?;
        }
        if let Some(wait) = &policy.wait {
            cancellable(cancel, self.navigator.wait_for(wait)).await?;
        }
        cancellable(cancel, self.navigator.scroll()).await?;

        self.transition(PipelineState::Extracting);
        if self.extractor.is_none() {
            let fetcher = self.fetcher_from_session().await?;
            self.extractor = Some(ExtractorFactory::create(&policy.extractor, fetcher.clone())?);
            self.fetcher = Some(fetcher);
        }
        let extractor = self
            .extractor
            .as_ref()
            .ok_or_else(|| CrawlError::Generic("extractor unavailable".into()))?;
        cancellable(cancel, extractor.extract(&*self.navigator, page)).await
    }

    /// Build the run's fetcher from the browser's current identity.
    async fn fetcher_from_session(&self) -> Result<FF::Fetcher, CrawlError> {
        let session = self.navigator.session().await?;
        tracing::debug!(
            cookies = session.cookies.len(),
            user_agent = ?session.user_agent,
            "Building fetcher from browser session"
        );
        self.factory.from_session(&session)
    }
}

async fn cancellable<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, CrawlError>
where
    E: Into<CrawlError>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CrawlError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}
