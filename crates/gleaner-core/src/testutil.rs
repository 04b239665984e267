//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls through a clone kept by the test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::CrawlError;
use crate::models::{ElementState, FetchedResource, Hook, ResourceRequest};
use crate::pipeline::{PipelineEvent, PipelineReporter, PipelineState};
use crate::session::SessionSnapshot;
use crate::traits::{BrowserDriver, ResourceFetcher, ResourceFetcherFactory};

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

/// Mock browser driver with scripted responses.
#[derive(Clone)]
pub struct MockDriver {
    /// Queue of navigation results. Each `get` pops the first element;
    /// when empty, navigation succeeds unless `always_fail` is set.
    get_results: Arc<Mutex<VecDeque<Result<(), CrawlError>>>>,
    always_fail: Arc<Mutex<bool>>,
    /// Queue of script results; `Null` once exhausted.
    script_results: Arc<Mutex<VecDeque<Result<serde_json::Value, CrawlError>>>>,
    /// Per-selector query results; the last entry repeats.
    queries: Arc<Mutex<HashMap<String, VecDeque<Vec<String>>>>>,
    element_states: Arc<Mutex<VecDeque<ElementState>>>,
    element_default: Arc<Mutex<ElementState>>,
    session: Arc<Mutex<SessionSnapshot>>,
    pub visited: Arc<Mutex<Vec<String>>>,
    pub scripts: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            get_results: Arc::new(Mutex::new(VecDeque::new())),
            always_fail: Arc::new(Mutex::new(false)),
            script_results: Arc::new(Mutex::new(VecDeque::new())),
            queries: Arc::new(Mutex::new(HashMap::new())),
            element_states: Arc::new(Mutex::new(VecDeque::new())),
            element_default: Arc::new(Mutex::new(ElementState::Absent)),
            session: Arc::new(Mutex::new(SessionSnapshot::default())),
            visited: Arc::new(Mutex::new(Vec::new())),
            scripts: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Driver whose every navigation fails.
    pub fn failing() -> Self {
        let driver = Self::new();
        *driver.always_fail.lock().unwrap() = true;
        driver
    }

    pub fn with_get_results(self, results: Vec<Result<(), CrawlError>>) -> Self {
        *self.get_results.lock().unwrap() = results.into();
        self
    }

    pub fn with_script_results(self, results: Vec<Result<serde_json::Value, CrawlError>>) -> Self {
        *self.script_results.lock().unwrap() = results.into();
        self
    }

    /// Successive results for `selector`; the last one repeats.
    pub fn with_query(self, selector: &str, results: Vec<Vec<&str>>) -> Self {
        let results = results
            .into_iter()
            .map(|r| r.into_iter().map(String::from).collect())
            .collect();
        self.queries
            .lock()
            .unwrap()
            .insert(selector.to_string(), results);
        self
    }

    pub fn with_element_states(self, states: Vec<ElementState>) -> Self {
        *self.element_states.lock().unwrap() = states.into();
        self
    }

    pub fn with_element_default(self, state: ElementState) -> Self {
        *self.element_default.lock().unwrap() = state;
        self
    }

    pub fn with_session(self, session: SessionSnapshot) -> Self {
        *self.session.lock().unwrap() = session;
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl BrowserDriver for MockDriver {
    async fn get(&self, url: &str) -> Result<(), CrawlError> {
        self.visited.lock().unwrap().push(url.to_string());
        if let Some(result) = self.get_results.lock().unwrap().pop_front() {
            return result;
        }
        if *self.always_fail.lock().unwrap() {
            return Err(CrawlError::Navigation("browser session unusable".into()));
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, CrawlError> {
        Ok(self.visited.lock().unwrap().last().cloned())
    }

    async fn execute_script(&self, script: &str) -> Result<serde_json::Value, CrawlError> {
        self.scripts.lock().unwrap().push(script.to_string());
        self.script_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(serde_json::Value::Null))
    }

    async fn query_all(
        &self,
        _hook: Hook,
        selector: &str,
        _attribute: Option<&str>,
    ) -> Result<Vec<String>, CrawlError> {
        let mut queries = self.queries.lock().unwrap();
        match queries.get_mut(selector) {
            Some(results) if results.len() > 1 => Ok(results.pop_front().unwrap_or_default()),
            Some(results) => Ok(results.front().cloned().unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn element_state(&self, _hook: Hook, _selector: &str) -> Result<ElementState, CrawlError> {
        let next = self.element_states.lock().unwrap().pop_front();
        Ok(next.unwrap_or(*self.element_default.lock().unwrap()))
    }

    async fn session(&self) -> Result<SessionSnapshot, CrawlError> {
        Ok(self.session.lock().unwrap().clone())
    }

    async fn close(&mut self) -> Result<(), CrawlError> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher keyed by URL. Unknown URLs return their own URL as bytes.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, FetchedResource>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    pub requests: Arc<Mutex<Vec<ResourceRequest>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            delays: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, url: &str, bytes: &[u8], content_type: Option<&str>) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            FetchedResource {
                final_url: url.to_string(),
                content_type: content_type.map(String::from),
                bytes: bytes.to_vec(),
            },
        );
        self
    }

    pub fn with_json(self, url: &str, body: serde_json::Value) -> Self {
        let bytes = body.to_string().into_bytes();
        self.with_response(url, &bytes, Some("application/json"))
    }

    /// Every request to `url` fails with a network error.
    pub fn with_failure(self, url: &str) -> Self {
        self.failing.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn with_delay(self, url: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
        self
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }
}

impl ResourceFetcher for MockFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource, CrawlError> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delays.lock().unwrap().get(&request.url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&request.url) {
            return Err(CrawlError::Network(format!(
                "Connection failed: {}",
                request.url
            )));
        }

        let response = self.responses.lock().unwrap().get(&request.url).cloned();
        Ok(response.unwrap_or_else(|| FetchedResource {
            final_url: request.url.clone(),
            content_type: None,
            bytes: request.url.as_bytes().to_vec(),
        }))
    }
}

// ---------------------------------------------------------------------------
// MockFetcherFactory
// ---------------------------------------------------------------------------

/// Mock factory that hands out clones of one [`MockFetcher`].
#[derive(Clone)]
pub struct MockFetcherFactory {
    fetcher: MockFetcher,
    create_error: Arc<Mutex<Option<CrawlError>>>,
    pub sessions: Arc<Mutex<Vec<SessionSnapshot>>>,
}

impl MockFetcherFactory {
    pub fn new(fetcher: MockFetcher) -> Self {
        Self {
            fetcher,
            create_error: Arc::new(Mutex::new(None)),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_create_error(error: CrawlError) -> Self {
        Self {
            fetcher: MockFetcher::new(),
            create_error: Arc::new(Mutex::new(Some(error))),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ResourceFetcherFactory for MockFetcherFactory {
    type Fetcher = MockFetcher;

    fn from_session(&self, session: &SessionSnapshot) -> Result<MockFetcher, CrawlError> {
        if let Some(e) = self.create_error.lock().unwrap().take() {
            return Err(e);
        }
        self.sessions.lock().unwrap().push(session.clone());
        Ok(self.fetcher.clone())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock pipeline reporter that records events. Clones share the records.
#[derive(Default, Clone)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
    pub states: Arc<Mutex<Vec<PipelineState>>>,
    pub backoffs: Arc<Mutex<Vec<Duration>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match &event {
            PipelineEvent::StateChanged { to, .. } => {
                self.states.lock().unwrap().push(*to);
                "StateChanged"
            }
            PipelineEvent::AttemptFailed { backoff, will_retry, .. } => {
                if *will_retry {
                    self.backoffs.lock().unwrap().push(*backoff);
                }
                "AttemptFailed"
            }
            PipelineEvent::PageExtracted { .. } => "PageExtracted",
            PipelineEvent::ArtifactSaved { .. } => "ArtifactSaved",
            PipelineEvent::ArtifactFailed { .. } => "ArtifactFailed",
            PipelineEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
