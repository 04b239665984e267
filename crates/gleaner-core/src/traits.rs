use std::future::Future;

use crate::error::CrawlError;
use crate::models::{ElementState, FetchedResource, Hook, ResourceRequest};
use crate::session::SessionSnapshot;

/// The narrow slice of a browser automation driver the pipeline needs.
///
/// A driver owns one browser session. It is not `Clone`: exactly one
/// [`Navigator`](crate::navigator::Navigator) drives it at a time.
pub trait BrowserDriver: Send + Sync {
    /// Navigate the session to `url` and wait for the load to settle.
    fn get(&self, url: &str) -> impl Future<Output = Result<(), CrawlError>> + Send;

    /// URL of the currently loaded document, if any.
    fn current_url(&self) -> impl Future<Output = Result<Option<String>, CrawlError>> + Send;

    /// Run a script in the page context and return its JSON-serializable result.
    ///
    /// `script` is a function body, as with WebDriver's `executeScript`:
    /// the value of its `return` statement is the result.
    fn execute_script(
        &self,
        script: &str,
    ) -> impl Future<Output = Result<serde_json::Value, CrawlError>> + Send;

    /// Text content (or the named attribute) of every element matching `selector`.
    fn query_all(
        &self,
        hook: Hook,
        selector: &str,
        attribute: Option<&str>,
    ) -> impl Future<Output = Result<Vec<String>, CrawlError>> + Send;

    /// Presence/visibility of the first element matching `selector`.
    fn element_state(
        &self,
        hook: Hook,
        selector: &str,
    ) -> impl Future<Output = Result<ElementState, CrawlError>> + Send;

    /// Current identity of the session (user agent, language, cookies).
    fn session(&self) -> impl Future<Output = Result<SessionSnapshot, CrawlError>> + Send;

    /// Release the session. Called once at the end of every run.
    fn close(&mut self) -> impl Future<Output = Result<(), CrawlError>> + Send;
}

/// Direct HTTP(S) byte fetches, independent of the browser session.
pub trait ResourceFetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &ResourceRequest,
    ) -> impl Future<Output = Result<FetchedResource, CrawlError>> + Send;
}

/// Builds a [`ResourceFetcher`] that mirrors a browser session.
///
/// The session is passed explicitly so the fetcher never reads ambient
/// driver state.
pub trait ResourceFetcherFactory: Send + Sync {
    type Fetcher: ResourceFetcher + 'static;

    fn from_session(&self, session: &SessionSnapshot) -> Result<Self::Fetcher, CrawlError>;
}
