//! Extraction strategies: turn the loaded page into raw records.
//!
//! Three strategies share the [`Extractor`] interface and are selected by
//! [`ExtractorType`] through [`ExtractorFactory`]:
//!
//! - [`DomExtractor`] queries elements through the navigator's driver.
//! - [`ScriptExtractor`] evaluates a snippet in the page context.
//! - [`ApiExtractor`] calls a declared endpoint with the run's
//!   [`ResourceFetcher`], bypassing the DOM.

use std::future::Future;

use serde_json::{Map, Value};
use url::Url;

use crate::error::{CrawlError, ExtractionError};
use crate::keypath;
use crate::models::{RawRecord, ResourceRequest};
use crate::navigator::Navigator;
use crate::policy::{ApiEndpoint, DomField, ExtractorPolicy, ExtractorType};
use crate::template;
use crate::traits::{BrowserDriver, ResourceFetcher};

/// Produces raw records from the current page state.
pub trait Extractor: Send + Sync {
    fn extract<D: BrowserDriver>(
        &self,
        navigator: &Navigator<D>,
        page: u32,
    ) -> impl Future<Output = Result<Vec<RawRecord>, ExtractionError>> + Send;
}

/// Normalize a strategy's JSON result into a record list.
///
/// An object becomes a one-element list, an array of objects is taken
/// as-is, and `null` means nothing was found.
fn into_records(value: Value) -> Result<Vec<RawRecord>, ExtractionError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(_) => Ok(vec![value]),
        Value::Array(items) => {
            if let Some(bad) = items.iter().find(|v| !v.is_object()) {
                return Err(ExtractionError::InvalidPayload(format!(
                    "expected an array of objects, found element {bad}"
                )));
            }
            Ok(items)
        }
        other => Err(ExtractionError::InvalidPayload(format!(
            "expected an object or array of objects, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// DOM
// ---------------------------------------------------------------------------

/// Queries each field's selector and zips the matches by position into one
/// list record per page: element `i` holds the `i`-th match of every field.
#[derive(Debug, Clone)]
pub struct DomExtractor {
    fields: Vec<DomField>,
}

impl DomExtractor {
    pub fn new(fields: Vec<DomField>) -> Self {
        Self { fields }
    }

    fn absolutize(base: Option<&Url>, value: String) -> String {
        match base.and_then(|b| b.join(&value).ok()) {
            Some(joined) => joined.to_string(),
            None => value,
        }
    }
}

impl Extractor for DomExtractor {
    async fn extract<D: BrowserDriver>(
        &self,
        navigator: &Navigator<D>,
        _page: u32,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let base = navigator.current_url().and_then(|u| Url::parse(u).ok());
        let mut columns: Vec<(&str, Vec<String>)> = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let values = navigator
                .query_all(field.hook, &field.selector, field.attribute.as_deref())
                .await
                .map_err(|e| {
                    ExtractionError::QueryFailed(format!("{} '{}': {e}", field.hook, field.selector))
                })?;
            let values = if field.absolute {
                values
                    .into_iter()
                    .map(|v| Self::absolutize(base.as_ref(), v))
                    .collect()
            } else {
                values
            };
            tracing::debug!(field = %field.name, matches = values.len(), "DOM field queried");
            columns.push((field.name.as_str(), values));
        }

        let rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        if rows == 0 {
            let selectors: Vec<&str> = self.fields.iter().map(|f| f.selector.as_str()).collect();
            return Err(ExtractionError::SelectorNotFound {
                selector: selectors.join(", "),
            });
        }

        let items = (0..rows)
            .map(|i| {
                let mut row = Map::new();
                for (name, values) in &columns {
                    if let Some(v) = values.get(i) {
                        row.insert((*name).to_string(), Value::String(v.clone()));
                    }
                }
                Value::Object(row)
            })
            .collect();

        Ok(vec![Value::Array(items)])
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// Evaluates a snippet that returns an object or an array of objects.
#[derive(Debug, Clone)]
pub struct ScriptExtractor {
    script: String,
}

impl ScriptExtractor {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Extractor for ScriptExtractor {
    async fn extract<D: BrowserDriver>(
        &self,
        navigator: &Navigator<D>,
        _page: u32,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let value = navigator
            .execute_js(&self.script)
            .await
            .map_err(|e| ExtractionError::ScriptFailed(e.to_string()))?;
        into_records(value)
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Calls a JSON endpoint directly and reads records from the response.
#[derive(Clone)]
pub struct ApiExtractor<R: ResourceFetcher> {
    endpoint: ApiEndpoint,
    fetcher: R,
}

impl<R: ResourceFetcher> ApiExtractor<R> {
    pub fn new(endpoint: ApiEndpoint, fetcher: R) -> Self {
        Self { endpoint, fetcher }
    }

    fn request_for<D: BrowserDriver>(&self, navigator: &Navigator<D>, page: u32) -> ResourceRequest {
        let params = navigator.params();
        let url = template::render(&self.endpoint.url_template, |token| match token {
            "page" => Some(page.to_string()),
            other => params.get(other).cloned(),
        });
        ResourceRequest {
            url,
            method: self.endpoint.method,
            body: self.endpoint.body.clone(),
        }
    }
}

impl<R: ResourceFetcher> Extractor for ApiExtractor<R> {
    async fn extract<D: BrowserDriver>(
        &self,
        navigator: &Navigator<D>,
        page: u32,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        let request = self.request_for(navigator, page);
        tracing::debug!(url = %request.url, "Calling extraction endpoint");

        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| ExtractionError::ApiFailed(e.to_string()))?;
        let body: Value = serde_json::from_slice(&response.bytes).map_err(|e| {
            ExtractionError::ApiFailed(format!("Invalid JSON from {}: {e}", request.url))
        })?;

        let records = match self.endpoint.records_path.as_deref() {
            Some(path) => keypath::resolve(&body, path).cloned().ok_or_else(|| {
                ExtractionError::ApiFailed(format!("records_path '{path}' not found in response"))
            })?,
            None => body,
        };
        into_records(records)
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The strategy configured by an [`ExtractorPolicy`].
#[derive(Clone)]
pub enum PolicyExtractor<R: ResourceFetcher> {
    Dom(DomExtractor),
    Script(ScriptExtractor),
    Api(ApiExtractor<R>),
}

impl<R: ResourceFetcher> PolicyExtractor<R> {
    pub fn kind(&self) -> ExtractorType {
        match self {
            PolicyExtractor::Dom(_) => ExtractorType::Dom,
            PolicyExtractor::Script(_) => ExtractorType::Script,
            PolicyExtractor::Api(_) => ExtractorType::Api,
        }
    }
}

impl<R: ResourceFetcher> Extractor for PolicyExtractor<R> {
    async fn extract<D: BrowserDriver>(
        &self,
        navigator: &Navigator<D>,
        page: u32,
    ) -> Result<Vec<RawRecord>, ExtractionError> {
        match self {
            PolicyExtractor::Dom(e) => e.extract(navigator, page).await,
            PolicyExtractor::Script(e) => e.extract(navigator, page).await,
            PolicyExtractor::Api(e) => e.extract(navigator, page).await,
        }
    }
}

/// Resolves an [`ExtractorPolicy`] to a concrete strategy, injecting the
/// fetcher when the strategy needs one.
pub struct ExtractorFactory;

impl ExtractorFactory {
    pub fn create<R: ResourceFetcher>(
        policy: &ExtractorPolicy,
        fetcher: R,
    ) -> Result<PolicyExtractor<R>, CrawlError> {
        match policy.kind {
            ExtractorType::Dom => {
                if policy.fields.is_empty() {
                    return Err(CrawlError::Policy("dom extractor needs at least one field".into()));
                }
                Ok(PolicyExtractor::Dom(DomExtractor::new(policy.fields.clone())))
            }
            ExtractorType::Script => policy
                .script
                .as_ref()
                .map(|s| PolicyExtractor::Script(ScriptExtractor::new(s.clone())))
                .ok_or_else(|| CrawlError::Policy("script extractor needs a script".into())),
            ExtractorType::Api => policy
                .endpoint
                .as_ref()
                .map(|e| PolicyExtractor::Api(ApiExtractor::new(e.clone(), fetcher)))
                .ok_or_else(|| CrawlError::Policy("api extractor needs an endpoint".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::models::{Hook, HttpMethod};
    use crate::policy::CrawlPolicy;
    use crate::testutil::{MockDriver, MockFetcher};
    use serde_json::json;

    async fn loaded(driver: MockDriver, url: &str) -> Navigator<MockDriver> {
        let mut nav = Navigator::new(driver, &CrawlPolicy::default());
        nav.load(url, &BTreeMap::from([("q".into(), "boots".into())]))
            .await
            .unwrap();
        nav
    }

    fn field(name: &str, selector: &str, attribute: Option<&str>, absolute: bool) -> DomField {
        DomField {
            name: name.into(),
            hook: Hook::Css,
            selector: selector.into(),
            attribute: attribute.map(String::from),
            absolute,
        }
    }

    #[tokio::test]
    async fn dom_zips_fields_and_resolves_urls() {
        let driver = MockDriver::new()
            .with_query("img.product", vec![vec!["/media/a.jpg", "https://cdn.example/b.png"]])
            .with_query(".caption", vec![vec!["first"]]);
        let nav = loaded(driver, "https://shop.example/list/").await;

        let extractor = DomExtractor::new(vec![
            field("url", "img.product", Some("src"), true),
            field("caption", ".caption", None, false),
        ]);
        let records = extractor.extract(&nav, 1).await.unwrap();

        assert_eq!(
            records,
            vec![json!([
                {"url": "https://shop.example/media/a.jpg", "caption": "first"},
                {"url": "https://cdn.example/b.png"}
            ])]
        );
    }

    #[tokio::test]
    async fn dom_without_matches_is_selector_not_found() {
        let nav = loaded(MockDriver::new(), "https://shop.example/").await;
        let extractor = DomExtractor::new(vec![field("url", "img.missing", Some("src"), false)]);

        let err = extractor.extract(&nav, 1).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            err,
            ExtractionError::SelectorNotFound {
                selector: "img.missing".into()
            }
        );
    }

    #[tokio::test]
    async fn script_wraps_single_object() {
        let driver = MockDriver::new().with_script_results(vec![Ok(json!({"url": "http://x/a.jpg"}))]);
        let nav = loaded(driver, "https://shop.example/").await;

        let records = ScriptExtractor::new("window.__DATA__").extract(&nav, 1).await.unwrap();
        assert_eq!(records, vec![json!({"url": "http://x/a.jpg"})]);
    }

    #[tokio::test]
    async fn script_array_becomes_records() {
        let driver = MockDriver::new().with_script_results(vec![Ok(json!([{"a": 1}, {"a": 2}]))]);
        let nav = loaded(driver, "https://shop.example/").await;

        let records = ScriptExtractor::new("items()").extract(&nav, 1).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn script_failure_is_fatal() {
        let driver = MockDriver::new()
            .with_script_results(vec![Err(CrawlError::Generic("ReferenceError: items".into()))]);
        let nav = loaded(driver, "https://shop.example/").await;

        let err = ScriptExtractor::new("items()").extract(&nav, 1).await.unwrap_err();
        assert!(matches!(err, ExtractionError::ScriptFailed(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn script_scalar_is_invalid_payload() {
        let driver = MockDriver::new().with_script_results(vec![Ok(json!("nope"))]);
        let nav = loaded(driver, "https://shop.example/").await;

        let err = ScriptExtractor::new("x").extract(&nav, 1).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn api_reads_records_path() {
        let fetcher = MockFetcher::new().with_json(
            "https://api.shop.example/items?q=boots&page=2",
            json!({"data": {"items": [{"url": "u1"}, {"url": "u2"}]}}),
        );
        let nav = loaded(MockDriver::new(), "https://shop.example/").await;
        let extractor = ApiExtractor::new(
            ApiEndpoint {
                url_template: "https://api.shop.example/items?q={q}&page={page}".into(),
                method: HttpMethod::Get,
                body: None,
                records_path: Some("data.items".into()),
            },
            fetcher.clone(),
        );

        let records = extractor.extract(&nav, 2).await.unwrap();
        assert_eq!(records, vec![json!({"url": "u1"}), json!({"url": "u2"})]);
        assert_eq!(
            fetcher.requested_urls(),
            vec!["https://api.shop.example/items?q=boots&page=2".to_string()]
        );
    }

    #[tokio::test]
    async fn api_fetch_failure_is_fatal() {
        let fetcher = MockFetcher::new().with_failure("https://api.shop.example/items");
        let nav = loaded(MockDriver::new(), "https://shop.example/").await;
        let extractor = ApiExtractor::new(
            ApiEndpoint {
                url_template: "https://api.shop.example/items".into(),
                method: HttpMethod::Get,
                body: None,
                records_path: None,
            },
            fetcher,
        );

        let err = extractor.extract(&nav, 1).await.unwrap_err();
        assert!(matches!(err, ExtractionError::ApiFailed(_)));
    }

    #[test]
    fn factory_selects_strategy() {
        let policy = ExtractorPolicy {
            kind: ExtractorType::Script,
            script: Some("window.__DATA__".into()),
            ..ExtractorPolicy::default()
        };
        let extractor = ExtractorFactory::create(&policy, MockFetcher::new()).unwrap();
        assert_eq!(extractor.kind(), ExtractorType::Script);

        let missing = ExtractorPolicy {
            kind: ExtractorType::Api,
            ..ExtractorPolicy::default()
        };
        assert!(ExtractorFactory::create(&missing, MockFetcher::new()).is_err());
    }
}
