//! Drives one browser session according to the navigation, scroll and wait
//! policies.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::CrawlError;
use crate::models::{ElementState, Hook};
use crate::policy::{CrawlPolicy, NavigationPolicy, ScrollPolicy, ScrollStrategy, WaitCondition, WaitPolicy};
use crate::session::SessionSnapshot;
use crate::template;
use crate::traits::BrowserDriver;

/// Interval between element-state polls in [`Navigator::wait`].
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const SCROLL_TO_BOTTOM_JS: &str =
    "window.scrollTo(0, document.body.scrollHeight); return document.body.scrollHeight;";

/// Owns a [`BrowserDriver`] for the duration of one run.
///
/// Not `Clone`: the browser session must never be driven from two flows.
pub struct Navigator<D: BrowserDriver> {
    driver: D,
    navigation: NavigationPolicy,
    scroll: ScrollPolicy,
    base_url: Option<String>,
    params: BTreeMap<String, String>,
    current_url: Option<String>,
}

impl<D: BrowserDriver> Navigator<D> {
    pub fn new(driver: D, policy: &CrawlPolicy) -> Self {
        Self {
            driver,
            navigation: policy.navigation.clone(),
            scroll: policy.scroll.clone(),
            base_url: None,
            params: BTreeMap::new(),
            current_url: None,
        }
    }

    /// Build the URL for `page` from the run URL, the pagination template,
    /// the caller's extra params and the policy's query params.
    pub fn build_url(
        &self,
        url: &str,
        page: u32,
        params: &BTreeMap<String, String>,
    ) -> Result<String, CrawlError> {
        let raw = match &self.navigation.pagination_template {
            Some(tpl) => template::render(tpl, |token| match token {
                "url" => Some(url.to_string()),
                "page" => Some(page.to_string()),
                other => params.get(other).cloned(),
            }),
            None => template::render(url, |token| match token {
                "page" => Some(page.to_string()),
                other => params.get(other).cloned(),
            }),
        };

        let mut parsed = Url::parse(&raw)
            .map_err(|e| CrawlError::Navigation(format!("Invalid URL '{raw}': {e}")))?;
        if !self.navigation.query_params.is_empty() {
            let mut pairs = parsed.query_pairs_mut();
            for (key, value) in &self.navigation.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(parsed.to_string())
    }

    /// Load the first page of a run. Remembers `url` and `params` for
    /// [`paginate`](Self::paginate).
    pub async fn load(
        &mut self,
        url: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, CrawlError> {
        self.base_url = Some(url.to_string());
        self.params = params.clone();
        self.paginate(self.navigation.start_page).await
    }

    /// Re-derive the URL for `page` and load it.
    pub async fn paginate(&mut self, page: u32) -> Result<String, CrawlError> {
        let base = self
            .base_url
            .clone()
            .ok_or_else(|| CrawlError::Navigation("paginate called before load".into()))?;
        let target = self.build_url(&base, page, &self.params)?;
        self.goto(&target).await?;
        Ok(target)
    }

    async fn goto(&mut self, target: &str) -> Result<(), CrawlError> {
        let timeout = self.navigation.page_load_timeout();
        tracing::debug!(url = %target, "Loading page");

        match tokio::time::timeout(timeout, self.driver.get(target)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.current_url = None;
                return Err(match e {
                    CrawlError::Navigation(_) => e,
                    other => CrawlError::Navigation(format!("Failed to load {target}: {other}")),
                });
            }
            Err(_) => {
                self.current_url = None;
                return Err(CrawlError::Navigation(format!(
                    "Page load of {target} timed out after {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        }

        self.current_url = match self.driver.current_url().await {
            Ok(Some(u)) => Some(u),
            _ => Some(target.to_string()),
        };
        Ok(())
    }

    /// Perform the policy's scroll actions. Returns how many were performed.
    pub async fn scroll(&self) -> Result<u32, CrawlError> {
        let mut performed = 0;
        let mut last_height: Option<u64> = None;

        for _ in 0..self.scroll.max_scrolls {
            let script = match self.scroll.strategy {
                ScrollStrategy::None => return Ok(0),
                ScrollStrategy::FixedStep => format!("window.scrollBy(0, {})", self.scroll.step_px),
                ScrollStrategy::ToBottom => SCROLL_TO_BOTTOM_JS.to_string(),
            };

            let result = self
                .driver
                .execute_script(&script)
                .await
                .map_err(|e| CrawlError::Navigation(format!("Scroll failed: {e}")))?;
            performed += 1;
            tokio::time::sleep(self.scroll.pause()).await;

            if self.scroll.strategy == ScrollStrategy::ToBottom {
                let height = result.as_u64();
                if height.is_some() && height == last_height {
                    tracing::debug!(scrolls = performed, "Page height stable, stopping scroll");
                    break;
                }
                last_height = height;
            }
        }

        Ok(performed)
    }

    /// Block until an element matching `selector` satisfies `condition`.
    pub async fn wait(
        &self,
        hook: Hook,
        selector: &str,
        timeout: Duration,
        condition: WaitCondition,
    ) -> Result<(), CrawlError> {
        // A timeout past the clock's range never expires on its own.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let state = self.driver.element_state(hook, selector).await?;
            let satisfied = match condition {
                WaitCondition::Present => state != ElementState::Absent,
                WaitCondition::Visible => state == ElementState::Visible,
            };
            if satisfied {
                return Ok(());
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(CrawlError::WaitTimeout {
                        selector: selector.to_string(),
                        condition,
                        timeout_secs: timeout.as_secs_f64(),
                    });
                }
                Some(deadline) => WAIT_POLL_INTERVAL.min(deadline - now),
                None => WAIT_POLL_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    pub async fn wait_for(&self, policy: &WaitPolicy) -> Result<(), CrawlError> {
        self.wait(
            policy.hook,
            &policy.selector,
            policy.timeout(),
            policy.condition,
        )
        .await
    }

    pub async fn execute_js(&self, script: &str) -> Result<serde_json::Value, CrawlError> {
        self.driver.execute_script(script).await
    }

    pub async fn query_all(
        &self,
        hook: Hook,
        selector: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<String>, CrawlError> {
        self.driver.query_all(hook, selector, attribute).await
    }

    /// URL of the last successfully loaded page.
    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub async fn session(&self) -> Result<SessionSnapshot, CrawlError> {
        self.driver.session().await
    }

    /// Release the underlying browser session.
    pub async fn close(&mut self) -> Result<(), CrawlError> {
        self.driver.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDriver;

    fn navigator_with(driver: MockDriver, f: impl FnOnce(&mut CrawlPolicy)) -> Navigator<MockDriver> {
        let mut policy = CrawlPolicy::default();
        f(&mut policy);
        Navigator::new(driver, &policy)
    }

    #[test]
    fn test_build_url_with_template_and_query() {
        let nav = navigator_with(MockDriver::new(), |p| {
            p.navigation.pagination_template = Some("{url}/{category}?page={page}".into());
            p.navigation.query_params =
                BTreeMap::from([("sort".into(), "new".into()), ("lang".into(), "en".into())]);
        });
        let params = BTreeMap::from([("category".into(), "shoes".into())]);

        let url = nav.build_url("https://shop.example/c", 3, &params).unwrap();
        assert_eq!(url, "https://shop.example/c/shoes?page=3&lang=en&sort=new");
    }

    #[test]
    fn test_build_url_without_template_substitutes_url_tokens() {
        let nav = navigator_with(MockDriver::new(), |_| {});
        let url = nav
            .build_url("https://shop.example/search?q={q}&p={page}", 2, &BTreeMap::from([("q".into(), "boots".into())]))
            .unwrap();
        assert_eq!(url, "https://shop.example/search?q=boots&p=2");
    }

    #[test]
    fn test_build_url_rejects_invalid() {
        let nav = navigator_with(MockDriver::new(), |_| {});
        let err = nav.build_url("not a url", 1, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CrawlError::Navigation(_)));
    }

    #[tokio::test]
    async fn test_load_then_paginate() {
        let driver = MockDriver::new();
        let mut nav = navigator_with(driver.clone(), |p| {
            p.navigation.pagination_template = Some("{url}?page={page}".into());
        });

        nav.load("https://shop.example/list", &BTreeMap::new()).await.unwrap();
        nav.paginate(2).await.unwrap();

        assert_eq!(
            driver.visited(),
            vec![
                "https://shop.example/list?page=1".to_string(),
                "https://shop.example/list?page=2".to_string()
            ]
        );
        assert_eq!(nav.current_url(), Some("https://shop.example/list?page=2"));
    }

    #[tokio::test]
    async fn test_paginate_before_load_fails() {
        let mut nav = navigator_with(MockDriver::new(), |_| {});
        assert!(matches!(nav.paginate(1).await, Err(CrawlError::Navigation(_))));
    }

    #[tokio::test]
    async fn test_load_failure_maps_to_navigation_error() {
        let driver = MockDriver::new().with_get_results(vec![Err(CrawlError::Network("reset".into()))]);
        let mut nav = navigator_with(driver, |_| {});

        let err = nav.load("https://shop.example", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Navigation(_)));
        assert!(nav.current_url().is_none());
    }

    #[tokio::test]
    async fn test_scroll_fixed_step() {
        let driver = MockDriver::new();
        let nav = navigator_with(driver.clone(), |p| {
            p.scroll.strategy = ScrollStrategy::FixedStep;
            p.scroll.max_scrolls = 3;
            p.scroll.step_px = 500;
            p.scroll.pause_sec = 0.0;
        });

        assert_eq!(nav.scroll().await.unwrap(), 3);
        assert_eq!(driver.scripts(), vec!["window.scrollBy(0, 500)".to_string(); 3]);
    }

    #[tokio::test]
    async fn test_scroll_to_bottom_stops_when_height_stable() {
        let driver = MockDriver::new().with_script_results(vec![
            Ok(serde_json::json!(1000)),
            Ok(serde_json::json!(2000)),
            Ok(serde_json::json!(2000)),
        ]);
        let nav = navigator_with(driver.clone(), |p| {
            p.scroll.strategy = ScrollStrategy::ToBottom;
            p.scroll.max_scrolls = 10;
            p.scroll.pause_sec = 0.0;
        });

        assert_eq!(nav.scroll().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_scroll_disabled() {
        let driver = MockDriver::new();
        let nav = navigator_with(driver.clone(), |_| {});
        assert_eq!(nav.scroll().await.unwrap(), 0);
        assert!(driver.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_wait_visible_succeeds_after_polls() {
        let driver = MockDriver::new().with_element_states(vec![
            ElementState::Absent,
            ElementState::Hidden,
            ElementState::Visible,
        ]);
        let nav = navigator_with(driver, |_| {});

        nav.wait(Hook::Css, "#grid", Duration::from_secs(5), WaitCondition::Visible)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_present_accepts_hidden() {
        let driver = MockDriver::new().with_element_states(vec![ElementState::Hidden]);
        let nav = navigator_with(driver, |_| {});

        nav.wait(Hook::Xpath, "//div", Duration::from_secs(1), WaitCondition::Present)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let driver = MockDriver::new();
        let nav = navigator_with(driver, |_| {});

        let err = nav
            .wait(Hook::Css, "#never", Duration::from_millis(300), WaitCondition::Present)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_with_unbounded_timeout() {
        let driver = MockDriver::new()
            .with_element_states(vec![ElementState::Absent, ElementState::Visible]);
        let nav = navigator_with(driver, |_| {});

        nav.wait(Hook::Css, "#grid", Duration::MAX, WaitCondition::Visible)
            .await
            .unwrap();
    }
}
