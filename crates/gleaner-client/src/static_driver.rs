use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gleaner_core::error::CrawlError;
use gleaner_core::models::{ElementState, Hook};
use gleaner_core::session::{SessionCookie, SessionSnapshot};
use gleaner_core::traits::BrowserDriver;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::fetcher::{map_send_error, session_client};

/// A [`BrowserDriver`] for server-rendered pages.
///
/// Loads documents with plain HTTP and queries them with CSS selectors.
/// There is no script engine: XPath lookups and script execution fail, so
/// use it with the DOM extractor and the `none` scroll strategy.
pub struct StaticHtmlDriver {
    client: Client,
    jar: Arc<Jar>,
    session: SessionSnapshot,
    timeout_secs: u64,
    page: Mutex<Option<LoadedPage>>,
}

#[derive(Clone)]
struct LoadedPage {
    url: String,
    html: String,
}

impl StaticHtmlDriver {
    pub fn new(session: SessionSnapshot, timeout: Duration) -> Result<Self, CrawlError> {
        let (client, jar) = session_client(&session, timeout)?;
        Ok(Self {
            client,
            jar,
            session,
            timeout_secs: timeout.as_secs(),
            page: Mutex::new(None),
        })
    }

    fn loaded(&self) -> Result<LoadedPage, CrawlError> {
        self.page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CrawlError::Navigation("No page loaded".into()))
    }

    fn css(selector: &str) -> Result<Selector, CrawlError> {
        Selector::parse(selector)
            .map_err(|e| CrawlError::Navigation(format!("Invalid CSS selector '{selector}': {e}")))
    }

    fn css_only(hook: Hook) -> Result<(), CrawlError> {
        match hook {
            Hook::Css => Ok(()),
            Hook::Xpath => Err(CrawlError::Navigation(
                "XPath lookups need a script-capable driver".into(),
            )),
        }
    }
}

impl BrowserDriver for StaticHtmlDriver {
    async fn get(&self, url: &str) -> Result<(), CrawlError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Navigation(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| CrawlError::Navigation(format!("Failed to read page body: {e}")))?;

        tracing::debug!(url = %final_url, bytes = html.len(), "Loaded static page");
        *self.page.lock().unwrap_or_else(PoisonError::into_inner) = Some(LoadedPage {
            url: final_url,
            html,
        });
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, CrawlError> {
        Ok(self
            .page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.url.clone()))
    }

    async fn execute_script(&self, _script: &str) -> Result<serde_json::Value, CrawlError> {
        Err(CrawlError::Navigation(
            "StaticHtmlDriver cannot execute scripts".into(),
        ))
    }

    async fn query_all(
        &self,
        hook: Hook,
        selector: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<String>, CrawlError> {
        Self::css_only(hook)?;
        let selector = Self::css(selector)?;
        let page = self.loaded()?;
        let document = Html::parse_document(&page.html);

        let values = document
            .select(&selector)
            .filter_map(|el| match attribute {
                Some(name) => el.value().attr(name).map(str::to_string),
                None => Some(element_text(&el)),
            })
            .collect();
        Ok(values)
    }

    async fn element_state(&self, hook: Hook, selector: &str) -> Result<ElementState, CrawlError> {
        Self::css_only(hook)?;
        let selector = Self::css(selector)?;
        let page = self.loaded()?;
        let document = Html::parse_document(&page.html);

        let state = match document.select(&selector).next() {
            None => ElementState::Absent,
            Some(el) if is_hidden(&el) => ElementState::Hidden,
            Some(_) => ElementState::Visible,
        };
        Ok(state)
    }

    async fn session(&self) -> Result<SessionSnapshot, CrawlError> {
        let mut snapshot = self.session.clone();
        let Some(page) = self.loaded().ok() else {
            return Ok(snapshot);
        };
        let Ok(url) = Url::parse(&page.url) else {
            return Ok(snapshot);
        };
        let host = url.host_str().unwrap_or_default().to_string();

        let jar_cookies = self
            .jar
            .cookies(&url)
            .and_then(|h| h.to_str().ok().map(String::from))
            .unwrap_or_default();
        for pair in jar_cookies.split("; ").filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let known = snapshot
                .cookies
                .iter_mut()
                .find(|c| c.name == name && c.matches_host(&host));
            match known {
                Some(cookie) => cookie.value = value.to_string(),
                None => snapshot.cookies.push(SessionCookie::new(name, value, &host)),
            }
        }
        Ok(snapshot)
    }

    async fn close(&mut self) -> Result<(), CrawlError> {
        *self.page.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hidden by markup alone; there is no layout to consult.
fn is_hidden(el: &ElementRef<'_>) -> bool {
    let attrs = el.value();
    if attrs.attr("hidden").is_some() || attrs.attr("type") == Some("hidden") {
        return true;
    }
    attrs.attr("style").is_some_and(|style| {
        let style: String = style.chars().filter(|c| !c.is_whitespace()).collect();
        let style = style.to_ascii_lowercase();
        style.contains("display:none") || style.contains("visibility:hidden")
    })
}
