use std::path::PathBuf;

use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use gleaner_core::error::CrawlError;
use gleaner_core::models::{ElementState, Hook};
use gleaner_core::session::{SessionCookie, SessionSnapshot};
use gleaner_core::traits::BrowserDriver;
use tokio::task::JoinHandle;

/// Launch options for [`ChromiumDriver`].
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    pub headless: bool,
    /// Explicit browser binary; otherwise `CHROME_BIN` and well-known paths.
    pub executable: Option<PathBuf>,
    pub window_size: (u32, u32),
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            window_size: (1366, 900),
        }
    }
}

/// Headless Chromium over the Chrome DevTools Protocol.
///
/// Owns one browser process and exactly one tab. The session snapshot
/// passed to [`launch`](Self::launch) is applied before the first
/// navigation: User-Agent and Accept-Language overrides plus cookies.
///
/// # Example
///
/// ```rust,no_run
/// use gleaner_client::ChromiumDriver;
/// use gleaner_core::session::SessionSnapshot;
/// use gleaner_core::traits::BrowserDriver;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut driver = ChromiumDriver::launch(SessionSnapshot::default()).await?;
/// driver.get("https://example.com").await?;
/// let title = driver.execute_script("return document.title").await?;
/// driver.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ChromiumDriver {
    browser: Browser,
    page: Option<Page>,
    handler: JoinHandle<()>,
    session: SessionSnapshot,
}

impl ChromiumDriver {
    pub async fn launch(session: SessionSnapshot) -> Result<Self, CrawlError> {
        Self::launch_with(session, ChromiumOptions::default()).await
    }

    pub async fn launch_with(
        session: SessionSnapshot,
        options: ChromiumOptions,
    ) -> Result<Self, CrawlError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .window_size(options.window_size.0, options.window_size.1);

        if let Some(bin) = options.executable.or_else(Self::find_chrome_binary) {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        if options.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        let config = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .build()
            .map_err(|e| CrawlError::Navigation(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Navigation(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::Navigation(format!("Failed to open tab: {e}")))?;

        let driver = Self {
            browser,
            page: Some(page),
            handler,
            session,
        };
        driver.apply_session().await?;
        Ok(driver)
    }

    /// Locate a Chrome/Chromium binary. `CHROME_BIN` wins; snap wrappers
    /// strip headless flags, so the real binary inside the snap is preferred.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    fn page(&self) -> Result<&Page, CrawlError> {
        self.page
            .as_ref()
            .ok_or_else(|| CrawlError::Navigation("Browser tab is closed".into()))
    }

    async fn apply_session(&self) -> Result<(), CrawlError> {
        let page = self.page()?;

        // CDP only overrides Accept-Language together with a User-Agent, so a
        // language-only snapshot re-sends the browser's own agent string.
        let browser_agent = match (&self.session.user_agent, &self.session.accept_language) {
            (None, Some(_)) => self.evaluate("navigator.userAgent".to_string()).await?,
            _ => serde_json::Value::Null,
        };
        if let Some(params) = identity_override(&self.session, browser_agent.as_str()) {
            page.execute(params)
                .await
                .map_err(|e| CrawlError::Session(format!("Failed to override user agent: {e}")))?;
        }

        let cookies = self
            .session
            .cookies
            .iter()
            .filter(|c| !c.domain.is_empty())
            .map(to_cookie_param)
            .collect::<Result<Vec<_>, _>>()?;
        if !cookies.is_empty() {
            tracing::debug!(count = cookies.len(), "Restoring session cookies");
            page.set_cookies(cookies)
                .await
                .map_err(|e| CrawlError::Session(format!("Failed to set cookies: {e}")))?;
        }
        Ok(())
    }

    async fn evaluate(&self, expression: String) -> Result<serde_json::Value, CrawlError> {
        let result = self
            .page()?
            .evaluate(expression)
            .await
            .map_err(|e| CrawlError::Generic(format!("Script evaluation failed: {e}")))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// The User-Agent override carrying the snapshot's identity, if it names one.
fn identity_override(
    session: &SessionSnapshot,
    browser_agent: Option<&str>,
) -> Option<SetUserAgentOverrideParams> {
    let user_agent = session.user_agent.as_deref().or(browser_agent)?;
    let mut params = SetUserAgentOverrideParams::new(user_agent.to_string());
    params.accept_language = session.accept_language.clone();
    Some(params)
}

/// Accept-Language header for `navigator.languages`, weighted the way
/// Chromium sends it: `en-US,en;q=0.9`.
fn accept_language_header(languages: &[String]) -> Option<String> {
    let parts: Vec<String> = languages
        .iter()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, lang)| match i {
            0 => lang.clone(),
            _ => {
                let q = 10usize.saturating_sub(i).max(1);
                format!("{lang};q=0.{q}")
            }
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join(","))
}

fn to_cookie_param(cookie: &SessionCookie) -> Result<CookieParam, CrawlError> {
    CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only)
        .build()
        .map_err(|e| CrawlError::Session(format!("Invalid cookie '{}': {e}", cookie.name)))
}

/// JS expression resolving `selector` to an array of matching elements.
fn lookup_js(hook: Hook, selector: &str) -> String {
    let selector = serde_json::Value::from(selector).to_string();
    match hook {
        Hook::Css => format!("Array.from(document.querySelectorAll({selector}))"),
        Hook::Xpath => format!(
            "(() => {{ const r = document.evaluate({selector}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
             const out = []; for (let i = 0; i < r.snapshotLength; i++) out.push(r.snapshotItem(i)); return out; }})()"
        ),
    }
}

fn query_js(hook: Hook, selector: &str, attribute: Option<&str>) -> String {
    let elements = lookup_js(hook, selector);
    match attribute {
        Some(name) => {
            let name = serde_json::Value::from(name).to_string();
            format!(
                "{elements}.filter(el => el.getAttribute && el.getAttribute({name}) !== null).map(el => el.getAttribute({name}))"
            )
        }
        None => format!(
            "{elements}.map(el => (el.innerText ?? el.textContent ?? '').replace(/\\s+/g, ' ').trim())"
        ),
    }
}

fn state_js(hook: Hook, selector: &str) -> String {
    let elements = lookup_js(hook, selector);
    format!(
        "(() => {{ const el = {elements}[0]; if (!el) return 'absent'; \
         const style = window.getComputedStyle(el); \
         const shown = style.display !== 'none' && style.visibility !== 'hidden' && el.getClientRects().length > 0; \
         return shown ? 'visible' : 'hidden'; }})()"
    )
}

impl BrowserDriver for ChromiumDriver {
    async fn get(&self, url: &str) -> Result<(), CrawlError> {
        self.page()?
            .goto(url)
            .await
            .map_err(|e| CrawlError::Navigation(format!("Failed to navigate to {url}: {e}")))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, CrawlError> {
        self.page()?
            .url()
            .await
            .map_err(|e| CrawlError::Navigation(format!("Failed to read page URL: {e}")))
    }

    /// `script` is a function body, as with WebDriver: `return` yields the result.
    async fn execute_script(&self, script: &str) -> Result<serde_json::Value, CrawlError> {
        self.evaluate(format!("(() => {{ {script} }})()")).await
    }

    async fn query_all(
        &self,
        hook: Hook,
        selector: &str,
        attribute: Option<&str>,
    ) -> Result<Vec<String>, CrawlError> {
        let value = self.evaluate(query_js(hook, selector, attribute)).await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn element_state(&self, hook: Hook, selector: &str) -> Result<ElementState, CrawlError> {
        let value = self.evaluate(state_js(hook, selector)).await?;
        Ok(match value.as_str() {
            Some("visible") => ElementState::Visible,
            Some("hidden") => ElementState::Hidden,
            _ => ElementState::Absent,
        })
    }

    async fn session(&self) -> Result<SessionSnapshot, CrawlError> {
        let page = self.page()?;
        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| CrawlError::Session(format!("Failed to read cookies: {e}")))?;

        let user_agent = match &self.session.user_agent {
            Some(ua) => Some(ua.clone()),
            None => self
                .evaluate("navigator.userAgent".to_string())
                .await?
                .as_str()
                .map(String::from),
        };

        let accept_language = match &self.session.accept_language {
            Some(lang) => Some(lang.clone()),
            None => {
                let languages: Vec<String> =
                    serde_json::from_value(self.evaluate("navigator.languages".to_string()).await?)
                        .unwrap_or_default();
                accept_language_header(&languages)
            }
        };

        Ok(SessionSnapshot {
            user_agent,
            accept_language,
            cookies: cookies
                .into_iter()
                .map(|c| SessionCookie {
                    name: c.name,
                    value: c.value,
                    domain: c.domain,
                    path: c.path,
                    secure: c.secure,
                    http_only: c.http_only,
                })
                .collect(),
            headers: self.session.headers.clone(),
        })
    }

    async fn close(&mut self) -> Result<(), CrawlError> {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                tracing::debug!(error = %e, "Failed to close tab");
            }
        }
        let result = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| CrawlError::Navigation(format!("Failed to close browser: {e}")));
        let _ = self.browser.wait().await;
        self.handler.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_js_escapes_selector() {
        let js = lookup_js(Hook::Css, r#"a[href="x"]"#);
        assert_eq!(js, r#"Array.from(document.querySelectorAll("a[href=\"x\"]"))"#);
    }

    #[test]
    fn test_query_js_reads_attribute() {
        let js = query_js(Hook::Xpath, "//img", Some("src"));
        assert!(js.contains("XPathResult.ORDERED_NODE_SNAPSHOT_TYPE"));
        assert!(js.contains(r#"getAttribute("src")"#));
    }

    #[test]
    fn test_language_only_session_still_overrides() {
        let session = SessionSnapshot {
            accept_language: Some("fr-FR,fr;q=0.9".into()),
            ..SessionSnapshot::default()
        };
        let params = identity_override(&session, Some("Mozilla/5.0 HeadlessChrome")).unwrap();
        assert_eq!(params.user_agent, "Mozilla/5.0 HeadlessChrome");
        assert_eq!(params.accept_language.as_deref(), Some("fr-FR,fr;q=0.9"));

        let explicit = SessionSnapshot {
            user_agent: Some("GleanerTest/1.0".into()),
            ..session
        };
        let params = identity_override(&explicit, Some("ignored")).unwrap();
        assert_eq!(params.user_agent, "GleanerTest/1.0");

        assert!(identity_override(&SessionSnapshot::default(), None).is_none());
    }

    #[test]
    fn test_accept_language_from_navigator_languages() {
        let langs = vec!["en-US".to_string(), "en".to_string(), "it".to_string()];
        assert_eq!(
            accept_language_header(&langs).as_deref(),
            Some("en-US,en;q=0.9,it;q=0.8")
        );
        assert_eq!(accept_language_header(&[]), None);
    }

    #[tokio::test]
    #[ignore = "needs a Chromium binary"]
    async fn renders_and_queries_example_com() {
        let mut driver = ChromiumDriver::launch(SessionSnapshot::default()).await.unwrap();
        driver.get("https://example.com").await.unwrap();

        let headings = driver.query_all(Hook::Css, "h1", None).await.unwrap();
        assert_eq!(headings, vec!["Example Domain"]);
        assert_eq!(
            driver.element_state(Hook::Xpath, "//h1").await.unwrap(),
            ElementState::Visible
        );
        assert_eq!(
            driver.execute_script("return 1 + 1").await.unwrap(),
            serde_json::json!(2)
        );
        driver.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Chromium binary"]
    async fn applies_session_identity() {
        let mut session = SessionSnapshot {
            user_agent: Some("GleanerTest/1.0".into()),
            accept_language: Some("de-DE".into()),
            ..SessionSnapshot::default()
        };
        session.cookies.push(SessionCookie::new("sid", "abc", "example.com"));

        let mut driver = ChromiumDriver::launch(session).await.unwrap();
        driver.get("https://example.com").await.unwrap();

        let ua = driver.execute_script("return navigator.userAgent").await.unwrap();
        assert_eq!(ua, serde_json::json!("GleanerTest/1.0"));
        let snapshot = driver.session().await.unwrap();
        assert!(snapshot.cookies.iter().any(|c| c.name == "sid" && c.value == "abc"));
        driver.close().await.unwrap();
    }
}
