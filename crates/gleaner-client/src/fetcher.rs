use std::sync::Arc;
use std::time::Duration;

use gleaner_core::error::CrawlError;
use gleaner_core::models::{FetchedResource, HttpMethod, ResourceRequest};
use gleaner_core::session::{SessionCookie, SessionSnapshot};
use gleaner_core::traits::{ResourceFetcher, ResourceFetcherFactory};
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use url::Url;

/// User-Agent sent when the session does not carry one.
pub const DEFAULT_USER_AGENT: &str = concat!("gleaner/", env!("CARGO_PKG_VERSION"));

/// HTTP fetcher using reqwest.
///
/// Built from a [`SessionSnapshot`] so direct downloads present the same
/// User-Agent, Accept-Language and cookies as the browser that produced
/// the page.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, CrawlError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, CrawlError> {
        Self::from_session(&SessionSnapshot::default(), timeout)
    }

    pub fn from_session(session: &SessionSnapshot, timeout: Duration) -> Result<Self, CrawlError> {
        let (client, _) = session_client(session, timeout)?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl ResourceFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource, CrawlError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Http(format!(
                "HTTP {} for {}",
                status.as_u16(),
                request.url
            )));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CrawlError::Http(format!("Failed to read response body: {e}")))?;

        tracing::debug!(url = %final_url, bytes = bytes.len(), "Fetched resource");
        Ok(FetchedResource {
            final_url,
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Builds [`ReqwestFetcher`]s that mirror a browser session.
#[derive(Debug, Clone)]
pub struct ReqwestFetcherFactory {
    timeout: Duration,
}

impl ReqwestFetcherFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ReqwestFetcherFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ResourceFetcherFactory for ReqwestFetcherFactory {
    type Fetcher = ReqwestFetcher;

    fn from_session(&self, session: &SessionSnapshot) -> Result<ReqwestFetcher, CrawlError> {
        ReqwestFetcher::from_session(session, self.timeout)
    }
}

pub(crate) fn map_send_error(e: reqwest::Error, timeout_secs: u64) -> CrawlError {
    if e.is_timeout() {
        CrawlError::Timeout(timeout_secs)
    } else if e.is_connect() {
        CrawlError::Network(format!("Connection failed: {e}"))
    } else {
        CrawlError::Http(e.to_string())
    }
}

/// A reqwest client carrying the session's identity, plus the cookie jar
/// it reads from.
pub(crate) fn session_client(
    session: &SessionSnapshot,
    timeout: Duration,
) -> Result<(Client, Arc<Jar>), CrawlError> {
    let jar = Arc::new(session_jar(session));
    let client = Client::builder()
        .user_agent(session.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
        .default_headers(session_headers(session)?)
        .cookie_provider(Arc::clone(&jar))
        .timeout(timeout)
        .build()
        .map_err(|e| CrawlError::Http(e.to_string()))?;
    Ok((client, jar))
}

fn session_headers(session: &SessionSnapshot) -> Result<HeaderMap, CrawlError> {
    let mut headers = HeaderMap::new();
    if let Some(lang) = &session.accept_language {
        let value = HeaderValue::from_str(lang)
            .map_err(|e| CrawlError::Session(format!("Invalid Accept-Language '{lang}': {e}")))?;
        headers.insert(ACCEPT_LANGUAGE, value);
    }
    for (name, value) in &session.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CrawlError::Session(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| CrawlError::Session(format!("Invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Seed a cookie jar with the session's cookies. Cookies without a domain
/// cannot be scoped and are skipped.
pub(crate) fn session_jar(session: &SessionSnapshot) -> Jar {
    let jar = Jar::default();
    for cookie in &session.cookies {
        match cookie_origin(cookie) {
            Some(origin) => jar.add_cookie_str(&cookie.to_set_cookie(), &origin),
            None => tracing::debug!(name = %cookie.name, "Skipping cookie without a domain"),
        }
    }
    jar
}

fn cookie_origin(cookie: &SessionCookie) -> Option<Url> {
    let domain = cookie.domain.trim_start_matches('.');
    if domain.is_empty() {
        return None;
    }
    let scheme = if cookie.secure { "https" } else { "http" };
    Url::parse(&format!("{scheme}://{domain}/")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).to_lowercase()
        });
        (format!("http://{addr}"), handle)
    }

    fn session() -> SessionSnapshot {
        let mut session = SessionSnapshot {
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Test".into()),
            accept_language: Some("it-IT,it;q=0.9".into()),
            ..SessionSnapshot::default()
        };
        session.cookies.push(SessionCookie::new("sid", "abc123", "127.0.0.1"));
        session.headers.insert("X-Requested-With".into(), "gleaner".into());
        session
    }

    #[test]
    fn test_session_jar_scopes_cookies_by_domain() {
        let mut session = session();
        session.cookies.push(SessionCookie::new("orphan", "1", ""));
        let jar = session_jar(&session);

        let local = Url::parse("http://127.0.0.1/page").unwrap();
        let header = jar.cookies(&local).unwrap();
        assert_eq!(header.to_str().unwrap(), "sid=abc123");

        let other = Url::parse("http://example.com/").unwrap();
        assert!(jar.cookies(&other).is_none());
    }

    #[test]
    fn test_invalid_header_is_session_error() {
        let mut session = SessionSnapshot::default();
        session.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            ReqwestFetcher::from_session(&session, Duration::from_secs(5)),
            Err(CrawlError::Session(_))
        ));
    }

    #[tokio::test]
    async fn fetch_mirrors_session_identity() {
        let (base, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 3\r\nConnection: close\r\n\r\nPNG",
        )
        .await;
        let fetcher = ReqwestFetcherFactory::default().from_session(&session()).unwrap();

        let resource = fetcher
            .fetch(&ResourceRequest::get(format!("{base}/a.png")))
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(resource.bytes, b"PNG");
        assert_eq!(resource.content_type.as_deref(), Some("image/png"));
        assert!(request.contains("user-agent: mozilla/5.0 (x11; linux x86_64) test"));
        assert!(request.contains("accept-language: it-it,it;q=0.9"));
        assert!(request.contains("cookie: sid=abc123"));
        assert!(request.contains("x-requested-with: gleaner"));
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let (base, server) = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let fetcher = ReqwestFetcher::with_timeout(Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch(&ResourceRequest::get(format!("{base}/missing.jpg")))
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, CrawlError::Http(msg) if msg.contains("404")));
    }
}
