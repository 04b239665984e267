//! Browser session state shared with the HTTP side of a run.
//!
//! A [`SessionSnapshot`] is read from the driver after the first page load
//! and handed to a [`ResourceFetcherFactory`](crate::traits::ResourceFetcherFactory)
//! so direct fetches carry the same identity (User-Agent, Accept-Language,
//! cookies) as the browser. It can also be persisted between runs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: default_cookie_path(),
            secure: false,
            http_only: false,
        }
    }

    /// `Set-Cookie` style line suitable for a cookie jar.
    pub fn to_set_cookie(&self) -> String {
        let mut line = format!("{}={}; Path={}", self.name, self.value, self.path);
        if !self.domain.is_empty() {
            line.push_str(&format!("; Domain={}", self.domain));
        }
        if self.secure {
            line.push_str("; Secure");
        }
        if self.http_only {
            line.push_str("; HttpOnly");
        }
        line
    }

    /// Whether this cookie applies to `host` (domain-suffix match).
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        domain.is_empty() || host == domain || host.ends_with(&format!(".{domain}"))
    }
}

/// Identity of a browser session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub cookies: Vec<SessionCookie>,
    /// Extra headers sent with every direct request.
    pub headers: BTreeMap<String, String>,
}

impl SessionSnapshot {
    /// Read a session continuity file.
    pub fn load(path: &Path) -> Result<Self, CrawlError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::Session(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CrawlError::Session(format!("Invalid session file {}: {e}", path.display()))
        })
    }

    /// Read a session file if it exists; an absent file is an empty session.
    pub fn load_or_default(path: &Path) -> Result<Self, CrawlError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the snapshot as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CrawlError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CrawlError::Session(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            CrawlError::Session(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Cookies applicable to `host`, rendered as a `Cookie` header value.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SessionSnapshot {
        SessionSnapshot {
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".into()),
            accept_language: Some("it-IT,it;q=0.9".into()),
            cookies: vec![
                SessionCookie::new("sid", "abc", ".shop.example"),
                SessionCookie::new("other", "1", "elsewhere.test"),
            ],
            headers: BTreeMap::from([("Referer".into(), "https://shop.example/".into())]),
        }
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/session.json");

        let session = sample();
        session.save(&path).unwrap();
        assert_eq!(SessionSnapshot::load(&path).unwrap(), session);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let loaded = SessionSnapshot::load_or_default(&tmp.path().join("none.json")).unwrap();
        assert_eq!(loaded, SessionSnapshot::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = SessionSnapshot::load(&path).unwrap_err();
        assert!(matches!(err, CrawlError::Session(_)));
    }

    #[test]
    fn test_cookie_header_matches_subdomains() {
        let session = sample();
        assert_eq!(
            session.cookie_header("cdn.shop.example").as_deref(),
            Some("sid=abc")
        );
        assert_eq!(session.cookie_header("shop.example").as_deref(), Some("sid=abc"));
        assert_eq!(session.cookie_header("unrelated.test"), None);
    }

    #[test]
    fn test_to_set_cookie() {
        let mut cookie = SessionCookie::new("sid", "abc", "shop.example");
        cookie.secure = true;
        assert_eq!(
            cookie.to_set_cookie(),
            "sid=abc; Path=/; Domain=shop.example; Secure"
        );
    }
}
