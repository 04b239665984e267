//! Immutable configuration for one crawl run.
//!
//! Every policy derives serde so callers can build one from whatever
//! configuration source they use; [`CrawlPolicy::from_value`] deserializes
//! and validates in one step. Loading and merging files is left to the
//! caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::models::{HttpMethod, Hook, ItemKind};
use crate::template;

/// Tokens a naming template may reference.
pub const NAME_TOKENS: &[&str] = &["section", "record_index", "item_index"];

/// Default naming template: `{section}_{record_index}_{item_index}`.
pub const DEFAULT_NAME_TEMPLATE: &str = "{section}_{record_index}_{item_index}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlPolicy {
    pub navigation: NavigationPolicy,
    pub scroll: ScrollPolicy,
    pub extractor: ExtractorPolicy,
    /// Explicit wait applied after every page load.
    pub wait: Option<WaitPolicy>,
    /// Rules in emission order.
    pub normalization: Vec<NormalizationRule>,
    pub storage: StoragePolicy,
    /// Retries per page after the initial attempt.
    pub retries: u32,
    /// Linear backoff unit: attempt `n` sleeps `n * retry_backoff_sec`.
    pub retry_backoff_sec: f64,
    /// Overall deadline for the run.
    pub run_timeout_sec: Option<f64>,
    /// Maximum concurrent remote fetches while saving.
    pub fetch_concurrency: usize,
    /// Session continuity file written at the end of the run.
    pub session_file: Option<PathBuf>,
}

impl Default for CrawlPolicy {
    fn default() -> Self {
        Self {
            navigation: NavigationPolicy::default(),
            scroll: ScrollPolicy::default(),
            extractor: ExtractorPolicy::default(),
            wait: None,
            normalization: Vec::new(),
            storage: StoragePolicy::default(),
            retries: 3,
            retry_backoff_sec: 2.0,
            run_timeout_sec: None,
            fetch_concurrency: 4,
            session_file: None,
        }
    }
}

impl CrawlPolicy {
    /// Deserialize a policy from JSON and validate it.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CrawlError> {
        let policy: CrawlPolicy = serde_json::from_value(value)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Backoff slept before retry number `attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        secs(self.retry_backoff_sec * f64::from(attempt))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_sec.map(secs)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        check_secs("retry_backoff_sec", self.retry_backoff_sec)?;
        // The last retry sleeps the longest.
        check_secs(
            "retry_backoff_sec * retries",
            self.retry_backoff_sec * f64::from(self.retries),
        )?;
        if let Some(t) = self.run_timeout_sec {
            check_secs("run_timeout_sec", t)?;
        }
        if self.fetch_concurrency == 0 {
            return Err(policy_err("fetch_concurrency must be at least 1"));
        }
        self.navigation.validate()?;
        self.scroll.validate()?;
        self.extractor.validate()?;
        if let Some(wait) = &self.wait {
            wait.validate()?;
        }
        for (i, rule) in self.normalization.iter().enumerate() {
            rule.validate()
                .map_err(|e| policy_err(&format!("normalization rule {i}: {e}")))?;
        }
        Ok(())
    }
}

fn policy_err(msg: &str) -> CrawlError {
    CrawlError::Policy(msg.to_string())
}

fn check_secs(field: &str, value: f64) -> Result<(), CrawlError> {
    Duration::try_from_secs_f64(value).map(|_| ()).map_err(|e| {
        policy_err(&format!(
            "{field} must be a non-negative number of seconds ({e})"
        ))
    })
}

/// Seconds to a [`Duration`], clamped into range. Values that fail
/// [`check_secs`] never reach here from a validated policy.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(if value > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

/// How the page URL is derived for each page of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationPolicy {
    /// Template for page URLs, e.g. `{url}?page={page}`. Without one, every
    /// page loads the run URL unchanged.
    pub pagination_template: Option<String>,
    /// Appended to the URL as query parameters, in key order.
    pub query_params: BTreeMap<String, String>,
    pub start_page: u32,
    pub max_pages: u32,
    /// Stop paginating after a page that yields no records.
    pub stop_on_empty: bool,
    pub page_load_timeout_sec: f64,
}

impl Default for NavigationPolicy {
    fn default() -> Self {
        Self {
            pagination_template: None,
            query_params: BTreeMap::new(),
            start_page: 1,
            max_pages: 1,
            stop_on_empty: true,
            page_load_timeout_sec: 30.0,
        }
    }
}

impl NavigationPolicy {
    pub fn page_load_timeout(&self) -> Duration {
        secs(self.page_load_timeout_sec)
    }

    /// Number of the `offset`-th page of a run, if it fits in a `u32`.
    pub fn page_at(&self, offset: u32) -> Option<u32> {
        self.start_page.checked_add(offset)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        if self.max_pages == 0 {
            return Err(policy_err("navigation.max_pages must be at least 1"));
        }
        if self.page_at(self.max_pages - 1).is_none() {
            return Err(policy_err("navigation.start_page + max_pages overflows"));
        }
        check_secs("navigation.page_load_timeout_sec", self.page_load_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Scroll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollStrategy {
    #[default]
    None,
    /// Scroll down by `step_px` per action.
    FixedStep,
    /// Jump to the bottom of the document per action.
    ToBottom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollPolicy {
    pub strategy: ScrollStrategy,
    pub pause_sec: f64,
    pub max_scrolls: u32,
    pub step_px: u32,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            strategy: ScrollStrategy::None,
            pause_sec: 1.0,
            max_scrolls: 5,
            step_px: 800,
        }
    }
}

impl ScrollPolicy {
    pub fn pause(&self) -> Duration {
        secs(self.pause_sec)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        check_secs("scroll.pause_sec", self.pause_sec)
    }
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    #[default]
    Present,
    Visible,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Present => write!(f, "present"),
            WaitCondition::Visible => write!(f, "visible"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitPolicy {
    #[serde(default)]
    pub hook: Hook,
    pub selector: String,
    #[serde(default)]
    pub condition: WaitCondition,
    #[serde(default = "default_wait_timeout")]
    pub timeout_sec: f64,
}

fn default_wait_timeout() -> f64 {
    10.0
}

impl WaitPolicy {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_sec)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        if self.selector.trim().is_empty() {
            return Err(policy_err("wait.selector must not be empty"));
        }
        check_secs("wait.timeout_sec", self.timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorType {
    #[default]
    Dom,
    Script,
    Api,
}

impl fmt::Display for ExtractorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractorType::Dom => write!(f, "dom"),
            ExtractorType::Script => write!(f, "script"),
            ExtractorType::Api => write!(f, "api"),
        }
    }
}

/// One named column of a DOM extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomField {
    pub name: String,
    #[serde(default)]
    pub hook: Hook,
    pub selector: String,
    /// Attribute to read; text content when absent.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Resolve relative URLs against the current page URL.
    #[serde(default)]
    pub absolute: bool,
}

/// Endpoint called directly by the API strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    /// URL template; `{page}` and caller params are substituted.
    pub url_template: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Dotted path to the record array inside the response.
    #[serde(default)]
    pub records_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorPolicy {
    #[serde(rename = "type")]
    pub kind: ExtractorType,
    pub fields: Vec<DomField>,
    pub script: Option<String>,
    pub endpoint: Option<ApiEndpoint>,
}

impl ExtractorPolicy {
    fn validate(&self) -> Result<(), CrawlError> {
        match self.kind {
            ExtractorType::Dom => {
                if self.fields.is_empty() {
                    return Err(policy_err("dom extractor needs at least one field"));
                }
                if let Some(f) = self
                    .fields
                    .iter()
                    .find(|f| f.name.is_empty() || f.selector.trim().is_empty())
                {
                    return Err(policy_err(&format!(
                        "dom field '{}' needs a name and a selector",
                        f.name
                    )));
                }
            }
            ExtractorType::Script => {
                if self.script.as_deref().is_none_or(|s| s.trim().is_empty()) {
                    return Err(policy_err("script extractor needs a script"));
                }
            }
            ExtractorType::Api => {
                if self
                    .endpoint
                    .as_ref()
                    .is_none_or(|e| e.url_template.trim().is_empty())
                {
                    return Err(policy_err("api extractor needs an endpoint url"));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Projects one raw record field into an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRule {
    /// Dotted path into the record; a leading `payload` names the item itself.
    pub source: String,
    pub kind: ItemKind,
    #[serde(default = "default_name_template")]
    pub name_template: String,
    #[serde(default)]
    pub allow_empty: bool,
    /// Extension without the dot.
    #[serde(default)]
    pub extension: Option<String>,
}

fn default_name_template() -> String {
    DEFAULT_NAME_TEMPLATE.to_string()
}

impl NormalizationRule {
    pub fn new(source: &str, kind: ItemKind, name_template: &str) -> Self {
        Self {
            source: source.to_string(),
            kind,
            name_template: name_template.to_string(),
            allow_empty: false,
            extension: None,
        }
    }

    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extension = Some(ext.trim_start_matches('.').to_string());
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source must not be empty".into());
        }
        if self.name_template.trim().is_empty() {
            return Err("name_template must not be empty".into());
        }
        if let Some(unknown) = template::tokens(&self.name_template)
            .into_iter()
            .find(|t| !NAME_TOKENS.contains(t))
        {
            return Err(format!("unknown token '{{{unknown}}}' in name_template"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// What to do when a target directory does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistencePolicy {
    #[default]
    CreateIfMissing,
    FailIfMissing,
}

/// How to avoid overwriting an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// `name_1.ext`, `name_2.ext`, ...
    #[default]
    Counter,
    /// `name_<timestamp>.ext`, falling back to a counter.
    Timestamp,
    /// Replace existing files.
    Overwrite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    pub targets: BTreeMap<ItemKind, PathBuf>,
    pub existence: ExistencePolicy,
    pub collision: CollisionPolicy,
    /// Store items under `<target>/<section>/`.
    pub section_subdirs: bool,
}

impl StoragePolicy {
    /// One subdirectory per kind under `root`: `images/`, `texts/`, `binaries/`.
    pub fn under_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let targets = BTreeMap::from([
            (ItemKind::Image, root.join("images")),
            (ItemKind::Text, root.join("texts")),
            (ItemKind::Binary, root.join("binaries")),
        ]);
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn target_for(&self, kind: ItemKind) -> Option<&Path> {
        self.targets.get(&kind).map(PathBuf::as_path)
    }
}
