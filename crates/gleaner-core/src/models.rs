use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PersistenceError;

/// An unprocessed record produced by an extractor: a JSON object, or a
/// list of objects whose elements become individually indexed items.
pub type RawRecord = serde_json::Value;

/// Category of extracted content; decides how an item is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Image,
    Text,
    Binary,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Image => "image",
            ItemKind::Text => "text",
            ItemKind::Binary => "binary",
        }
    }

    /// Extension used when neither the rule nor the source names one.
    pub fn fallback_extension(&self) -> &'static str {
        match self {
            ItemKind::Image => "jpg",
            ItemKind::Text => "txt",
            ItemKind::Binary => "bin",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(ItemKind::Image),
            "text" => Ok(ItemKind::Text),
            "binary" => Ok(ItemKind::Binary),
            _ => Err(format!("Unknown item kind: {}", s)),
        }
    }
}

/// Content carried by a [`NormalizedItem`].
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    /// Inline content written as-is.
    Text(String),
    /// Remote resource whose bytes are fetched at save time.
    Remote(Url),
    /// Bytes decoded from a `data:` URI.
    Inline(Vec<u8>),
    /// An image or binary value that names no retrievable content. Saving
    /// it records a failure instead of writing the raw value.
    Unresolved { value: String, reason: String },
}

impl ItemPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            ItemPayload::Text(t) => t.is_empty(),
            ItemPayload::Inline(bytes) => bytes.is_empty(),
            ItemPayload::Remote(_) | ItemPayload::Unresolved { .. } => false,
        }
    }
}

/// Where an item's extension came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionSource {
    /// Named by the normalization rule.
    Rule,
    /// Taken from the remote URL's path.
    Url,
    /// Taken from a `data:` URI's media type.
    MediaType,
    /// Kind default; may be refined from the response Content-Type.
    Fallback,
}

/// One unit of content after normalization, ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub kind: ItemKind,
    pub payload: ItemPayload,
    pub section: String,
    /// File stem, never empty.
    pub name: String,
    /// Extension without the leading dot.
    pub extension: String,
    pub extension_source: ExtensionSource,
    pub record_index: usize,
    pub item_index: usize,
}

impl NormalizedItem {
    /// `name.extension`, or just `name` when the extension is empty.
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.extension)
        }
    }
}

/// Result of persisting one [`NormalizedItem`].
#[derive(Debug, Clone, PartialEq)]
pub struct SavedArtifact {
    pub kind: ItemKind,
    /// Item name the artifact was produced from.
    pub name: String,
    /// Final path on success; the planned path (if any) on failure.
    pub path: Option<PathBuf>,
    /// Bytes written.
    pub size: Option<u64>,
    pub error: Option<PersistenceError>,
}

impl SavedArtifact {
    pub fn saved(kind: ItemKind, name: &str, path: PathBuf, size: u64) -> Self {
        Self {
            kind,
            name: name.to_string(),
            path: Some(path),
            size: Some(size),
            error: None,
        }
    }

    pub fn failed(
        kind: ItemKind,
        name: &str,
        path: Option<PathBuf>,
        error: PersistenceError,
    ) -> Self {
        Self {
            kind,
            name: name.to_string(),
            path,
            size: None,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of every artifact produced by one run.
///
/// Artifacts are grouped by kind for lookup (`summary[ItemKind::Image]`,
/// `summary["image"]`) while [`flatten`](Self::flatten) preserves the order
/// in which the normalizer emitted the items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveSummary {
    groups: BTreeMap<ItemKind, Vec<SavedArtifact>>,
    order: Vec<(ItemKind, usize)>,
    interrupted: bool,
}

impl SaveSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, artifact: SavedArtifact) {
        let group = self.groups.entry(artifact.kind).or_default();
        self.order.push((artifact.kind, group.len()));
        group.push(artifact);
    }

    /// Artifacts of one kind, in emission order.
    pub fn get(&self, kind: ItemKind) -> &[SavedArtifact] {
        self.groups.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All artifacts in emission order.
    pub fn flatten(&self) -> impl Iterator<Item = &SavedArtifact> {
        self.order.iter().map(|(kind, i)| &self.groups[kind][*i])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.flatten().filter(|a| a.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SavedArtifact> {
        self.flatten().filter(|a| !a.success())
    }

    /// True when at least one artifact failed and at least one succeeded.
    pub fn is_partial(&self) -> bool {
        self.failed() > 0 && self.succeeded() > 0
    }

    pub fn is_full_success(&self) -> bool {
        self.failed() == 0 && !self.interrupted
    }

    /// True when the run was cancelled while saving.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub(crate) fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }
}

impl FromIterator<SavedArtifact> for SaveSummary {
    fn from_iter<I: IntoIterator<Item = SavedArtifact>>(iter: I) -> Self {
        let mut summary = SaveSummary::new();
        for artifact in iter {
            summary.push(artifact);
        }
        summary
    }
}

impl Index<ItemKind> for SaveSummary {
    type Output = [SavedArtifact];

    fn index(&self, kind: ItemKind) -> &Self::Output {
        self.get(kind)
    }
}

impl Index<&str> for SaveSummary {
    type Output = [SavedArtifact];

    /// Unknown kind names resolve to an empty slice.
    fn index(&self, kind: &str) -> &Self::Output {
        match kind.parse::<ItemKind>() {
            Ok(kind) => self.get(kind),
            Err(_) => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Driver and fetcher data
// ---------------------------------------------------------------------------

/// Lookup strategy for an element selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    #[default]
    Css,
    Xpath,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Css => write!(f, "css"),
            Hook::Xpath => write!(f, "xpath"),
        }
    }
}

/// What a driver reports about the first element matching a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Absent,
    Hidden,
    Visible,
}

/// HTTP method for direct resource requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// A direct HTTP request issued through a ResourceFetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub url: String,
    pub method: HttpMethod,
    pub body: Option<serde_json::Value>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            body: None,
        }
    }
}

/// Bytes returned by a ResourceFetcher.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedResource {
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}
