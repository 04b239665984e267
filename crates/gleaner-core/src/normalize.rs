use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use url::Url;

use crate::keypath;
use crate::models::{ExtensionSource, ItemKind, ItemPayload, NormalizedItem, RawRecord};
use crate::paths::sanitize_file_stem;
use crate::policy::NormalizationRule;
use crate::storage::extension_for_content_type;
use crate::template;

/// Applies normalization rules to raw records.
///
/// Emission order is record, then item within the record, then rule in
/// policy order, so identical input always yields identical output.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<NormalizationRule>,
    section: String,
}

impl Normalizer {
    pub fn new(rules: Vec<NormalizationRule>, section: impl Into<String>) -> Self {
        Self {
            rules,
            section: section.into(),
        }
    }

    pub fn normalize(&self, records: &[RawRecord]) -> Vec<NormalizedItem> {
        let mut out = Vec::new();

        for (record_index, record) in records.iter().enumerate() {
            let items: Vec<&Value> = match record {
                Value::Array(elements) => elements.iter().collect(),
                other => vec![other],
            };

            for (item_index, item) in items.into_iter().enumerate() {
                for rule in &self.rules {
                    if let Some(normalized) = self.apply(rule, item, record_index, item_index) {
                        out.push(normalized);
                    }
                }
            }
        }

        tracing::debug!(
            records = records.len(),
            items = out.len(),
            section = %self.section,
            "Normalized records"
        );
        out
    }

    fn apply(
        &self,
        rule: &NormalizationRule,
        item: &Value,
        record_index: usize,
        item_index: usize,
    ) -> Option<NormalizedItem> {
        let text = resolve_source(item, &rule.source).map(value_text).unwrap_or_default();
        let (payload, media_type) = if text.trim().is_empty() {
            if !rule.allow_empty {
                return None;
            }
            (ItemPayload::Text(String::new()), None)
        } else {
            match rule.kind {
                ItemKind::Text => (ItemPayload::Text(text), None),
                ItemKind::Image | ItemKind::Binary => content_payload(&text),
            }
        };

        let (extension, extension_source) = match &rule.extension {
            Some(ext) => (ext.trim_start_matches('.').to_string(), ExtensionSource::Rule),
            None => match (&payload, rule.kind) {
                (_, ItemKind::Text) => (ItemKind::Text.fallback_extension().to_string(), ExtensionSource::Fallback),
                (ItemPayload::Remote(url), kind) => match url_extension(url) {
                    Some(ext) => (ext, ExtensionSource::Url),
                    None => (kind.fallback_extension().to_string(), ExtensionSource::Fallback),
                },
                (ItemPayload::Inline(_), kind) => {
                    match media_type.as_deref().and_then(extension_for_content_type) {
                        Some(ext) => (ext.to_string(), ExtensionSource::MediaType),
                        None => (kind.fallback_extension().to_string(), ExtensionSource::Fallback),
                    }
                }
                (_, kind) => (kind.fallback_extension().to_string(), ExtensionSource::Fallback),
            },
        };

        let rendered = template::render(&rule.name_template, |token| match token {
            "section" => Some(self.section.clone()),
            "record_index" => Some(record_index.to_string()),
            "item_index" => Some(item_index.to_string()),
            _ => None,
        });

        Some(NormalizedItem {
            kind: rule.kind,
            payload,
            section: self.section.clone(),
            name: sanitize_file_stem(&rendered),
            extension,
            extension_source,
            record_index,
            item_index,
        })
    }
}

/// Resolve a rule source against one item. A leading `payload` segment
/// names the item itself.
fn resolve_source<'a>(item: &'a Value, source: &str) -> Option<&'a Value> {
    let path = match source.split_once('.') {
        Some(("payload", rest)) => rest,
        _ if source == "payload" => "",
        _ => source,
    };
    keypath::resolve(item, path)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(a) if a.is_empty() => String::new(),
        Value::Object(o) if o.is_empty() => String::new(),
        other => other.to_string(),
    }
}

/// Payload for an image or binary value, plus the media type of inline data.
fn content_payload(text: &str) -> (ItemPayload, Option<String>) {
    if let Some(url) = remote_url(text) {
        return (ItemPayload::Remote(url), None);
    }
    let unresolved = |reason: String| ItemPayload::Unresolved {
        value: text.trim().to_string(),
        reason,
    };
    match decode_data_uri(text) {
        Some(Ok((bytes, media_type))) => (ItemPayload::Inline(bytes), media_type),
        Some(Err(reason)) => (unresolved(reason), None),
        None => (unresolved("not an http(s) or data URL".into()), None),
    }
}

/// Decode a `data:[<media type>][;base64],<data>` URI. `None` when `text`
/// is not a data URI at all.
fn decode_data_uri(text: &str) -> Option<Result<(Vec<u8>, Option<String>), String>> {
    let text = text.trim();
    let scheme = text.get(..5)?;
    if !scheme.eq_ignore_ascii_case("data:") {
        return None;
    }
    let Some((meta, data)) = text[5..].split_once(',') else {
        return Some(Err("data URI has no ',' separator".into()));
    };

    let (meta, is_base64) = match meta.rsplit_once(';') {
        Some((head, tail)) if tail.eq_ignore_ascii_case("base64") => (head, true),
        _ => (meta, false),
    };
    let media_type = meta
        .split(';')
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_ascii_lowercase);

    let raw: Vec<u8> = percent_encoding::percent_decode_str(data).collect();
    let bytes = if is_base64 {
        let compact: Vec<u8> = raw.into_iter().filter(|b| !b.is_ascii_whitespace()).collect();
        match STANDARD.decode(compact) {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(format!("invalid base64 in data URI: {e}"))),
        }
    } else {
        raw
    };
    Some(Ok((bytes, media_type)))
}

/// Parse an absolute http(s) URL; protocol-relative URLs default to https.
fn remote_url(text: &str) -> Option<Url> {
    let text = text.trim();
    let candidate = if text.starts_with("//") {
        format!("https:{text}")
    } else {
        text.to_string()
    };
    Url::parse(&candidate)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

/// Lowercased extension of the URL's last path segment (1-5 alphanumerics).
pub(crate) fn url_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}
