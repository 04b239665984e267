//! Persists normalized items to per-kind target directories.
//!
//! Text and inline payloads are written in emission order. Remote payloads
//! are fetched through the run's [`ResourceFetcher`] with bounded
//! concurrency. Every item yields exactly one [`SavedArtifact`]; a failing
//! item never stops its siblings.
//!
//! Files are written to a temporary sibling and moved into place once
//! complete, so a failed or abandoned write never leaves a partial file at
//! the artifact's path.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::PersistenceError;
use crate::models::{
    ExtensionSource, ItemKind, ItemPayload, NormalizedItem, ResourceRequest, SaveSummary,
    SavedArtifact,
};
use crate::paths::{PathBuilder, sanitize_file_stem};
use crate::policy::{CollisionPolicy, ExistencePolicy, StoragePolicy};
use crate::traits::ResourceFetcher;

/// Map a Content-Type to a file extension.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        "image/bmp" => "bmp",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/json" => "json",
        "text/plain" => "txt",
        "text/html" => "html",
        _ => return None,
    };
    Some(ext)
}

/// A remote item whose bytes still have to be fetched.
struct RemoteJob {
    index: usize,
    kind: ItemKind,
    name: String,
    url: Url,
    dir: PathBuf,
    path: PathBuf,
    refine_extension: bool,
}

pub struct StorageDispatcher<R: ResourceFetcher> {
    policy: StoragePolicy,
    fetcher: R,
    concurrency: usize,
}

impl<R: ResourceFetcher> StorageDispatcher<R> {
    pub fn new(policy: StoragePolicy, fetcher: R, concurrency: usize) -> Self {
        Self {
            policy,
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Persist every item. Never fails as a whole.
    pub async fn save_many(&self, items: &[NormalizedItem]) -> SaveSummary {
        self.save_many_until(items, &CancellationToken::new()).await
    }

    /// Like [`save_many`](Self::save_many), stopping early when `cancel`
    /// fires. Artifacts already written stay valid; unfinished items are
    /// recorded as [`PersistenceError::Cancelled`].
    pub async fn save_many_until(
        &self,
        items: &[NormalizedItem],
        cancel: &CancellationToken,
    ) -> SaveSummary {
        let mut slots: Vec<Option<SavedArtifact>> = vec![None; items.len()];
        let mut planned: Vec<Option<PathBuf>> = vec![None; items.len()];
        let mut ready_dirs: HashSet<PathBuf> = HashSet::new();
        let mut builder = PathBuilder::new(self.policy.collision);
        let mut jobs = Vec::new();

        for (index, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            if let ItemPayload::Unresolved { value, reason } = &item.payload {
                tracing::warn!(name = %item.name, %reason, "Skipping item without retrievable content");
                let error = PersistenceError::Unresolved {
                    value: preview(value),
                    reason: reason.clone(),
                };
                slots[index] = Some(SavedArtifact::failed(item.kind, &item.name, None, error));
                continue;
            }

            let dir = match self.ensure_dir(item, &mut ready_dirs) {
                Ok(dir) => dir,
                Err(e) => {
                    slots[index] = Some(SavedArtifact::failed(item.kind, &item.name, None, e));
                    continue;
                }
            };
            let path = builder.reserve(&dir, &item.name, &item.extension);
            planned[index] = Some(path.clone());

            match &item.payload {
                ItemPayload::Text(text) => {
                    slots[index] = Some(self.write_inline(item, path, text.as_bytes()));
                }
                ItemPayload::Inline(bytes) => {
                    slots[index] = Some(self.write_inline(item, path, bytes));
                }
                // Recorded as failed before a path was reserved.
                ItemPayload::Unresolved { .. } => {}
                ItemPayload::Remote(url) => jobs.push(RemoteJob {
                    index,
                    kind: item.kind,
                    name: item.name.clone(),
                    url: url.clone(),
                    dir,
                    path,
                    refine_extension: item.extension_source == ExtensionSource::Fallback,
                }),
            }
        }

        let builder = Mutex::new(builder);
        let mut pending = std::pin::pin!(
            stream::iter(jobs)
                .map(|job| self.save_remote(job, &builder))
                .buffer_unordered(self.concurrency)
        );

        let mut interrupted = cancel.is_cancelled();
        if !interrupted {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    next = pending.next() => match next {
                        Some((index, artifact)) => slots[index] = Some(artifact),
                        None => break,
                    },
                }
            }
        }

        let mut summary: SaveSummary = slots
            .into_iter()
            .zip(planned)
            .zip(items)
            .map(|((slot, path), item)| {
                slot.unwrap_or_else(|| {
                    SavedArtifact::failed(item.kind, &item.name, path, PersistenceError::Cancelled)
                })
            })
            .collect();

        if interrupted {
            tracing::warn!(
                saved = summary.succeeded(),
                total = summary.len(),
                "Saving interrupted by cancellation"
            );
            summary.mark_interrupted();
        }
        summary
    }

    /// Resolve and prepare the directory an item is stored in.
    fn ensure_dir(
        &self,
        item: &NormalizedItem,
        ready: &mut HashSet<PathBuf>,
    ) -> Result<PathBuf, PersistenceError> {
        let target = self
            .policy
            .target_for(item.kind)
            .ok_or_else(|| PersistenceError::NoTarget(item.kind.to_string()))?;
        let dir = if self.policy.section_subdirs {
            target.join(sanitize_file_stem(&item.section))
        } else {
            target.to_path_buf()
        };
        if ready.contains(&dir) {
            return Ok(dir);
        }

        if self.policy.existence == ExistencePolicy::FailIfMissing && !target.is_dir() {
            return Err(PersistenceError::MissingDirectory(target.to_path_buf()));
        }
        std::fs::create_dir_all(&dir).map_err(|e| PersistenceError::Io {
            path: dir.clone(),
            message: e.to_string(),
        })?;

        ready.insert(dir.clone());
        Ok(dir)
    }

    fn write_inline(&self, item: &NormalizedItem, path: PathBuf, bytes: &[u8]) -> SavedArtifact {
        match write_file(&path, bytes, self.overwrite()) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Saved inline item");
                SavedArtifact::saved(item.kind, &item.name, path, bytes.len() as u64)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write inline item");
                let message = e.to_string();
                SavedArtifact::failed(
                    item.kind,
                    &item.name,
                    Some(path.clone()),
                    PersistenceError::Io { path, message },
                )
            }
        }
    }

    async fn save_remote(
        &self,
        job: RemoteJob,
        builder: &Mutex<PathBuilder>,
    ) -> (usize, SavedArtifact) {
        let resource = match self.fetcher.fetch(&ResourceRequest::get(job.url.as_str())).await {
            Ok(resource) => resource,
            Err(e) => {
                tracing::warn!(url = %job.url, error = %e, "Failed to fetch remote item");
                let error = PersistenceError::Fetch {
                    url: job.url.to_string(),
                    message: e.to_string(),
                };
                return (
                    job.index,
                    SavedArtifact::failed(job.kind, &job.name, Some(job.path), error),
                );
            }
        };

        let mut path = job.path;
        if job.refine_extension {
            let refined = resource
                .content_type
                .as_deref()
                .and_then(extension_for_content_type);
            if let Some(ext) = refined.filter(|ext| path.extension().is_none_or(|cur| cur != *ext)) {
                path = builder.lock().await.reserve(&job.dir, &job.name, ext);
            }
        }

        let artifact = match write_bytes(&path, &resource.bytes, self.overwrite()).await {
            Ok(()) => {
                tracing::debug!(url = %job.url, path = %path.display(), bytes = resource.bytes.len(), "Saved remote item");
                SavedArtifact::saved(job.kind, &job.name, path, resource.bytes.len() as u64)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write remote item");
                let message = e.to_string();
                SavedArtifact::failed(
                    job.kind,
                    &job.name,
                    Some(path.clone()),
                    PersistenceError::Io { path, message },
                )
            }
        };
        (job.index, artifact)
    }

    fn overwrite(&self) -> bool {
        self.policy.collision == CollisionPolicy::Overwrite
    }
}

/// Shorten a rejected value for error messages; data URIs can be huge.
fn preview(value: &str) -> String {
    const MAX_CHARS: usize = 64;
    match value.char_indices().nth(MAX_CHARS) {
        Some((end, _)) => format!("{}...", &value[..end]),
        None => value.to_string(),
    }
}

/// Temporary file in the same directory as `path`, removed on drop.
fn temp_sibling(path: &Path) -> io::Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut builder = tempfile::Builder::new();
    builder.prefix(".gleaner-").suffix(".part");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    builder.tempfile_in(dir)
}

/// Move a completed temporary file to `path`. Without `overwrite` an
/// existing file at `path` is an error and stays untouched.
fn persist(temp: NamedTempFile, path: &Path, overwrite: bool) -> io::Result<()> {
    let result = if overwrite {
        temp.persist(path)
    } else {
        temp.persist_noclobber(path)
    };
    result.map(|_| ()).map_err(|e| e.error)
}

fn write_file(path: &Path, bytes: &[u8], overwrite: bool) -> io::Result<()> {
    let mut temp = temp_sibling(path)?;
    temp.write_all(bytes)?;
    persist(temp, path, overwrite)
}

/// Async counterpart of [`write_file`]. Dropping the future mid-write drops
/// the temporary file with it.
async fn write_bytes(path: &Path, bytes: &[u8], overwrite: bool) -> io::Result<()> {
    let temp = temp_sibling(path)?;
    let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    persist(temp, path, overwrite)
}
