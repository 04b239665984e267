//! Collision-safe output paths.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::policy::CollisionPolicy;

/// Replace path separators and characters rejected by common filesystems
/// with `_`. Never returns an empty stem.
pub fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "item".to_string(),
        _ => cleaned,
    }
}

/// Hands out unique paths for one batch.
///
/// A path is unique when nothing exists on disk there and no earlier call
/// in the same batch returned it. `Overwrite` only skips the on-disk check.
#[derive(Debug)]
pub struct PathBuilder {
    collision: CollisionPolicy,
    reserved: HashSet<PathBuf>,
}

impl PathBuilder {
    pub fn new(collision: CollisionPolicy) -> Self {
        Self {
            collision,
            reserved: HashSet::new(),
        }
    }

    pub fn reserve(&mut self, dir: &Path, name: &str, extension: &str) -> PathBuf {
        let stem = match self.collision {
            CollisionPolicy::Timestamp => {
                format!("{name}_{}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
            }
            CollisionPolicy::Counter | CollisionPolicy::Overwrite => name.to_string(),
        };

        let mut candidate = dir.join(file_name(&stem, extension, None));
        let mut counter = 0u32;
        while self.is_taken(&candidate) {
            counter += 1;
            candidate = dir.join(file_name(&stem, extension, Some(counter)));
        }

        self.reserved.insert(candidate.clone());
        candidate
    }

    fn is_taken(&self, path: &Path) -> bool {
        if self.reserved.contains(path) {
            return true;
        }
        self.collision != CollisionPolicy::Overwrite && path.exists()
    }
}

fn file_name(stem: &str, extension: &str, counter: Option<u32>) -> String {
    let stem = match counter {
        Some(n) => format!("{stem}_{n}"),
        None => stem.to_string(),
    };
    if extension.is_empty() {
        stem
    } else {
        format!("{stem}.{extension}")
    }
}
