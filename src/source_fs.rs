//! Filesystem source adapter.
//!
//! Walks a local directory, selects files by glob, and reports each file as
//! an external item keyed by its path relative to the root.
//!
//! # Cursor
//!
//! `"{mtime_micros}|{relative_path}"` of the last item handed out. Discovery
//! orders files by `(mtime, path)` and yields only those strictly after the
//! cursor, so one token serves both resumption and incremental runs. A file
//! touched after the cursor was issued gets a newer mtime and is seen again.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::adapter::{ExternalItem, ItemStream, SourceAdapter};
use crate::config::FilesystemSourceConfig;
use crate::error::{AdapterError, MappingFailure};
use crate::models::{normalize_ts, Record};

pub const SOURCE_TYPE: &str = "filesystem";

pub struct FilesystemAdapter {
    name: String,
    config: FilesystemSourceConfig,
    description: String,
}

impl FilesystemAdapter {
    pub fn new(name: String, config: FilesystemSourceConfig) -> Self {
        let description = format!("Files under {}", config.root.display());
        Self {
            name,
            config,
            description,
        }
    }
}

struct Entry {
    relative: String,
    path: PathBuf,
    modified: DateTime<Utc>,
    bytes: u64,
}

impl Entry {
    fn position(&self) -> (i64, &str) {
        (self.modified.timestamp_micros(), &self.relative)
    }
}

pub fn format_cursor(modified: DateTime<Utc>, relative_path: &str) -> String {
    format!("{}|{}", modified.timestamp_micros(), relative_path)
}

pub fn parse_cursor(cursor: &str) -> Option<(i64, String)> {
    let (micros, path) = cursor.split_once('|')?;
    Some((micros.parse().ok()?, path.to_string()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, AdapterError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| AdapterError::Other(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AdapterError::Other(e.to_string()))
}

/// Matching files under the root, ordered by `(mtime, path)`.
fn scan_entries(config: &FilesystemSourceConfig) -> Result<Vec<Entry>, AdapterError> {
    let root = &config.root;
    if !root.is_dir() {
        return Err(AdapterError::Io(format!(
            "filesystem root does not exist: {}",
            root.display()
        )));
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry.map_err(|e| AdapterError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| AdapterError::Io(e.to_string()))?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        entries.push(Entry {
            relative,
            path: path.to_path_buf(),
            modified: normalize_ts(modified),
            bytes: metadata.len(),
        });
    }

    entries.sort_by(|a, b| a.position().cmp(&b.position()));
    Ok(entries)
}

fn title_of(content: &str, path: &Path) -> String {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|heading| heading.trim().to_string())
        .filter(|heading| !heading.is_empty())
        .unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        })
}

#[async_trait]
impl SourceAdapter for FilesystemAdapter {
    fn source_type(&self) -> &str {
        SOURCE_TYPE
    }

    fn source_identity(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn authenticate(&self) -> Result<bool, AdapterError> {
        Ok(self.config.root.is_dir())
    }

    fn discover(&self, cursor: Option<String>) -> ItemStream<'_> {
        let config = self.config.clone();
        let after = cursor.as_deref().and_then(|c| {
            let parsed = parse_cursor(c);
            if parsed.is_none() {
                tracing::warn!(cursor = c, "unreadable filesystem cursor, rescanning everything");
            }
            parsed
        });

        Box::pin(async_stream::stream! {
            let scanned = tokio::task::spawn_blocking(move || scan_entries(&config)).await;
            let entries = match scanned {
                Ok(Ok(entries)) => entries,
                Ok(Err(e)) => {
                    yield Err(e);
                    return;
                }
                Err(e) => {
                    yield Err(AdapterError::Other(format!("filesystem scan panicked: {}", e)));
                    return;
                }
            };

            for entry in entries {
                if let Some((micros, path)) = &after {
                    if entry.position() <= (*micros, path.as_str()) {
                        continue;
                    }
                }
                yield Ok(ExternalItem::new(entry.relative.clone(), entry.modified)
                    .with_cursor(format_cursor(entry.modified, &entry.relative))
                    .with_payload(serde_json::json!({
                        "path": entry.path.to_string_lossy(),
                        "bytes": entry.bytes,
                    })));
            }
        })
    }

    fn map(&self, item: &ExternalItem) -> Result<Record, MappingFailure> {
        let path = item
            .payload
            .get("path")
            .and_then(|p| p.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| MappingFailure::new(&item.external_id, "payload has no path"))?;

        let bytes = std::fs::read(&path)
            .map_err(|e| MappingFailure::new(&item.external_id, format!("read failed: {}", e)))?;
        let byte_len = bytes.len();
        let content = String::from_utf8(bytes)
            .map_err(|_| MappingFailure::new(&item.external_id, "file is not valid UTF-8"))?;

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut record = Record::new(title_of(&content, &path), content)
            .with_metadata("path", item.external_id.clone())
            .with_metadata("extension", extension)
            .with_metadata("bytes", byte_len as u64);
        for tag in &self.config.tags {
            record = record.with_tag(tag.clone());
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn config(root: &Path) -> FilesystemSourceConfig {
        FilesystemSourceConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
            tags: vec!["notes".to_string()],
        }
    }

    fn write_at(root: &Path, rel: &str, body: &str, secs: u64) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    async fn collect(adapter: &FilesystemAdapter, cursor: Option<String>) -> Vec<ExternalItem> {
        adapter
            .discover(cursor)
            .map(|item| item.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_discover_orders_by_mtime_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_at(dir.path(), "b.md", "# B", 2_000);
        write_at(dir.path(), "a.md", "# A", 3_000);
        write_at(dir.path(), "sub/c.txt", "c", 1_000);
        write_at(dir.path(), "skip.rs", "fn main() {}", 1_000);
        write_at(dir.path(), "node_modules/x.md", "x", 1_000);

        let adapter = FilesystemAdapter::new("notes".into(), config(dir.path()));
        let items = collect(&adapter, None).await;
        let ids: Vec<&str> = items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["sub/c.txt", "b.md", "a.md"]);
        assert_eq!(items[0].modified_at.timestamp(), 1_000);
    }

    #[tokio::test]
    async fn test_cursor_resumes_after_last_item() {
        let dir = tempfile::tempdir().unwrap();
        write_at(dir.path(), "one.md", "1", 1_000);
        write_at(dir.path(), "two.md", "2", 2_000);
        write_at(dir.path(), "three.md", "3", 3_000);

        let adapter = FilesystemAdapter::new("notes".into(), config(dir.path()));
        let all = collect(&adapter, None).await;
        let cursor = all[1].cursor.clone();

        let rest = collect(&adapter, cursor.clone()).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].external_id, "three.md");

        write_at(dir.path(), "one.md", "1 again", 4_000);
        let rest = collect(&adapter, cursor).await;
        let ids: Vec<&str> = rest.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["three.md", "one.md"]);
    }

    #[tokio::test]
    async fn test_missing_root_fails_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FilesystemAdapter::new("gone".into(), config(&dir.path().join("nope")));
        assert!(!adapter.authenticate().await.unwrap());

        let first = adapter.discover(None).next().await.unwrap();
        assert!(matches!(first, Err(AdapterError::Io(_))));
    }

    #[tokio::test]
    async fn test_map_builds_record() {
        let dir = tempfile::tempdir().unwrap();
        write_at(dir.path(), "guide.md", "intro\n# Getting Started\nbody", 1_000);
        write_at(dir.path(), "plain.txt", "no heading", 2_000);

        let adapter = FilesystemAdapter::new("notes".into(), config(dir.path()));
        let items = collect(&adapter, None).await;

        let guide = adapter.map(&items[0]).unwrap();
        assert_eq!(guide.title, "Getting Started");
        assert_eq!(guide.custom_metadata.get_str("path"), Some("guide.md"));
        assert_eq!(guide.custom_metadata.get_str("extension"), Some("md"));
        assert!(guide.tags.contains("notes"));

        let plain = adapter.map(&items[1]).unwrap();
        assert_eq!(plain.title, "plain.txt");
    }

    #[tokio::test]
    async fn test_map_rejects_binary_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blob.md"), [0xff, 0xfe, 0x00]).unwrap();

        let adapter = FilesystemAdapter::new("notes".into(), config(dir.path()));
        let items = collect(&adapter, None).await;
        let err = adapter.map(&items[0]).unwrap_err();
        assert_eq!(err.external_id, "blob.md");
    }

    #[test]
    fn test_cursor_format() {
        let ts = DateTime::<Utc>::from_timestamp(12, 500_000).unwrap();
        let cursor = format_cursor(ts, "a|b.md");
        assert_eq!(cursor, "12000500|a|b.md");
        assert_eq!(parse_cursor(&cursor), Some((12_000_500, "a|b.md".to_string())));
        assert_eq!(parse_cursor("garbage"), None);
    }
}
