use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_LEGACY_PATTERN: &str = r"[0-9]{6,20}@s\.whatsapp\.net";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid legacy identifier pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid migration config: {0}")]
    InvalidConfig(String),
    #[error("record store root {} is not a directory", .0.display())]
    StoreRoot(PathBuf),
}

/// Finds legacy identifiers in text.
#[derive(Debug, Clone)]
pub struct LegacyMatcher {
    regex: Regex,
}

impl LegacyMatcher {
    pub fn new(pattern: &str) -> Result<Self, MigrationError> {
        let regex = Regex::new(pattern).map_err(|source| MigrationError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex })
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn find_all<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.regex
            .find_iter(text)
            .map(|found| found.as_str())
            .collect()
    }

    pub fn first(&self, text: &str) -> Option<String> {
        self.regex.find(text).map(|found| found.as_str().to_string())
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Parsed body of a scanned file.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    Json(Value),
    Text(String),
    /// Not valid UTF-8; only its name can be migrated.
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub content: RecordContent,
    /// Legacy identifier encoded in the file name, if any.
    pub name_id: Option<String>,
    pub content_ids: BTreeSet<String>,
}

impl ScannedFile {
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.name_id.iter().chain(self.content_ids.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub files_scanned: usize,
    pub files: Vec<ScannedFile>,
    pub candidates: BTreeSet<String>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Walks `root` and collects every file that references a legacy identifier.
///
/// Entries are visited in name order so repeated runs produce the same report.
pub fn scan_store(root: &Path, matcher: &LegacyMatcher) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(path = %dir.display(), error = %error, "failed to list record directory");
                outcome.failures.push((dir, error.to_string()));
                continue;
            }
        };
        let mut paths = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths.into_iter().rev() {
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if is_temp_artifact(&path) {
                continue;
            }
            outcome.files_scanned += 1;
            match scan_file(&path, matcher) {
                Ok(Some(file)) => {
                    outcome.candidates.extend(file.ids().cloned());
                    outcome.files.push(file);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "failed to scan record");
                    outcome.failures.push((path, error.to_string()));
                }
            }
        }
    }
    outcome.files.sort_by(|left, right| left.path.cmp(&right.path));
    outcome
}

fn is_temp_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.contains(".tmp-"))
}

/// Scans one file; `Ok(None)` when it references no legacy identifier.
pub fn scan_file(path: &Path, matcher: &LegacyMatcher) -> std::io::Result<Option<ScannedFile>> {
    let name_id = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| matcher.first(name));
    let bytes = std::fs::read(path)?;
    let mut content_ids = BTreeSet::new();
    let content = match String::from_utf8(bytes) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                collect_json_ids(&value, matcher, &mut content_ids);
                RecordContent::Json(value)
            }
            Err(_) => {
                content_ids.extend(matcher.find_all(&raw).into_iter().map(str::to_string));
                RecordContent::Text(raw)
            }
        },
        Err(_) => RecordContent::Opaque,
    };
    if name_id.is_none() && content_ids.is_empty() {
        return Ok(None);
    }
    Ok(Some(ScannedFile {
        path: path.to_path_buf(),
        content,
        name_id,
        content_ids,
    }))
}

/// Collects identifiers from object keys and string values at any depth.
pub fn collect_json_ids(value: &Value, matcher: &LegacyMatcher, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => out.extend(matcher.find_all(text).into_iter().map(str::to_string)),
        Value::Array(items) => {
            for item in items {
                collect_json_ids(item, matcher, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                out.extend(matcher.find_all(key).into_iter().map(str::to_string));
                collect_json_ids(item, matcher, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
