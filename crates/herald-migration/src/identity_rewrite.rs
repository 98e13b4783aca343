use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use herald_core::{write_json_atomic, write_text_atomic};
use serde_json::{Map, Value};

use crate::identity_resolve::Resolution;
use crate::identity_scan::{LegacyMatcher, RecordContent, ScannedFile};
use crate::migration_report::MigrationRecord;

/// Replacement and removal counts produced by one rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteCounts {
    pub replacements: usize,
    pub removals: usize,
}

impl RewriteCounts {
    pub fn changed(&self) -> bool {
        self.replacements > 0 || self.removals > 0
    }

    fn add(&mut self, other: RewriteCounts) {
        self.replacements += other.replacements;
        self.removals += other.removals;
    }
}

/// Rewrites identifiers inside a JSON document.
///
/// Resolved identifiers are substituted wherever they appear. A string equal
/// to an orphan is dropped from its container, an object key containing an
/// orphan drops its entry, and an orphan embedded in longer text is erased.
pub fn rewrite_json(
    value: &mut Value,
    matcher: &LegacyMatcher,
    resolution: &Resolution,
) -> RewriteCounts {
    let mut counts = RewriteCounts::default();
    if is_orphan_string(value, resolution) {
        *value = Value::Null;
        counts.removals += 1;
        return counts;
    }
    rewrite_value(value, matcher, resolution, &mut counts);
    counts
}

fn is_orphan_string(value: &Value, resolution: &Resolution) -> bool {
    matches!(value, Value::String(text) if resolution.orphans.contains(text))
}

fn rewrite_value(
    value: &mut Value,
    matcher: &LegacyMatcher,
    resolution: &Resolution,
    counts: &mut RewriteCounts,
) {
    match value {
        Value::String(text) => {
            let (rewritten, delta) = rewrite_text(text, matcher, resolution);
            if delta.changed() {
                *text = rewritten;
                counts.add(delta);
            }
        }
        Value::Array(items) => {
            let before = items.len();
            items.retain(|item| !is_orphan_string(item, resolution));
            counts.removals += before - items.len();
            for item in items.iter_mut() {
                rewrite_value(item, matcher, resolution, counts);
            }
        }
        Value::Object(map) => {
            let entries = std::mem::take(map);
            let mut rebuilt = Map::with_capacity(entries.len());
            for (key, mut item) in entries {
                let key_ids = matcher.find_all(&key);
                if key_ids.iter().any(|id| resolution.orphans.contains(*id)) {
                    counts.removals += 1;
                    continue;
                }
                if is_orphan_string(&item, resolution) {
                    counts.removals += 1;
                    continue;
                }
                rewrite_value(&mut item, matcher, resolution, counts);
                let (new_key, delta) = rewrite_text(&key, matcher, resolution);
                counts.add(delta);
                if rebuilt.contains_key(&new_key) {
                    tracing::warn!(key = %new_key, "migrated key collides with an existing entry; keeping the first");
                    continue;
                }
                rebuilt.insert(new_key, item);
            }
            *map = rebuilt;
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Substitutes resolved identifiers and erases orphans in free text.
pub fn rewrite_text(
    text: &str,
    matcher: &LegacyMatcher,
    resolution: &Resolution,
) -> (String, RewriteCounts) {
    let mut counts = RewriteCounts::default();
    let rewritten = matcher
        .regex()
        .replace_all(text, |captures: &regex::Captures<'_>| {
            let found = &captures[0];
            if let Some(new_id) = resolution.mapping.get(found) {
                counts.replacements += 1;
                new_id.clone()
            } else if resolution.orphans.contains(found) {
                counts.removals += 1;
                String::new()
            } else {
                found.to_string()
            }
        })
        .into_owned();
    (rewritten, counts)
}

/// True when `new_id` can stand inside a file name without leaving its directory.
fn is_safe_file_component(new_id: &str) -> bool {
    if new_id.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(new_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn renamed_path(path: &Path, legacy_id: &str, new_id: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(name.replacen(legacy_id, new_id, 1)))
}

fn write_content(path: &Path, content: &RecordContent) -> Result<()> {
    match content {
        RecordContent::Json(value) => write_json_atomic(path, value),
        RecordContent::Text(text) => write_text_atomic(path, text),
        RecordContent::Opaque => {
            anyhow::bail!("refusing to rewrite opaque record {}", path.display())
        }
    }
}

fn rewrite_content(
    content: &mut RecordContent,
    matcher: &LegacyMatcher,
    resolution: &Resolution,
) -> RewriteCounts {
    match content {
        RecordContent::Json(value) => rewrite_json(value, matcher, resolution),
        RecordContent::Text(text) => {
            let (rewritten, counts) = rewrite_text(text, matcher, resolution);
            if counts.changed() {
                *text = rewritten;
            }
            counts
        }
        RecordContent::Opaque => RewriteCounts::default(),
    }
}

/// Applies the migration to one scanned file and reports what changed.
///
/// With `dry_run` set the record describes the effects without touching disk.
pub fn apply_to_file(
    file: ScannedFile,
    matcher: &LegacyMatcher,
    resolution: &Resolution,
    dry_run: bool,
) -> Result<MigrationRecord> {
    let ScannedFile {
        path,
        mut content,
        name_id,
        ..
    } = file;
    let mut record = MigrationRecord::new(&path);

    if let Some(legacy_id) = name_id.as_deref() {
        if resolution.orphans.contains(legacy_id) {
            if !dry_run {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to delete {}", path.display()))?;
            }
            record.deleted = true;
            record.removals = 1;
            return Ok(record);
        }
    }

    let counts = rewrite_content(&mut content, matcher, resolution);
    record.replacements = counts.replacements;
    record.removals = counts.removals;

    let rename_target = name_id.as_deref().and_then(|legacy_id| {
        let new_id = resolution.mapping.get(legacy_id)?;
        if !is_safe_file_component(new_id) {
            tracing::warn!(
                path = %path.display(),
                new_id = %new_id,
                "resolved identifier is not a safe file name; keeping legacy file name"
            );
            record.conflict = true;
            return None;
        }
        renamed_path(&path, legacy_id, new_id)
    });

    if let Some(target) = rename_target {
        if target.exists() {
            tracing::warn!(
                from = %path.display(),
                to = %target.display(),
                "rename target exists; keeping legacy file name"
            );
            record.conflict = true;
        } else {
            if !dry_run {
                if matches!(content, RecordContent::Opaque) {
                    std::fs::rename(&path, &target).with_context(|| {
                        format!("failed to rename {} to {}", path.display(), target.display())
                    })?;
                } else {
                    write_content(&target, &content)?;
                    std::fs::remove_file(&path).with_context(|| {
                        format!("failed to remove migrated {}", path.display())
                    })?;
                }
            }
            record.renamed_to = Some(target.display().to_string());
            record.rewritten = counts.changed();
            return Ok(record);
        }
    }

    if counts.changed() {
        if !dry_run {
            write_content(&path, &content)?;
        }
        record.rewritten = true;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{apply_to_file, is_safe_file_component, rewrite_json, rewrite_text};
    use crate::identity_resolve::Resolution;
    use crate::identity_scan::{scan_file, LegacyMatcher, DEFAULT_LEGACY_PATTERN};

    const KNOWN: &str = "111111@s.whatsapp.net";
    const ORPHAN: &str = "222222@s.whatsapp.net";

    fn matcher() -> LegacyMatcher {
        LegacyMatcher::new(DEFAULT_LEGACY_PATTERN).expect("pattern")
    }

    fn resolution() -> Resolution {
        let mut resolution = Resolution::default();
        resolution
            .mapping
            .insert(KNOWN.to_string(), "abc@lid".to_string());
        resolution.orphans.insert(ORPHAN.to_string());
        resolution
    }

    #[test]
    fn unit_rewrite_json_replaces_and_removes_orphans() {
        let mut value = json!({
            "admins": [KNOWN, ORPHAN],
            ORPHAN: {"warns": 3},
            "111111@s.whatsapp.net": {"xp": 10},
            "owner": ORPHAN,
            "greeting": format!("hi {ORPHAN}!"),
            "other": "333333@s.whatsapp.net"
        });
        let counts = rewrite_json(&mut value, &matcher(), &resolution());
        assert_eq!(
            value,
            json!({
                "admins": ["abc@lid"],
                "abc@lid": {"xp": 10},
                "greeting": "hi !",
                "other": "333333@s.whatsapp.net"
            })
        );
        assert_eq!(counts.replacements, 2);
        assert_eq!(counts.removals, 4);
    }

    #[test]
    fn unit_rewrite_text_substitutes_and_erases() {
        let (text, counts) = rewrite_text(
            &format!("{KNOWN},{ORPHAN},{KNOWN}"),
            &matcher(),
            &resolution(),
        );
        assert_eq!(text, "abc@lid,,abc@lid");
        assert_eq!(counts.replacements, 2);
        assert_eq!(counts.removals, 1);
    }

    #[test]
    fn functional_apply_renames_resolved_file_and_rewrites_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(format!("{KNOWN}.json"));
        std::fs::write(&path, json!({"id": KNOWN, "level": 4}).to_string()).expect("write");

        let scanned = scan_file(&path, &matcher()).expect("scan").expect("candidate");
        let record = apply_to_file(scanned, &matcher(), &resolution(), false).expect("apply");
        let target = temp.path().join("abc@lid.json");
        assert!(!path.exists());
        assert_eq!(record.renamed_to, Some(target.display().to_string()));
        assert_eq!(record.replacements, 1);
        let migrated: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&target).expect("read")).expect("json");
        assert_eq!(migrated, json!({"id": "abc@lid", "level": 4}));
    }

    #[test]
    fn regression_resolved_id_with_path_separators_never_moves_the_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = temp.path().join("store");
        std::fs::create_dir_all(&store).expect("store dir");
        let path = store.join(format!("{KNOWN}.json"));
        std::fs::write(&path, json!({"id": KNOWN}).to_string()).expect("write legacy");
        let mut resolution = Resolution::default();
        resolution
            .mapping
            .insert(KNOWN.to_string(), "../escape@lid".to_string());

        let scanned = scan_file(&path, &matcher()).expect("scan").expect("candidate");
        let record = apply_to_file(scanned, &matcher(), &resolution, false).expect("apply");
        assert!(record.conflict);
        assert!(record.rewritten);
        assert_eq!(record.renamed_to, None);
        assert!(path.exists());
        assert!(!temp.path().join("escape@lid.json").exists());
        let legacy: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(legacy, json!({"id": "../escape@lid"}));
    }

    #[test]
    fn unit_safe_file_component_rejects_traversal_and_separators() {
        assert!(is_safe_file_component("abc@lid"));
        assert!(!is_safe_file_component(""));
        assert!(!is_safe_file_component(".."));
        assert!(!is_safe_file_component("."));
        assert!(!is_safe_file_component("a/b"));
        assert!(!is_safe_file_component("abc/"));
        assert!(!is_safe_file_component("a\\b"));
    }

    #[test]
    fn regression_rename_conflict_never_overwrites_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(format!("{KNOWN}.json"));
        let target = temp.path().join("abc@lid.json");
        std::fs::write(&path, json!({"id": KNOWN}).to_string()).expect("write legacy");
        std::fs::write(&target, "{\"keep\":true}").expect("write target");

        let scanned = scan_file(&path, &matcher()).expect("scan").expect("candidate");
        let record = apply_to_file(scanned, &matcher(), &resolution(), false).expect("apply");
        assert!(record.conflict);
        assert!(record.rewritten);
        assert_eq!(record.renamed_to, None);
        assert_eq!(
            std::fs::read_to_string(&target).expect("read target"),
            "{\"keep\":true}"
        );
        let legacy: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(legacy, json!({"id": "abc@lid"}));
    }

    #[test]
    fn functional_orphan_file_name_deletes_instead_of_rewriting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(format!("{ORPHAN}.json"));
        std::fs::write(&path, json!({"members": [KNOWN, ORPHAN]}).to_string()).expect("write");

        let scanned = scan_file(&path, &matcher()).expect("scan").expect("candidate");
        let record = apply_to_file(scanned, &matcher(), &resolution(), false).expect("apply");
        assert!(record.deleted);
        assert!(!record.rewritten);
        assert_eq!(record.removals, 1);
        assert_eq!(record.replacements, 0);
        assert!(!path.exists());
    }

    #[test]
    fn functional_dry_run_reports_without_touching_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("group.json");
        let original = json!({"members": [KNOWN, ORPHAN]}).to_string();
        std::fs::write(&path, &original).expect("write");

        let scanned = scan_file(&path, &matcher()).expect("scan").expect("candidate");
        let record = apply_to_file(scanned, &matcher(), &resolution(), true).expect("apply");
        assert!(record.rewritten);
        assert_eq!((record.replacements, record.removals), (1, 1));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), original);
    }
}
