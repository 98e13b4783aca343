use std::path::Path;

use serde::Serialize;

/// Effects of the migration on one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub path: String,
    pub replacements: usize,
    pub removals: usize,
    pub rewritten: bool,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
    pub conflict: bool,
}

impl MigrationRecord {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.display().to_string(),
            ..Self::default()
        }
    }

    pub fn wrote(&self) -> bool {
        self.rewritten || self.deleted || self.renamed_to.is_some()
    }
}

/// Totals for one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub candidates: usize,
    pub resolved: usize,
    pub orphans: usize,
    pub failed_lookups: usize,
    pub files_scanned: usize,
    pub files_rewritten: usize,
    pub files_deleted: usize,
    pub files_renamed: usize,
    pub replacements: usize,
    pub removals: usize,
    pub renames: usize,
    pub conflicts: usize,
    pub failures: usize,
    pub records: Vec<MigrationRecord>,
}

impl MigrationReport {
    pub fn push(&mut self, record: MigrationRecord) {
        self.replacements += record.replacements;
        self.removals += record.removals;
        if record.rewritten && record.renamed_to.is_none() {
            self.files_rewritten += 1;
        }
        if record.deleted {
            self.files_deleted += 1;
        }
        if record.renamed_to.is_some() {
            self.files_renamed += 1;
            self.renames += 1;
        }
        if record.conflict {
            self.conflicts += 1;
        }
        if record.wrote() || record.conflict {
            self.records.push(record);
        }
    }

    /// Number of files written, deleted or renamed.
    pub fn writes(&self) -> usize {
        self.files_rewritten + self.files_deleted + self.files_renamed
    }

    pub fn is_noop(&self) -> bool {
        self.writes() == 0 && self.replacements == 0 && self.removals == 0
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{MigrationRecord, MigrationReport};

    #[test]
    fn unit_report_push_aggregates_counts_and_skips_untouched_records() {
        let mut report = MigrationReport::default();
        let mut rewritten = MigrationRecord::new(Path::new("store/a.json"));
        rewritten.replacements = 2;
        rewritten.removals = 1;
        rewritten.rewritten = true;
        report.push(rewritten);

        let mut renamed = MigrationRecord::new(Path::new("store/b.json"));
        renamed.replacements = 1;
        renamed.rewritten = true;
        renamed.renamed_to = Some("store/c.json".to_string());
        report.push(renamed);

        report.push(MigrationRecord::new(Path::new("store/untouched.json")));

        assert_eq!(report.replacements, 3);
        assert_eq!(report.removals, 1);
        assert_eq!(report.files_rewritten, 1);
        assert_eq!(report.files_renamed, 1);
        assert_eq!(report.writes(), 2);
        assert_eq!(report.records.len(), 2);
        assert!(!report.is_noop());

        let encoded = serde_json::to_value(&report).expect("serialize");
        assert_eq!(encoded["records"][0]["path"], "store/a.json");
        assert!(encoded["records"][0].get("renamed_to").is_none());
    }
}
