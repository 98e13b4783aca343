use std::path::PathBuf;

use anyhow::Result;
use herald_session::IdentifierResolver;

use crate::identity_resolve::{resolve_candidates, ResolvePacing};
use crate::identity_rewrite::apply_to_file;
use crate::identity_scan::{scan_store, LegacyMatcher, MigrationError, DEFAULT_LEGACY_PATTERN};
use crate::migration_report::MigrationReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub store_root: PathBuf,
    pub legacy_pattern: String,
    pub pacing: ResolvePacing,
    pub dry_run: bool,
}

impl MigrationConfig {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            legacy_pattern: DEFAULT_LEGACY_PATTERN.to_string(),
            pacing: ResolvePacing::default(),
            dry_run: false,
        }
    }
}

/// Migrates legacy identifiers in the record store through a live resolver.
#[derive(Debug, Clone)]
pub struct IdentityMigration {
    config: MigrationConfig,
    matcher: LegacyMatcher,
}

impl IdentityMigration {
    pub fn new(config: MigrationConfig) -> Result<Self, MigrationError> {
        if config.pacing.batch_size == 0 {
            return Err(MigrationError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if config.pacing.max_attempts == 0 {
            return Err(MigrationError::InvalidConfig(
                "max attempts must be greater than 0".to_string(),
            ));
        }
        let matcher = LegacyMatcher::new(&config.legacy_pattern)?;
        Ok(Self { config, matcher })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Scans, resolves and applies one migration pass.
    ///
    /// A missing store root yields an empty report. Per-file failures are
    /// logged and counted; they never abort the run.
    pub async fn run(&self, resolver: &dyn IdentifierResolver) -> Result<MigrationReport> {
        let root = &self.config.store_root;
        let mut report = MigrationReport {
            dry_run: self.config.dry_run,
            ..MigrationReport::default()
        };
        if !root.exists() {
            tracing::info!(root = %root.display(), "record store missing; nothing to migrate");
            return Ok(report);
        }
        if !root.is_dir() {
            return Err(MigrationError::StoreRoot(root.clone()).into());
        }

        let scan = scan_store(root, &self.matcher);
        report.files_scanned = scan.files_scanned;
        report.candidates = scan.candidates.len();
        report.failures = scan.failures.len();
        if scan.candidates.is_empty() {
            tracing::info!(
                files_scanned = report.files_scanned,
                "identity migration found no legacy identifiers"
            );
            return Ok(report);
        }

        let resolution = resolve_candidates(&scan.candidates, resolver, self.config.pacing).await;
        report.resolved = resolution.mapping.len();
        report.orphans = resolution.orphans.len();
        report.failed_lookups = resolution.failed_lookups;

        for file in scan.files {
            let path = file.path.clone();
            match apply_to_file(file, &self.matcher, &resolution, self.config.dry_run) {
                Ok(record) => report.push(record),
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %format!("{error:#}"),
                        "failed to migrate record"
                    );
                    report.failures += 1;
                }
            }
        }

        tracing::info!(
            dry_run = report.dry_run,
            candidates = report.candidates,
            resolved = report.resolved,
            orphans = report.orphans,
            replacements = report.replacements,
            removals = report.removals,
            renames = report.renames,
            conflicts = report.conflicts,
            failures = report.failures,
            "identity migration complete"
        );
        Ok(report)
    }
}
