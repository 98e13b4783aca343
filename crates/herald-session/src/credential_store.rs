use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use herald_core::write_json_atomic;
use serde_json::Value;

const CREDENTIALS_FILE: &str = "creds.json";

/// Directory-backed store for session credentials.
///
/// Transports may keep additional key files next to `creds.json`; `clear`
/// wipes the whole directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials_path().is_file()
    }

    pub fn load(&self) -> Result<Option<Value>> {
        let path = self.credentials_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read credentials {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse credentials {}", path.display()))?;
        Ok(Some(value))
    }

    pub fn save(&self, credentials: &Value) -> Result<()> {
        write_json_atomic(&self.credentials_path(), credentials)
            .context("failed to persist session credentials")
    }

    /// Removes every stored credential and recreates an empty directory.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("failed to wipe {}", self.dir.display()))?;
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to recreate {}", self.dir.display()))?;
        Ok(())
    }
}
