//! Persistent git-branch -> Keboola-branch mapping (`branch-mapping.json`).
//!
//! Reads fail open: a missing, unreadable or malformed file loads as an empty
//! mapping so read-only tools keep working. Writes are atomic (temp file in the
//! same directory, then rename).
//!
//! Mutations are read-modify-write without file locking; two concurrent
//! writers race and the last one wins.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use crate::error::GateError;

/// Branch name -> workspace id (`None` = production).
pub type BranchMappings = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all mappings, returning an empty map on any read or parse failure.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> BranchMappings {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("mapping file missing, using empty mapping");
                return BranchMappings::new();
            }
            Err(err) => {
                warn!(err = %err, "mapping file unreadable, using empty mapping");
                return BranchMappings::new();
            }
        };
        match serde_json::from_str::<BranchMappings>(&contents) {
            Ok(mappings) => {
                debug!(count = mappings.len(), "mappings loaded");
                mappings
            }
            Err(err) => {
                warn!(err = %err, "mapping file malformed, using empty mapping");
                BranchMappings::new()
            }
        }
    }

    /// Atomically replace the mapping file.
    #[instrument(skip_all, fields(path = %self.path.display(), count = mappings.len()))]
    pub fn save(&self, mappings: &BranchMappings) -> Result<(), GateError> {
        let staged = stage(&self.path, mappings).map_err(|err| self.write_error(&err))?;
        staged
            .persist(&self.path)
            .map_err(|err| self.write_error(&anyhow::Error::new(err.error)))?;
        debug!("mappings saved");
        Ok(())
    }

    /// Set (or overwrite) the mapping for `branch`.
    pub fn add_or_update(&self, branch: &str, workspace_id: Option<&str>) -> Result<(), GateError> {
        let mut mappings = self.load();
        mappings.insert(branch.to_string(), workspace_id.map(str::to_string));
        self.save(&mappings)
    }

    /// Remove the mapping for `branch`.
    ///
    /// Returns `None` when nothing was mapped (the file is left untouched),
    /// otherwise the removed value.
    pub fn remove(&self, branch: &str) -> Result<Option<Option<String>>, GateError> {
        let mut mappings = self.load();
        let Some(removed) = mappings.remove(branch) else {
            return Ok(None);
        };
        self.save(&mappings)?;
        Ok(Some(removed))
    }

    /// Lookup: `None` = absent, `Some(None)` = production.
    pub fn get(&self, branch: &str) -> Option<Option<String>> {
        self.load().remove(branch)
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.load().contains_key(branch)
    }

    fn write_error(&self, err: &anyhow::Error) -> GateError {
        GateError::MappingWrite {
            path: self.path.clone(),
            reason: format!("{err:#}"),
        }
    }
}

/// Serialize `mappings` into a synced temp file beside `path`, ready to persist.
///
/// Dropping the returned file without persisting removes it and leaves `path`
/// untouched.
fn stage(path: &Path, mappings: &BranchMappings) -> Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(mappings).context("serialize mappings")?;
    buf.push('\n');
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(buf.as_bytes()).context("write temp mapping file")?;
    tmp.as_file().sync_all().context("sync temp mapping file")?;
    Ok(tmp)
}
