//! Project guard over `.keboola/manifest.json`.
//!
//! `KBC_BRANCH_ID` is only honored by `kbc` when the project was initialized
//! with `--allow-target-env`. Without that flag the override is silently
//! ignored, so every operation that sets it must pass [`ProjectGuard::validate`]
//! first.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{GateError, Result};

/// Manifest location relative to the project root.
pub const MANIFEST_RELATIVE_PATH: &str = ".keboola/manifest.json";

/// The subset of the manifest the server reads.
///
/// Parsing is lenient past valid JSON: a non-boolean `allowTargetEnv` counts as
/// `false` and branch entries without a usable `id`/`path` are skipped, so
/// unrelated manifest shapes never block the guard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    #[serde(default, deserialize_with = "lenient_flag")]
    pub allow_target_env: bool,
    #[serde(default, deserialize_with = "lenient_branches")]
    pub branches: Vec<ManifestBranch>,
}

/// A remote branch known to the local project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestBranch {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub path: String,
}

impl ProjectManifest {
    /// Find a branch by display name: exact path first, then with `/` -> `-`,
    /// which is how `kbc` derives branch paths.
    pub fn find_branch(&self, name: &str) -> Option<&ManifestBranch> {
        let normalized = normalize_branch_path(name);
        self.branches
            .iter()
            .find(|b| b.path == name)
            .or_else(|| self.branches.iter().find(|b| b.path == normalized))
    }
}

/// Path `kbc` uses for a branch display name.
pub fn normalize_branch_path(name: &str) -> String {
    name.replace('/', "-")
}

#[derive(Debug, Clone)]
pub struct ProjectGuard {
    manifest_path: PathBuf,
}

impl ProjectGuard {
    pub fn new(project_root: &Path) -> Self {
        Self {
            manifest_path: project_root.join(MANIFEST_RELATIVE_PATH),
        }
    }

    /// Load the manifest, distinguishing missing from unparseable.
    pub fn load(&self) -> Result<ProjectManifest> {
        let contents = match fs::read_to_string(&self.manifest_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GateError::ProjectUninitialized {
                    manifest: self.manifest_path.clone(),
                });
            }
            Err(err) => {
                return Err(GateError::ProjectCorrupt {
                    manifest: self.manifest_path.clone(),
                    reason: err.to_string(),
                });
            }
        };
        serde_json::from_str(&contents).map_err(|err| GateError::ProjectCorrupt {
            manifest: self.manifest_path.clone(),
            reason: err.to_string(),
        })
    }

    /// Require an initialized project with `allowTargetEnv: true`.
    #[instrument(skip_all, fields(manifest = %self.manifest_path.display()))]
    pub fn validate(&self) -> Result<()> {
        let manifest = self.load().inspect_err(|err| {
            warn!(code = err.code(), "project guard failed");
        })?;
        if !manifest.allow_target_env {
            warn!("manifest does not allow target env override");
            return Err(GateError::ProjectMisconfigured);
        }
        debug!("project guard passed");
        Ok(())
    }

    /// Look up a remote branch by display name; any manifest problem yields `None`.
    pub fn find_workspace(&self, name: &str) -> Option<ManifestBranch> {
        match self.load() {
            Ok(manifest) => manifest.find_branch(name).cloned(),
            Err(err) => {
                debug!(err = %err, "manifest unavailable for branch lookup");
                None
            }
        }
    }
}

fn lenient_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_bool().unwrap_or(false))
}

fn lenient_branches<'de, D>(deserializer: D) -> std::result::Result<Vec<ManifestBranch>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ManifestBranch>(item) {
            Ok(branch) => Some(branch),
            Err(err) => {
                debug!(err = %err, "skipping manifest branch entry");
                None
            }
        })
        .collect())
}

fn id_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}
