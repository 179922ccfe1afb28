//! `meta.toml` package descriptor.

use serde::Deserialize;

use crate::{HostError, Result};

/// Descriptor file at the root of every game package.
pub const MANIFEST_FILE: &str = "meta.toml";

/// Parsed package descriptor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Host API generation the package was written against.
    pub engine_version: u32,
    pub meta: ManifestMeta,
}

/// The `[meta]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    #[serde(default)]
    pub changelog: Vec<String>,
    pub path_to_main_script: String,
    pub path_to_logo: String,
}

impl Manifest {
    /// Parse and validate a descriptor.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text)
            .map_err(|e| HostError::Package(format!("invalid {MANIFEST_FILE}: {e}")))?;

        if manifest.meta.id.trim().is_empty() {
            return Err(HostError::Package("game id must not be empty".to_string()));
        }
        if manifest.meta.path_to_main_script.is_empty() {
            return Err(HostError::Package(
                "path_to_main_script must not be empty".to_string(),
            ));
        }

        Ok(manifest)
    }
}
