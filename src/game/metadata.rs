//! Per-instance `metadata.json`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Game;
use crate::source::{escape_name, escape_segment, DataSource};
use crate::{HostError, Result};

/// File holding an instance's metadata, inside its directory.
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    game_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    #[serde(default)]
    instance_name: Option<String>,
}

/// Identity of one game instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub game_id: String,
    pub instance_name: String,
}

impl InstanceMetadata {
    /// Allocate a fresh instance of `game` below `instances` and save its
    /// metadata.
    ///
    /// The id is `<game id>-<n>` for the smallest `n` whose directory does
    /// not exist yet.
    pub fn create(instances: &DataSource, game: &Game) -> Result<Self> {
        let instance_id = (0u64..)
            .map(|n| format!("{}-{n}", game.id()))
            .find(|id| !instances.contains(&escape_segment(id)))
            .ok_or_else(|| HostError::Validation("no free instance id".to_string()))?;

        let metadata = Self {
            instance_name: format!("{}: {instance_id}", game.name()),
            instance_id,
            game_id: game.id().to_string(),
        };
        metadata.save(instances)?;
        debug!(instance = %metadata.instance_id, "created instance metadata");
        Ok(metadata)
    }

    /// Read the metadata in directory `directory` of `instances`, a name as
    /// listed by [`DataSource::paths`].
    ///
    /// Older files without an `instanceId` take the directory name.
    pub fn load(instances: &DataSource, directory: &str) -> Result<Self> {
        let path = format!("{}/{METADATA_FILE}", escape_name(directory));
        let text = instances.read_to_string(&path)?;
        let file: MetadataFile = serde_json::from_str(&text)?;

        let instance_id = file.instance_id.unwrap_or_else(|| directory.to_string());
        Ok(Self {
            instance_name: file.instance_name.unwrap_or_else(|| instance_id.clone()),
            instance_id,
            game_id: file.game_id,
        })
    }

    /// Write the metadata into this instance's directory.
    pub fn save(&self, instances: &DataSource) -> Result<()> {
        let path = format!("{}/{METADATA_FILE}", self.directory_name());
        let writer = instances
            .write(&path)
            .ok_or_else(|| HostError::Validation(format!("cannot write `{path}`")))?;

        let file = MetadataFile {
            game_id: self.game_id.clone(),
            instance_id: Some(self.instance_id.clone()),
            instance_name: Some(self.instance_name.clone()),
        };
        serde_json::to_writer_pretty(writer, &file)?;
        Ok(())
    }

    /// Name of the instance directory, as a path segment.
    pub fn directory_name(&self) -> String {
        escape_segment(&self.instance_id)
    }
}
