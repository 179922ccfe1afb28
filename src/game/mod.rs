//! Game packages and the instances that play them.
//!
//! A game package is a directory (or remote tree) holding a `meta.toml`
//! descriptor, a main script and any modules it requires. Each installed
//! game can be played by any number of instances, each with its own
//! sandbox, persistent data and pending notifications.

mod instance;
mod manifest;
mod metadata;
mod render;
mod repository;

use std::sync::Arc;

use tracing::{info, warn};

pub use instance::{load_instances, GameInstance, InstanceContext};
pub use manifest::{Manifest, ManifestMeta, MANIFEST_FILE};
pub use metadata::InstanceMetadata;
pub use render::{LogRenderSink, RenderSink};
pub use repository::{validate_repository_name, GameRepositories, GameRepository};

use crate::fetch::DeferredFetch;
use crate::host::ForegroundExecutor;
use crate::source::DataSource;
use crate::version::parse_version;
use crate::{HostError, Result};

/// A loaded game package.
#[derive(Debug)]
pub struct Game {
    source: DataSource,
    manifest: Manifest,
    logo: DeferredFetch<Vec<u8>>,
}

impl Game {
    /// Load the package rooted at `source`.
    pub fn load(source: DataSource, executor: ForegroundExecutor) -> Result<Self> {
        let text = source.read_to_string(MANIFEST_FILE).map_err(|e| match e {
            HostError::NotFound(_) => {
                HostError::Package(format!("no `{MANIFEST_FILE}` in game package"))
            }
            other => other,
        })?;
        let manifest = Manifest::parse(&text)?;

        let logo_source = source.clone();
        let logo_path = manifest.meta.path_to_logo.clone();
        let logo = DeferredFetch::new(
            format!("logo of `{}`", manifest.meta.id),
            executor,
            move || {
                logo_source
                    .read_bytes(&logo_path)
                    .ok_or(HostError::NotFound(logo_path))
            },
        );

        Ok(Self {
            source,
            manifest,
            logo,
        })
    }

    /// Source of the package's files.
    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn engine_version(&self) -> u32 {
        self.manifest.engine_version
    }

    pub fn id(&self) -> &str {
        &self.manifest.meta.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.meta.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.meta.version
    }

    pub fn author(&self) -> &str {
        &self.manifest.meta.author
    }

    pub fn description(&self) -> &str {
        &self.manifest.meta.description
    }

    pub fn changelog(&self) -> &[String] {
        &self.manifest.meta.changelog
    }

    pub fn path_to_main_script(&self) -> &str {
        &self.manifest.meta.path_to_main_script
    }

    pub fn path_to_logo(&self) -> &str {
        &self.manifest.meta.path_to_logo
    }

    /// Raw bytes of the logo image, read in the background on first use.
    pub fn logo(&self) -> &DeferredFetch<Vec<u8>> {
        &self.logo
    }

    /// Source text of the main script.
    pub fn read_main_script(&self) -> Result<Vec<u8>> {
        let path = self.path_to_main_script();
        self.source
            .read_bytes(path)
            .ok_or_else(|| HostError::Package(format!("main script `{path}` not found")))
    }

    /// Numeric components of the package version.
    pub fn parse_version(&self) -> Vec<u64> {
        parse_version(self.version())
    }

    /// Name on a single line with runs of whitespace collapsed.
    pub fn name_formatted(&self) -> String {
        simplify(self.name())
    }

    /// Description on a single line with runs of whitespace collapsed.
    pub fn description_formatted(&self) -> String {
        simplify(self.description())
    }
}

fn simplify(input: &str) -> String {
    input
        .trim()
        .replace('\n', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Load every game installed below `games`, one package per directory.
///
/// Packages that fail to load are logged and skipped.
pub fn load_installed(games: &DataSource, executor: &ForegroundExecutor) -> Vec<Arc<Game>> {
    let mut loaded = Vec::new();

    for entry in games.paths("") {
        let Some(source) = games.subsource(&entry) else {
            continue;
        };
        match Game::load(source, executor.clone()) {
            Ok(game) => {
                info!(game = game.id(), version = game.version(), "loaded game package");
                loaded.push(Arc::new(game));
            }
            Err(e) => warn!(entry = %entry, error = %e, "skipping invalid game package"),
        }
    }

    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::host::Host;
    use crate::source::AssetBundle;
    use std::time::Duration;

    const META: &str = r#"
engine_version = 1

[meta]
id = "pet"
name = "  Pet\n  Game  "
version = "v1.2"
author = "someone"
description = "Feed   your\tpet."
changelog = ["first", "second"]
path_to_main_script = "main"
path_to_logo = "logo.png"
"#;

    fn package() -> DataSource {
        DataSource::asset(
            AssetBundle::new([
                ("meta.toml", META.as_bytes()),
                ("main", b"print('hi')".as_slice()),
                ("logo.png", b"\x89PNG".as_slice()),
            ]),
            "",
        )
    }

    #[test]
    fn test_load_reads_manifest() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let game = Game::load(package(), host.executor()).unwrap();

        assert_eq!(game.engine_version(), 1);
        assert_eq!(game.id(), "pet");
        assert_eq!(game.author(), "someone");
        assert_eq!(game.changelog(), ["first", "second"]);
        assert_eq!(game.parse_version(), vec![1, 2]);
        assert_eq!(game.read_main_script().unwrap(), b"print('hi')");
    }

    #[test]
    fn test_formatted_text() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let game = Game::load(package(), host.executor()).unwrap();

        assert_eq!(game.name_formatted(), "Pet Game");
        assert_eq!(game.description_formatted(), "Feed your pet.");
    }

    #[test]
    fn test_missing_manifest() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let empty = DataSource::asset(AssetBundle::new([("main", b"".as_slice())]), "");

        let err = Game::load(empty, host.executor()).unwrap_err();
        assert!(matches!(err, HostError::Package(_)), "{err}");
    }

    #[test]
    fn test_logo_is_fetched_lazily() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let game = Game::load(package(), host.executor()).unwrap();
        assert!(game.logo().get_if_finished().unwrap().is_none());

        let (tx, rx) = std::sync::mpsc::channel();
        game.logo().get_or_start(move |result| {
            let _ = tx.send(result);
        });

        let mut logo = None;
        assert!(host.queue().run_until(Duration::from_secs(5), || {
            logo = rx.try_recv().ok();
            logo.is_some()
        }));
        assert_eq!(logo.unwrap().unwrap().as_slice(), b"\x89PNG");
    }

    #[test]
    fn test_load_installed_skips_broken_packages() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let games = DataSource::asset(
            AssetBundle::new([
                ("pet/meta.toml", META.as_bytes()),
                ("pet/main", b"".as_slice()),
                ("broken/main", b"".as_slice()),
            ]),
            "",
        );

        let loaded = load_installed(&games, &host.executor());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "pet");
    }
}
