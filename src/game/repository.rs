//! Games published as releases of `owner/name` repositories.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::Game;
use crate::config::RepositoryConfig;
use crate::fetch::DeferredFetch;
use crate::host::ForegroundExecutor;
use crate::source::{DataSource, HttpAccess};
use crate::version::{compare_components, parse_version};
use crate::{HostError, Result};

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: Option<String>,
}

/// A repository whose latest release is a game package.
pub struct GameRepository {
    repository_name: String,
    id: String,
    name: String,
    game: DeferredFetch<Game>,
}

impl fmt::Debug for GameRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameRepository")
            .field("repository_name", &self.repository_name)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl GameRepository {
    /// Describe the repository `repository_name` publishing game `id`.
    ///
    /// Nothing is fetched until [`game`](Self::game) is first used.
    pub fn new(
        repository_name: &str,
        id: &str,
        name: &str,
        hosts: &RepositoryConfig,
        http: HttpAccess,
        executor: ForegroundExecutor,
    ) -> Result<Self> {
        validate_repository_name(repository_name)?;

        let repository = repository_name.to_string();
        let api_url = hosts.api_url.trim_end_matches('/').to_string();
        let raw_url = hosts.raw_url.trim_end_matches('/').to_string();
        let game_executor = executor.clone();
        let game = DeferredFetch::new(
            format!("latest release of `{repository_name}`"),
            executor,
            move || fetch_latest(&repository, &api_url, &raw_url, &http, game_executor),
        );

        Ok(Self {
            repository_name: repository_name.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            game,
        })
    }

    pub fn repository_name(&self) -> &str {
        &self.repository_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The game of the latest release.
    pub fn game(&self) -> &DeferredFetch<Game> {
        &self.game
    }

    /// Whether the latest release is newer than `installed`.
    ///
    /// `None` until the release has been fetched successfully.
    pub fn update_available(&self, installed: &Game) -> Option<bool> {
        let latest = self.game.get_if_finished().ok()??;
        let ordering = compare_components(&latest.parse_version(), &installed.parse_version());
        Some(ordering == Ordering::Greater)
    }
}

/// Check that `repository_name` is a plain `owner/name` pair safe to embed in
/// URLs.
pub fn validate_repository_name(repository_name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(HostError::Validation(format!(
            "invalid repository name `{repository_name}`: {reason}"
        )))
    };

    let Some((owner, name)) = repository_name.split_once('/') else {
        return invalid("must contain exactly one `/`");
    };
    if name.contains('/') {
        return invalid("must contain exactly one `/`");
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/');
    if !repository_name.chars().all(allowed) {
        return invalid("contains illegal characters");
    }
    if [owner, name].iter().any(|part| matches!(*part, "" | "." | "..")) {
        return invalid("special names are not allowed");
    }

    Ok(())
}

fn fetch_latest(
    repository: &str,
    api_url: &str,
    raw_url: &str,
    http: &HttpAccess,
    executor: ForegroundExecutor,
) -> Result<Game> {
    let release_url = format!("{api_url}/repos/{repository}/releases/latest");
    let release_url = Url::parse(&release_url)
        .map_err(|e| HostError::Validation(format!("invalid URL `{release_url}`: {e}")))?;

    let body = http.get_bytes(&release_url)?;
    let release: LatestRelease = serde_json::from_slice(&body).map_err(|e| {
        HostError::Fetch(format!(
            "could not read the latest release of `{repository}`: {e}"
        ))
    })?;
    let tag = release.tag_name.ok_or_else(|| {
        HostError::Fetch(format!(
            "the latest release of `{repository}` has no tag; make sure the release is tagged"
        ))
    })?;
    debug!(repository, tag = %tag, "found latest release");

    let source = DataSource::remote(&format!("{raw_url}/{repository}/{tag}"), http.clone())?;
    let game = Game::load(source, executor)?;

    if game.parse_version() != parse_version(&tag) {
        return Err(HostError::Package(format!(
            "latest release of `{repository}` does not match its descriptor: tag {tag}, meta.toml {}",
            game.version()
        )));
    }

    Ok(game)
}

/// Known game repositories, addressable by game id or position.
#[derive(Debug, Default)]
pub struct GameRepositories {
    list: Vec<GameRepository>,
    by_id: HashMap<String, usize>,
}

impl GameRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration, skipping invalid entries.
    pub fn from_config(
        config: &RepositoryConfig,
        http: &HttpAccess,
        executor: &ForegroundExecutor,
    ) -> Self {
        let mut repositories = Self::new();

        for entry in &config.games {
            let repository = GameRepository::new(
                &entry.repository,
                &entry.id,
                &entry.name,
                config,
                http.clone(),
                executor.clone(),
            );
            match repository {
                Ok(repository) => {
                    if !repositories.add(repository) {
                        warn!(id = %entry.id, "duplicate game repository ignored");
                    }
                }
                Err(e) => warn!(repository = %entry.repository, error = %e, "skipping repository"),
            }
        }

        repositories
    }

    /// Add `repository` unless one with the same game id exists.
    pub fn add(&mut self, repository: GameRepository) -> bool {
        if self.by_id.contains_key(repository.id()) {
            return false;
        }
        self.by_id.insert(repository.id().to_string(), self.list.len());
        self.list.push(repository);
        true
    }

    pub fn get(&self, game_id: &str) -> Option<&GameRepository> {
        self.by_id.get(game_id).map(|&index| &self.list[index])
    }

    pub fn get_index(&self, index: usize) -> Option<&GameRepository> {
        self.list.get(index)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameRepository> {
        self.list.iter()
    }
}
