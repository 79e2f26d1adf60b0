//! Repository manager trait and the filesystem implementation

use async_trait::async_trait;
use forgestr_relay::{is_hex_of_len, Event, RepoCoordinate};
use git2::Repository;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Directory inside each bare repository holding non-authoritative metadata
pub const HINT_DIR: &str = "forgestr";

const MAX_REPO_ID_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionOutcome {
    Created,
    Refreshed,
}

#[async_trait]
pub trait RepoManager: Send + Sync {
    async fn repo_exists(&self, coordinate: &RepoCoordinate) -> Result<bool>;

    /// Create or refresh the local repository for `announcement`. Must be
    /// idempotent and must never remove existing objects or refs.
    async fn provision_repo(
        &self,
        announcement: &Event,
        self_transfer: Option<&Event>,
        is_existing: bool,
    ) -> Result<ProvisionOutcome>;
}

/// Repo ids become path components, so only a conservative charset is accepted
pub fn validate_repo_id(repo_id: &str) -> Result<()> {
    if repo_id.is_empty() || repo_id.len() > MAX_REPO_ID_LEN {
        return Err(Error::InvalidRepoId(repo_id.to_string()));
    }
    if repo_id.starts_with('.') || repo_id.starts_with('-') {
        return Err(Error::InvalidRepoId(repo_id.to_string()));
    }
    let ok = repo_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || repo_id.contains("..") {
        return Err(Error::InvalidRepoId(repo_id.to_string()));
    }
    Ok(())
}

/// Bare repositories on the local filesystem
#[derive(Debug, Clone)]
pub struct FsRepoManager {
    root: PathBuf,
}

impl FsRepoManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<owner>/<repo>.git`
    pub fn repo_path(&self, coordinate: &RepoCoordinate) -> Result<PathBuf> {
        validate_repo_id(&coordinate.repo_id)?;
        if !is_hex_of_len(&coordinate.owner, 64) {
            return Err(Error::InvalidAnnouncement(format!(
                "owner is not a hex key: {}",
                coordinate.owner
            )));
        }
        Ok(self
            .root
            .join(coordinate.owner.to_ascii_lowercase())
            .join(format!("{}.git", coordinate.repo_id)))
    }
}

#[async_trait]
impl RepoManager for FsRepoManager {
    async fn repo_exists(&self, coordinate: &RepoCoordinate) -> Result<bool> {
        let path = self.repo_path(coordinate)?;
        Ok(path.join("HEAD").is_file())
    }

    async fn provision_repo(
        &self,
        announcement: &Event,
        self_transfer: Option<&Event>,
        is_existing: bool,
    ) -> Result<ProvisionOutcome> {
        let coordinate = RepoCoordinate::from_announcement(announcement)
            .map_err(|e| Error::InvalidAnnouncement(e.to_string()))?;
        let path = self.repo_path(&coordinate)?;
        let announcement = announcement.clone();
        let self_transfer = self_transfer.cloned();

        tokio::task::spawn_blocking(move || {
            provision_blocking(&path, &announcement, self_transfer.as_ref(), is_existing)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }
}

fn provision_blocking(
    path: &Path,
    announcement: &Event,
    self_transfer: Option<&Event>,
    is_existing: bool,
) -> Result<ProvisionOutcome> {
    let outcome = if path.join("HEAD").is_file() {
        let repo = Repository::open_bare(path)?;
        if !repo.is_bare() {
            return Err(Error::NotARepository(path.display().to_string()));
        }
        debug!("Refreshing {}", path.display());
        ProvisionOutcome::Refreshed
    } else {
        if is_existing {
            warn!("{} was reported as existing but has no HEAD, creating", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let repo = Repository::init_bare(path)?;
        repo.set_head("refs/heads/main")?;
        info!("Created bare repository {}", path.display());
        ProvisionOutcome::Created
    };

    write_metadata(path, announcement, self_transfer)?;
    Ok(outcome)
}

fn write_metadata(path: &Path, announcement: &Event, self_transfer: Option<&Event>) -> Result<()> {
    let description = announcement
        .tag_value("description")
        .or_else(|| announcement.tag_value("name"))
        .or_else(|| announcement.tag_value("d"))
        .unwrap_or_default();
    fs::write(path.join("description"), format!("{}\n", description))?;

    // Portable hints for tooling. Authorization never reads these back;
    // ownership is always resolved from the signed transfer chain.
    let hints = path.join(HINT_DIR);
    fs::create_dir_all(&hints)?;
    fs::write(
        hints.join("announcement.json"),
        serde_json::to_vec_pretty(announcement)?,
    )?;
    fs::write(hints.join("owner"), format!("{}\n", announcement.pubkey))?;
    if let Some(evidence) = self_transfer {
        fs::write(
            hints.join("self-transfer.json"),
            serde_json::to_vec_pretty(evidence)?,
        )?;
    }
    Ok(())
}
