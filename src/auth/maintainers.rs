//! Maintainer sets and visibility
//!
//! A [`MaintainerSet`] combines the current owner (from the transfer chain)
//! with the latest valid announcement for the repository. Sets are cached
//! per `(genesis owner, repo id)`.

use forgestr_relay::{
    normalize_key, Event, EventSource, Filter, RepoCoordinate, KIND_REPO_ANNOUNCEMENT,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::cache::TtlCache;
use super::ownership::OwnershipResolver;
use super::validator::validate_announcement;
use super::{AuthError, Result};

pub const DEFAULT_MAINTAINER_TTL: Duration = Duration::from_secs(300);

const ANNOUNCEMENT_FETCH_LIMIT: usize = 50;

/// Owner, maintainers and privacy of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintainerSet {
    /// Current owner, lowercase hex
    pub owner: String,
    /// Owner first, then announced maintainers, deduplicated
    pub maintainers: Vec<String>,
    pub is_private: bool,
    /// False when no valid announcement was found; such repositories are
    /// visible to nobody
    pub has_announcement: bool,
}

impl MaintainerSet {
    pub fn contains(&self, key: &str) -> bool {
        self.maintainers.iter().any(|m| m == key)
    }

    /// Visibility for an already normalized viewer key
    pub fn visible_to(&self, viewer: Option<&str>) -> bool {
        if !self.has_announcement {
            return false;
        }
        if !self.is_private {
            return true;
        }
        viewer.is_some_and(|v| self.contains(v))
    }
}

/// Resolves and caches [`MaintainerSet`]s.
///
/// Answers may be up to one TTL stale: a transfer or announcement published
/// elsewhere is not seen until the entry expires, unless the writer calls
/// [`MaintainerResolver::invalidate`]. Within the TTL the same key returns
/// the same set even if the underlying events change. A lookup that was
/// already in flight when `invalidate` ran still answers its caller but
/// does not repopulate the cache.
pub struct MaintainerResolver {
    source: Arc<dyn EventSource>,
    ownership: OwnershipResolver,
    cache: Arc<TtlCache<(String, String), MaintainerSet>>,
}

impl MaintainerResolver {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self::with_ttl(source, DEFAULT_MAINTAINER_TTL)
    }

    pub fn with_ttl(source: Arc<dyn EventSource>, ttl: Duration) -> Self {
        Self {
            ownership: OwnershipResolver::new(source.clone()),
            source,
            cache: Arc::new(TtlCache::new(ttl)),
        }
    }

    /// Shared handle, e.g. for a sweeper task
    pub fn cache(&self) -> &Arc<TtlCache<(String, String), MaintainerSet>> {
        &self.cache
    }

    pub fn ownership(&self) -> &OwnershipResolver {
        &self.ownership
    }

    pub async fn maintainers(&self, genesis_owner: &str, repo_id: &str) -> Result<MaintainerSet> {
        let coordinate = RepoCoordinate::new(genesis_owner, repo_id).map_err(|e| match e {
            forgestr_relay::Error::InvalidKey(k) => AuthError::InvalidKey(k),
            other => AuthError::InvalidCoordinate(other.to_string()),
        })?;
        let key = (coordinate.owner.clone(), coordinate.repo_id.clone());

        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let generation = self.cache.generation();
        let set = self.compute(&coordinate).await?;
        if !self.cache.insert_if_current(key, set.clone(), generation) {
            debug!("Invalidated while resolving {}, not caching", coordinate);
        }
        Ok(set)
    }

    async fn compute(&self, coordinate: &RepoCoordinate) -> Result<MaintainerSet> {
        let owner = self
            .ownership
            .current_owner(&coordinate.owner, &coordinate.repo_id)
            .await?;
        let announcement = self
            .latest_announcement(&coordinate.owner, &owner, &coordinate.repo_id)
            .await?;

        let set = match announcement {
            Some(event) => build_maintainer_set(&owner, &event),
            None => {
                debug!("No valid announcement for {}", coordinate);
                MaintainerSet {
                    maintainers: vec![owner.clone()],
                    owner,
                    is_private: false,
                    has_announcement: false,
                }
            }
        };
        Ok(set)
    }

    /// Latest valid announcement for `repo_id` by the genesis key or the current owner
    pub async fn latest_announcement(
        &self,
        genesis: &str,
        current_owner: &str,
        repo_id: &str,
    ) -> Result<Option<Event>> {
        let mut filter = Filter::new()
            .kind(KIND_REPO_ANNOUNCEMENT)
            .author(genesis)
            .d_tag(repo_id)
            .limit(ANNOUNCEMENT_FETCH_LIMIT);
        if current_owner != genesis {
            filter = filter.author(current_owner);
        }

        let events = self.source.fetch_events(&[filter]).await?;
        Ok(events
            .into_iter()
            .filter(|e| {
                e.pubkey.eq_ignore_ascii_case(genesis) || e.pubkey.eq_ignore_ascii_case(current_owner)
            })
            .filter(|e| match validate_announcement(e, Some(repo_id)) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Skipping announcement {}: {}", e.id, err);
                    false
                }
            })
            .max_by(newest))
    }

    /// Whether `viewer` (npub or hex, `None` for anonymous) may see the repository.
    /// Any resolution failure denies.
    pub async fn can_view(&self, viewer: Option<&str>, genesis_owner: &str, repo_id: &str) -> bool {
        let viewer = match viewer.map(normalize_key).transpose() {
            Ok(v) => v,
            Err(e) => {
                debug!("Undecodable viewer key: {}", e);
                return false;
            }
        };

        match self.maintainers(genesis_owner, repo_id).await {
            Ok(set) => set.visible_to(viewer.as_deref()),
            Err(e) => {
                warn!("Denying view of {}/{}: {}", genesis_owner, repo_id, e);
                false
            }
        }
    }

    pub async fn is_maintainer(&self, key: &str, genesis_owner: &str, repo_id: &str) -> bool {
        let Ok(key) = normalize_key(key) else {
            return false;
        };
        match self.maintainers(genesis_owner, repo_id).await {
            Ok(set) => set.contains(&key),
            Err(e) => {
                warn!("Maintainer check for {}/{} failed: {}", genesis_owner, repo_id, e);
                false
            }
        }
    }

    /// Drop the cached set after ownership or maintainer data changed
    pub fn invalidate(&self, genesis_owner: &str, repo_id: &str) -> bool {
        let Ok(owner) = normalize_key(genesis_owner) else {
            return false;
        };
        self.cache.invalidate(&(owner, repo_id.to_string()))
    }
}

/// Maintainer set for `owner` from a validated announcement
pub fn build_maintainer_set(owner: &str, announcement: &Event) -> MaintainerSet {
    let mut maintainers = vec![owner.to_string()];
    for raw in announcement.tag_values("maintainers") {
        match normalize_key(raw) {
            Ok(key) if !maintainers.contains(&key) => maintainers.push(key),
            Ok(_) => {}
            Err(_) => debug!("Dropping undecodable maintainer key {}", raw),
        }
    }

    MaintainerSet {
        owner: owner.to_string(),
        maintainers,
        is_private: is_private(announcement),
        has_announcement: true,
    }
}

pub fn is_private(announcement: &Event) -> bool {
    announcement.has_tag(&["private", "true"])
        || announcement.has_tag(&["private"])
        || announcement.has_tag(&["t", "private"])
}

fn newest(a: &Event, b: &Event) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}
