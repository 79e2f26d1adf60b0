//! Who may have a new repository provisioned
//!
//! Consulted only before creating a repository that does not exist locally;
//! refreshing an existing one is never gated.

pub mod crawler;

use async_trait::async_trait;
use forgestr_relay::{normalize_key, EventSource};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TtlCache;
use crate::config::{AccessMode, ProvisioningConfig};

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Whether `announcer` (lowercase hex) may get a new repository
    async fn may_create_repo(&self, announcer: &str) -> bool;

    fn describe(&self) -> String;
}

/// Anyone may create
pub struct OpenAccess;

#[async_trait]
impl AccessPolicy for OpenAccess {
    async fn may_create_repo(&self, _announcer: &str) -> bool {
        true
    }

    fn describe(&self) -> String {
        "open".to_string()
    }
}

/// Fixed set of keys
pub struct AllowlistAccess {
    allowed: HashSet<String>,
}

impl AllowlistAccess {
    /// Undecodable entries are logged and skipped
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = HashSet::new();
        for key in keys {
            match normalize_key(key.as_ref()) {
                Ok(hex) => {
                    allowed.insert(hex);
                }
                Err(e) => warn!("Ignoring allowlist entry: {}", e),
            }
        }
        Self { allowed }
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

#[async_trait]
impl AccessPolicy for AllowlistAccess {
    async fn may_create_repo(&self, announcer: &str) -> bool {
        normalize_key(announcer).is_ok_and(|k| self.allowed.contains(&k))
    }

    fn describe(&self) -> String {
        format!("allowlist ({} keys)", self.allowed.len())
    }
}

/// Keys within `max_distance` follows of `root`
pub struct SocialGraphAccess {
    source: Arc<dyn EventSource>,
    root: String,
    max_distance: u32,
    graph: TtlCache<(), Arc<HashMap<String, u32>>>,
}

impl SocialGraphAccess {
    pub fn new(
        source: Arc<dyn EventSource>,
        root: &str,
        max_distance: u32,
        refresh: Duration,
    ) -> forgestr_relay::Result<Self> {
        Ok(Self {
            source,
            root: normalize_key(root)?,
            max_distance,
            graph: TtlCache::new(refresh),
        })
    }

    async fn graph(&self) -> forgestr_relay::Result<Arc<HashMap<String, u32>>> {
        if let Some(graph) = self.graph.get(&()) {
            return Ok(graph);
        }
        let graph = Arc::new(
            crawler::crawl(self.source.as_ref(), &self.root, self.max_distance).await?,
        );
        info!(
            "Social graph from {} refreshed: {} keys within distance {}",
            self.root,
            graph.len(),
            self.max_distance
        );
        self.graph.insert((), graph.clone());
        Ok(graph)
    }

    /// Distance of `key` from the root, if within range
    pub async fn distance(&self, key: &str) -> forgestr_relay::Result<Option<u32>> {
        let key = normalize_key(key)?;
        Ok(self.graph().await?.get(&key).copied())
    }
}

#[async_trait]
impl AccessPolicy for SocialGraphAccess {
    async fn may_create_repo(&self, announcer: &str) -> bool {
        match self.distance(announcer).await {
            Ok(Some(d)) => {
                debug!("{} is at distance {} from {}", announcer, d, self.root);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Social graph lookup failed, denying {}: {}", announcer, e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("social graph ({} within {})", self.root, self.max_distance)
    }
}

/// Policy for the configured access mode. `local_key` (the daemon's own
/// identity) is always allowlisted and is the default social graph root.
pub fn policy_from_config(
    config: &ProvisioningConfig,
    source: Arc<dyn EventSource>,
    local_key: &str,
) -> forgestr_relay::Result<Arc<dyn AccessPolicy>> {
    let policy: Arc<dyn AccessPolicy> = match config.access {
        AccessMode::Open => Arc::new(OpenAccess),
        AccessMode::Allowlist => Arc::new(AllowlistAccess::new(
            config
                .allowlist
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(local_key)),
        )),
        AccessMode::SocialGraph => {
            let root = config.socialgraph_root.as_deref().unwrap_or(local_key);
            Arc::new(SocialGraphAccess::new(
                source,
                root,
                config.max_distance,
                Duration::from_secs(config.graph_refresh_secs),
            )?)
        }
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_utils::key;
    use forgestr_relay::{MemoryEventSource, UnsignedEvent, KIND_CONTACTS};

    #[tokio::test]
    async fn test_open_access() {
        assert!(OpenAccess.may_create_repo(&key(1).hex).await);
    }

    #[tokio::test]
    async fn test_allowlist_normalizes() {
        let sirius_npub = "npub1g53mukxnjkcmr94fhryzkqutdz2ukq4ks0gvy5af25rgmwsl4ngq43drvk";
        let sirius_hex = "4523be58d395b1b196a9b8c82b038b6895cb02b683d0c253a955068dba1facd0";
        let policy = AllowlistAccess::new([sirius_npub, "junk"]);

        assert_eq!(policy.len(), 1);
        assert!(policy.may_create_repo(sirius_hex).await);
        assert!(policy.may_create_repo(&sirius_hex.to_ascii_uppercase()).await);
        assert!(!policy.may_create_repo(&key(1).hex).await);
    }

    #[tokio::test]
    async fn test_social_graph_access() {
        let (root, friend, stranger) = (key(1), key(2), key(3));
        let follows = UnsignedEvent::new(
            KIND_CONTACTS,
            vec![vec!["p".to_string(), friend.hex.clone()]],
            "",
        )
        .sign(&root.keypair)
        .unwrap();
        let source = Arc::new(MemoryEventSource::with_events(vec![follows]));

        let policy =
            SocialGraphAccess::new(source.clone(), &root.hex, 1, Duration::from_secs(60)).unwrap();
        assert!(policy.may_create_repo(&root.hex).await);
        assert!(policy.may_create_repo(&friend.hex).await);
        assert!(!policy.may_create_repo(&stranger.hex).await);

        // graph is cached between decisions
        let fetches = source.fetch_count();
        assert!(policy.may_create_repo(&friend.hex).await);
        assert_eq!(source.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn test_policy_from_config() {
        let (local, listed, other) = (key(1), key(2), key(3));
        let source: Arc<dyn EventSource> = Arc::new(MemoryEventSource::new());
        let mut config = ProvisioningConfig {
            allowlist: vec![listed.hex.clone()],
            ..Default::default()
        };

        let policy = policy_from_config(&config, source.clone(), &local.hex).unwrap();
        assert!(policy.may_create_repo(&local.hex).await);
        assert!(policy.may_create_repo(&listed.hex).await);
        assert!(!policy.may_create_repo(&other.hex).await);

        config.access = AccessMode::Open;
        let policy = policy_from_config(&config, source.clone(), &local.hex).unwrap();
        assert!(policy.may_create_repo(&other.hex).await);

        config.access = AccessMode::SocialGraph;
        config.socialgraph_root = Some("not-a-key".into());
        assert!(policy_from_config(&config, source, &local.hex).is_err());
    }

    #[tokio::test]
    async fn test_social_graph_fails_closed() {
        let root = key(1);
        let source = Arc::new(MemoryEventSource::new());
        source.set_failing(true);
        let policy = SocialGraphAccess::new(source, &root.hex, 2, Duration::from_secs(60)).unwrap();
        assert!(!policy.may_create_repo(&root.hex).await);
    }
}
