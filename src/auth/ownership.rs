//! Ownership transfer chain
//!
//! Transfers for a coordinate form an append-only chain rooted at the
//! announcing key. A transfer only counts when it is signed by whoever owns the
//! repository at that point in the chain, so a key that has already handed
//! the repository on can publish as many transfers as it likes without effect.
//!
//! Relays return events in arbitrary order, so the chain is sorted by
//! `(created_at, id)` before folding. The result depends only on the set of
//! events, never on delivery order.

use forgestr_relay::{
    fetch_all, normalize_key, EventSource, Event, Filter, RepoCoordinate, UnsignedEvent,
    KIND_OWNERSHIP_TRANSFER,
};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AuthError, Result};

/// Transfers requested per page while walking back through a coordinate's history
pub const TRANSFER_PAGE_SIZE: usize = 500;

/// Past this many pages resolution fails instead of deciding on a partial chain
pub const TRANSFER_MAX_PAGES: usize = 200;

pub struct OwnershipResolver {
    source: Arc<dyn EventSource>,
}

impl OwnershipResolver {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    /// Current controlling key (lowercase hex) for `genesis_owner`'s `repo_id`
    pub async fn current_owner(&self, genesis_owner: &str, repo_id: &str) -> Result<String> {
        let coordinate = coordinate(genesis_owner, repo_id)?;
        let transfers = self.transfers(&coordinate).await?;
        Ok(resolve_chain(&coordinate, transfers))
    }

    /// All transfer events referencing `coordinate`, unverified.
    ///
    /// Anyone can publish events tagging the coordinate, so the whole history
    /// is paged in. A newest-first window could push real links out.
    pub async fn transfers(&self, coordinate: &RepoCoordinate) -> Result<Vec<Event>> {
        let filter = Filter::new()
            .kind(KIND_OWNERSHIP_TRANSFER)
            .a_tag(coordinate.to_string());
        Ok(fetch_all(self.source.as_ref(), &filter, TRANSFER_PAGE_SIZE, TRANSFER_MAX_PAGES).await?)
    }

    /// Earliest valid self-transfer by the announcing key, the genesis attestation
    pub async fn find_self_transfer(&self, coordinate: &RepoCoordinate) -> Result<Option<Event>> {
        let filter = Filter::new()
            .kind(KIND_OWNERSHIP_TRANSFER)
            .author(coordinate.owner.clone())
            .a_tag(coordinate.to_string());
        let events =
            fetch_all(self.source.as_ref(), &filter, TRANSFER_PAGE_SIZE, TRANSFER_MAX_PAGES).await?;

        let address = coordinate.to_string();
        Ok(events
            .into_iter()
            .filter(|e| is_self_transfer(e) && references(e, &address))
            .filter(|e| e.pubkey.eq_ignore_ascii_case(&coordinate.owner))
            .filter(|e| e.verify().is_ok())
            .min_by(chain_order))
    }
}

fn coordinate(genesis_owner: &str, repo_id: &str) -> Result<RepoCoordinate> {
    RepoCoordinate::new(genesis_owner, repo_id).map_err(|e| match e {
        forgestr_relay::Error::InvalidKey(k) => AuthError::InvalidKey(k),
        other => AuthError::InvalidCoordinate(other.to_string()),
    })
}

/// Fold `events` into the current owner of `coordinate`.
///
/// Events that are not transfers for this coordinate, fail verification, or
/// are signed by a key other than the owner at that point are discarded.
pub fn resolve_chain(
    coordinate: &RepoCoordinate,
    events: impl IntoIterator<Item = Event>,
) -> String {
    let address = coordinate.to_string();

    let mut chain: Vec<Event> = events
        .into_iter()
        .filter(|e| e.kind == KIND_OWNERSHIP_TRANSFER && references(e, &address))
        .filter(|e| match e.verify() {
            Ok(()) => true,
            Err(err) => {
                warn!("Ignoring unverifiable transfer for {}: {}", address, err);
                false
            }
        })
        .collect();

    chain.sort_by(chain_order);
    chain.dedup_by(|a, b| a.id == b.id);

    let mut current = coordinate.owner.clone();
    for event in &chain {
        if !event.pubkey.eq_ignore_ascii_case(&current) {
            warn!(
                "Discarding transfer {} for {}: signed by {} but owner is {}",
                event.id, address, event.pubkey, current
            );
            continue;
        }

        let Some(recipient) = event.tag_value("p") else {
            warn!("Discarding transfer {} for {}: no p tag", event.id, address);
            continue;
        };

        match normalize_key(recipient) {
            Ok(next) => {
                if next != current {
                    debug!("{} transferred {} -> {}", address, current, next);
                }
                current = next;
            }
            Err(e) => warn!("Discarding transfer {} for {}: {}", event.id, address, e),
        }
    }

    current
}

/// Signer and recipient are the same key
pub fn is_self_transfer(event: &Event) -> bool {
    event.kind == KIND_OWNERSHIP_TRANSFER
        && event
            .tag_value("p")
            .and_then(|p| normalize_key(p).ok())
            .is_some_and(|p| p.eq_ignore_ascii_case(&event.pubkey))
}

/// Unsigned transfer of `coordinate` from `from` to `to`; `from == to` is an attestation
pub fn transfer_template(
    coordinate: &RepoCoordinate,
    from: &str,
    to: &str,
    created_at: u64,
) -> UnsignedEvent {
    UnsignedEvent::new(
        KIND_OWNERSHIP_TRANSFER,
        vec![
            vec!["a".to_string(), coordinate.to_string()],
            vec!["p".to_string(), to.to_string()],
        ],
        "",
    )
    .with_pubkey(from)
    .with_created_at(created_at)
}

fn references(event: &Event, address: &str) -> bool {
    event
        .tags
        .iter()
        .any(|tag| tag.len() >= 2 && tag[0] == "a" && tag[1] == address)
}

fn chain_order(a: &Event, b: &Event) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_utils::{key, transfer};
    use forgestr_relay::MemoryEventSource;

    fn coord_of(owner: &str) -> RepoCoordinate {
        RepoCoordinate::new(owner, "forgestr").unwrap()
    }

    #[test]
    fn test_empty_chain_keeps_genesis() {
        let a = key(1);
        let coord = coord_of(&a.hex);
        assert_eq!(resolve_chain(&coord, vec![]), a.hex);
    }

    #[test]
    fn test_forged_transfer_after_handover_is_ignored() {
        let (a, b, c) = (key(1), key(2), key(3));
        let coord = coord_of(&a.hex);
        let address = coord.to_string();

        let events = vec![
            transfer(&a, &address, &a.hex, 100),
            transfer(&a, &address, &b.hex, 200),
            // A no longer owns the repository here
            transfer(&a, &address, &c.hex, 250),
        ];
        assert_eq!(resolve_chain(&coord, events), b.hex);
    }

    #[test]
    fn test_chain_of_transfers_ends_at_last_recipient() {
        let keys: Vec<_> = (1..=5).map(key).collect();
        let coord = coord_of(&keys[0].hex);
        let address = coord.to_string();

        let mut events: Vec<Event> = keys
            .windows(2)
            .enumerate()
            .map(|(i, pair)| transfer(&pair[0], &address, &pair[1].hex, 100 + i as u64))
            .collect();
        events.reverse();
        assert_eq!(resolve_chain(&coord, events.clone()), keys[4].hex);

        // any delivery order gives the same answer
        events.rotate_left(2);
        assert_eq!(resolve_chain(&coord, events), keys[4].hex);
    }

    #[test]
    fn test_same_timestamp_tie_break_is_deterministic() {
        let (a, b, c) = (key(1), key(2), key(3));
        let coord = coord_of(&a.hex);
        let address = coord.to_string();

        let to_b = transfer(&a, &address, &b.hex, 100);
        let to_c = transfer(&a, &address, &c.hex, 100);
        let expected = if to_b.id < to_c.id { &b.hex } else { &c.hex };

        let forward = resolve_chain(&coord, vec![to_b.clone(), to_c.clone()]);
        let backward = resolve_chain(&coord, vec![to_c, to_b]);
        assert_eq!(&forward, expected);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_tampered_and_foreign_events_are_skipped() {
        let (a, b, c) = (key(1), key(2), key(3));
        let coord = coord_of(&a.hex);
        let address = coord.to_string();

        let mut tampered = transfer(&a, &address, &b.hex, 100);
        tampered.tags[1][1] = c.hex.clone();
        let other_address = RepoCoordinate::new(&a.hex, "other").unwrap().to_string();
        let other_repo = transfer(&a, &other_address, &c.hex, 110);

        assert_eq!(resolve_chain(&coord, vec![tampered, other_repo]), a.hex);
    }

    #[test]
    fn test_npub_recipient_is_normalized() {
        let a = key(1);
        let coord = coord_of(&a.hex);
        let sirius_npub = "npub1g53mukxnjkcmr94fhryzkqutdz2ukq4ks0gvy5af25rgmwsl4ngq43drvk";
        let sirius_hex = "4523be58d395b1b196a9b8c82b038b6895cb02b683d0c253a955068dba1facd0";

        let events = vec![transfer(&a, &coord.to_string(), sirius_npub, 100)];
        assert_eq!(resolve_chain(&coord, events), sirius_hex);
    }

    #[test]
    fn test_is_self_transfer() {
        let (a, b) = (key(1), key(2));
        let address = coord_of(&a.hex).to_string();
        assert!(is_self_transfer(&transfer(&a, &address, &a.hex, 1)));
        assert!(!is_self_transfer(&transfer(&a, &address, &b.hex, 1)));
    }

    #[tokio::test]
    async fn test_current_owner_scenario() {
        let (owner_a, owner_b, owner_c) = (key(10), key(11), key(12));
        let coord = coord_of(&owner_a.hex);
        let address = coord.to_string();

        let source = Arc::new(MemoryEventSource::with_events(vec![
            transfer(&owner_a, &address, &owner_c.hex, 250),
            transfer(&owner_a, &address, &owner_a.hex, 100),
            transfer(&owner_a, &address, &owner_b.hex, 200),
        ]));
        let resolver = OwnershipResolver::new(source);

        let owner = resolver.current_owner(&owner_a.hex, "forgestr").await.unwrap();
        assert_eq!(owner, owner_b.hex);
    }

    #[tokio::test]
    async fn test_flood_of_unrelated_transfers_does_not_hide_the_chain() {
        let (a, b, spammer) = (key(1), key(2), key(9));
        let coord = coord_of(&a.hex);
        let address = coord.to_string();

        let mut events = vec![
            transfer(&a, &address, &a.hex, 100),
            transfer(&a, &address, &b.hex, 200),
        ];
        let flood = TRANSFER_PAGE_SIZE as u64 + 20;
        events.extend((0..flood).map(|i| transfer(&spammer, &address, &spammer.hex, 1000 + i)));
        let source = Arc::new(MemoryEventSource::with_events(events));
        let resolver = OwnershipResolver::new(source.clone());

        let owner = resolver.current_owner(&a.hex, "forgestr").await.unwrap();
        assert_eq!(owner, b.hex);
        assert!(source.fetch_count() > 1);
    }

    #[tokio::test]
    async fn test_find_self_transfer_picks_earliest_valid() {
        let (a, b) = (key(1), key(2));
        let coord = coord_of(&a.hex);
        let address = coord.to_string();

        let first = transfer(&a, &address, &a.hex, 100);
        let source = Arc::new(MemoryEventSource::with_events(vec![
            transfer(&a, &address, &a.hex, 300),
            first.clone(),
            transfer(&a, &address, &b.hex, 50),
        ]));
        let resolver = OwnershipResolver::new(source);

        let found = resolver.find_self_transfer(&coord).await.unwrap();
        assert_eq!(found, Some(first));
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        let a = key(1);
        let source = Arc::new(MemoryEventSource::new());
        source.set_failing(true);
        let resolver = OwnershipResolver::new(source);
        assert!(resolver.current_owner(&a.hex, "forgestr").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_genesis_key() {
        let resolver = OwnershipResolver::new(Arc::new(MemoryEventSource::new()));
        assert!(matches!(
            resolver.current_owner("not-a-key", "forgestr").await,
            Err(AuthError::InvalidKey(_))
        ));
    }
}
