//! Event transport abstraction
//!
//! The resolvers only need "give me the events matching these filters" and
//! "send this event to these relays". Relays make no ordering promises, so
//! anything order-sensitive sorts for itself.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::event::Event;
use crate::filter::Filter;
use crate::{Error, Result};

/// Per-relay result of a publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub succeeded: Vec<String>,
    /// (relay, reason)
    pub failed: Vec<(String, String)>,
}

impl PublishOutcome {
    /// Partial success is normal; one accepting relay is enough
    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events matching any of `filters`, deduplicated by id, in no particular order
    async fn fetch_events(&self, filters: &[Filter]) -> Result<Vec<Event>>;

    /// Publish to `relays` (the source's own relays when empty)
    async fn publish_event(&self, event: &Event, relays: &[String]) -> Result<PublishOutcome>;
}

/// Every event matching `filter`, walking backwards in time with `until`
/// pages of `page_size` until a page comes back short.
///
/// Relays serve the newest events first under a limit, so a single limited
/// request can be crowded out by anyone publishing newer matching events.
/// When one second holds a full page of events that were all seen already,
/// the walk steps past that second. Errors once `max_pages` is exceeded.
pub async fn fetch_all(
    source: &dyn EventSource,
    filter: &Filter,
    page_size: usize,
    max_pages: usize,
) -> Result<Vec<Event>> {
    let page_size = page_size.max(1);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut until = filter.until;

    for _ in 0..max_pages {
        let mut page_filter = filter.clone().limit(page_size);
        page_filter.until = until;

        let page = source.fetch_events(&[page_filter]).await?;
        let full = page.len() >= page_size;
        let oldest = page.iter().map(|e| e.created_at).min();

        let mut added = 0;
        for event in page {
            if seen.insert(event.id.clone()) {
                out.push(event);
                added += 1;
            }
        }

        let (true, Some(oldest)) = (full, oldest) else {
            return Ok(out);
        };
        until = if added > 0 {
            Some(oldest)
        } else {
            match oldest.checked_sub(1) {
                Some(previous) => Some(previous),
                None => return Ok(out),
            }
        };
    }

    Err(Error::Relay(format!(
        "more than {} pages of {} events, giving up",
        max_pages, page_size
    )))
}

/// In-memory event source, used by tests and one-shot CLI runs
#[derive(Default)]
pub struct MemoryEventSource {
    events: RwLock<Vec<Event>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = Event>) -> Self {
        let source = Self::new();
        for event in events {
            source.insert(event);
        }
        source
    }

    /// Store an event, ignoring duplicates by id
    pub fn insert(&self, event: Event) {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        if !events.iter().any(|e| e.id == event.id) {
            events.push(event);
        }
    }

    /// Replace everything, e.g. to simulate out-of-band changes
    pub fn replace_all(&self, replacement: Vec<Event>) {
        *self.events.write().unwrap_or_else(|e| e.into_inner()) = replacement;
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `fetch_events` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Make every subsequent fetch fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn fetch_events(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Relay("memory source set to fail".to_string()));
        }

        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for filter in filters {
            let mut matched: Vec<&Event> = events.iter().filter(|e| filter.matches(e)).collect();
            // relays return the newest events first when a limit applies
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matched.truncate(limit);
            }
            for event in matched {
                if seen.insert(event.id.clone()) {
                    out.push(event.clone());
                }
            }
        }

        Ok(out)
    }

    async fn publish_event(&self, event: &Event, relays: &[String]) -> Result<PublishOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Relay("memory source set to fail".to_string()));
        }
        self.insert(event.clone());
        let succeeded = if relays.is_empty() {
            vec!["memory".to_string()]
        } else {
            relays.to_vec()
        };
        Ok(PublishOutcome { succeeded, failed: vec![] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::keypair;
    use crate::event::{UnsignedEvent, KIND_REPO_ANNOUNCEMENT};

    fn announcement(seed: u8, repo: &str, created_at: u64) -> Event {
        UnsignedEvent::new(KIND_REPO_ANNOUNCEMENT, vec![vec!["d".into(), repo.into()]], "")
            .with_created_at(created_at)
            .sign(&keypair(seed))
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_source_limit_keeps_newest() {
        let source = MemoryEventSource::with_events(vec![
            announcement(1, "a", 100),
            announcement(1, "b", 300),
            announcement(1, "c", 200),
        ]);

        let events = source
            .fetch_events(&[Filter::new().kind(KIND_REPO_ANNOUNCEMENT).limit(2)])
            .await
            .unwrap();
        let repos: Vec<&str> = events.iter().filter_map(|e| e.tag_value("d")).collect();
        assert_eq!(repos, vec!["b", "c"]);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_pages_past_the_limit() {
        let events: Vec<Event> = (1..=7).map(|i| announcement(1, "r", i * 100)).collect();
        let source = MemoryEventSource::with_events(events);
        let filter = Filter::new().kind(KIND_REPO_ANNOUNCEMENT);

        let all = fetch_all(&source, &filter, 3, 10).await.unwrap();
        let mut times: Vec<u64> = all.iter().map(|e| e.created_at).collect();
        times.sort_unstable();
        assert_eq!(times, vec![100, 200, 300, 400, 500, 600, 700]);
        // 700-500, 500-300, 300-100, then the short page at 100
        assert_eq!(source.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_fetch_all_steps_over_a_saturated_second() {
        let mut events: Vec<Event> = (0..4).map(|i| announcement(i + 1, "r", 500)).collect();
        events.push(announcement(9, "r", 100));
        let source = MemoryEventSource::with_events(events);
        let filter = Filter::new().kind(KIND_REPO_ANNOUNCEMENT);

        let all = fetch_all(&source, &filter, 2, 10).await.unwrap();
        assert!(all.iter().any(|e| e.created_at == 100));
    }

    #[tokio::test]
    async fn test_fetch_all_gives_up_after_max_pages() {
        let events: Vec<Event> = (1..=10).map(|i| announcement(1, "r", i)).collect();
        let source = MemoryEventSource::with_events(events);
        let filter = Filter::new().kind(KIND_REPO_ANNOUNCEMENT);
        assert!(fetch_all(&source, &filter, 2, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_source_dedupes_across_filters() {
        let event = announcement(1, "a", 100);
        let source = MemoryEventSource::with_events(vec![event.clone(), event.clone()]);
        assert_eq!(source.len(), 1);

        let events = source
            .fetch_events(&[Filter::new().d_tag("a"), Filter::new().author(event.pubkey.clone())])
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_source_failure_mode() {
        let source = MemoryEventSource::new();
        source.set_failing(true);
        assert!(source.fetch_events(&[Filter::new()]).await.is_err());
        source.set_failing(false);
        assert!(source.fetch_events(&[Filter::new()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_publish_reports_success() {
        let source = MemoryEventSource::new();
        let outcome = source
            .publish_event(&announcement(2, "x", 1), &["wss://one".to_string()])
            .await
            .unwrap();
        assert!(outcome.any_succeeded());
        assert_eq!(outcome.succeeded, vec!["wss://one".to_string()]);
        assert_eq!(source.len(), 1);
    }
}
