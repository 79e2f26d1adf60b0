//! Follow-graph crawler
//!
//! Breadth-first walk over contact lists (kind 3):
//! 1. Start from seed keys at distance 0
//! 2. Fetch their contact lists in batches
//! 3. Queue every newly seen `p` tag at distance + 1
//! 4. Stop expanding at `max_depth`

use forgestr_relay::{normalize_key, Event, EventSource, Filter, KIND_CONTACTS};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Crawler progress
pub struct CrawlerState {
    /// Keys already queued or crawled
    pub seen: HashSet<String>,
    /// Distance from the seeds at which each key was discovered
    pub depth_map: HashMap<String, u32>,
    pub queue: VecDeque<(String, u32)>, // (pubkey, depth)
    /// Maximum distance (1 = direct follows only)
    pub max_depth: u32,
    pub batch_size: usize,
    pub batch_counter: u32,
}

impl CrawlerState {
    pub fn new(max_depth: u32) -> Self {
        Self {
            seen: HashSet::new(),
            depth_map: HashMap::new(),
            queue: VecDeque::new(),
            max_depth,
            batch_size: 250,
            batch_counter: 0,
        }
    }

    pub fn get_depth(&self, pubkey: &str) -> Option<u32> {
        self.depth_map.get(pubkey).copied()
    }

    pub fn add_seeds(&mut self, pubkeys: &[String]) {
        for pk in pubkeys {
            if self.seen.insert(pk.clone()) {
                self.depth_map.insert(pk.clone(), 0);
                self.queue.push_back((pk.clone(), 0));
            }
        }
    }

    /// Next batch of keys sharing one depth, or None when the queue is empty
    pub fn next_batch(&mut self) -> Option<(Vec<String>, u32)> {
        let depth = self.queue.front()?.1;

        let mut batch = Vec::with_capacity(self.batch_size.min(self.queue.len()));
        while batch.len() < self.batch_size {
            match self.queue.front() {
                Some((_, d)) if *d == depth => {
                    if let Some((pk, _)) = self.queue.pop_front() {
                        batch.push(pk);
                    }
                }
                _ => break,
            }
        }

        self.batch_counter += 1;
        debug!(
            "Crawler batch {} with {} pubkeys at depth {}",
            self.batch_counter,
            batch.len(),
            depth
        );

        Some((batch, depth))
    }

    /// Queue the follows of `author`, found at `current_depth`
    pub fn process_contact_list(&mut self, author: &str, follows: Vec<String>, current_depth: u32) {
        if current_depth >= self.max_depth {
            return;
        }

        let next_depth = current_depth + 1;
        let mut added = 0;

        for followed in follows {
            if self.seen.insert(followed.clone()) {
                self.depth_map.insert(followed.clone(), next_depth);
                self.queue.push_back((followed, next_depth));
                added += 1;
            }
        }

        if added > 0 {
            trace!("Added {} new pubkeys from {} at depth {}", added, author, next_depth);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> CrawlerStats {
        CrawlerStats {
            seen_count: self.seen.len(),
            queue_count: self.queue.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerStats {
    pub seen_count: usize,
    pub queue_count: usize,
}

/// Contact lists from specific authors
pub fn contact_list_filter(authors: &[String]) -> Filter {
    Filter::new()
        .kind(KIND_CONTACTS)
        .authors(authors.iter().cloned())
}

/// Followed keys (`p` tags) of a contact list, normalized, undecodable ones dropped
pub fn extract_p_tags(event: &Event) -> Vec<String> {
    // p-tag format: ["p", <pubkey>, ...optional relay/petname]
    event
        .tags
        .iter()
        .filter(|tag| tag.len() >= 2 && tag[0] == "p")
        .filter_map(|tag| normalize_key(&tag[1]).ok())
        .collect()
}

/// Crawl from `root` and return every key within `max_depth` with its distance.
///
/// Only the newest verified contact list per author is used.
pub async fn crawl(
    source: &dyn EventSource,
    root: &str,
    max_depth: u32,
) -> forgestr_relay::Result<HashMap<String, u32>> {
    let mut state = CrawlerState::new(max_depth);
    state.add_seeds(&[root.to_string()]);

    while let Some((batch, depth)) = state.next_batch() {
        if depth >= max_depth {
            // nothing found here can be expanded further
            continue;
        }

        let events = source.fetch_events(&[contact_list_filter(&batch)]).await?;
        let mut latest: HashMap<String, Event> = HashMap::new();
        for event in events {
            if event.kind != KIND_CONTACTS || event.verify().is_err() {
                continue;
            }
            let author = event.pubkey.to_ascii_lowercase();
            if !batch.contains(&author) {
                continue;
            }
            match latest.get(&author) {
                Some(existing) if existing.created_at >= event.created_at => {}
                _ => {
                    latest.insert(author, event);
                }
            }
        }

        for (author, event) in latest {
            state.process_contact_list(&author, extract_p_tags(&event), depth);
        }
    }

    let stats = state.stats();
    debug!("Crawl from {} reached {} keys", root, stats.seen_count);
    Ok(state.depth_map)
}
