//! Subscription filters (NIP-01 `REQ` filter objects)

use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#a", default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Vec<String>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.into());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(Vec::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn a_tag(mut self, value: impl Into<String>) -> Self {
        self.a.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn d_tag(mut self, value: impl Into<String>) -> Self {
        self.d.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn p_tag(mut self, value: impl Into<String>) -> Self {
        self.p.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every constraint (limit is ignored)
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id.eq_ignore_ascii_case(&event.id)) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a.eq_ignore_ascii_case(&event.pubkey)) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        for (name, wanted) in [("a", &self.a), ("d", &self.d), ("p", &self.p)] {
            if let Some(wanted) = wanted {
                let hit = event
                    .tags
                    .iter()
                    .any(|tag| tag.len() >= 2 && tag[0] == name && wanted.contains(&tag[1]));
                if !hit {
                    return false;
                }
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_OWNERSHIP_TRANSFER;

    fn transfer(pubkey: &str, a: &str, created_at: u64) -> Event {
        Event {
            id: "00".repeat(32),
            pubkey: pubkey.to_string(),
            created_at,
            kind: KIND_OWNERSHIP_TRANSFER,
            tags: vec![vec!["a".into(), a.into()], vec!["p".into(), "bb".into()]],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_filter_serializes_tag_keys() {
        let filter = Filter::new()
            .kind(KIND_OWNERSHIP_TRANSFER)
            .a_tag("30617:aa:repo")
            .limit(10);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["kinds"], serde_json::json!([1641]));
        assert_eq!(json["#a"], serde_json::json!(["30617:aa:repo"]));
        assert_eq!(json["limit"], 10);
        assert!(json.get("authors").is_none());
    }

    #[test]
    fn test_filter_matches() {
        let event = transfer("AA", "30617:aa:repo", 100);
        assert!(Filter::new().kind(KIND_OWNERSHIP_TRANSFER).matches(&event));
        assert!(Filter::new().author("aa").matches(&event));
        assert!(Filter::new().a_tag("30617:aa:repo").p_tag("bb").matches(&event));
        assert!(!Filter::new().a_tag("30617:aa:other").matches(&event));
        assert!(!Filter::new().d_tag("repo").matches(&event));
        assert!(!Filter::new().kind(1).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(Filter::new().until(100).matches(&event));
        assert!(!Filter::new().until(99).matches(&event));
    }
}
