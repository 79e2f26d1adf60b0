//! Repository coordinates
//!
//! A coordinate is the stable address of a repository announcement:
//! `"30617:<owner-at-announcement hex>:<repo id>"`. The owner component is
//! fixed when the announcement is authored and never follows transfers.

use std::fmt;
use std::str::FromStr;

use crate::event::{Event, KIND_REPO_ANNOUNCEMENT};
use crate::keys::normalize_key;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoCoordinate {
    pub kind: u16,
    /// Announcing key, lowercase hex
    pub owner: String,
    pub repo_id: String,
}

impl RepoCoordinate {
    /// Coordinate of a repository announced by `owner` (npub or hex)
    pub fn new(owner: &str, repo_id: &str) -> Result<Self> {
        if repo_id.is_empty() {
            return Err(Error::InvalidCoordinate("empty repository id".to_string()));
        }
        Ok(Self {
            kind: KIND_REPO_ANNOUNCEMENT,
            owner: normalize_key(owner)?,
            repo_id: repo_id.to_string(),
        })
    }

    /// Coordinate addressed by an announcement event
    pub fn from_announcement(event: &Event) -> Result<Self> {
        if event.kind != KIND_REPO_ANNOUNCEMENT {
            return Err(Error::InvalidCoordinate(format!(
                "event {} is kind {}, not an announcement",
                event.id, event.kind
            )));
        }
        let repo_id = event
            .tag_value("d")
            .ok_or_else(|| Error::InvalidCoordinate(format!("event {} has no d tag", event.id)))?;
        Self::new(&event.pubkey, repo_id)
    }
}

impl fmt::Display for RepoCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.owner, self.repo_id)
    }
}

impl FromStr for RepoCoordinate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // repo ids may themselves contain ':' so split at most twice
        let mut parts = s.splitn(3, ':');
        let (Some(kind), Some(owner), Some(repo_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidCoordinate(s.to_string()));
        };

        let kind: u16 = kind
            .parse()
            .map_err(|_| Error::InvalidCoordinate(s.to_string()))?;
        if kind != KIND_REPO_ANNOUNCEMENT {
            return Err(Error::InvalidCoordinate(format!("unexpected kind in {}", s)));
        }

        Self::new(owner, repo_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "4523be58d395b1b196a9b8c82b038b6895cb02b683d0c253a955068dba1facd0";

    #[test]
    fn test_coordinate_format() {
        let coord = RepoCoordinate::new(OWNER, "forgestr").unwrap();
        assert_eq!(coord.to_string(), format!("30617:{}:forgestr", OWNER));
    }

    #[test]
    fn test_coordinate_parse() {
        let coord: RepoCoordinate = format!("30617:{}:with:colon", OWNER).parse().unwrap();
        assert_eq!(coord.owner, OWNER);
        assert_eq!(coord.repo_id, "with:colon");
    }

    #[test]
    fn test_coordinate_normalizes_owner() {
        let upper = format!("30617:{}:repo", OWNER.to_ascii_uppercase());
        let coord: RepoCoordinate = upper.parse().unwrap();
        assert_eq!(coord.owner, OWNER);
    }

    #[test]
    fn test_coordinate_rejects_bad_input() {
        assert!("30617:abc".parse::<RepoCoordinate>().is_err());
        assert!(format!("1:{}:repo", OWNER).parse::<RepoCoordinate>().is_err());
        assert!(format!("30617:{}:", OWNER).parse::<RepoCoordinate>().is_err());
    }
}
