//! Repository announcement validation
//!
//! Pure checks on a single kind-30617 event, applied in a fixed order so each
//! rejection names the first thing that is wrong with it.

use forgestr_relay::{is_hex_of_len, unix_now, Event, KIND_REPO_ANNOUNCEMENT};
use thiserror::Error;

/// Allowed clock skew for events dated in the future
pub const MAX_FUTURE_SKEW_SECS: u64 = 60;

/// Oldest acceptable announcement: 10 years
pub const MAX_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("wrong event kind: expected {expected}, got {actual}")]
    WrongKind { expected: u16, actual: u16 },

    #[error("signature does not verify for signer {0}")]
    InvalidSignature(String),

    #[error("event id does not match content hash, event was tampered with")]
    IdMismatch,

    #[error("missing d tag (repository id)")]
    MissingRepoId,

    #[error("repository id mismatch: expected {expected}, got {actual}")]
    RepoIdMismatch { expected: String, actual: String },

    #[error("malformed {field}: expected {expected_len} hex characters")]
    MalformedHex {
        field: &'static str,
        expected_len: usize,
    },

    #[error("created_at {created_at} is more than 60s in the future (now {now})")]
    FromTheFuture { created_at: u64, now: u64 },

    #[error("created_at {created_at} is more than 10 years in the past (now {now})")]
    TooOld { created_at: u64, now: u64 },
}

/// Validate against the current wall clock
pub fn validate_announcement(
    event: &Event,
    expected_repo_id: Option<&str>,
) -> Result<(), AnnouncementError> {
    validate_announcement_at(event, expected_repo_id, unix_now())
}

/// Validate with an explicit `now` (unix seconds)
pub fn validate_announcement_at(
    event: &Event,
    expected_repo_id: Option<&str>,
    now: u64,
) -> Result<(), AnnouncementError> {
    if event.id.is_empty() {
        return Err(AnnouncementError::MissingField("id"));
    }
    if event.pubkey.is_empty() {
        return Err(AnnouncementError::MissingField("pubkey"));
    }
    if event.sig.is_empty() {
        return Err(AnnouncementError::MissingField("sig"));
    }
    if event.created_at == 0 {
        return Err(AnnouncementError::MissingField("created_at"));
    }

    if event.kind != KIND_REPO_ANNOUNCEMENT {
        return Err(AnnouncementError::WrongKind {
            expected: KIND_REPO_ANNOUNCEMENT,
            actual: event.kind,
        });
    }

    if !event.has_valid_signature() {
        return Err(AnnouncementError::InvalidSignature(event.pubkey.clone()));
    }

    if !event.has_valid_id() {
        return Err(AnnouncementError::IdMismatch);
    }

    let repo_id = event.tag_value("d").ok_or(AnnouncementError::MissingRepoId)?;
    if let Some(expected) = expected_repo_id {
        if repo_id != expected {
            return Err(AnnouncementError::RepoIdMismatch {
                expected: expected.to_string(),
                actual: repo_id.to_string(),
            });
        }
    }

    if !is_hex_of_len(&event.pubkey, 64) {
        return Err(AnnouncementError::MalformedHex {
            field: "pubkey",
            expected_len: 64,
        });
    }
    if !is_hex_of_len(&event.sig, 128) {
        return Err(AnnouncementError::MalformedHex {
            field: "sig",
            expected_len: 128,
        });
    }

    if event.created_at > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
        return Err(AnnouncementError::FromTheFuture {
            created_at: event.created_at,
            now,
        });
    }
    if event.created_at < now.saturating_sub(MAX_AGE_SECS) {
        return Err(AnnouncementError::TooOld {
            created_at: event.created_at,
            now,
        });
    }

    Ok(())
}
