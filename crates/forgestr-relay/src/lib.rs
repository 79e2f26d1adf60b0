//! Nostr plumbing for forgestr
//!
//! This crate provides:
//! - The NIP-01 event model with id hashing, Schnorr signing and verification
//! - Repository coordinates (`30617:<owner>:<repo>`)
//! - Subscription filters and the `EventSource` transport trait
//! - A WebSocket relay client and an in-memory source for tests

pub mod client;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod source;

pub use client::{RelayClient, DEFAULT_FETCH_TIMEOUT, DEFAULT_RELAYS};
pub use coordinate::RepoCoordinate;
pub use error::{Error, Result};
pub use event::{
    unix_now, Event, UnsignedEvent, KIND_BRANCH_PROTECTION, KIND_CONTACTS,
    KIND_OWNERSHIP_TRANSFER, KIND_REPO_ANNOUNCEMENT,
};
pub use filter::Filter;
pub use keys::{is_hex_of_len, normalize_key, public_key_hex, to_npub};
pub use source::{fetch_all, EventSource, MemoryEventSource, PublishOutcome};
