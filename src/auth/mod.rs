//! Ownership and access-control resolution
//!
//! Everything here is derived from signed events:
//! - `validator`: is a single announcement legitimate
//! - `ownership`: who controls a coordinate after walking the transfer chain
//! - `maintainers`: owner + maintainer keys + privacy, cached with a TTL
//! - `protection`: per-branch push policy

pub mod cache;
pub mod maintainers;
pub mod ownership;
pub mod protection;
pub mod validator;

use thiserror::Error;

pub use cache::{spawn_sweeper, TtlCache};
pub use maintainers::{MaintainerResolver, MaintainerSet, DEFAULT_MAINTAINER_TTL};
pub use ownership::{is_self_transfer, resolve_chain, transfer_template, OwnershipResolver};
pub use protection::{
    create_protection_event, parse_protection_event, BranchRule, ProtectionError,
    ProtectionEvaluator, PushDecision,
};
pub use validator::{validate_announcement, validate_announcement_at, AnnouncementError};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Event source error: {0}")]
    Source(#[from] forgestr_relay::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
pub(crate) mod test_utils {
    use forgestr_relay::{public_key_hex, Event, UnsignedEvent, KIND_OWNERSHIP_TRANSFER, KIND_REPO_ANNOUNCEMENT};
    use secp256k1::{Keypair, Secp256k1};

    pub struct TestKey {
        pub keypair: Keypair,
        pub hex: String,
    }

    pub fn key(seed: u8) -> TestKey {
        let keypair = Keypair::from_seckey_slice(&Secp256k1::new(), &[seed; 32]).unwrap();
        let hex = public_key_hex(&keypair);
        TestKey { keypair, hex }
    }

    pub fn tags(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|tag| tag.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    pub fn announcement(signer: &TestKey, repo: &str, extra: &[&[&str]], created_at: u64) -> Event {
        let mut all = vec![vec!["d".to_string(), repo.to_string()]];
        all.extend(tags(extra));
        UnsignedEvent::new(KIND_REPO_ANNOUNCEMENT, all, "")
            .with_created_at(created_at)
            .sign(&signer.keypair)
            .unwrap()
    }

    pub fn transfer(signer: &TestKey, coordinate: &str, recipient: &str, created_at: u64) -> Event {
        UnsignedEvent::new(
            KIND_OWNERSHIP_TRANSFER,
            vec![
                vec!["a".to_string(), coordinate.to_string()],
                vec!["p".to_string(), recipient.to_string()],
            ],
            "",
        )
        .with_created_at(created_at)
        .sign(&signer.keypair)
        .unwrap()
    }
}
