//! Nostr event model (NIP-01)
//!
//! ```json
//! {
//!   "id": "<sha256 of [0,pubkey,created_at,kind,tags,content]>",
//!   "pubkey": "<32-byte x-only key, hex>",
//!   "created_at": 1700000000,
//!   "kind": 30617,
//!   "tags": [["d", "my-repo"], ["clone", "https://git.example.com/..."]],
//!   "content": "",
//!   "sig": "<64-byte schnorr signature, hex>"
//! }
//! ```

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Contact list (NIP-02)
pub const KIND_CONTACTS: u16 = 3;

/// Repository ownership transfer. Regular (non-replaceable) so the chain is append-only.
pub const KIND_OWNERSHIP_TRANSFER: u16 = 1641;

/// Repository announcement (NIP-34), parameterized-replaceable on `d`
pub const KIND_REPO_ANNOUNCEMENT: u16 = 30617;

/// Branch protection rules for one repository, parameterized-replaceable on `d`
pub const KIND_BRANCH_PROTECTION: u16 = 30620;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signed nostr event as delivered by relays.
///
/// Fields default when absent so that envelope completeness can be reported
/// as a validation failure instead of a decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Recompute the event id from its signed fields
    pub fn compute_id(&self) -> String {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Whether `id` matches the hash of the signed fields
    pub fn has_valid_id(&self) -> bool {
        self.id.eq_ignore_ascii_case(&self.compute_id())
    }

    /// Verify the Schnorr signature over `id` for `pubkey`
    pub fn has_valid_signature(&self) -> bool {
        verify_schnorr(&self.id, &self.pubkey, &self.sig)
    }

    /// Full authenticity check: untampered id and valid signature
    pub fn verify(&self) -> Result<()> {
        if !self.has_valid_id() {
            return Err(Error::InvalidEvent(format!("id mismatch for {}", self.id)));
        }
        if !self.has_valid_signature() {
            return Err(Error::InvalidEvent(format!("bad signature on {}", self.id)));
        }
        Ok(())
    }

    /// First value of the first tag called `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// Every value (all positions after the name) of every tag called `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(|t| t == name).unwrap_or(false))
            .flat_map(|tag| tag.iter().skip(1).map(|v| v.as_str()))
    }

    /// Whether any tag equals `expected` exactly
    pub fn has_tag(&self, expected: &[&str]) -> bool {
        self.tags.iter().any(|tag| {
            tag.len() == expected.len() && tag.iter().zip(expected).all(|(a, b)| a == b)
        })
    }

    /// Strip id and signature, e.g. to re-sign an edited event
    pub fn into_unsigned(self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// Event that has not been signed yet.
///
/// Also used as a template handed to a key holder who must sign it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            pubkey: String::new(),
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    pub fn with_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkey = pubkey.into();
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sign with `keypair`. An empty pubkey is filled from the keypair; a
    /// different pubkey is refused.
    pub fn sign(self, keypair: &Keypair) -> Result<Event> {
        let signer = hex::encode(keypair.x_only_public_key().0.serialize());
        if !self.pubkey.is_empty() && !self.pubkey.eq_ignore_ascii_case(&signer) {
            return Err(Error::Signing(format!(
                "template belongs to {} but keypair is {}",
                self.pubkey, signer
            )));
        }

        let id_bytes = id_digest(&signer, self.created_at, self.kind, &self.tags, &self.content);
        let message = Message::from_digest(id_bytes);
        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr(&message, keypair);

        Ok(Event {
            id: hex::encode(id_bytes),
            pubkey: signer,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.to_string(),
        })
    }
}

/// NIP-01 event id: hex sha256 of `[0, pubkey, created_at, kind, tags, content]`
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    hex::encode(id_digest(pubkey, created_at, kind, tags, content))
}

fn id_digest(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let serialized = serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(serialized.as_bytes()).into()
}

fn verify_schnorr(id: &str, pubkey: &str, sig: &str) -> bool {
    let Ok(id_bytes) = hex::decode(id) else {
        return false;
    };
    let Ok(pubkey_bytes) = hex::decode(pubkey) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };

    let Ok(xonly) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(&id_bytes) else {
        return false;
    };

    Secp256k1::verification_only()
        .verify_schnorr(&signature, &message, &xonly)
        .is_ok()
}
