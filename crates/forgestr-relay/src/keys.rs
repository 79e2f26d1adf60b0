//! Public key normalization
//!
//! Keys arrive as lowercase hex, uppercase hex or NIP-19 `npub1...` strings.
//! Everything inside forgestr compares keys as 64-char lowercase hex.

use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::PublicKey;
use secp256k1::Keypair;

use crate::{Error, Result};

/// Whether `s` is exactly `len` hex characters
pub fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Normalize an npub or hex key to lowercase hex
pub fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim();

    if key.starts_with("npub1") {
        let pk = PublicKey::from_bech32(key)
            .map_err(|e| Error::InvalidKey(format!("{}: {}", key, e)))?;
        return Ok(pk.to_hex());
    }

    if is_hex_of_len(key, 64) {
        Ok(key.to_ascii_lowercase())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// Encode a hex key as npub for display
pub fn to_npub(hex_key: &str) -> Result<String> {
    let pk = PublicKey::from_hex(hex_key)
        .map_err(|e| Error::InvalidKey(format!("{}: {}", hex_key, e)))?;
    pk.to_bech32()
        .map_err(|e| Error::InvalidKey(format!("{}: {}", hex_key, e)))
}

/// Hex x-only public key of a keypair
pub fn public_key_hex(keypair: &Keypair) -> String {
    hex::encode(keypair.x_only_public_key().0.serialize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIRIUS_HEX: &str = "4523be58d395b1b196a9b8c82b038b6895cb02b683d0c253a955068dba1facd0";
    const SIRIUS_NPUB: &str = "npub1g53mukxnjkcmr94fhryzkqutdz2ukq4ks0gvy5af25rgmwsl4ngq43drvk";

    #[test]
    fn test_normalize_npub() {
        assert_eq!(normalize_key(SIRIUS_NPUB).unwrap(), SIRIUS_HEX);
    }

    #[test]
    fn test_normalize_uppercase_hex() {
        let upper = SIRIUS_HEX.to_ascii_uppercase();
        assert_eq!(normalize_key(&upper).unwrap(), SIRIUS_HEX);
        assert_eq!(normalize_key(&format!("  {}\n", SIRIUS_HEX)).unwrap(), SIRIUS_HEX);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_key("").is_err());
        assert!(normalize_key("abc").is_err());
        assert!(normalize_key("npub1notreallyakey").is_err());
        assert!(normalize_key(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_npub_round_trip() {
        assert_eq!(to_npub(SIRIUS_HEX).unwrap(), SIRIUS_NPUB);
    }
}
