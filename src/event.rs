//! Nostr event model, canonical serialization, and verification.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Oldest `created_at` a submitted event may carry, relative to the relay clock.
pub const CREATED_AT_PAST_SLACK: i64 = 10 * 60;
/// Furthest-future `created_at` a submitted event may carry.
pub const CREATED_AT_FUTURE_SLACK: i64 = 5 * 60;

/// Simple tag wrapper preserving tag fields. The first field is the tag name.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Vec::<String>::deserialize(deserializer)?;
        if fields.is_empty() {
            return Err(D::Error::custom("tag must not be empty"));
        }
        Ok(Tag(fields))
    }
}

/// Signed, content-addressed record distributed by the relay.
///
/// Field order fixes the JSON key order on output. Exactly these seven
/// fields are accepted on input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Event identifier (hex of the SHA-256 canonical hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Distribution class derived from the kind number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    ParamReplaceable,
}

/// Outcome of a structurally successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    BadId,
    BadSig,
}

/// Failure to even attempt verification: a field could not be decoded.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed hex field: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("malformed key or signature: {0}")]
    Crypto(#[from] secp256k1::Error),
}

impl Event {
    /// Compact JSON array `[0,pubkey,created_at,kind,tags,content]` hashed
    /// to produce the event id.
    pub fn serialize_canonical(&self) -> Result<Vec<u8>, serde_json::Error> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        serde_json::to_vec(&arr)
    }

    /// SHA-256 of the canonical serialization.
    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        let ser = self.serialize_canonical()?;
        Ok(Sha256::digest(&ser).into())
    }

    /// Check the id against the canonical hash and the Schnorr signature
    /// against the author key.
    pub fn verify(&self) -> Result<Verdict, VerifyError> {
        let hash = self.hash()?;
        let id = hex::decode(&self.id)?;
        if id != hash {
            return Ok(Verdict::BadId);
        }
        let pubkey = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let msg = Message::from_digest_slice(&hash)?;
        let secp = Secp256k1::verification_only();
        Ok(if secp.verify_schnorr(&sig, &msg, &pubkey).is_ok() {
            Verdict::Ok
        } else {
            Verdict::BadSig
        })
    }

    pub fn kind_class(&self) -> KindClass {
        match self.kind {
            0 | 3 => KindClass::Replaceable,
            10000..=19999 => KindClass::Replaceable,
            20000..=29999 => KindClass::Ephemeral,
            30000..=39999 => KindClass::ParamReplaceable,
            _ => KindClass::Regular,
        }
    }

    /// Freshness rule for submissions: `created_at` must lie within
    /// [now − 10 min, now + 5 min].
    pub fn is_fresh(&self, now: i64) -> bool {
        let ahead = self.created_at - now;
        (-CREATED_AT_PAST_SLACK..=CREATED_AT_FUTURE_SLACK).contains(&ahead)
    }

    /// Value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [n, value, ..] if n == name => Some(value.as_str()),
                _ => None,
            })
    }
}

/// Non-empty lowercase hex, the only form accepted for id and key fields.
pub(crate) fn is_hex(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}


#[cfg(test)]
mod tests {
    use super::testutil::signed_event;
    use super::*;

    #[test]
    fn canonical_serialization_is_compact() {
        let ev = Event {
            id: String::new(),
            pubkey: "ab".repeat(32),
            created_at: 1693157791,
            kind: 1,
            tags: vec![Tag(vec!["e".into(), "cd".repeat(32)])],
            content: "powa".into(),
            sig: String::new(),
        };
        let ser = String::from_utf8(ev.serialize_canonical().unwrap()).unwrap();
        let expected = format!(
            "[0,\"{}\",1693157791,1,[[\"e\",\"{}\"]],\"powa\"]",
            "ab".repeat(32),
            "cd".repeat(32)
        );
        assert_eq!(ser, expected);
    }

    #[test]
    fn canonical_serialization_ignores_id_and_sig() {
        let ev = signed_event(1, 100, "meu");
        let mut other = ev.clone();
        other.id = "ff".repeat(32);
        other.sig = "ff".repeat(64);
        assert_eq!(
            ev.serialize_canonical().unwrap(),
            other.serialize_canonical().unwrap()
        );
    }

    #[test]
    fn verify_accepts_signed_event() {
        let ev = signed_event(1, 100, "");
        assert_eq!(ev.verify().unwrap(), Verdict::Ok);
    }

    #[test]
    fn verify_detects_id_mismatch() {
        let mut ev = signed_event(1, 100, "");
        let flip = if ev.id.starts_with("00") { "11" } else { "00" };
        ev.id.replace_range(0..2, flip);
        assert_eq!(ev.verify().unwrap(), Verdict::BadId);
    }

    #[test]
    fn verify_detects_bad_signature() {
        let ev = signed_event(1, 100, "powa");
        let other = signed_event(1, 100, "meu");
        let mut forged = ev.clone();
        forged.sig = other.sig;
        assert_eq!(forged.verify().unwrap(), Verdict::BadSig);
    }

    #[test]
    fn verify_rejects_undecodable_fields() {
        let mut ev = signed_event(1, 100, "");
        ev.id = "zz".repeat(32);
        assert!(ev.verify().is_err());
        let mut ev = signed_event(1, 100, "");
        ev.pubkey = "ab".into();
        assert!(ev.verify().is_err());
    }

    #[test]
    fn kind_classes_partition_the_range() {
        let mut ev = signed_event(1, 0, "");
        let cases = [
            (0, KindClass::Replaceable),
            (1, KindClass::Regular),
            (3, KindClass::Replaceable),
            (9999, KindClass::Regular),
            (10000, KindClass::Replaceable),
            (19999, KindClass::Replaceable),
            (20000, KindClass::Ephemeral),
            (29999, KindClass::Ephemeral),
            (30000, KindClass::ParamReplaceable),
            (39999, KindClass::ParamReplaceable),
            (40000, KindClass::Regular),
            (65535, KindClass::Regular),
        ];
        for (kind, class) in cases {
            ev.kind = kind;
            assert_eq!(ev.kind_class(), class, "kind {kind}");
        }
    }

    #[test]
    fn freshness_window_is_inclusive() {
        let now = 1_700_000_000;
        let mut ev = signed_event(1, now, "");
        assert!(ev.is_fresh(now));
        ev.created_at = now - CREATED_AT_PAST_SLACK;
        assert!(ev.is_fresh(now));
        ev.created_at = now - CREATED_AT_PAST_SLACK - 1;
        assert!(!ev.is_fresh(now));
        ev.created_at = now + CREATED_AT_FUTURE_SLACK;
        assert!(ev.is_fresh(now));
        ev.created_at = now + CREATED_AT_FUTURE_SLACK + 1;
        assert!(!ev.is_fresh(now));
    }

    #[test]
    fn tag_value_returns_first_match() {
        let mut ev = signed_event(30023, 0, "");
        ev.tags = vec![
            Tag(vec!["t".into(), "essay".into()]),
            Tag(vec!["d".into(), "slug1".into()]),
            Tag(vec!["d".into(), "slug2".into()]),
        ];
        assert_eq!(ev.tag_value("d"), Some("slug1"));
        assert_eq!(ev.tag_value("e"), None);
    }

    #[test]
    fn event_json_rejects_unknown_and_missing_fields() {
        let ev = signed_event(1, 100, "");
        let mut val = serde_json::to_value(&ev).unwrap();
        val["powa"] = serde_json::json!("meu");
        assert!(serde_json::from_value::<Event>(val).is_err());

        let mut val = serde_json::to_value(&ev).unwrap();
        val.as_object_mut().unwrap().remove("sig");
        assert!(serde_json::from_value::<Event>(val).is_err());
    }

    #[test]
    fn event_json_rejects_empty_tag() {
        let json =
            r#"{"id":"","pubkey":"","created_at":0,"kind":1,"tags":[[]],"content":"","sig":""}"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }

    #[test]
    fn event_json_key_order_is_fixed() {
        let ev = signed_event(1, 100, "");
        let json = serde_json::to_string(&ev).unwrap();
        let keys = [
            "\"id\"",
            "\"pubkey\"",
            "\"created_at\"",
            "\"kind\"",
            "\"tags\"",
            "\"content\"",
            "\"sig\"",
        ];
        let positions: Vec<_> = keys.iter().map(|k| json.find(*k).unwrap()).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn hex_validation() {
        assert!(is_hex("0123456789abcdef"));
        assert!(!is_hex(""));
        assert!(!is_hex("ABCDEF"));
        assert!(!is_hex("xyz"));
    }
}
