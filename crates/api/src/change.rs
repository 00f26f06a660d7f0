//! Signed, content-addressed changes of an object's change-log.

use crate::block::Block;
use crate::*;
use ed25519_dalek::{Signer, Verifier};
use std::collections::BTreeMap;

/// Number of changes after which a full snapshot is embedded.
pub const SNAPSHOT_EVERY: usize = 150;

/// A relation attached to an object.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RelationLink {
    /// Relation key.
    pub key: String,
    /// Relation format (text, number, object, ...).
    pub format: String,
}

/// Persisted form of an object's state.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default, rename_all = "camelCase")]
pub struct Snapshot {
    /// All blocks, root included.
    pub blocks: Vec<Block>,
    /// Stored details.
    pub details: Details,
    /// Object type keys.
    pub object_types: Vec<String>,
    /// Relation links.
    pub relation_links: Vec<RelationLink>,
    /// Store key/values of change-set-backed sub-documents.
    pub store: BTreeMap<String, Value>,
}

/// A single operation within a change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ChangeContent {
    /// Create or overwrite a block.
    BlockSet {
        /// The full block.
        block: Block,
    },
    /// Remove a block.
    BlockRemove {
        /// Block id.
        id: String,
    },
    /// Set a stored detail.
    DetailsSet {
        /// Key.
        key: String,
        /// Value.
        value: Value,
    },
    /// Remove a stored detail.
    DetailsUnset {
        /// Key.
        key: String,
    },
    /// Add an object type key.
    ObjectTypeAdd {
        /// Type key.
        key: String,
    },
    /// Remove an object type key.
    ObjectTypeRemove {
        /// Type key.
        key: String,
    },
    /// Add relation links.
    RelationAdd {
        /// The links.
        links: Vec<RelationLink>,
    },
    /// Remove relation links by key.
    RelationRemove {
        /// The keys.
        keys: Vec<String>,
    },
    /// Set a store value.
    StoreKeySet {
        /// Slash separated path.
        path: String,
        /// Value.
        value: Value,
    },
    /// Remove a store value.
    StoreKeyUnset {
        /// Slash separated path.
        path: String,
    },
    /// Marks the object deleted.
    Tombstone,
}

/// The signed part of a change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    /// The object (tree) this change belongs to.
    pub tree_id: ObjectId,
    /// The space the object lives in.
    pub space_id: SpaceId,
    /// Heads at the time this change was made. Empty for the root.
    pub prev: Vec<ChangeId>,
    /// Author.
    pub account: AccountId,
    /// Unix seconds.
    pub timestamp: i64,
    /// Only set on the root change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<RootInfo>,
    /// Full state, set on the root and every [SNAPSHOT_EVERY] changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Operations relative to the state at `prev`.
    #[serde(default)]
    pub contents: Vec<ChangeContent>,
}

/// Creation data carried by the root change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootInfo {
    /// Smartblock type of the object.
    pub sb_type: SmartBlockType,
    /// Unique key for derived objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<UniqueKey>,
    /// Random seed for non-derived objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub seed: String,
}

/// A change as stored and transferred.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    /// Content address of `payload` + `signature`.
    pub id: ChangeId,
    /// Canonical json of a [ChangePayload].
    #[serde(with = "crate::serde_bytes_base64")]
    pub payload: bytes::Bytes,
    /// Ed25519 signature over `payload` by `account`.
    #[serde(with = "crate::serde_bytes_base64")]
    pub signature: bytes::Bytes,
}

fn change_id(payload: &[u8], signature: &[u8]) -> ChangeId {
    ChangeId::from(hex::encode(hash_parts(&[payload, signature])))
}

impl RawChange {
    /// Encode and sign a payload.
    pub fn sign(
        payload: &ChangePayload,
        key: &ed25519_dalek::SigningKey,
    ) -> HeartResult<Self> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| HeartError::other_src("encode change", e))?;
        let signature = key.sign(&payload).to_bytes();
        Ok(Self {
            id: change_id(&payload, &signature),
            payload: payload.into(),
            signature: bytes::Bytes::copy_from_slice(&signature),
        })
    }

    /// Decode the payload, checking the content address and signature.
    pub fn verify(&self) -> HeartResult<ChangePayload> {
        if change_id(&self.payload, &self.signature) != self.id {
            return Err(HeartError::corrupt_record(format!(
                "change id mismatch: {}",
                self.id
            )));
        }
        let payload: ChangePayload = serde_json::from_slice(&self.payload)
            .map_err(|e| {
                HeartError::kind_src(
                    ErrorKind::CorruptRecord,
                    "decode change",
                    e,
                )
            })?;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(
            &payload.account.as_key_bytes()?,
        )
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::CorruptRecord, "change author", e)
        })?;
        let sig: [u8; 64] =
            (&self.signature[..]).try_into().map_err(|_| {
                HeartError::corrupt_record("change signature length")
            })?;
        vk.verify(&self.payload, &ed25519_dalek::Signature::from_bytes(&sig))
            .map_err(|e| {
                HeartError::kind_src(
                    ErrorKind::CorruptRecord,
                    format!("change signature: {}", self.id),
                    e,
                )
            })?;
        Ok(payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(key: &ed25519_dalek::SigningKey) -> ChangePayload {
        ChangePayload {
            tree_id: "obj".into(),
            space_id: "space".into(),
            prev: vec![],
            account: AccountId::from(bytes::Bytes::copy_from_slice(
                key.verifying_key().as_bytes(),
            )),
            timestamp: 1,
            root: Some(RootInfo {
                sb_type: SmartBlockType::Page,
                unique_key: None,
                seed: "s".into(),
            }),
            snapshot: None,
            contents: vec![ChangeContent::DetailsSet {
                key: "name".into(),
                value: "n".into(),
            }],
        }
    }

    #[test]
    fn signed_change_verifies() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
        let p = payload(&key);
        let raw = RawChange::sign(&p, &key).unwrap();
        assert_eq!(p, raw.verify().unwrap());
    }

    #[test]
    fn tampering_is_detected() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
        let mut raw = RawChange::sign(&payload(&key), &key).unwrap();
        let mut tampered = raw.payload.to_vec();
        tampered[10] ^= 1;
        raw.payload = tampered.into();
        assert!(raw.verify().unwrap_err().is(ErrorKind::CorruptRecord));

        // re-address the content so only the signature check can catch it
        raw.id = change_id(&raw.payload, &raw.signature);
        assert!(raw.verify().unwrap_err().is(ErrorKind::CorruptRecord));
    }
}
