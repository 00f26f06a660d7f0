//! Types dealing with data identity or hashing.

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

/// Base byte identity type meant for newtyping.
/// You probably want [AccountId] or [PeerId].
///
/// These bytes are ONLY the raw ed25519 public key of the identity
/// being tracked, without prefix or suffix.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Id(#[serde(with = "crate::serde_bytes_base64")] pub bytes::Bytes);

imp_deref!(Id, bytes::Bytes);
imp_from!(Id, bytes::Bytes, b => Id(b));

impl Id {
    /// Parse the base64url display form back into an Id.
    pub fn from_b64(s: &str) -> crate::HeartResult<Self> {
        use base64::prelude::*;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| Id(bytes::Bytes::from(v)))
            .map_err(|e| {
                crate::HeartError::kind_src(
                    crate::ErrorKind::BadInput,
                    format!("invalid id: {s}"),
                    e,
                )
            })
    }

    /// Interpret these bytes as a 32 byte public key.
    pub fn as_key_bytes(&self) -> crate::HeartResult<[u8; 32]> {
        (&self.0[..]).try_into().map_err(|_| {
            crate::HeartError::bad_input(format!(
                "expected 32 key bytes, got {}",
                self.0.len()
            ))
        })
    }
}

/// The default display function encodes the Id as base64.
fn display(
    b: &bytes::Bytes,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    use base64::prelude::*;
    f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
}

macro_rules! imp_key_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Id);

        imp_deref!($name, Id);
        imp_from!($name, bytes::Bytes, b => $name(Id(b)));
        imp_from!($name, Id, b => $name(b));

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                display(&self.0 .0, f)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                display(&self.0 .0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::HeartError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Id::from_b64(s).map($name)
            }
        }
    };
}

imp_key_id! {
    /// The public part of the account key. Used for cross-device identity
    /// and as the author of every change.
    AccountId
}

imp_key_id! {
    /// The public part of the device key. Used for transport authentication.
    PeerId
}

macro_rules! imp_str_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub std::sync::Arc<str>);

        imp_deref!($name, str);
        imp_from!($name, &str, s => $name(s.into()));
        imp_from!($name, String, s => $name(s.into_boxed_str().into()));

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl $name {
            /// Get the string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

imp_str_id! {
    /// Identifies a space.
    SpaceId
}

imp_str_id! {
    /// Identifies an object (SmartBlock) within a space.
    ObjectId
}

imp_str_id! {
    /// Content address of a single change in an object's change-log.
    ChangeId
}

imp_str_id! {
    /// Identifies a client session of the external api.
    SessionId
}

/// Hash a list of length-prefixed parts with sha256.
///
/// Length prefixes make the encoding injective, so distinct part lists
/// never produce the same pre-image.
pub fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::Digest;
    let mut h = sha2::Sha256::new();
    for p in parts {
        h.update((p.len() as u64).to_be_bytes());
        h.update(p);
    }
    h.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_serde_fixtures() {
        const F: &[(&[u8], &str)] = &[
            (b"test-hash-1", "\"dGVzdC1oYXNoLTE\""),
            (b"s", "\"cw\""),
            (&[255, 255, 255, 255, 255, 255, 255], "\"_________w\""),
        ];

        for (d, e) in F.iter() {
            let r = serde_json::to_string(&Id(bytes::Bytes::from_static(d)))
                .unwrap();
            assert_eq!(e, &r);
            let r: AccountId = serde_json::from_str(e).unwrap();
            assert_eq!(d, &r.0 .0);
        }
    }

    #[test]
    fn key_id_display_parses_back() {
        let id = PeerId::from(bytes::Bytes::from_static(&[7; 32]));
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!([7; 32], parsed.as_key_bytes().unwrap());
    }

    #[test]
    fn str_id_is_transparent() {
        let id = ObjectId::from("bafy-1");
        assert_eq!("\"bafy-1\"", serde_json::to_string(&id).unwrap());
        assert_eq!("bafy-1", id.to_string());
    }

    #[test]
    fn hash_parts_is_injective_over_boundaries() {
        assert_ne!(hash_parts(&[b"ab", b"c"]), hash_parts(&[b"a", b"bc"]));
        assert_eq!(hash_parts(&[b"ab", b"c"]), hash_parts(&[b"ab", b"c"]));
    }
}
