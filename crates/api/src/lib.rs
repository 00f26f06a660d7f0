#![deny(missing_docs)]
//! Heart API contains the heart module traits and the basic types required
//! to define the api of those traits.
//!
//! If you want to run a heart account, please see the heart crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) mod serde_bytes_base64 {
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    pub fn deserialize<'de, D, T: From<bytes::Bytes>>(
        deserializer: D,
    ) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| bytes::Bytes::from(v).into())
            .map_err(serde::de::Error::custom)
    }
}

pub mod block;
pub mod builder;
pub mod change;
pub mod config;
pub mod event;
pub mod kv;
pub mod remote;
pub mod transport;

pub mod doc;

mod error;
pub use error::*;

pub mod id;
pub use id::{hash_parts, AccountId, ChangeId, ObjectId, PeerId, SessionId, SpaceId};

mod timestamp;
pub use timestamp::*;

mod domain;
pub use domain::*;
