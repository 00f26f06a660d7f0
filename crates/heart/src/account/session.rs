//! Opaque session tokens for the external rpc api.
//!
//! A token is `<id>.<mac>` where the mac is an hmac of the id under a key
//! that lives only in this process. Closing a session forgets the id.

use heart_api::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Mutex;

pub(super) struct Sessions {
    key: [u8; 32],
    ids: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Sessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessions")
            .field("open", &self.ids().len())
            .finish()
    }
}

fn mac(key: &[u8; 32], id: &str) -> HeartResult<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| HeartError::other("session key"))?;
    mac.update(id.as_bytes());
    Ok(mac)
}

fn invalid() -> HeartError {
    HeartError::kind(ErrorKind::Restricted, "invalid session token")
}

impl Sessions {
    pub fn new() -> Self {
        Self {
            key: rand::random(),
            ids: Mutex::new(HashSet::new()),
        }
    }

    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn create(&self) -> HeartResult<String> {
        let id = hex::encode(rand::random::<[u8; 16]>());
        let tag = hex::encode(mac(&self.key, &id)?.finalize().into_bytes());
        self.ids().insert(id.clone());
        Ok(format!("{id}.{tag}"))
    }

    /// The session id of a valid token.
    fn check(&self, token: &str) -> HeartResult<String> {
        let (id, tag) = token.split_once('.').ok_or_else(invalid)?;
        let tag = hex::decode(tag).map_err(|_| invalid())?;
        mac(&self.key, id)?
            .verify_slice(&tag)
            .map_err(|_| invalid())?;
        Ok(id.to_string())
    }

    pub fn validate(&self, token: &str) -> HeartResult<()> {
        let id = self.check(token)?;
        if self.ids().contains(&id) {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    pub fn close(&self, token: &str) -> HeartResult<()> {
        let id = self.check(token)?;
        if self.ids().remove(&id) {
            Ok(())
        } else {
            Err(HeartError::not_found("session"))
        }
    }

    pub fn close_all(&self) {
        self.ids().clear();
    }
}
