//! SLIP-0010 hardened derivation over ed25519.

use heart_api::*;
use hmac::{Hmac, Mac};
use sha2::Sha512;

const HARDENED: u32 = 0x8000_0000;

/// A derived key and its chain code.
#[derive(Clone)]
pub(crate) struct ExtKey {
    pub key: [u8; 32],
    chain: [u8; 32],
}

fn split(i: &[u8]) -> ExtKey {
    let mut key = [0_u8; 32];
    let mut chain = [0_u8; 32];
    key.copy_from_slice(&i[..32]);
    chain.copy_from_slice(&i[32..64]);
    ExtKey { key, chain }
}

fn hmac512(key: &[u8], parts: &[&[u8]]) -> HeartResult<[u8; 64]> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .map_err(|_| HeartError::other("hmac key"))?;
    for p in parts {
        mac.update(p);
    }
    let mut out = [0_u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

impl ExtKey {
    /// The master key of a seed.
    pub fn master(seed: &[u8]) -> HeartResult<Self> {
        Ok(split(&hmac512(b"ed25519 seed", &[seed])?))
    }

    /// Derive a hardened child. Ed25519 only supports hardened children,
    /// so the index is always hardened.
    pub fn child(&self, index: u32) -> HeartResult<Self> {
        let index = (index | HARDENED).to_be_bytes();
        Ok(split(&hmac512(&self.chain, &[&[0], &self.key, &index])?))
    }

    /// Follow a path of hardened indices.
    pub fn derive_path(seed: &[u8], path: &[u32]) -> HeartResult<Self> {
        let mut key = Self::master(seed)?;
        for index in path {
            key = key.child(*index)?;
        }
        Ok(key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Test vector 1 for ed25519 from the SLIP-0010 document.
    #[test]
    fn slip10_vector_1() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let m = ExtKey::master(&seed).unwrap();
        assert_eq!(
            "2b4be7f19ee27bbf30c667b642d5f4aa69fd169872f8fc3059c08ebae2eb19e7",
            hex::encode(m.key)
        );
        assert_eq!(
            "90046a93de5380a72b5e45010748567d5ea02bbf6522f979e05c0d8d8ca9fffb",
            hex::encode(m.chain)
        );
        let c = ExtKey::derive_path(&seed, &[0]).unwrap();
        assert_eq!(
            "68e0fe46dfb67e368c75379acec591dad19df3cde26e63b93a8e704f1dade7a3",
            hex::encode(c.key)
        );
    }
}
