//! Record keys and their routing digest.

use std::fmt;

use ripemd::{Digest, Ripemd160};

use crate::encoder::VecSink;
use crate::error::{ProtoError, Result};
use crate::protocol::DIGEST_SIZE;
use crate::value::Value;

/// Number of partitions a namespace is split into.
pub const PARTITIONS: u32 = 4096;

/// A record key.
///
/// The digest is the identity the server routes and stores by; namespace and
/// set travel alongside it, and the user key only when the policy asks for it.
#[derive(Clone, PartialEq)]
pub struct Key {
    /// Namespace.
    pub namespace: String,
    /// Set name (may be empty).
    pub set_name: String,
    /// RIPEMD-160 digest.
    pub digest: [u8; DIGEST_SIZE],
    /// Original user key, if known.
    pub user_key: Option<Value>,
}

impl Key {
    /// Build a key and compute its digest.
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Self> {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = compute_digest(&set_name, &user_key)?;
        Ok(Self {
            namespace: namespace.into(),
            set_name,
            digest,
            user_key: Some(user_key),
        })
    }

    /// Build a key from a digest computed elsewhere.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            digest,
            user_key: None,
        }
    }

    /// Partition the key belongs to.
    pub fn partition_id(&self) -> u32 {
        partition_id(&self.digest)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.set_name)?;
        match &self.user_key {
            Some(v) => write!(f, "{v:?}"),
            None => {
                for b in &self.digest[..4] {
                    write!(f, "{b:02x}")?;
                }
                write!(f, "..")
            }
        }
    }
}

/// Partition id of a digest: first four bytes little-endian, modulo 4096.
pub fn partition_id(digest: &[u8; DIGEST_SIZE]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&digest[..4]);
    u32::from_le_bytes(raw) % PARTITIONS
}

/// RIPEMD-160 over set name, the key's particle type and its serialized bytes.
pub fn compute_digest(set_name: &str, user_key: &Value) -> Result<[u8; DIGEST_SIZE]> {
    if !user_key.is_valid_key() {
        return Err(ProtoError::InvalidValue {
            reason: format!("{user_key:?} cannot be used as a key"),
        });
    }
    let mut key_bytes = VecSink::new();
    user_key.write(&mut key_bytes);

    let mut hasher = Ripemd160::new();
    hasher.update(set_name.as_bytes());
    hasher.update([user_key.particle_type()]);
    hasher.update(key_bytes.as_slice());

    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}
