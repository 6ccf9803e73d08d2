//! BLAKE3 digest implementation, backed by the `blake3` crate.
//!
//! This is the default hashing backend: it is noticeably faster than
//! `ring`'s SHA-256 on the batch digests computed over request payloads
//! and checkpoint state.

use std::cmp::Eq;
use std::hash::{Hash, Hasher};

use crate::bft::error::*;

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize, Serializer, Deserializer};
#[cfg(feature = "serialize_serde")]
use serde::de::Error as SerdeError;

pub struct Context(blake3::Hasher);

impl Context {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finalize())
    }
}

#[derive(Copy, Clone)]
pub struct Digest(blake3::Hash);

impl Digest {
    pub const LENGTH: usize = blake3::OUT_LEN;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length")
                .wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(blake3::Hash::from(inner)))
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Digest {}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0.as_bytes()[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(feature = "serialize_serde")]
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0.as_bytes())
    }
}

#[cfg(feature = "serialize_serde")]
impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(deserializer)?;
        Digest::from_bytes(bytes).map_err(D::Error::custom)
    }
}
