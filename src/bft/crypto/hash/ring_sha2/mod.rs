//! SHA-256 digest implementation, backed by `ring`.

use std::cmp::Eq;
use std::hash::{Hash, Hasher};

use ring::digest::{
    self,
    SHA256,
    SHA256_OUTPUT_LEN,
};

use crate::bft::error::*;

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize, Serializer, Deserializer};
#[cfg(feature = "serialize_serde")]
use serde::de::Error as SerdeError;

/// Incremental digest context; not yet used by the single-shot API below,
/// kept for parity with streaming digest backends.
pub struct Context(digest::Context);

impl Context {
    pub fn new() -> Self {
        Self(digest::Context::new(&SHA256))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        let d = self.0.finish();
        Digest::from_bytes_unchecked(d.as_ref())
    }
}

#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length")
                .wrapped(ErrorKind::CryptoHash);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }

    pub fn from_data(data: &[u8]) -> Self {
        let d = digest::digest(&SHA256, data);
        Self::from_bytes_unchecked(d.as_ref())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Digest {}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(feature = "serialize_serde")]
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0[..])
    }
}

#[cfg(feature = "serialize_serde")]
impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(deserializer)?;
        Digest::from_bytes(bytes).map_err(D::Error::custom)
    }
}
