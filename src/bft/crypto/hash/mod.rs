//! Digest (fingerprinting) abstractions.
//!
//! The concrete backend is picked at compile time via the
//! `crypto_hash_*` feature flags; everywhere else in the crate only
//! the [`Digest`] type and the [`DigestScheme`] trait are used.

#[cfg(feature = "crypto_hash_ring_sha2")]
pub mod ring_sha2;

#[cfg(feature = "crypto_hash_blake3_blake3")]
pub mod blake3_impl;

#[cfg(feature = "crypto_hash_blake3_blake3")]
pub use self::blake3_impl::{Context, Digest};

#[cfg(all(feature = "crypto_hash_ring_sha2", not(feature = "crypto_hash_blake3_blake3")))]
pub use self::ring_sha2::{Context, Digest};

#[cfg(not(any(feature = "crypto_hash_ring_sha2", feature = "crypto_hash_blake3_blake3")))]
compile_error!("One of the crypto_hash_* features must be enabled.");

/// Capability abstracting over the concrete digest scheme used to
/// fingerprint requests, batches of updates and checkpoint state.
///
/// The consensus core never hashes data directly; it calls into a
/// `DigestScheme` so that different deployments may pick different
/// collision-resistance and performance trade-offs without touching
/// the protocol logic.
pub trait DigestScheme: Send + Sync {
    /// Computes the digest of an arbitrary byte slice.
    fn digest(&self, data: &[u8]) -> Digest;
}

/// The default [`DigestScheme`], using whichever backend was selected
/// through the `crypto_hash_*` feature flags.
#[derive(Copy, Clone, Default)]
pub struct DefaultDigestScheme;

impl DigestScheme for DefaultDigestScheme {
    fn digest(&self, data: &[u8]) -> Digest {
        Digest::from_data(data)
    }
}
