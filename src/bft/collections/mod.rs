//! This module is used to provide common collection types, that
//! are used throughout the consensus core. In particular, hash map
//! and hash set aliases with a configurable hashing backend, as well
//! as an insertion-ordered map used by the out-of-order message
//! buffers.

use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

use linked_hash_map::LinkedHashMap;

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
type RandomState = std::collections::hash_map::RandomState;

/// A `HashMap`, using a possibly non-cryptographic hasher, configured
/// via the `collections_randomstate_*` feature flags.
pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;

/// A `HashSet`, using a possibly non-cryptographic hasher, configured
/// via the `collections_randomstate_*` feature flags.
pub type HashSet<K> = StdHashSet<K, RandomState>;

/// An insertion-ordered map, used to keep track of out-of-order
/// protocol messages in the sequence they arrived, while still
/// allowing lookup by key.
pub type OrderedMap<K, V> = LinkedHashMap<K, V>;
