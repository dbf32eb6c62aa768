//! Collection aliases used throughout the crate instead of reaching for
//! `std::collections` directly. `OrderedMap`/`OrderedSet` commit to
//! deterministic iteration order, which the binary image format (§6.1)
//! and the network remap tables depend on.

use std::collections::{BTreeMap, BTreeSet};

pub type Array<T> = Vec<T>;
pub type OrderedMap<K, V> = BTreeMap<K, V>;
pub type OrderedSet<T> = BTreeSet<T>;
