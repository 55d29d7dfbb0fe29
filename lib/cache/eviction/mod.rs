//! Cache eviction policies.

pub mod lru;
