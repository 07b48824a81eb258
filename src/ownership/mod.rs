//! Bucket ownership snapshots, the store holding the current one and the abort predicate built
//! whenever the current snapshot is replaced.
pub mod predicate;
pub mod snapshot;
pub mod store;
