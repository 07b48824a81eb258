//! Cluster membership (who is up) and distribution (who should own what)
pub mod distribution;
pub mod state;
