pub mod bucket;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod executor;
pub mod gate;
pub mod link;
pub mod message;
pub mod metrics;
pub mod ownership;
pub mod telemetry;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
