//! Metrics reported by the ownership checks.
//!
//! Registration and export belong to the surrounding service, so the checks only talk to an injected
//! [`MetricSink`]. [`OwnershipMetrics`] is a lock free implementation backed by atomics.
//!
//! Reported metrics:
//!  - `idealStateOpsAborted`: ideal state operations aborted because of an ownership mismatch
//!  - `externalLoadOpsAborted`: external load operations aborted because of an ownership mismatch
//!  - `averageAbortProcessingTime`: time spent deciding and executing aborts
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

use crate::message::classifier::MutationClass;

pub trait MetricSink: Send + Sync {
    fn ops_aborted(&self, class: MutationClass);
    fn abort_processing_time(&self, elapsed: Duration);
}

#[derive(Debug, Default)]
pub struct OwnershipMetrics {
    ideal_state_ops_aborted: AtomicU64,
    external_load_ops_aborted: AtomicU64,
    abort_time_total_micros: AtomicU64,
    abort_time_samples: AtomicU64,
}

/// Point in time copy of [`OwnershipMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub ideal_state_ops_aborted: u64,
    pub external_load_ops_aborted: u64,
    /// None until the first sample
    pub average_abort_processing_time_ms: Option<f64>,
}

impl OwnershipMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ideal_state_ops_aborted(&self) -> u64 {
        self.ideal_state_ops_aborted.load(Ordering::Relaxed)
    }

    pub fn external_load_ops_aborted(&self) -> u64 {
        self.external_load_ops_aborted.load(Ordering::Relaxed)
    }

    pub fn average_abort_processing_time(&self) -> Option<Duration> {
        let samples = self.abort_time_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }

        let total = self.abort_time_total_micros.load(Ordering::Relaxed);
        Some(Duration::from_micros(total / samples))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ideal_state_ops_aborted: self.ideal_state_ops_aborted(),
            external_load_ops_aborted: self.external_load_ops_aborted(),
            average_abort_processing_time_ms: self
                .average_abort_processing_time()
                .map(|avg| avg.as_secs_f64() * 1000.0),
        }
    }
}

impl MetricSink for OwnershipMetrics {
    fn ops_aborted(&self, class: MutationClass) {
        let counter = match class {
            MutationClass::IdealState => &self.ideal_state_ops_aborted,
            MutationClass::ExternalLoad => &self.external_load_ops_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn abort_processing_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.abort_time_total_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.abort_time_samples.fetch_add(1, Ordering::Relaxed);
    }
}
