//! Applies cluster state and distribution changes to the ownership snapshot.
//!
//! Each change builds a new [`OwnershipSnapshot`] from the latest inputs and installs it in the
//! [`OwnershipStateStore`]. The (old, new) pair then becomes an [`AbortPredicate`] that a drain job,
//! running on the dedicated [`SequentialExecutor`], uses to abort every queued operation the change
//! invalidated. Drain jobs run strictly in transition order.
//!
//! The calling thread only pays for the snapshot swap. Aborting queued operations is O(queue size)
//! and never runs on it.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tracing::{event, instrument, Level};

use crate::{
    cluster::{distribution::DistributionConfigBundle, state::ClusterStateBundle},
    config::AbortSwitches,
    drain::PendingOperations,
    error::Result,
    executor::SequentialExecutor,
    gate::AbortPath,
    link::MessageSender,
    message::StorageMessage,
    ownership::{predicate::AbortPredicate, snapshot::OwnershipSnapshot, store::OwnershipStateStore},
};

/// Latest known inputs of the ownership snapshot
#[derive(Debug, Default)]
struct Inputs {
    state: Option<Arc<ClusterStateBundle>>,
    distributions: Option<Arc<DistributionConfigBundle>>,
}

pub struct StateTransitionCoordinator {
    store: Arc<OwnershipStateStore>,
    switches: Arc<AbortSwitches>,
    executor: SequentialExecutor,
    pending: Arc<dyn PendingOperations>,
    abort_path: Arc<AbortPath>,
    down: Arc<dyn MessageSender>,
    /// Also serializes transitions, so drain jobs are enqueued in install order
    inputs: Mutex<Inputs>,
}

impl StateTransitionCoordinator {
    /// # Errors
    /// Returns [`crate::error::Error::ExecutorUnavailable`] if called outside of a tokio runtime
    pub fn new(
        store: Arc<OwnershipStateStore>,
        switches: Arc<AbortSwitches>,
        distributions: Option<Arc<DistributionConfigBundle>>,
        pending: Arc<dyn PendingOperations>,
        abort_path: Arc<AbortPath>,
        down: Arc<dyn MessageSender>,
    ) -> Result<Self> {
        let state = store.current().cluster_state_bundle().cloned();
        Ok(Self {
            store,
            switches,
            executor: SequentialExecutor::new("ownership-state-sync")?,
            pending,
            abort_path,
            down,
            inputs: Mutex::new(Inputs {
                state,
                distributions,
            }),
        })
    }

    fn acquire_lock(&self) -> MutexGuard<Inputs> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the ownership implied by `bundle` and schedules the drain of operations it invalidated.
    ///
    /// `deferred` (usually the state change message itself) is sent down the chain once the drain is done.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::ExecutorUnavailable`] after [`Self::close`]. The new snapshot
    /// is installed regardless, only the drain and the deferred message are dropped.
    #[instrument(level = "debug", skip_all, fields(version = bundle.version()))]
    pub fn on_cluster_state_changed(
        &self,
        bundle: Arc<ClusterStateBundle>,
        deferred: Option<StorageMessage>,
    ) -> Result<()> {
        let mut inputs = self.acquire_lock();
        inputs.state = Some(bundle);
        self.transition(&inputs, deferred)
    }

    /// Same as [`Self::on_cluster_state_changed`] for a new distribution config
    #[instrument(level = "debug", skip_all)]
    pub fn on_distribution_changed(&self, distributions: Arc<DistributionConfigBundle>) -> Result<()> {
        let mut inputs = self.acquire_lock();
        inputs.distributions = Some(distributions);
        self.transition(&inputs, None)
    }

    /// Records a cluster state published outside of the message chain. Nothing is installed
    /// until [`Self::reload_cluster_state`] is called.
    pub fn record_cluster_state(&self, bundle: Arc<ClusterStateBundle>) {
        self.acquire_lock().state = Some(bundle);
    }

    /// Re-derives the snapshot from the latest recorded inputs. Nothing is drained.
    pub fn reload_cluster_state(&self) {
        let inputs = self.acquire_lock();
        self.install(&inputs);
    }

    fn install(&self, inputs: &Inputs) -> AbortPredicate {
        let (old, new) = self.store.transition(|old| {
            OwnershipSnapshot::new(
                inputs.state.clone(),
                inputs.distributions.clone(),
                old.node_index(),
            )
        });
        log_transition(&old, &new);

        AbortPredicate::build(old, new)
    }

    fn transition(&self, inputs: &Inputs, deferred: Option<StorageMessage>) -> Result<()> {
        let predicate = self.install(inputs);

        if self.switches.aborting_on_state_change() && predicate.may_abort() {
            let job = DrainJob {
                predicate,
                pending: self.pending.clone(),
                abort_path: self.abort_path.clone(),
                down: self.down.clone(),
                deferred,
            };
            return self.executor.execute(move || job.run());
        }

        // still goes through the executor so it can't overtake the drain of a previous transition
        match deferred {
            Some(message) => {
                let down = self.down.clone();
                self.executor.execute(move || down.send(message))
            }
            None => Ok(()),
        }
    }

    /// Waits for every transition scheduled so far to be fully processed
    pub async fn sync(&self) -> Result<()> {
        self.executor.sync().await
    }

    /// Stops scheduling drains. Drains already scheduled still run.
    pub fn close(&self) {
        self.executor.shutdown();
    }

    /// Closes and waits for the scheduled drains to finish
    pub async fn join(&self) {
        self.executor.join().await;
    }
}

fn log_transition(old: &OwnershipSnapshot, new: &OwnershipSnapshot) {
    let describe = |snapshot: &OwnershipSnapshot| match snapshot.cluster_state_bundle() {
        Some(bundle) => bundle.baseline().to_string(),
        None => String::from("<none>"),
    };

    event!(
        Level::DEBUG,
        "Ownership transition {} -> {}: '{}' -> '{}'",
        old.generation(),
        new.generation(),
        describe(old),
        describe(new)
    );
}

struct DrainJob {
    predicate: AbortPredicate,
    pending: Arc<dyn PendingOperations>,
    abort_path: Arc<AbortPath>,
    down: Arc<dyn MessageSender>,
    deferred: Option<StorageMessage>,
}

impl DrainJob {
    #[instrument(name = "coordinator::drain", level = "debug", skip_all, fields(generation = self.predicate.new_snapshot().generation()))]
    fn run(self) {
        let started = Instant::now();
        let aborted = self.pending.abort_matching(&self.predicate);
        for cmd in aborted.iter() {
            self.abort_path.abort(cmd);
        }
        let elapsed = started.elapsed();
        self.abort_path.sample_processing_time(elapsed);

        event!(
            Level::DEBUG,
            "Aborted {} queued operations in {:?}",
            aborted.len(),
            elapsed
        );

        if let Some(message) = self.deferred {
            self.down.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::Arc};

    use crate::{
        bucket::{Bucket, BucketId, BucketSpace},
        cluster::{
            distribution::{Distribution, DistributionConfigBundle},
            state::ClusterStateBundle,
        },
        config::{AbortSwitches, OwnershipConfig},
        drain::InMemoryOperationQueue,
        gate::AbortPath,
        link::mock::RecordingSender,
        message::{CommandKind, SetSystemState, StorageCommand, StorageMessage},
        metrics::OwnershipMetrics,
        ownership::{
            snapshot::{Owner, OwnershipSnapshot},
            store::OwnershipStateStore,
        },
    };

    use super::StateTransitionCoordinator;

    struct Fixture {
        coordinator: StateTransitionCoordinator,
        store: Arc<OwnershipStateStore>,
        switches: Arc<AbortSwitches>,
        queue: Arc<InMemoryOperationQueue>,
        up: Arc<RecordingSender>,
        down: Arc<RecordingSender>,
        metrics: Arc<OwnershipMetrics>,
    }

    fn distributions(redundancy: u16) -> Arc<DistributionConfigBundle> {
        Arc::new(DistributionConfigBundle::from_default(Distribution::new(
            redundancy, redundancy,
        )))
    }

    fn fixture() -> Fixture {
        let store = Arc::new(OwnershipStateStore::new(OwnershipSnapshot::new(
            None,
            Some(distributions(1)),
            0,
        )));
        let switches = Arc::new(AbortSwitches::default());
        let queue = Arc::new(InMemoryOperationQueue::new());
        let up = Arc::new(RecordingSender::new());
        let down = Arc::new(RecordingSender::new());
        let metrics = Arc::new(OwnershipMetrics::new());
        let coordinator = StateTransitionCoordinator::new(
            store.clone(),
            switches.clone(),
            Some(distributions(1)),
            queue.clone(),
            Arc::new(AbortPath::new(up.clone(), metrics.clone())),
            down.clone(),
        )
        .unwrap();

        Fixture {
            coordinator,
            store,
            switches,
            queue,
            up,
            down,
            metrics,
        }
    }

    fn bundle(state: &str) -> Arc<ClusterStateBundle> {
        Arc::new(ClusterStateBundle::from_str(state).unwrap())
    }

    fn state_message(id: u64, state: &str) -> StorageMessage {
        StorageMessage::SetSystemState(SetSystemState {
            id,
            bundle: bundle(state),
        })
    }

    fn enqueue_puts(queue: &InMemoryOperationQueue, count: u64) {
        for location in 0..count {
            queue.push(StorageCommand::new(
                location,
                CommandKind::Put,
                Bucket::new(BucketSpace::Default, BucketId::new(16, location)),
                0,
            ));
        }
    }

    #[tokio::test]
    async fn first_state_installs_without_draining() {
        let fixture = fixture();
        enqueue_puts(&fixture.queue, 20);
        let message = state_message(1, "version:1 distributor:2 storage:1");

        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:2 storage:1"), Some(message.clone()))
            .unwrap();
        // installed before the call returns
        assert!(fixture.store.current().valid());

        fixture.coordinator.sync().await.unwrap();
        assert_eq!(fixture.queue.len(), 20);
        assert!(fixture.up.is_empty());
        assert_eq!(fixture.down.take(), vec![message]);
        assert_eq!(fixture.metrics.average_abort_processing_time(), None);
    }

    #[tokio::test]
    async fn drain_aborts_operations_on_moved_buckets() {
        let fixture = fixture();
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:2 storage:1"), None)
            .unwrap();
        enqueue_puts(&fixture.queue, 200);
        let old = fixture.store.current();

        let message = state_message(2, "version:2 distributor:2 .1.s:d storage:1");
        fixture
            .coordinator
            .on_cluster_state_changed(
                bundle("version:2 distributor:2 .1.s:d storage:1"),
                Some(message.clone()),
            )
            .unwrap();
        fixture.coordinator.sync().await.unwrap();

        let expected: Vec<u64> = (0..200)
            .filter(|location| {
                let bucket = Bucket::new(BucketSpace::Default, BucketId::new(16, *location));
                old.owner_of(&bucket) == Owner::Node(1)
            })
            .collect();
        assert!(!expected.is_empty());

        let aborted: Vec<u64> = fixture
            .up
            .take_aborted_replies()
            .into_iter()
            .map(|reply| reply.id)
            .collect();
        assert_eq!(aborted, expected);
        assert_eq!(fixture.queue.len(), 200 - expected.len());
        assert_eq!(
            fixture.metrics.external_load_ops_aborted(),
            expected.len() as u64
        );
        assert!(fixture.metrics.average_abort_processing_time().is_some());
        // the state message follows the drain
        assert_eq!(fixture.down.take(), vec![message]);
    }

    #[tokio::test]
    async fn drain_leaves_non_mutating_operations_queued() {
        let fixture = fixture();
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:2 storage:1"), None)
            .unwrap();
        let bucket = Bucket::new(BucketSpace::Default, BucketId::new(16, 4));
        for (id, kind) in [CommandKind::Get, CommandKind::Visit, CommandKind::Stat]
            .into_iter()
            .enumerate()
        {
            fixture
                .queue
                .push(StorageCommand::new(id as u64, kind, bucket, 0));
        }

        // no distributor is left to own anything
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:2 distributor:2 .0.s:d .1.s:d storage:1"), None)
            .unwrap();
        fixture.coordinator.sync().await.unwrap();

        assert!(fixture.up.is_empty());
        assert_eq!(fixture.queue.len(), 3);
        assert_eq!(fixture.metrics.external_load_ops_aborted(), 0);
        assert_eq!(fixture.metrics.ideal_state_ops_aborted(), 0);
    }

    #[tokio::test]
    async fn draining_can_be_disabled() {
        let fixture = fixture();
        fixture.switches.configure(&OwnershipConfig {
            abort_queued_and_pending_on_state_change: false,
            abort_mutating_ideal_state_ops: true,
            abort_mutating_external_load_ops: true,
        });
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:2 storage:1"), None)
            .unwrap();
        enqueue_puts(&fixture.queue, 50);

        let message = state_message(2, "version:2 distributor:2 .0.s:d .1.s:d storage:1");
        fixture
            .coordinator
            .on_cluster_state_changed(
                bundle("version:2 distributor:2 .0.s:d .1.s:d storage:1"),
                Some(message.clone()),
            )
            .unwrap();
        fixture.coordinator.sync().await.unwrap();

        assert_eq!(fixture.queue.len(), 50);
        assert!(fixture.up.is_empty());
        assert_eq!(fixture.down.take(), vec![message]);
        assert_eq!(fixture.store.current().baseline_state().version(), 2);
    }

    #[tokio::test]
    async fn state_messages_keep_their_order() {
        let fixture = fixture();
        let mut sent = Vec::new();
        for version in 1..=20u32 {
            let state = if version % 2 == 0 {
                format!("version:{} distributor:3 storage:1", version)
            } else {
                format!("version:{} distributor:3 .{}.s:d storage:1", version, version % 3)
            };
            let message = state_message(version as u64, &state);
            sent.push(message.clone());
            fixture
                .coordinator
                .on_cluster_state_changed(bundle(&state), Some(message))
                .unwrap();
            enqueue_puts(&fixture.queue, 10);
        }

        fixture.coordinator.sync().await.unwrap();
        assert_eq!(fixture.down.take(), sent);
    }

    #[tokio::test]
    async fn distribution_change_drains_like_a_state_change() {
        let fixture = fixture();
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:1 storage:3"), None)
            .unwrap();
        enqueue_puts(&fixture.queue, 30);

        // the local storage node goes down
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:2 distributor:1 storage:3 .0.s:d"), None)
            .unwrap();
        fixture.coordinator.sync().await.unwrap();
        assert_eq!(fixture.up.take_aborted_replies().len(), 30);

        enqueue_puts(&fixture.queue, 30);
        let generation = fixture.store.current().generation();
        fixture
            .coordinator
            .on_distribution_changed(distributions(2))
            .unwrap();
        fixture.coordinator.sync().await.unwrap();

        let current = fixture.store.current();
        assert!(current.generation() > generation);
        assert_eq!(
            current
                .distributions()
                .unwrap()
                .bucket_space_distribution(BucketSpace::Default)
                .redundancy,
            2
        );
        // storage node 0 is still down, everything queued is aborted again
        assert_eq!(fixture.up.take_aborted_replies().len(), 30);
    }

    #[tokio::test]
    async fn reload_installs_recorded_state_without_draining() {
        let fixture = fixture();
        fixture
            .coordinator
            .on_cluster_state_changed(bundle("version:1 distributor:2 storage:1"), None)
            .unwrap();
        enqueue_puts(&fixture.queue, 20);

        fixture
            .coordinator
            .record_cluster_state(bundle("version:5 distributor:2 .0.s:d .1.s:d storage:1"));
        assert_eq!(fixture.store.current().baseline_state().version(), 1);

        fixture.coordinator.reload_cluster_state();
        fixture.coordinator.sync().await.unwrap();
        assert_eq!(fixture.store.current().baseline_state().version(), 5);
        assert_eq!(fixture.queue.len(), 20);
        assert!(fixture.up.is_empty());
    }

    #[tokio::test]
    async fn closed_coordinator_still_installs() {
        let fixture = fixture();
        fixture.coordinator.join().await;

        let result = fixture.coordinator.on_cluster_state_changed(
            bundle("version:1 distributor:1 storage:1"),
            Some(state_message(1, "version:1 distributor:1 storage:1")),
        );
        assert!(result.is_err());
        assert_eq!(fixture.store.current().baseline_state().version(), 1);
        assert!(fixture.down.is_empty());
    }
}
