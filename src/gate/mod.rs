//! The changed bucket ownership gate.
//!
//! A [`StorageLink`] that synchronously checks every mutating command against the current bucket
//! ownership. A command sent by a distributor that, at the time of checking, does not own the target
//! bucket is answered with an aborted reply instead of reaching persistence. This prevents a stale
//! distributor from mutating a bucket that another distributor is now responsible for.
//!
//! Cluster state changes arriving through the chain are handed to the [`StateTransitionCoordinator`]
//! which swaps the ownership snapshot and drains the operations the change invalidated. The state
//! message continues down the chain only once that drain is done.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{event, Level};

use crate::{
    cluster::distribution::DistributionConfigBundle,
    config::{AbortSwitches, Config},
    coordinator::StateTransitionCoordinator,
    drain::PendingOperations,
    error::Result,
    link::{Disposition, MessageSender, StorageLink},
    message::{
        classifier::{classify, mutation_class, MutationClass},
        ResultCode, ReturnCode, StorageCommand, StorageMessage, StorageReply,
    },
    metrics::MetricSink,
    ownership::{
        snapshot::{Owner, OwnershipSnapshot},
        store::OwnershipStateStore,
    },
};

pub const ABORTED_MESSAGE: &str =
    "Operation aborted since its sending distributor no longer owns the bucket";

/// Answers commands with an aborted reply sent up the chain and accounts for it.
///
/// Shared by the inbound checks and the drain of a state transition.
pub struct AbortPath {
    up: Arc<dyn MessageSender>,
    metrics: Arc<dyn MetricSink>,
}

impl AbortPath {
    pub fn new(up: Arc<dyn MessageSender>, metrics: Arc<dyn MetricSink>) -> Self {
        Self { up, metrics }
    }

    /// Sends an aborted reply for `cmd`. Only mutating commands count towards the abort metrics.
    pub fn abort(&self, cmd: &StorageCommand) {
        let mut reply = cmd.make_reply();
        reply.result = ReturnCode::new(ResultCode::Aborted, ABORTED_MESSAGE);

        if let Some(class) = mutation_class(cmd.kind) {
            self.metrics.ops_aborted(class);
        }
        self.up.send(reply.into());
    }

    pub fn sample_processing_time(&self, elapsed: Duration) {
        self.metrics.abort_processing_time(elapsed);
    }
}

pub struct ChangedOwnershipGate {
    store: Arc<OwnershipStateStore>,
    switches: Arc<AbortSwitches>,
    coordinator: Arc<StateTransitionCoordinator>,
    abort_path: Arc<AbortPath>,
    up: Arc<dyn MessageSender>,
    down: Arc<dyn MessageSender>,
}

impl ChangedOwnershipGate {
    pub fn new(
        store: Arc<OwnershipStateStore>,
        switches: Arc<AbortSwitches>,
        coordinator: Arc<StateTransitionCoordinator>,
        abort_path: Arc<AbortPath>,
        up: Arc<dyn MessageSender>,
        down: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            store,
            switches,
            coordinator,
            abort_path,
            up,
            down,
        }
    }

    /// Wires a gate and its coordinator for the node described by `config`.
    ///
    /// The node starts without a cluster state, so nothing is checked until the first one arrives.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::ExecutorUnavailable`] if called outside of a tokio runtime
    pub fn from_config(
        config: &Config,
        distributions: Option<Arc<DistributionConfigBundle>>,
        up: Arc<dyn MessageSender>,
        down: Arc<dyn MessageSender>,
        pending: Arc<dyn PendingOperations>,
        metrics: Arc<dyn MetricSink>,
    ) -> Result<Self> {
        let store = Arc::new(OwnershipStateStore::new(OwnershipSnapshot::new(
            None,
            distributions.clone(),
            config.node_index,
        )));
        let switches = Arc::new(AbortSwitches::new(&config.ownership));
        let abort_path = Arc::new(AbortPath::new(up.clone(), metrics));
        let coordinator = Arc::new(StateTransitionCoordinator::new(
            store.clone(),
            switches.clone(),
            distributions,
            pending,
            abort_path.clone(),
            down.clone(),
        )?);

        Ok(Self::new(
            store,
            switches,
            coordinator,
            abort_path,
            up,
            down,
        ))
    }

    pub fn coordinator(&self) -> &Arc<StateTransitionCoordinator> {
        &self.coordinator
    }

    pub fn switches(&self) -> &Arc<AbortSwitches> {
        &self.switches
    }

    pub fn store(&self) -> &Arc<OwnershipStateStore> {
        &self.store
    }

    fn needs_checking(&self, class: MutationClass) -> bool {
        self.switches.aborting(class)
    }

    /// Whether the sender of `cmd` owns its bucket under the current snapshot.
    /// True when there is no ownership basis yet.
    fn sender_owns_bucket(&self, cmd: &StorageCommand) -> bool {
        let snapshot = self.store.current();
        if !snapshot.valid() {
            event!(
                Level::DEBUG,
                "No cluster state received yet, letting {} through unchecked",
                cmd.kind
            );
            return true;
        }

        let owner = snapshot.owner_of(&cmd.bucket);
        if owner == Owner::Node(cmd.source_index) {
            return true;
        }

        event!(
            Level::DEBUG,
            "Aborting {} {} to {} from distributor {}: owner is {:?} in state version {}",
            cmd.kind,
            cmd.id,
            cmd.bucket,
            cmd.source_index,
            owner,
            snapshot.baseline_state().version()
        );
        false
    }

    fn forward(&self, message: StorageMessage) -> Disposition {
        self.down.send(message);
        Disposition::Forward
    }
}

impl StorageLink for ChangedOwnershipGate {
    fn handle_inbound(&self, message: StorageMessage) -> Disposition {
        if let StorageMessage::SetSystemState(set_state) = &message {
            let bundle = set_state.bundle.clone();
            return match self
                .coordinator
                .on_cluster_state_changed(bundle, Some(message.clone()))
            {
                Ok(()) => Disposition::Deferred,
                Err(err) => {
                    // the transition is installed, only the drain is lost
                    event!(
                        Level::WARN,
                        "Unable to schedule the state transition drain: {}",
                        err
                    );
                    self.forward(message)
                }
            };
        }

        let class = match classify(&message).mutation() {
            Some((class, _)) => class,
            None => return self.forward(message),
        };
        if !self.needs_checking(class) {
            return self.forward(message);
        }

        match message {
            StorageMessage::Command(cmd) => {
                let started = Instant::now();
                if self.sender_owns_bucket(&cmd) {
                    return self.forward(cmd.into());
                }

                self.abort_path.abort(&cmd);
                self.abort_path.sample_processing_time(started.elapsed());
                Disposition::Abort
            }
            message => self.forward(message),
        }
    }

    fn handle_reply(&self, reply: StorageReply) {
        self.up.send(reply.into());
    }

    fn handle_close(&self) {
        self.coordinator.close();
    }
}
