use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::ResumptionScheduler;
use crate::errors::Result;
use crate::store::RunStore;
use crate::types::RunRecord;
use crate::waiter::{complete_deferred, DeferredWait, ResumptionKey, RunStateWatcher};

/// Final result of a resumed wait.
#[derive(Debug)]
pub struct ResumptionOutcome {
    pub wait_id: Uuid,
    pub key: ResumptionKey,
    pub result: Result<RunRecord>,
}

/// In-process scheduler. Each wait is watched on its own tokio task and its
/// outcome is delivered on the channel returned by [`LocalScheduler::new`].
pub struct LocalScheduler<S: RunStore> {
    store: Arc<S>,
    outcomes: mpsc::UnboundedSender<ResumptionOutcome>,
    shutdown: CancellationToken,
}

impl<S: RunStore> LocalScheduler<S> {
    pub fn new(store: Arc<S>) -> (Self, mpsc::UnboundedReceiver<ResumptionOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            outcomes: tx,
            shutdown: CancellationToken::new(),
        };
        (scheduler, rx)
    }

    /// Abandon every parked wait. Each reports `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl<S: RunStore> ResumptionScheduler for LocalScheduler<S> {
    async fn register_resumption(&self, wait: DeferredWait) -> Result<Uuid> {
        let wait_id = Uuid::new_v4();
        let store = self.store.clone();
        let outcomes = self.outcomes.clone();
        let cancel = self.shutdown.child_token();

        info!(
            %wait_id,
            workflow_id = %wait.key.workflow_id,
            run_id = %wait.key.run_id,
            "Parked deferred wait"
        );

        tokio::spawn(async move {
            let watcher = RunStateWatcher::new(store.clone());
            let result = match watcher.watch(&wait, &cancel).await {
                Ok(event) => complete_deferred(store.as_ref(), &wait, &event).await,
                Err(e) => Err(e),
            };

            if outcomes
                .send(ResumptionOutcome {
                    wait_id,
                    key: wait.key,
                    result,
                })
                .is_err()
            {
                debug!("Outcome receiver dropped");
            }
        });

        Ok(wait_id)
    }
}
