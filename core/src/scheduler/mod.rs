// Scheduling layer for deferred waits
//
// A deferred wait is parked here and resumed once its run settles:
// - LocalScheduler: in-process, one tokio task per wait
// - PgResumptionScheduler: persisted in deferred_waits, resumed by a
//   ResumptionWorker that may live in another process

mod local;
mod postgres;

pub use local::{LocalScheduler, ResumptionOutcome};
pub use postgres::{ParkedWait, PgResumptionScheduler, ResumptionWorker};

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::waiter::DeferredWait;

#[async_trait]
pub trait ResumptionScheduler: Send + Sync {
    /// Park `wait`. The returned id identifies the wait in the scheduler's
    /// outcomes and status queries.
    async fn register_resumption(&self, wait: DeferredWait) -> Result<Uuid>;
}
