//! Trigger a downstream run against the in-memory store and wait on it,
//! once in place and once through the local scheduler.

use relay_core::scheduler::LocalScheduler;
use relay_core::store::{MemoryRunStore, RunStore};
use relay_core::{Outcome, RunState, TriggerController, TriggerRequest};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRunStore::new());
    store.register_workflow("downstream").await?;

    let (scheduler, mut outcomes) = LocalScheduler::new(store.clone());
    let controller = TriggerController::new(store.clone(), "http://localhost:8080")
        .with_scheduler(Arc::new(scheduler));

    // Stand-in for the execution engine: finish every queued run shortly after it appears
    let engine = store.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let runs = engine
                .list_runs(relay_core::RunListFilter {
                    workflow_id: "downstream".to_string(),
                    state: Some(RunState::Queued),
                    limit: None,
                })
                .await
                .unwrap_or_default();
            for run in runs {
                let _ = engine.set_state("downstream", &run.run_id, RunState::Success).await;
            }
        }
    });

    let outcome = controller
        .trigger(
            TriggerRequest::new("downstream")
                .conf(&serde_json::json!({"source": "demo"}))
                .wait_for_completion(true)
                .poll_interval(Duration::from_millis(100)),
        )
        .await?;
    if let Outcome::Completed(run) = &outcome {
        println!("Blocking wait finished: {} is {}", run.run_id, run.state);
        println!("{}", controller.extra_link(&run.identity()).url);
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = controller
        .trigger(
            TriggerRequest::new("downstream")
                .wait_for_completion(true)
                .deferred(true)
                .poll_interval(Duration::from_millis(100)),
        )
        .await?;
    if let Outcome::Deferred { wait_id, wait } = outcome {
        println!("Parked wait {} for {}", wait_id, wait.key.run_id);
        if let Some(resumed) = outcomes.recv().await {
            let run = resumed.result?;
            println!("Deferred wait finished: {} is {}", run.run_id, run.state);
        }
    }

    Ok(())
}
