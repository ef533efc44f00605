use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::pipeline::{Orchestrator, PipelineError, TriggerKind, WorkItem};
use crate::scheduler::Scheduler;

pub const OVERLAP_REASON: &str = "previous run still in progress";

/// Main scheduler execution loop.
///
/// Sleeps until the next cron fire time and starts a run in the background.
/// A fire that lands while a run is still going is recorded as skipped.
pub async fn run_scheduler_loop(scheduler: Scheduler, orchestrator: Arc<Orchestrator>, items: Vec<WorkItem>) {
    if scheduler.is_empty() {
        info!("No schedules configured, scheduler idle");
        return;
    }
    info!(schedules = ?scheduler.expressions().collect::<Vec<_>>(), "Scheduler engine started");

    let items = Arc::new(items);
    let in_flight = Arc::new(Mutex::new(()));

    loop {
        let now = Utc::now();
        let Some(next) = scheduler.next_after(now) else {
            warn!("Schedules have no future fire times, scheduler stopping");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next.to_rfc3339(), "Next scheduled run");
        tokio::time::sleep(wait).await;

        fire(orchestrator.clone(), items.clone(), in_flight.clone()).await;
    }
}

/// Start one scheduled run unless another is in flight. Returns once the run
/// has been spawned or the skip has been recorded.
pub async fn fire(orchestrator: Arc<Orchestrator>, items: Arc<Vec<WorkItem>>, in_flight: Arc<Mutex<()>>) {
    let guard = match in_flight.clone().try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => {
            warn!("Scheduled run fired while previous run is still in progress");
            if let Err(e) = orchestrator.record_skip(TriggerKind::Schedule, OVERLAP_REASON).await {
                error!(error = %e, "Failed to record skipped run");
            }
            return;
        }
    };

    tokio::spawn(async move {
        let _guard = guard;
        match orchestrator.run(&items, TriggerKind::Schedule).await {
            Ok(record) => info!(run_id = %record.run_id, status = %record.status, "Scheduled run complete"),
            Err(PipelineError::HistoryUnsaved { record, source }) => {
                error!(run_id = %record.run_id, error = %source, "Scheduled run finished but was not saved")
            }
            Err(PipelineError::ReleaseUnsaved { record, source }) => {
                error!(run_id = %record.run_id, error = %source, "Scheduled run saved without its release record")
            }
            Err(e) => error!(error = %e, "Scheduled run failed"),
        }
    });
}
