//! The bulk control-plane task worker: pops one [`BulkTask`] at a time off the Redis
//! queue and applies its action to every job id in it, one job at a time, publishing the
//! same event a single-job action would (spec §4.10 "Bulk variants ... the caller observes
//! outcomes via the event stream").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use ingest_engine::models::backends::{events, jobs as job_store};
use ingest_engine::models::{BulkAction, BulkTask, JobEvent, BULK_TASK_QUEUE};
use ingest_engine::utils::{ApiError, Shared};

/// How long a single `BRPOP` waits before looping back around to check nothing else died
const POP_TIMEOUT_SECONDS: u64 = 5;

/// One bulk-task consumer; any number of these can run against the same queue, since
/// `BRPOP` hands each waiting consumer a distinct element
pub struct BulkWorker {
    worker_id: String,
    shared: Arc<Shared>,
}

impl BulkWorker {
    #[must_use]
    pub fn new(worker_id: String, shared: Arc<Shared>) -> Self {
        BulkWorker { worker_id, shared }
    }

    /// Pop-and-apply forever; never returns short of a panic
    pub async fn start(self) {
        tracing::info!(worker_id = %self.worker_id, "starting bulk control-plane worker");
        loop {
            match self.pop_next().await {
                Ok(Some(task)) => self.apply(task).await,
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(worker_id = %self.worker_id, %error, "failed to pop bulk task");
                    tokio::time::sleep(Duration::from_secs(POP_TIMEOUT_SECONDS)).await;
                }
            }
        }
    }

    /// Block on the Redis queue for at most [`POP_TIMEOUT_SECONDS`], returning the next
    /// task if one arrived
    async fn pop_next(&self) -> Result<Option<BulkTask>, ApiError> {
        let mut conn = self.shared.redis.get().await?;
        let popped: Option<(String, String)> = conn
            .brpop(BULK_TASK_QUEUE, POP_TIMEOUT_SECONDS as f64)
            .await?;
        let Some((_, payload)) = popped else {
            return Ok(None);
        };
        let task: BulkTask = serde_json::from_str(&payload)?;
        Ok(Some(task))
    }

    /// Apply one bulk task's action to every job id it names, independently, so one job's
    /// failure (already-terminal, wrong owner, illegal transition) never stops the rest
    async fn apply(&self, task: BulkTask) {
        tracing::info!(
            worker_id = %self.worker_id,
            action = %task.action,
            jobs = task.job_ids.len(),
            "applying bulk control task"
        );
        for job_id in task.job_ids.clone() {
            if let Err(error) = self.apply_one(&task, job_id).await {
                tracing::warn!(worker_id = %self.worker_id, %job_id, %error, "bulk action failed for job");
            }
        }
    }

    /// Apply the bulk action to a single job id and publish its resulting event, mirroring
    /// what the single-job control route does (spec §4.10, §6 `POST /jobs/{id}/{action}`)
    async fn apply_one(&self, task: &BulkTask, job_id: Uuid) -> Result<(), ApiError> {
        if task.action == BulkAction::Delete {
            let job = job_store::get(job_id, &self.shared).await?;
            if !task.is_admin && job.owner != task.owner {
                return Err(ingest_engine::bad_internal!(format!(
                    "job {job_id} not owned by {}",
                    task.owner
                )));
            }
            let dir = std::path::Path::new(&self.shared.config.job_data_dir).join(job_id.to_string());
            let _ = tokio::fs::remove_dir_all(&dir).await;
            job_store::delete(job_id, &self.shared).await?;
            let event = JobEvent::deleted(job_id, job.status, Utc::now());
            events::publish(&event, &self.shared).await?;
            return Ok(());
        }

        let action = task
            .action
            .as_job_action()
            .expect("every non-delete BulkAction maps to a JobAction");
        let job = job_store::apply_action(job_id, &task.owner, task.is_admin, action, &self.shared).await?;
        let event = JobEvent::status_changed(job_id, job.status, Utc::now());
        events::publish(&event, &self.shared).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_maps_to_no_job_action() {
        assert!(BulkAction::Delete.as_job_action().is_none());
    }

    #[test]
    fn every_other_action_maps_to_a_job_action() {
        for action in [
            BulkAction::Start,
            BulkAction::Pause,
            BulkAction::Stop,
            BulkAction::Resume,
            BulkAction::Retry,
        ] {
            assert!(action.as_job_action().is_some());
        }
    }
}
