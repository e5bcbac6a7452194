use crate::entities;
use crate::errors::FloodgateError;
use crate::storage;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet,
    QueryFilter, Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    db: DatabaseConnection,
    audit_retention_days: i64,
) -> Result<JobScheduler, FloodgateError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| FloodgateError::Other(format!("Failed to create job scheduler: {e}")))?;

    let db_clone = db.clone();

    // Authorization-log retention sweep - runs every hour
    let purge_logs_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            info!("Running purge_authorization_logs job");
            let execution_id = start_job_execution(&db, "purge_authorization_logs").await.ok();

            match storage::purge_authorization_logs(&db, audit_retention_days).await {
                Ok(count) => {
                    info!("Purged {} authorization log entries", count);
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(&db, id, true, None, Some(count as i64)).await;
                    }
                }
                Err(e) => {
                    error!("Failed to purge authorization logs: {e}");
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(&db, id, false, Some(e.to_string()), None).await;
                    }
                }
            }
        })
    })
    .map_err(|e| FloodgateError::Other(format!("Failed to create purge job: {e}")))?;

    sched
        .add(purge_logs_job)
        .await
        .map_err(|e| FloodgateError::Other(format!("Failed to add purge job: {e}")))?;

    sched
        .start()
        .await
        .map_err(|e| FloodgateError::Other(format!("Failed to start job scheduler: {e}")))?;

    info!("Job scheduler started");

    Ok(sched)
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, FloodgateError> {
    let now = Utc::now().timestamp();

    let execution = entities::job_execution::ActiveModel {
        id: NotSet,
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), FloodgateError> {
    let now = Utc::now().timestamp();

    if let Some(execution) = entities::JobExecution::find()
        .filter(entities::job_execution::Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (useful for operational tooling)
pub async fn trigger_job_manually(
    db: &DatabaseConnection,
    job_name: &str,
    audit_retention_days: i64,
) -> Result<(), FloodgateError> {
    info!("Manually triggering job: {job_name}");
    let execution_id = start_job_execution(db, job_name).await?;

    let result = match job_name {
        "purge_authorization_logs" => {
            storage::purge_authorization_logs(db, audit_retention_days).await
        }
        _ => {
            return Err(FloodgateError::Other(format!("Unknown job name: {job_name}")));
        }
    };

    match result {
        Ok(count) => {
            info!("Manually triggered job {job_name} completed: {count} records");
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await?;
        }
        Err(e) => {
            error!("Manually triggered job {job_name} failed: {e}");
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
        }
    }

    Ok(())
}
