use crate::errors::LodestarError;
use crate::storage;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the job scheduler with the background sweep.
///
/// Expiry itself is checked lazily on every read; this job only bounds how
/// long dead records linger in storage.
pub async fn init_scheduler(
    db: DatabaseConnection,
    retention_margin_secs: i64,
) -> Result<JobScheduler, LodestarError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| LodestarError::Other(format!("Failed to create job scheduler: {}", e)))?;

    // Cleanup expired device codes - runs every hour
    let cleanup_devices_job = Job::new_async("0 10 * * * *", move |_uuid, _l| {
        let db = db.clone();
        Box::pin(async move {
            info!("Running cleanup_expired_devices job");
            match storage::cleanup_expired_devices(&db, retention_margin_secs).await {
                Ok(count) => {
                    info!("Cleaned up {} expired device codes", count);
                }
                Err(e) => {
                    error!("Failed to cleanup expired device codes: {}", e);
                }
            }
        })
    })
    .map_err(|e| LodestarError::Other(format!("Failed to create cleanup devices job: {}", e)))?;

    sched
        .add(cleanup_devices_job)
        .await
        .map_err(|e| LodestarError::Other(format!("Failed to add cleanup devices job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| LodestarError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started");

    Ok(sched)
}
