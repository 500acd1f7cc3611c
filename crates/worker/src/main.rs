//! ShopSub Background Worker
//!
//! Runs the subscription lifecycle on a schedule:
//! - Expiry sweep (every 15 minutes)
//! - Pending gateway payment reconciliation (every 5 minutes)
//! - Auto-renewal initiation (hourly)
//! - Trial ending and expiry reminders (daily, 08:00 and 08:30 UTC)
//! - Invariant checks (daily at 03:00 UTC)
//!
//! Every job is safe to re-run, so overlapping or repeated runs only
//! produce skipped entries in the job report.

use std::future::Future;
use std::time::Duration;

use shopsub_billing::{BillingConfig, BillingResult, BillingService, JobReport, LifecycleJobs};
use shopsub_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log the outcome of a job run; the report itself is logged by the job
fn log_job_result(job: &'static str, result: BillingResult<JobReport>) {
    match result {
        Ok(report) if report.errors > 0 => {
            warn!(job, errors = report.errors, "Job finished with errors");
        }
        Ok(_) => {}
        Err(e) => error!(job, error = %e, "Job failed"),
    }
}

/// Schedule one lifecycle job on `cron`
async fn add_lifecycle_job<F, Fut>(
    scheduler: &JobScheduler,
    cron: &str,
    name: &'static str,
    jobs: LifecycleJobs,
    run: F,
) -> anyhow::Result<()>
where
    F: Fn(LifecycleJobs, OffsetDateTime) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = BillingResult<JobReport>> + Send + 'static,
{
    scheduler
        .add(Job::new_async(cron, move |_uuid, _l| {
            let jobs = jobs.clone();
            let run = run.clone();
            Box::pin(async move {
                info!(job = name, "Running scheduled job");
                log_job_result(name, run(jobs, OffsetDateTime::now_utc()).await);
            })
        })?)
        .await?;
    info!(job = name, cron, "Scheduled");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ShopSub Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let config = BillingConfig::from_env()?;
    let billing = BillingService::from_config(pool, config)?;

    let scheduler = JobScheduler::new().await?;

    add_lifecycle_job(
        &scheduler,
        "0 */15 * * * *",
        "sweep_expired",
        billing.jobs.clone(),
        |jobs, now| async move { jobs.sweep_expired(now).await },
    )
    .await?;

    add_lifecycle_job(
        &scheduler,
        "0 */5 * * * *",
        "reconcile_pending_payments",
        billing.jobs.clone(),
        |jobs, now| async move { jobs.reconcile_pending_payments(now).await },
    )
    .await?;

    add_lifecycle_job(
        &scheduler,
        "0 0 * * * *",
        "process_auto_renewals",
        billing.jobs.clone(),
        |jobs, now| async move { jobs.process_auto_renewals(now).await },
    )
    .await?;

    add_lifecycle_job(
        &scheduler,
        "0 0 8 * * *",
        "send_trial_ending_reminders",
        billing.jobs.clone(),
        |jobs, now| async move { jobs.send_trial_ending_reminders(now).await },
    )
    .await?;

    add_lifecycle_job(
        &scheduler,
        "0 30 8 * * *",
        "send_expiry_reminders",
        billing.jobs.clone(),
        |jobs, now| async move { jobs.send_expiry_reminders(now).await },
    )
    .await?;

    // Invariant checks only report; violations need a human
    let checker = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running scheduled invariant checks");
                match checker.run_all_checks(OffsetDateTime::now_utc()).await {
                    Ok(summary) if !summary.healthy => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Invariant violated"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!(job = "invariant_checks", "Scheduled");

    // Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - scheduler running");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("ShopSub Worker started successfully with {} scheduled jobs", 7);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
