// src/processor.rs
//
// The worker side of the provisioning queue: claims due jobs, drives
// subscription creation against the payment provider, persists the
// resulting license/subscription rows, and schedules retries. One job's
// failure never aborts the rest of the batch.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use crate::api::stripe_client::{CreateSubscriptionRequest, StripeClient};
use crate::db::{self, NewLicense, SubscriptionUpsert};
use crate::models::{CycleSummary, QueueJob};
use crate::{license_keys, platform, queue, refunds};

const DEFAULT_TRIAL_PERIOD_DAYS: i64 = 14;

/// Pause between sites within one batch job, to stay under provider rate
/// limits.
const INTER_SITE_DELAY_MS: u64 = 250;

#[derive(Debug)]
enum JobOutcome {
    /// A new subscription (or at least one, for batches) was created.
    Provisioned {
        subscription_id: Option<String>,
        item_id: Option<String>,
    },
    /// Everything this job asked for already exists; completed without
    /// touching the provider.
    AlreadyProvisioned {
        subscription_id: Option<String>,
        item_id: Option<String>,
    },
}

/// One full poll/claim/process pass, bounded by `limit`. Runs the
/// stuck-job reclaimer first.
pub async fn run_processing_cycle(
    pool: &PgPool,
    stripe: &StripeClient,
    limit: i64,
) -> CycleSummary {
    match queue::reclaim_stuck_jobs(pool).await {
        Ok(0) => {}
        Ok(n) => log::info!("reclaimed {n} stuck jobs"),
        Err(e) => log::error!("stuck job reclaim error: {e}"),
    }

    let jobs = match queue::due_jobs(pool, limit).await {
        Ok(jobs) => jobs,
        Err(e) => {
            log::error!("due job select error: {e}");
            return CycleSummary::default();
        }
    };

    let mut summary = CycleSummary::default();

    for job in jobs {
        match queue::claim_job(pool, &job.queue_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Another worker won the claim, or the job moved state.
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                log::error!("claim error queue_id={}: {e}", job.queue_id);
                continue;
            }
        }

        summary.processed += 1;

        let outcome = match job.job_type.as_str() {
            "license" => process_license_job(pool, stripe, &job).await,
            "site_batch" => process_site_batch(pool, stripe, &job).await,
            other => Err(format!("unknown job type: {other}")),
        };

        match outcome {
            Ok(JobOutcome::Provisioned {
                subscription_id,
                item_id,
            }) => {
                if let Err(e) = queue::mark_completed(
                    pool,
                    &job.queue_id,
                    subscription_id.as_deref(),
                    item_id.as_deref(),
                )
                .await
                {
                    // The subscription exists; the retry's duplicate check
                    // turns this into a reconciliation, not a second charge.
                    log::error!("mark completed error queue_id={}: {e}", job.queue_id);
                    record_job_failure(pool, &job, &format!("completion write failed: {e}"))
                        .await;
                    summary.failed += 1;
                    continue;
                }
                summary.succeeded += 1;
            }
            Ok(JobOutcome::AlreadyProvisioned {
                subscription_id,
                item_id,
            }) => {
                if let Err(e) = queue::mark_completed(
                    pool,
                    &job.queue_id,
                    subscription_id.as_deref(),
                    item_id.as_deref(),
                )
                .await
                {
                    log::error!("mark completed error queue_id={}: {e}", job.queue_id);
                }
                log::info!(
                    "skipped queue_id={} reason=race_detected (already provisioned)",
                    job.queue_id
                );
                summary.skipped += 1;
            }
            Err(message) => {
                record_job_failure(pool, &job, &message).await;
                summary.failed += 1;
            }
        }
    }

    summary
}

async fn record_job_failure(pool: &PgPool, job: &QueueJob, message: &str) {
    match queue::record_failure(pool, job, message).await {
        Ok(queue::RetryDisposition::Scheduled {
            attempts,
            next_retry_at,
        }) => {
            log::warn!(
                "job failed queue_id={} attempt={attempts} retry_at={next_retry_at}: {message}",
                job.queue_id
            );
        }
        Ok(queue::RetryDisposition::Exhausted { attempts }) => {
            log::error!(
                "job permanently failed queue_id={} after {attempts} attempts: {message}",
                job.queue_id
            );
        }
        Err(e) => {
            // The job stays in `processing`; the reclaimer will hand it back.
            log::error!("failure bookkeeping error queue_id={}: {e}", job.queue_id);
        }
    }
}

async fn process_license_job(
    pool: &PgPool,
    stripe: &StripeClient,
    job: &QueueJob,
) -> Result<JobOutcome, String> {
    let mut license_key = job
        .license_key
        .clone()
        .ok_or_else(|| "license job without license_key".to_string())?;

    // Swap a producer-issued placeholder for a real key, and persist it
    // before anything else so retries reuse the same key.
    if license_keys::is_temporary(&license_key) {
        let real = license_keys::generate_unique_license_key(pool)
            .await
            .map_err(|e| e.to_string())?;
        queue::update_license_key(pool, &job.queue_id, &real)
            .await
            .map_err(|e| e.to_string())?;
        license_key = real;
    }

    // Defense in depth: a license that already carries a subscription means
    // another worker (or a previous partial run) finished the provider side.
    if let Some(existing) = db::find_license_by_key(pool, &license_key)
        .await
        .map_err(|e| e.to_string())?
    {
        if let Some(subscription_id) = existing.subscription_id {
            return Ok(JobOutcome::AlreadyProvisioned {
                subscription_id: Some(subscription_id),
                item_id: existing.item_id,
            });
        }
    }

    let (trial_end, billing_period) = trial_and_period(stripe, &job.price_id).await;

    let sub = stripe
        .create_subscription(CreateSubscriptionRequest {
            customer: job.customer_id.clone(),
            price: job.price_id.clone(),
            quantity: 1,
            trial_end,
            metadata: vec![
                ("license_key".to_string(), license_key.clone()),
                ("queue_id".to_string(), job.queue_id.clone()),
                (
                    "payment_intent_id".to_string(),
                    job.payment_intent_id.clone(),
                ),
            ],
            idempotency_key: Some(format!(
                "sub-{license_key}-{}",
                job.payment_intent_id
            )),
        })
        .await
        .map_err(|e| e.to_string())?;

    let item_id = sub.first_item_id().map(|s| s.to_string());
    persist_provisioned(
        pool,
        job,
        &license_key,
        None,
        &billing_period,
        trial_end,
        &sub,
    )
    .await
    .map_err(|e| format!("persist failed after subscription {}: {e}", sub.id))?;

    Ok(JobOutcome::Provisioned {
        subscription_id: Some(sub.id),
        item_id,
    })
}

/// Multi-site variant: one subscription per domain, sequentially. A site
/// that fails marks the whole job failed; the retry walks the full list
/// again and skips sites the existence check shows as done.
async fn process_site_batch(
    pool: &PgPool,
    stripe: &StripeClient,
    job: &QueueJob,
) -> Result<JobOutcome, String> {
    let sites = job.site_list();
    if sites.is_empty() {
        return Err("site batch job without sites".to_string());
    }

    let (trial_end, billing_period) = trial_and_period(stripe, &job.price_id).await;

    let mut last_subscription_id: Option<String> = None;
    let mut last_item_id: Option<String> = None;
    let mut created_any = false;
    let site_count = sites.len();

    for (index, site) in sites.iter().enumerate() {
        if let Some(existing) = db::find_provisioned_site_license(pool, &job.customer_id, site)
            .await
            .map_err(|e| format!("site {site}: {e}"))?
        {
            log::info!(
                "skipping already provisioned site={site} queue_id={}",
                job.queue_id
            );
            last_subscription_id = existing.subscription_id;
            last_item_id = existing.item_id;
            continue;
        }

        let detected_platform = platform::detect_platform(site).await;

        let license_key = license_keys::generate_unique_license_key(pool)
            .await
            .map_err(|e| format!("site {site}: {e}"))?;

        let sub = stripe
            .create_subscription(CreateSubscriptionRequest {
                customer: job.customer_id.clone(),
                price: job.price_id.clone(),
                quantity: 1,
                trial_end,
                metadata: vec![
                    ("license_key".to_string(), license_key.clone()),
                    ("site_domain".to_string(), site.clone()),
                    ("platform".to_string(), detected_platform),
                    ("queue_id".to_string(), job.queue_id.clone()),
                ],
                idempotency_key: Some(format!("sub-{}-{site}", job.payment_intent_id)),
            })
            .await
            .map_err(|e| format!("site {site}: {e}"))?;

        let item_id = sub.first_item_id().map(|s| s.to_string());
        persist_provisioned(
            pool,
            job,
            &license_key,
            Some(site),
            &billing_period,
            trial_end,
            &sub,
        )
        .await
        .map_err(|e| format!("site {site}: persist failed after subscription {}: {e}", sub.id))?;

        last_subscription_id = Some(sub.id);
        last_item_id = item_id;
        created_any = true;

        if index + 1 < site_count {
            tokio::time::sleep(Duration::from_millis(INTER_SITE_DELAY_MS)).await;
        }
    }

    if created_any {
        Ok(JobOutcome::Provisioned {
            subscription_id: last_subscription_id,
            item_id: last_item_id,
        })
    } else {
        Ok(JobOutcome::AlreadyProvisioned {
            subscription_id: last_subscription_id,
            item_id: last_item_id,
        })
    }
}

/// License + subscription rows commit together or not at all; a partial
/// write must never mark the job completed.
async fn persist_provisioned(
    pool: &PgPool,
    job: &QueueJob,
    license_key: &str,
    site_domain: Option<&str>,
    billing_period: &str,
    trial_end: Option<i64>,
    sub: &crate::api::stripe_client::SubscriptionResponse,
) -> Result<(), sqlx::Error> {
    let period_start = epoch_to_datetime(sub.current_period_start);
    let period_end = epoch_to_datetime(sub.current_period_end);
    let renewal_date = period_end.or_else(|| epoch_to_datetime(trial_end));
    let item_id = sub.first_item_id();

    let mut tx = pool.begin().await?;
    db::insert_license(
        &mut tx,
        &NewLicense {
            license_key,
            customer_id: &job.customer_id,
            subscription_id: &sub.id,
            item_id,
            site_domain,
            billing_period,
            renewal_date,
        },
    )
    .await?;
    db::upsert_subscription(
        &mut tx,
        &SubscriptionUpsert {
            subscription_id: &sub.id,
            customer_id: &job.customer_id,
            user_email: &job.user_email,
            status: &sub.status,
            billing_period,
            current_period_start: period_start,
            current_period_end: period_end,
        },
    )
    .await?;
    tx.commit().await
}

/// Trial end and billing period for a price: a numeric `trial_days` entry
/// in the provider price metadata overrides the configured default.
async fn trial_and_period(stripe: &StripeClient, price_id: &str) -> (Option<i64>, String) {
    let default_days = std::env::var("TRIAL_PERIOD_DAYS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_TRIAL_PERIOD_DAYS);

    let (days, period) = match stripe.get_price(price_id).await {
        Ok(price) => {
            let days = price
                .metadata
                .get("trial_days")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default_days);
            let period = match price.recurring.and_then(|r| r.interval) {
                Some(interval) if interval == "year" => "yearly".to_string(),
                Some(interval) if interval == "week" => "weekly".to_string(),
                _ => "monthly".to_string(),
            };
            (days, period)
        }
        Err(e) => {
            log::warn!("price lookup failed for {price_id}, using defaults: {e}");
            (default_days, "monthly".to_string())
        }
    };

    let trial_end = if days > 0 {
        Some(Utc::now().timestamp() + days * 86_400)
    } else {
        None
    };
    (trial_end, period)
}

fn epoch_to_datetime(epoch: Option<i64>) -> Option<DateTime<Utc>> {
    epoch.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Spawn the periodic provisioning and refund loops. Intervals and batch
/// sizes come from the environment, matching the cron cadence described in
/// the ops runbook (process every minute, sweep hourly).
pub fn start_queue_workers(pool: PgPool, stripe: StripeClient) {
    let poll_interval = std::env::var("QUEUE_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let batch_size = std::env::var("QUEUE_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(25);
    let sweep_interval = std::env::var("REFUND_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3600);
    let sweep_batch = std::env::var("REFUND_SWEEP_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(50);

    let worker_pool = pool.clone();
    let worker_stripe = stripe.clone();
    tokio::spawn(async move {
        loop {
            let summary = run_processing_cycle(&worker_pool, &worker_stripe, batch_size).await;
            if summary.processed > 0 {
                log::info!(
                    "processing cycle: processed={} succeeded={} failed={} skipped={}",
                    summary.processed,
                    summary.succeeded,
                    summary.failed,
                    summary.skipped
                );
            }
            tokio::time::sleep(Duration::from_secs(poll_interval)).await;
        }
    });

    tokio::spawn(async move {
        loop {
            let summary = refunds::run_refund_sweep(&pool, &stripe, sweep_batch).await;
            if summary.processed > 0 {
                log::info!(
                    "refund sweep: processed={} succeeded={} failed={} skipped={}",
                    summary.processed,
                    summary.succeeded,
                    summary.failed,
                    summary.skipped
                );
            }
            tokio::time::sleep(Duration::from_secs(sweep_interval)).await;
        }
    });
}
