// src/queue.rs
//
// Durable job store for license provisioning. Every state transition is a
// conditional row update against the `queue` table; there is no broker and
// no in-process lock shared between invocations.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::QueueJob;

/// Jobs wedged in `processing` longer than this are assumed to belong to a
/// crashed worker and handed back to the pool.
pub const STUCK_JOB_TIMEOUT_SECS: i64 = 5 * 60;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

const JOB_COLUMNS: &str = r#"queue_id, job_type, status, customer_id, user_email,
    payment_intent_id, price_id, license_key, subscription_id, item_id,
    quantity, sites, attempts, max_attempts, next_retry_at, error_message,
    created_at, updated_at, processed_at"#;

pub struct NewJob<'a> {
    pub job_type: &'a str,
    pub customer_id: &'a str,
    pub user_email: &'a str,
    pub payment_intent_id: &'a str,
    pub price_id: &'a str,
    pub license_key: Option<&'a str>,
    pub quantity: i32,
    pub sites: Option<serde_json::Value>,
}

pub async fn enqueue_job(pool: &PgPool, job: &NewJob<'_>) -> Result<String, sqlx::Error> {
    let queue_id = format!("q_{}", Uuid::new_v4().simple());

    sqlx::query(
        r#"INSERT INTO queue
               (queue_id, job_type, status, customer_id, user_email,
                payment_intent_id, price_id, license_key, quantity, sites, max_attempts)
           VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, $10)"#,
    )
    .bind(&queue_id)
    .bind(job.job_type)
    .bind(job.customer_id)
    .bind(job.user_email)
    .bind(job.payment_intent_id)
    .bind(job.price_id)
    .bind(job.license_key)
    .bind(job.quantity)
    .bind(&job.sites)
    .bind(DEFAULT_MAX_ATTEMPTS)
    .execute(pool)
    .await?;

    Ok(queue_id)
}

/// First idempotency layer: a job already enqueued for this payment intent
/// (and license key, for per-unit jobs) in a live or completed state means
/// the webhook was delivered before. Failed jobs are not counted so a
/// permanently failed purchase can be re-driven by a fresh delivery.
pub async fn find_existing_job(
    pool: &PgPool,
    payment_intent_id: &str,
    license_key: Option<&str>,
) -> Result<Option<String>, sqlx::Error> {
    let queue_id: Option<String> = match license_key {
        Some(key) => {
            sqlx::query_scalar(
                r#"SELECT queue_id FROM queue
                   WHERE payment_intent_id = $1
                     AND license_key = $2
                     AND status IN ('pending', 'processing', 'completed')
                   LIMIT 1"#,
            )
            .bind(payment_intent_id)
            .bind(key)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_scalar(
                r#"SELECT queue_id FROM queue
                   WHERE payment_intent_id = $1
                     AND status IN ('pending', 'processing', 'completed')
                   LIMIT 1"#,
            )
            .bind(payment_intent_id)
            .fetch_optional(pool)
            .await?
        }
    };

    Ok(queue_id)
}

/// Pending jobs whose retry time has arrived, oldest first.
pub async fn due_jobs(pool: &PgPool, limit: i64) -> Result<Vec<QueueJob>, sqlx::Error> {
    let sql = format!(
        r#"SELECT {JOB_COLUMNS}
           FROM queue
           WHERE status = 'pending'
             AND (next_retry_at IS NULL OR next_retry_at <= $1)
           ORDER BY created_at ASC
           LIMIT $2"#
    );

    sqlx::query_as::<_, QueueJob>(&sql)
        .bind(Utc::now().timestamp())
        .bind(limit)
        .fetch_all(pool)
        .await
}

pub async fn get_job(pool: &PgPool, queue_id: &str) -> Result<Option<QueueJob>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM queue WHERE queue_id = $1");
    sqlx::query_as::<_, QueueJob>(&sql)
        .bind(queue_id)
        .fetch_optional(pool)
        .await
}

/// Atomically claim a pending job. Zero rows affected means another worker
/// got there first (or the job moved state); the caller skips silently.
/// This conditional update is the sole concurrency-control mechanism.
pub async fn claim_job(pool: &PgPool, queue_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE queue
           SET status = 'processing', updated_at = NOW()
           WHERE queue_id = $1 AND status = 'pending'"#,
    )
    .bind(queue_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Persist a real key over a temporary placeholder so retries reuse it.
pub async fn update_license_key(
    pool: &PgPool,
    queue_id: &str,
    license_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE queue SET license_key = $1, updated_at = NOW() WHERE queue_id = $2"#,
    )
    .bind(license_key)
    .bind(queue_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_completed(
    pool: &PgPool,
    queue_id: &str,
    subscription_id: Option<&str>,
    item_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE queue
           SET status = 'completed', subscription_id = $1, item_id = $2,
               error_message = NULL, processed_at = NOW(), updated_at = NOW()
           WHERE queue_id = $3"#,
    )
    .bind(subscription_id)
    .bind(item_id)
    .bind(queue_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Returned to `pending` with a backoff delay.
    Scheduled { attempts: i32, next_retry_at: i64 },
    /// Retry budget spent; the job is terminally `failed`.
    Exhausted { attempts: i32 },
}

/// Delay before the next attempt: 60 * 2^attempts seconds (2, 4, 8 minutes
/// for attempts 1, 2, 3).
pub fn backoff_delay_secs(attempts: i32) -> i64 {
    60 * (1_i64 << attempts.clamp(0, 30))
}

/// Record a failed attempt: bump the counter, then either release the job
/// back to `pending` with backoff or park it as terminally `failed`.
pub async fn record_failure(
    pool: &PgPool,
    job: &QueueJob,
    error_message: &str,
) -> Result<RetryDisposition, sqlx::Error> {
    let attempts = job.attempts + 1;

    if attempts < job.max_attempts {
        let next_retry_at = Utc::now().timestamp() + backoff_delay_secs(attempts);
        sqlx::query(
            r#"UPDATE queue
               SET status = 'pending', attempts = $1, next_retry_at = $2,
                   error_message = $3, updated_at = NOW()
               WHERE queue_id = $4"#,
        )
        .bind(attempts)
        .bind(next_retry_at)
        .bind(error_message)
        .bind(&job.queue_id)
        .execute(pool)
        .await?;

        Ok(RetryDisposition::Scheduled {
            attempts,
            next_retry_at,
        })
    } else {
        sqlx::query(
            r#"UPDATE queue
               SET status = 'failed', attempts = $1, next_retry_at = NULL,
                   error_message = $2, updated_at = NOW()
               WHERE queue_id = $3"#,
        )
        .bind(attempts)
        .bind(error_message)
        .bind(&job.queue_id)
        .execute(pool)
        .await?;

        Ok(RetryDisposition::Exhausted { attempts })
    }
}

/// Reset jobs stuck in `processing` past the staleness window back to
/// `pending`, attempts unchanged. Safe to run concurrently and redundantly.
pub async fn reclaim_stuck_jobs(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE queue
           SET status = 'pending', updated_at = NOW()
           WHERE status = 'processing'
             AND updated_at < NOW() - make_interval(secs => $1)"#,
    )
    .bind(STUCK_JOB_TIMEOUT_SECS as f64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Terminally failed jobs that aged past the grace window and have not been
/// refunded yet (no marker in error_message).
pub async fn refundable_jobs(
    pool: &PgPool,
    grace_hours: i64,
    limit: i64,
) -> Result<Vec<QueueJob>, sqlx::Error> {
    let sql = format!(
        r#"SELECT {JOB_COLUMNS}
           FROM queue
           WHERE status = 'failed'
             AND created_at < NOW() - make_interval(hours => $1)
             AND (error_message IS NULL OR error_message NOT LIKE '%REFUNDED:%')
           ORDER BY created_at ASC
           LIMIT $2"#
    );

    sqlx::query_as::<_, QueueJob>(&sql)
        .bind(grace_hours as i32)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Append the refund marker that excludes a job from future sweeps. The job
/// row itself is never deleted.
pub async fn append_refund_marker(
    pool: &PgPool,
    queue_id: &str,
    refund_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE queue
           SET error_message = COALESCE(error_message, '') || ' REFUNDED:' || $1,
               updated_at = NOW()
           WHERE queue_id = $2"#,
    )
    .bind(refund_id)
    .bind(queue_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Queue depth by status, for the dashboard.
pub async fn status_counts(pool: &PgPool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM queue GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
}
