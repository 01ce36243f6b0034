// src/db.rs

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{License, Refund, Subscription};

pub async fn license_key_exists(pool: &PgPool, license_key: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM licenses WHERE license_key = $1")
            .bind(license_key)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn find_license_by_key(
    pool: &PgPool,
    license_key: &str,
) -> Result<Option<License>, sqlx::Error> {
    sqlx::query_as::<_, License>(
        r#"SELECT id, license_key, customer_id, subscription_id, item_id, site_domain,
                  status, billing_period, renewal_date, created_at, updated_at
           FROM licenses
           WHERE license_key = $1"#,
    )
    .bind(license_key)
    .fetch_optional(pool)
    .await
}

/// Provisioned license for a given customer + site, if one exists. Used by
/// site-batch re-processing to skip sites that already went through.
pub async fn find_provisioned_site_license(
    pool: &PgPool,
    customer_id: &str,
    site_domain: &str,
) -> Result<Option<License>, sqlx::Error> {
    sqlx::query_as::<_, License>(
        r#"SELECT id, license_key, customer_id, subscription_id, item_id, site_domain,
                  status, billing_period, renewal_date, created_at, updated_at
           FROM licenses
           WHERE customer_id = $1 AND site_domain = $2 AND subscription_id IS NOT NULL
           ORDER BY created_at DESC
           LIMIT 1"#,
    )
    .bind(customer_id)
    .bind(site_domain)
    .fetch_optional(pool)
    .await
}

pub struct NewLicense<'a> {
    pub license_key: &'a str,
    pub customer_id: &'a str,
    pub subscription_id: &'a str,
    pub item_id: Option<&'a str>,
    pub site_domain: Option<&'a str>,
    pub billing_period: &'a str,
    pub renewal_date: Option<DateTime<Utc>>,
}

pub async fn insert_license(
    tx: &mut Transaction<'_, Postgres>,
    license: &NewLicense<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO licenses
               (license_key, customer_id, subscription_id, item_id, site_domain,
                status, billing_period, renewal_date)
           VALUES ($1, $2, $3, $4, $5, 'active', $6, $7)"#,
    )
    .bind(license.license_key)
    .bind(license.customer_id)
    .bind(license.subscription_id)
    .bind(license.item_id)
    .bind(license.site_domain)
    .bind(license.billing_period)
    .bind(license.renewal_date)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub struct SubscriptionUpsert<'a> {
    pub subscription_id: &'a str,
    pub customer_id: &'a str,
    pub user_email: &'a str,
    pub status: &'a str,
    pub billing_period: &'a str,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Idempotent: repeated webhook delivery or retried jobs must not create
/// duplicate subscription rows.
pub async fn upsert_subscription(
    tx: &mut Transaction<'_, Postgres>,
    sub: &SubscriptionUpsert<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO subscriptions
               (subscription_id, customer_id, user_email, status, billing_period,
                current_period_start, current_period_end)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           ON CONFLICT (subscription_id)
           DO UPDATE SET
               status = EXCLUDED.status,
               billing_period = EXCLUDED.billing_period,
               current_period_start = EXCLUDED.current_period_start,
               current_period_end = EXCLUDED.current_period_end,
               updated_at = NOW()"#,
    )
    .bind(sub.subscription_id)
    .bind(sub.customer_id)
    .bind(sub.user_email)
    .bind(sub.status)
    .bind(sub.billing_period)
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn find_subscription(
    pool: &PgPool,
    subscription_id: &str,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        r#"SELECT id, subscription_id, customer_id, user_email, status, billing_period,
                  current_period_start, current_period_end, created_at, updated_at
           FROM subscriptions
           WHERE subscription_id = $1"#,
    )
    .bind(subscription_id)
    .fetch_optional(pool)
    .await
}

pub async fn find_refund_for_queue_id(
    pool: &PgPool,
    queue_id: &str,
) -> Result<Option<Refund>, sqlx::Error> {
    sqlx::query_as::<_, Refund>(
        r#"SELECT id, refund_id, payment_intent_id, charge_id, amount, currency,
                  reason, queue_id, license_key, attempts, created_at
           FROM refunds
           WHERE queue_id = $1"#,
    )
    .bind(queue_id)
    .fetch_optional(pool)
    .await
}

pub struct NewRefund<'a> {
    pub refund_id: &'a str,
    pub payment_intent_id: &'a str,
    pub charge_id: &'a str,
    pub amount: i64,
    pub currency: &'a str,
    pub reason: &'a str,
    pub queue_id: &'a str,
    pub license_key: Option<&'a str>,
    pub attempts: i32,
}

/// Returns false when a refund row for this queue_id already exists; the
/// unique constraint is the hard guard against a double-sweep race.
pub async fn insert_refund(pool: &PgPool, refund: &NewRefund<'_>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"INSERT INTO refunds
               (refund_id, payment_intent_id, charge_id, amount, currency,
                reason, queue_id, license_key, attempts)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
           ON CONFLICT (queue_id) DO NOTHING"#,
    )
    .bind(refund.refund_id)
    .bind(refund.payment_intent_id)
    .bind(refund.charge_id)
    .bind(refund.amount)
    .bind(refund.currency)
    .bind(refund.reason)
    .bind(refund.queue_id)
    .bind(refund.license_key)
    .bind(refund.attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn record_webhook_event(
    pool: &PgPool,
    event_type: Option<&str>,
    payment_intent_id: Option<&str>,
    payload: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO webhook_events (event_type, payment_intent_id, payload)
           VALUES ($1, $2, $3)"#,
    )
    .bind(event_type)
    .bind(payment_intent_id)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}
