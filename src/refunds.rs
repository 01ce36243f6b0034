// src/refunds.rs
//
// Compensating refunds for jobs that exhausted their retries: customers
// must not stay charged for a license that never materialized. The sweep is
// cheap to re-run, so individual refund failures are just logged and picked
// up by the next pass.

use sqlx::PgPool;

use crate::api::stripe_client::StripeClient;
use crate::db::{self, NewRefund};
use crate::models::{CycleSummary, QueueJob};
use crate::queue;

/// Failed jobs younger than this are left alone; support may still fix the
/// underlying cause and re-drive the purchase.
pub const REFUND_GRACE_HOURS: i64 = 12;

const REFUND_REASON: &str = "license provisioning failed";

#[derive(Debug)]
enum RefundOutcome {
    Refunded(String),
    AlreadyRefunded,
}

pub async fn run_refund_sweep(pool: &PgPool, stripe: &StripeClient, limit: i64) -> CycleSummary {
    let jobs = match queue::refundable_jobs(pool, REFUND_GRACE_HOURS, limit).await {
        Ok(jobs) => jobs,
        Err(e) => {
            log::error!("refundable job select error: {e}");
            return CycleSummary::default();
        }
    };

    let mut summary = CycleSummary::default();

    for job in jobs {
        summary.processed += 1;
        match refund_job(pool, stripe, &job).await {
            Ok(RefundOutcome::Refunded(refund_id)) => {
                log::info!(
                    "refunded queue_id={} refund_id={refund_id} intent={}",
                    job.queue_id,
                    job.payment_intent_id
                );
                summary.succeeded += 1;
            }
            Ok(RefundOutcome::AlreadyRefunded) => {
                summary.skipped += 1;
            }
            Err(e) => {
                // Left for the next sweep; never blocks the rest of the batch.
                log::error!("refund error queue_id={}: {e}", job.queue_id);
                summary.failed += 1;
            }
        }
    }

    summary
}

async fn refund_job(
    pool: &PgPool,
    stripe: &StripeClient,
    job: &QueueJob,
) -> Result<RefundOutcome, String> {
    // A refund row without the marker means an earlier sweep crashed between
    // the insert and the annotation; repair the marker and move on.
    if let Some(existing) = db::find_refund_for_queue_id(pool, &job.queue_id)
        .await
        .map_err(|e| e.to_string())?
    {
        queue::append_refund_marker(pool, &job.queue_id, &existing.refund_id)
            .await
            .map_err(|e| e.to_string())?;
        return Ok(RefundOutcome::AlreadyRefunded);
    }

    let intent = stripe
        .get_payment_intent(&job.payment_intent_id)
        .await
        .map_err(|e| e.to_string())?;
    let charge_id = intent
        .latest_charge
        .ok_or_else(|| format!("payment intent {} has no charge", intent.id))?;

    // Refund one license unit: the price's unit amount when the price is
    // still readable, otherwise the captured amount split across the
    // original quantity.
    let amount = match stripe.get_price(&job.price_id).await {
        Ok(price) => price
            .unit_amount
            .unwrap_or_else(|| intent.amount / i64::from(job.quantity.max(1))),
        Err(e) => {
            log::warn!(
                "price lookup failed for {} during refund, using intent amount: {e}",
                job.price_id
            );
            intent.amount / i64::from(job.quantity.max(1))
        }
    };

    let refund = stripe
        .create_refund(
            &charge_id,
            amount,
            vec![
                ("queue_id".to_string(), job.queue_id.clone()),
                (
                    "license_key".to_string(),
                    job.license_key.clone().unwrap_or_default(),
                ),
                ("reason".to_string(), REFUND_REASON.to_string()),
            ],
        )
        .await
        .map_err(|e| e.to_string())?;

    let inserted = db::insert_refund(
        pool,
        &NewRefund {
            refund_id: &refund.id,
            payment_intent_id: &job.payment_intent_id,
            charge_id: &charge_id,
            amount,
            currency: &intent.currency,
            reason: REFUND_REASON,
            queue_id: &job.queue_id,
            license_key: job.license_key.as_deref(),
            attempts: job.attempts,
        },
    )
    .await
    .map_err(|e| e.to_string())?;

    queue::append_refund_marker(pool, &job.queue_id, &refund.id)
        .await
        .map_err(|e| e.to_string())?;

    if inserted {
        Ok(RefundOutcome::Refunded(refund.id))
    } else {
        // Lost a race with a concurrent sweep; its refund stands.
        Ok(RefundOutcome::AlreadyRefunded)
    }
}
