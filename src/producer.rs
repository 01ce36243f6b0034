// src/producer.rs
//
// Classifies completed-payment events into a provisioning use case and
// enqueues the corresponding jobs. Never calls the payment provider.

use serde::Serialize;
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::queue::{self, NewJob};

/// A completed-payment event as delivered by the webhook layer.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub event_type: String,
    /// Checkout mode: `payment` for one-time purchases, `subscription` for
    /// recurring checkouts.
    pub mode: String,
    pub payment_intent_id: String,
    pub customer_id: String,
    pub user_email: String,
    pub price_id: String,
    pub quantity: i64,
    pub amount_total: Option<i64>,
    /// Raw provider metadata bag; parsed exactly once, here.
    pub metadata: serde_json::Value,
}

/// The fixed provisioning flows. Job types never extend beyond these.
#[derive(Debug, PartialEq, Eq)]
pub enum UseCase {
    /// Recurring-subscription checkout; handled synchronously elsewhere.
    DirectLink,
    /// One-time bulk purchase: one job per license unit.
    Quantity,
    /// One-time multi-site purchase: a single job carrying every domain.
    SiteBatch,
}

/// Validated job payload, parsed out of the metadata bag at the boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum JobPayload {
    PerLicense { license_key: String },
    PerSiteBatch { sites: Vec<String> },
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SkippedEnqueue {
    pub queue_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct EnqueueSummary {
    pub enqueued: Vec<String>,
    pub skipped: Vec<SkippedEnqueue>,
}

/// Classification priority: recurring checkouts first, then the bulk
/// quantity marker, then the multi-site marker. Unmarked one-time payments
/// provision a single license.
pub fn classify(event: &PaymentEvent) -> UseCase {
    if event.mode == "subscription" {
        return UseCase::DirectLink;
    }

    let use_case = event.metadata.get("use_case").and_then(|v| v.as_str());
    if use_case == Some("quantity") || event.metadata.get("quantity").is_some() {
        return UseCase::Quantity;
    }
    if use_case == Some("sites") || event.metadata.get("sites").is_some() {
        return UseCase::SiteBatch;
    }

    UseCase::Quantity
}

/// License unit count for a quantity purchase: explicit metadata wins over
/// the checkout line quantity; always at least one.
pub fn unit_count(event: &PaymentEvent) -> usize {
    let from_metadata = event
        .metadata
        .get("quantity")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
    from_metadata.unwrap_or(event.quantity).max(1) as usize
}

/// Per-unit payloads for a quantity purchase. Pre-issued keys come from
/// metadata; missing positions get temporary `L<n>` placeholders the
/// processor will replace.
pub fn quantity_payloads(event: &PaymentEvent) -> Vec<JobPayload> {
    let provided: Vec<String> = event
        .metadata
        .get("license_keys")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    (0..unit_count(event))
        .map(|i| JobPayload::PerLicense {
            license_key: provided
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("L{}", i + 1)),
        })
        .collect()
}

pub fn site_payload(event: &PaymentEvent) -> Option<JobPayload> {
    let sites: Vec<String> = event
        .metadata
        .get("sites")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if sites.is_empty() {
        None
    } else {
        Some(JobPayload::PerSiteBatch { sites })
    }
}

/// Enqueue zero or more jobs for one payment event. Duplicate deliveries
/// short-circuit against existing jobs and report the existing queue_id.
pub async fn enqueue_payment_event(
    pool: &PgPool,
    event: &PaymentEvent,
) -> Result<EnqueueSummary, sqlx::Error> {
    let mut summary = EnqueueSummary::default();

    match classify(event) {
        UseCase::DirectLink => {
            summary.skipped.push(SkippedEnqueue {
                queue_id: None,
                reason: "direct_link".to_string(),
            });
        }
        UseCase::Quantity => {
            for payload in quantity_payloads(event) {
                let JobPayload::PerLicense { license_key } = payload else {
                    continue;
                };

                if let Some(existing) =
                    queue::find_existing_job(pool, &event.payment_intent_id, Some(&license_key))
                        .await?
                {
                    summary.skipped.push(SkippedEnqueue {
                        queue_id: Some(existing),
                        reason: "duplicate".to_string(),
                    });
                    continue;
                }

                let queue_id = queue::enqueue_job(
                    pool,
                    &NewJob {
                        job_type: "license",
                        customer_id: &event.customer_id,
                        user_email: &event.user_email,
                        payment_intent_id: &event.payment_intent_id,
                        price_id: &event.price_id,
                        license_key: Some(&license_key),
                        quantity: 1,
                        sites: None,
                    },
                )
                .await?;
                log::info!(
                    "enqueued license job queue_id={queue_id} intent={} key={license_key}",
                    event.payment_intent_id
                );
                summary.enqueued.push(queue_id);
            }
        }
        UseCase::SiteBatch => {
            let Some(JobPayload::PerSiteBatch { sites }) = site_payload(event) else {
                summary.skipped.push(SkippedEnqueue {
                    queue_id: None,
                    reason: "empty_site_list".to_string(),
                });
                return Ok(summary);
            };

            if let Some(existing) =
                queue::find_existing_job(pool, &event.payment_intent_id, None).await?
            {
                summary.skipped.push(SkippedEnqueue {
                    queue_id: Some(existing),
                    reason: "duplicate".to_string(),
                });
                return Ok(summary);
            }

            let quantity = sites.len() as i32;
            let queue_id = queue::enqueue_job(
                pool,
                &NewJob {
                    job_type: "site_batch",
                    customer_id: &event.customer_id,
                    user_email: &event.user_email,
                    payment_intent_id: &event.payment_intent_id,
                    price_id: &event.price_id,
                    license_key: None,
                    quantity,
                    sites: Some(serde_json::json!(sites)),
                },
            )
            .await?;
            log::info!(
                "enqueued site batch queue_id={queue_id} intent={} sites={quantity}",
                event.payment_intent_id
            );
            summary.enqueued.push(queue_id);
        }
    }

    Ok(summary)
}
