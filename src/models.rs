// src/models.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// A unit of deferred provisioning work: one subscription (and license)
/// to create for a completed payment.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueueJob {
    pub queue_id: String,
    pub job_type: String, // license | site_batch
    pub status: String,   // pending | processing | completed | failed
    pub customer_id: String,
    pub user_email: String,
    pub payment_intent_id: String,
    pub price_id: String,
    pub license_key: Option<String>,
    pub subscription_id: Option<String>,
    pub item_id: Option<String>,
    pub quantity: i32,
    pub sites: Option<serde_json::Value>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Site domains carried by a site_batch job. Empty for license jobs
    /// and for malformed payloads.
    pub fn site_list(&self) -> Vec<String> {
        self.sites
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct License {
    pub id: i32,
    pub license_key: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub item_id: Option<String>,
    pub site_domain: Option<String>,
    pub status: String,
    pub billing_period: String,
    pub renewal_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i32,
    pub subscription_id: String,
    pub customer_id: String,
    pub user_email: String,
    pub status: String,
    pub billing_period: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Refund {
    pub id: i32,
    pub refund_id: String,
    pub payment_intent_id: String,
    pub charge_id: String,
    pub amount: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub queue_id: String,
    pub license_key: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one processing cycle or refund sweep.
#[derive(Debug, Default, Clone, Serialize, ToSchema)]
pub struct CycleSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}
