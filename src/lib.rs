pub mod api;
pub mod db;
pub mod docs;
pub mod license_keys;
pub mod models;
pub mod platform;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod refunds;

use sqlx::PgPool;

use crate::api::stripe_client::StripeClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub stripe: StripeClient,
    pub stripe_webhook_key: String,
    pub internal_api_key: String,
}
