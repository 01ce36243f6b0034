pub mod ops;
pub mod stripe_client;
pub mod webhooks_stripe;
