// src/api/stripe_client.rs
//
// Minimal client for the Stripe REST API (form-encoded requests, JSON
// responses). Only the four calls the provisioning core needs.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

const STRIPE_API_BASE: &str = "https://api.stripe.com";

fn api_base() -> String {
    std::env::var("STRIPE_API_BASE_URL").unwrap_or_else(|_| STRIPE_API_BASE.to_string())
}

#[derive(Debug)]
pub enum StripeError {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    InvalidResponse(String),
}

impl fmt::Display for StripeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StripeError::Http(e) => write!(f, "http error: {e}"),
            StripeError::Api { status, body } => {
                write!(f, "stripe api error status={status} body={body}")
            }
            StripeError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl std::error::Error for StripeError {}

impl From<reqwest::Error> for StripeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[derive(Debug, Default)]
pub struct CreateSubscriptionRequest {
    pub customer: String,
    pub price: String,
    pub quantity: i64,
    /// Epoch seconds; first charge happens after trial end.
    pub trial_end: Option<i64>,
    pub metadata: Vec<(String, String)>,
    /// Deterministic key derived from the job identity so a racing retry
    /// cannot double-charge.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionItemResponse {
    pub id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct SubscriptionItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemResponse>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionResponse {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItemList,
}

impl SubscriptionResponse {
    pub fn first_item_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceRecurring {
    pub interval: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PriceResponse {
    pub id: String,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub recurring: Option<PriceRecurring>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentIntentResponse {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub latest_charge: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundResponse {
    pub id: String,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_key: String,
}

impl StripeClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    pub async fn create_subscription(
        &self,
        req: CreateSubscriptionRequest,
    ) -> Result<SubscriptionResponse, StripeError> {
        let mut params: Vec<(String, String)> = vec![
            ("customer".into(), req.customer),
            ("items[0][price]".into(), req.price),
            ("items[0][quantity]".into(), req.quantity.to_string()),
        ];
        if let Some(trial_end) = req.trial_end {
            params.push(("trial_end".into(), trial_end.to_string()));
        }
        for (key, value) in req.metadata {
            params.push((format!("metadata[{key}]"), value));
        }

        let mut builder = self
            .http
            .post(format!("{}/v1/subscriptions", api_base()))
            .bearer_auth(&self.api_key)
            .form(&params);
        if let Some(key) = req.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let resp = builder.send().await?;
        parse_response(resp).await
    }

    pub async fn get_price(&self, price_id: &str) -> Result<PriceResponse, StripeError> {
        let resp = self
            .http
            .get(format!("{}/v1/prices/{price_id}", api_base()))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn get_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentResponse, StripeError> {
        let resp = self
            .http
            .get(format!(
                "{}/v1/payment_intents/{payment_intent_id}",
                api_base()
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn create_refund(
        &self,
        charge_id: &str,
        amount: i64,
        metadata: Vec<(String, String)>,
    ) -> Result<RefundResponse, StripeError> {
        let mut params: Vec<(String, String)> = vec![
            ("charge".into(), charge_id.to_string()),
            ("amount".into(), amount.to_string()),
        ];
        for (key, value) in metadata {
            params.push((format!("metadata[{key}]"), value));
        }

        let resp = self
            .http
            .post(format!("{}/v1/refunds", api_base()))
            .bearer_auth(&self.api_key)
            .form(&params)
            .send()
            .await?;
        parse_response(resp).await
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, StripeError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(StripeError::Api {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str::<T>(&body)
        .map_err(|e| StripeError::InvalidResponse(format!("{e}; body={body}")))
}
