// src/api/webhooks_stripe.rs
//
// Inbound payment-completion webhook. Parsing and signature checking stay
// thin here; classification and enqueueing live in the producer.

use actix_web::{HttpRequest, HttpResponse, post, web};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::producer::{self, PaymentEvent};
use crate::{AppState, db};

/// HMAC-SHA256 in hex over `<timestamp>.<body>`, the provider's signed
/// payload shape.
pub fn sign_hmac_sha256_hex(secret: &str, data: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Parse a `Stripe-Signature` style header: `t=<ts>,v1=<hex>[,...]`.
pub fn parse_signature_header(header: &str) -> Option<(String, String)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.to_string()),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }
    Some((timestamp?, signature?))
}

/// Accepts either the provider signature header or the shared webhook key
/// used by manual redelivery tooling.
pub fn verify_signature(req: &HttpRequest, body: &[u8], secret: &str) -> bool {
    if let Some(header) = req
        .headers()
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
    {
        if let Some((timestamp, signature)) = parse_signature_header(header) {
            let payload = format!("{timestamp}.{}", String::from_utf8_lossy(body));
            return sign_hmac_sha256_hex(secret, &payload) == signature;
        }
        return false;
    }

    req.headers()
        .get("X-Webhook-Key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == secret)
        .unwrap_or(false)
}

fn decode_form_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = &raw[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Webhook bodies arrive as JSON or (from older redelivery tooling) as a
/// form-encoded flat map. Both become a JSON object.
pub fn parse_webhook_body(body: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if value.is_object() {
            return Some(value);
        }
    }

    let text = std::str::from_utf8(body).ok()?;
    let mut map = serde_json::Map::new();
    for pair in text.split('&') {
        let (key, value) = pair.split_once('=')?;
        map.insert(
            decode_form_component(key),
            Value::String(decode_form_component(value)),
        );
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// The webhook fields the producer cares about, pulled out of either the
/// provider's event envelope (`data.object`) or a flat payload.
#[derive(Debug, Default)]
pub struct NormalizedWebhook {
    pub event_type: Option<String>,
    pub mode: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub user_email: Option<String>,
    pub price_id: Option<String>,
    pub quantity: Option<i64>,
    pub amount_total: Option<i64>,
    pub metadata: Value,
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub fn normalize_payload(raw: Value) -> NormalizedWebhook {
    let event_type = get_str(&raw, "type")
        .or_else(|| get_str(&raw, "eventType"))
        .or_else(|| get_str(&raw, "event_type"));

    let object = raw
        .get("data")
        .and_then(|d| d.get("object"))
        .unwrap_or(&raw);

    let payment_intent_id = get_str(object, "payment_intent")
        .or_else(|| get_str(object, "payment_intent_id"));
    let customer_id = get_str(object, "customer").or_else(|| get_str(object, "customer_id"));
    let user_email = object
        .get("customer_details")
        .and_then(|d| d.get("email"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| get_str(object, "customer_email"));

    let first_line_item = object
        .get("line_items")
        .and_then(|li| li.get("data"))
        .and_then(|d| d.as_array())
        .and_then(|arr| arr.first());
    let price_id = object
        .get("metadata")
        .and_then(|m| m.get("price_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            first_line_item
                .and_then(|item| item.get("price"))
                .and_then(|p| p.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .or_else(|| get_str(object, "price_id"));
    let quantity = first_line_item
        .and_then(|item| item.get("quantity"))
        .and_then(|v| v.as_i64());

    NormalizedWebhook {
        event_type,
        mode: get_str(object, "mode"),
        payment_intent_id,
        customer_id,
        user_email,
        price_id,
        quantity,
        amount_total: object.get("amount_total").and_then(|v| v.as_i64()),
        metadata: object.get("metadata").cloned().unwrap_or_else(|| json!({})),
    }
}

impl NormalizedWebhook {
    /// A complete provisioning event needs the intent, the customer, and
    /// the price; anything less is acknowledged and ignored.
    pub fn into_payment_event(self) -> Option<PaymentEvent> {
        Some(PaymentEvent {
            event_type: self.event_type.clone()?,
            mode: self.mode.unwrap_or_else(|| "payment".to_string()),
            payment_intent_id: self.payment_intent_id?,
            customer_id: self.customer_id?,
            user_email: self.user_email.unwrap_or_default(),
            price_id: self.price_id?,
            quantity: self.quantity.unwrap_or(1),
            amount_total: self.amount_total,
            metadata: self.metadata,
        })
    }
}

#[utoipa::path(
    post,
    path = "/webhook/stripe",
    tag = "webhooks",
    responses(
        (status = 200, description = "Event accepted (possibly ignored)"),
        (status = 400, description = "Unparseable payload"),
        (status = 401, description = "Bad signature"),
        (status = 500, description = "Server error")
    )
)]
#[post("/webhook/stripe")]
pub async fn stripe_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    if !verify_signature(&req, &body, &state.stripe_webhook_key) {
        log::warn!("webhook rejected: bad signature");
        return HttpResponse::Unauthorized().json(json!({"error": "invalid signature"}));
    }

    let Some(raw) = parse_webhook_body(&body) else {
        return HttpResponse::BadRequest().json(json!({"error": "unparseable payload"}));
    };

    let normalized = normalize_payload(raw.clone());

    // Best-effort audit write, decoupled from the webhook result.
    {
        let pool = state.pool.clone();
        let event_type = normalized.event_type.clone();
        let intent = normalized.payment_intent_id.clone();
        tokio::spawn(async move {
            if let Err(e) =
                db::record_webhook_event(&pool, event_type.as_deref(), intent.as_deref(), &raw)
                    .await
            {
                log::error!("webhook audit write failed: {e}");
            }
        });
    }

    if normalized.event_type.as_deref() != Some("checkout.session.completed") {
        return HttpResponse::Ok().json(json!({"ok": true, "ignored": true}));
    }

    let Some(event) = normalized.into_payment_event() else {
        // Incomplete payloads answer 200 so the provider stops retrying.
        return HttpResponse::Ok().json(json!({"ok": true, "ignored": true}));
    };

    match producer::enqueue_payment_event(&state.pool, &event).await {
        Ok(summary) => HttpResponse::Ok().json(json!({
            "ok": true,
            "enqueued": summary.enqueued,
            "skipped": summary.skipped,
        })),
        Err(e) => {
            log::error!("enqueue error intent={}: {e}", event.payment_intent_id);
            HttpResponse::InternalServerError().finish()
        }
    }
}
