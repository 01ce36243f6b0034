use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;
use sqlx::{PgPool, Row};

use sitekey_billing::api::stripe_client::StripeClient;
use sitekey_billing::refunds::run_refund_sweep;

mod support;

fn set_env(key: &str, value: &str) {
    unsafe {
        std::env::set_var(key, value);
    }
}

async fn seed_failed_job(
    pool: &PgPool,
    queue_id: &str,
    payment_intent_id: &str,
    quantity: i32,
    age_hours: i32,
) {
    sqlx::query(
        r#"INSERT INTO queue
               (queue_id, job_type, status, customer_id, user_email, payment_intent_id,
                price_id, license_key, quantity, attempts, max_attempts, error_message,
                created_at, updated_at)
           VALUES ($1, 'license', 'failed', 'cus_rf', 'rf@example.com', $2,
                   'price_rf', 'KEY-RFND-RFND-RFND-RFND', $3, 3, 3, 'provider down',
                   NOW() - make_interval(hours => $4), NOW())"#,
    )
    .bind(queue_id)
    .bind(payment_intent_id)
    .bind(quantity)
    .bind(age_hours)
    .execute(pool)
    .await
    .expect("seed failed job");
}

/// An aged-out failed job is refunded exactly once across repeated sweeps,
/// with the amount split across the original quantity when the price is no
/// longer readable.
#[actix_web::test]
async fn failed_job_is_refunded_exactly_once() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;
    let server = MockServer::start_async().await;
    set_env("STRIPE_API_BASE_URL", &server.url(""));
    let stripe = StripeClient::new("test-stripe".to_string());

    seed_failed_job(pool, "q_refund_1", "pi_refund", 2, 13).await;

    let _intent_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/payment_intents/pi_refund");
        then.status(200).json_body(json!({
            "id": "pi_refund",
            "amount": 5800,
            "currency": "usd",
            "latest_charge": "ch_refund"
        }));
    });
    // Price gone: the sweep falls back to amount / quantity.
    let _price_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/prices/price_rf");
        then.status(404)
            .json_body(json!({"error": {"message": "no such price"}}));
    });
    let refund_mock = server.mock(|when, then| {
        when.method(POST).path("/v1/refunds").body_contains("ch_refund");
        then.status(200)
            .json_body(json!({"id": "re_1", "status": "succeeded"}));
    });

    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);
    refund_mock.assert();

    let row = sqlx::query(
        "SELECT refund_id, charge_id, amount, currency FROM refunds WHERE queue_id = 'q_refund_1'",
    )
    .fetch_one(pool)
    .await
    .expect("refund row");
    let refund_id: String = row.get("refund_id");
    let charge_id: String = row.get("charge_id");
    let amount: i64 = row.get("amount");
    let currency: String = row.get("currency");
    assert_eq!(refund_id, "re_1");
    assert_eq!(charge_id, "ch_refund");
    assert_eq!(amount, 2900);
    assert_eq!(currency, "usd");

    let error_message: Option<String> =
        sqlx::query_scalar("SELECT error_message FROM queue WHERE queue_id = 'q_refund_1'")
            .fetch_one(pool)
            .await
            .expect("marker");
    assert!(
        error_message.as_deref().unwrap_or("").contains("REFUNDED:re_1"),
        "marker missing: {error_message:?}"
    );

    // Second sweep: the marker excludes the job entirely.
    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.processed, 0);
    assert_eq!(refund_mock.hits(), 1);

    let refund_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM refunds WHERE queue_id = 'q_refund_1'")
            .fetch_one(pool)
            .await
            .expect("refund count");
    assert_eq!(refund_count, 1);
}

/// The price's unit amount wins over the intent-derived fallback when the
/// price is still readable.
#[actix_web::test]
async fn refund_amount_prefers_price_unit_amount() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;
    let server = MockServer::start_async().await;
    set_env("STRIPE_API_BASE_URL", &server.url(""));
    let stripe = StripeClient::new("test-stripe".to_string());

    seed_failed_job(pool, "q_refund_2", "pi_refund_2", 2, 13).await;

    let _intent_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/payment_intents/pi_refund_2");
        then.status(200).json_body(json!({
            "id": "pi_refund_2",
            "amount": 9999,
            "currency": "usd",
            "latest_charge": "ch_refund_2"
        }));
    });
    let _price_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/prices/price_rf");
        then.status(200).json_body(json!({
            "id": "price_rf",
            "unit_amount": 2900,
            "currency": "usd",
            "recurring": { "interval": "month" },
            "metadata": {}
        }));
    });
    let refund_mock = server.mock(|when, then| {
        when.method(POST).path("/v1/refunds").body_contains("amount=2900");
        then.status(200)
            .json_body(json!({"id": "re_2", "status": "succeeded"}));
    });

    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.succeeded, 1);
    refund_mock.assert();
}

/// Jobs inside the grace window are left alone; support may still fix and
/// re-drive them.
#[actix_web::test]
async fn recent_failures_are_not_swept() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;
    let server = MockServer::start_async().await;
    set_env("STRIPE_API_BASE_URL", &server.url(""));
    let stripe = StripeClient::new("test-stripe".to_string());

    seed_failed_job(pool, "q_recent", "pi_recent", 1, 1).await;

    let intent_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/payment_intents/pi_recent");
        then.status(200).json_body(json!({
            "id": "pi_recent",
            "amount": 2900,
            "currency": "usd",
            "latest_charge": "ch_recent"
        }));
    });

    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.processed, 0);
    assert_eq!(intent_mock.hits(), 0);
}

/// A refund failure is logged and left for the next sweep; the job stays
/// unmarked so it is retried.
#[actix_web::test]
async fn refund_failure_is_retried_on_next_sweep() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;
    let server = MockServer::start_async().await;
    set_env("STRIPE_API_BASE_URL", &server.url(""));
    let stripe = StripeClient::new("test-stripe".to_string());

    seed_failed_job(pool, "q_flaky", "pi_flaky", 1, 13).await;

    let _intent_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/payment_intents/pi_flaky");
        then.status(200).json_body(json!({
            "id": "pi_flaky",
            "amount": 2900,
            "currency": "usd",
            "latest_charge": "ch_flaky"
        }));
    });
    let _price_mock = server.mock(|when, then| {
        when.method(GET).path("/v1/prices/price_rf");
        then.status(404).json_body(json!({"error": {"message": "gone"}}));
    });
    let mut refund_fail = server.mock(|when, then| {
        when.method(POST).path("/v1/refunds");
        then.status(500)
            .json_body(json!({"error": {"message": "try later"}}));
    });

    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.failed, 1);

    let refund_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refunds")
        .fetch_one(pool)
        .await
        .expect("refund count");
    assert_eq!(refund_count, 0);

    refund_fail.delete();
    let refund_ok = server.mock(|when, then| {
        when.method(POST).path("/v1/refunds");
        then.status(200)
            .json_body(json!({"id": "re_flaky", "status": "succeeded"}));
    });

    let summary = run_refund_sweep(pool, &stripe, 10).await;
    assert_eq!(summary.succeeded, 1);
    refund_ok.assert();
}
