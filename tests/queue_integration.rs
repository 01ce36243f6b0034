use serde_json::json;
use sqlx::Row;
use std::collections::HashSet;

use sitekey_billing::license_keys::generate_unique_license_key;
use sitekey_billing::producer::{self, PaymentEvent};
use sitekey_billing::queue::{self, NewJob, RetryDisposition};

mod support;

fn quantity_event(payment_intent_id: &str, license_key: &str) -> PaymentEvent {
    PaymentEvent {
        event_type: "checkout.session.completed".to_string(),
        mode: "payment".to_string(),
        payment_intent_id: payment_intent_id.to_string(),
        customer_id: "cus_itest".to_string(),
        user_email: "itest@example.com".to_string(),
        price_id: "price_itest".to_string(),
        quantity: 1,
        amount_total: Some(2900),
        metadata: json!({
            "use_case": "quantity",
            "quantity": 1,
            "license_keys": [license_key]
        }),
    }
}

fn test_job<'a>(payment_intent_id: &'a str, license_key: &'a str) -> NewJob<'a> {
    NewJob {
        job_type: "license",
        customer_id: "cus_itest",
        user_email: "itest@example.com",
        payment_intent_id,
        price_id: "price_itest",
        license_key: Some(license_key),
        quantity: 1,
        sites: None,
    }
}

#[actix_web::test]
async fn enqueue_is_idempotent_per_intent_and_key() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let event = quantity_event("pi_dup", "KEY-AAAA-BBBB-CCCC-DDDD");

    let first = producer::enqueue_payment_event(pool, &event)
        .await
        .expect("first enqueue");
    assert_eq!(first.enqueued.len(), 1);
    assert!(first.skipped.is_empty());

    let second = producer::enqueue_payment_event(pool, &event)
        .await
        .expect("second enqueue");
    assert!(second.enqueued.is_empty());
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(second.skipped[0].reason, "duplicate");
    assert_eq!(second.skipped[0].queue_id.as_deref(), Some(first.enqueued[0].as_str()));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE payment_intent_id = $1")
        .bind("pi_dup")
        .fetch_one(pool)
        .await
        .expect("count jobs");
    assert_eq!(count, 1);
}

#[actix_web::test]
async fn quantity_fanout_creates_one_job_per_unit() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let event = PaymentEvent {
        metadata: json!({"use_case": "quantity", "quantity": 3}),
        ..quantity_event("pi_fanout", "unused")
    };

    let summary = producer::enqueue_payment_event(pool, &event)
        .await
        .expect("enqueue");
    assert_eq!(summary.enqueued.len(), 3);

    let keys: Vec<String> =
        sqlx::query_scalar("SELECT license_key FROM queue WHERE payment_intent_id = $1 ORDER BY license_key")
            .bind("pi_fanout")
            .fetch_all(pool)
            .await
            .expect("select keys");
    assert_eq!(keys, vec!["L1", "L2", "L3"]);
}

#[actix_web::test]
async fn site_batch_enqueue_is_idempotent_per_intent() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let event = PaymentEvent {
        metadata: json!({"sites": ["shop-a.invalid", "shop-b.invalid"]}),
        ..quantity_event("pi_sites", "unused")
    };

    let first = producer::enqueue_payment_event(pool, &event)
        .await
        .expect("first enqueue");
    assert_eq!(first.enqueued.len(), 1);

    let second = producer::enqueue_payment_event(pool, &event)
        .await
        .expect("second enqueue");
    assert!(second.enqueued.is_empty());
    assert_eq!(second.skipped[0].reason, "duplicate");

    let row = sqlx::query("SELECT job_type, quantity, sites FROM queue WHERE payment_intent_id = $1")
        .bind("pi_sites")
        .fetch_one(pool)
        .await
        .expect("select job");
    let job_type: String = row.get("job_type");
    let quantity: i32 = row.get("quantity");
    assert_eq!(job_type, "site_batch");
    assert_eq!(quantity, 2);
}

#[actix_web::test]
async fn claim_is_won_by_exactly_one_worker() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let queue_id = queue::enqueue_job(pool, &test_job("pi_race", "KEY-RACE-RACE-RACE-RACE"))
        .await
        .expect("enqueue");

    let (a, b) = tokio::join!(
        queue::claim_job(pool, &queue_id),
        queue::claim_job(pool, &queue_id)
    );
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    assert!(a ^ b, "exactly one claim must win (a={a}, b={b})");

    let status: String = sqlx::query_scalar("SELECT status FROM queue WHERE queue_id = $1")
        .bind(&queue_id)
        .fetch_one(pool)
        .await
        .expect("status");
    assert_eq!(status, "processing");
}

#[actix_web::test]
async fn failed_attempt_schedules_backoff_and_defers_job() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let queue_id = queue::enqueue_job(pool, &test_job("pi_retry", "KEY-RTRY-RTRY-RTRY-RTRY"))
        .await
        .expect("enqueue");
    assert!(queue::claim_job(pool, &queue_id).await.expect("claim"));

    let job = queue::get_job(pool, &queue_id)
        .await
        .expect("get job")
        .expect("job exists");
    let before = chrono::Utc::now().timestamp();

    let disposition = queue::record_failure(pool, &job, "provider timeout")
        .await
        .expect("record failure");
    match disposition {
        RetryDisposition::Scheduled {
            attempts,
            next_retry_at,
        } => {
            assert_eq!(attempts, 1);
            let delay = next_retry_at - before;
            assert!((119..=122).contains(&delay), "delay was {delay}");
        }
        other => panic!("expected scheduled retry, got {other:?}"),
    }

    // Deferred: not due until the backoff elapses.
    let due = queue::due_jobs(pool, 10).await.expect("due jobs");
    assert!(due.iter().all(|j| j.queue_id != queue_id));

    // Once the retry time passes it becomes claimable again.
    sqlx::query("UPDATE queue SET next_retry_at = $1 WHERE queue_id = $2")
        .bind(before - 1)
        .bind(&queue_id)
        .execute(pool)
        .await
        .expect("force due");
    let due = queue::due_jobs(pool, 10).await.expect("due jobs");
    assert!(due.iter().any(|j| j.queue_id == queue_id));
}

#[actix_web::test]
async fn exhausted_attempts_park_job_as_failed() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let queue_id = queue::enqueue_job(pool, &test_job("pi_dead", "KEY-DEAD-DEAD-DEAD-DEAD"))
        .await
        .expect("enqueue");
    sqlx::query("UPDATE queue SET attempts = 2, status = 'processing' WHERE queue_id = $1")
        .bind(&queue_id)
        .execute(pool)
        .await
        .expect("seed attempts");

    let job = queue::get_job(pool, &queue_id)
        .await
        .expect("get job")
        .expect("job exists");
    let disposition = queue::record_failure(pool, &job, "still broken")
        .await
        .expect("record failure");
    assert_eq!(disposition, RetryDisposition::Exhausted { attempts: 3 });

    let row = sqlx::query("SELECT status, error_message FROM queue WHERE queue_id = $1")
        .bind(&queue_id)
        .fetch_one(pool)
        .await
        .expect("select");
    let status: String = row.get("status");
    let error_message: Option<String> = row.get("error_message");
    assert_eq!(status, "failed");
    assert_eq!(error_message.as_deref(), Some("still broken"));

    // Never claimed again: not due, and the conditional claim misses.
    let due = queue::due_jobs(pool, 10).await.expect("due jobs");
    assert!(due.iter().all(|j| j.queue_id != queue_id));
    assert!(!queue::claim_job(pool, &queue_id).await.expect("claim"));
}

#[actix_web::test]
async fn reclaimer_returns_stale_processing_jobs() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let stale_id = queue::enqueue_job(pool, &test_job("pi_stale", "KEY-STAL-STAL-STAL-STAL"))
        .await
        .expect("enqueue stale");
    let fresh_id = queue::enqueue_job(pool, &test_job("pi_fresh", "KEY-FRSH-FRSH-FRSH-FRSH"))
        .await
        .expect("enqueue fresh");

    assert!(queue::claim_job(pool, &stale_id).await.expect("claim stale"));
    assert!(queue::claim_job(pool, &fresh_id).await.expect("claim fresh"));

    sqlx::query("UPDATE queue SET updated_at = NOW() - INTERVAL '6 minutes' WHERE queue_id = $1")
        .bind(&stale_id)
        .execute(pool)
        .await
        .expect("backdate");

    let reclaimed = queue::reclaim_stuck_jobs(pool).await.expect("reclaim");
    assert_eq!(reclaimed, 1);

    let stale_status: String = sqlx::query_scalar("SELECT status FROM queue WHERE queue_id = $1")
        .bind(&stale_id)
        .fetch_one(pool)
        .await
        .expect("stale status");
    let fresh_status: String = sqlx::query_scalar("SELECT status FROM queue WHERE queue_id = $1")
        .bind(&fresh_id)
        .fetch_one(pool)
        .await
        .expect("fresh status");
    assert_eq!(stale_status, "pending");
    assert_eq!(fresh_status, "processing");

    // Attempts untouched, and the job is claimable again.
    assert!(queue::claim_job(pool, &stale_id).await.expect("reclaim claim"));
}

#[actix_web::test]
async fn generated_keys_unique_against_prepopulated_store() {
    let test_db = support::init_test_db().await;
    let pool = &test_db.pool;

    let mut existing = HashSet::new();
    for i in 0..100 {
        let key = format!("KEY-SEED-SEED-SEED-{i:04}");
        sqlx::query(
            r#"INSERT INTO licenses (license_key, customer_id, status, billing_period)
               VALUES ($1, 'cus_seed', 'active', 'monthly')"#,
        )
        .bind(&key)
        .execute(pool)
        .await
        .expect("seed license");
        existing.insert(key);
    }

    let mut generated = HashSet::new();
    for _ in 0..1_000 {
        let key = generate_unique_license_key(pool).await.expect("generate");
        assert!(!existing.contains(&key), "collided with stored key: {key}");
        assert!(generated.insert(key), "generator repeated a key");
    }
}
