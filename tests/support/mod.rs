use sqlx::PgPool;
use std::env;
use std::sync::OnceLock;
use tokio::sync::{Mutex, MutexGuard};

use sitekey_billing::AppState;
use sitekey_billing::api::stripe_client::StripeClient;

// Tests inside one binary share TEST_DATABASE_URL, so they hold this guard
// for their whole lifetime; each one starts from a freshly created schema.
static TEST_DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// `postgres://.../name?params` -> (admin url pointing at `postgres`, name)
fn admin_url_and_db_name(url: &str) -> (String, String) {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let slash = base.rfind('/').expect("database url without a path");
    let db_name = &base[slash + 1..];
    assert!(!db_name.is_empty(), "database name is empty");

    let mut admin_url = format!("{}postgres", &base[..slash + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }
    (admin_url, db_name.to_string())
}

pub async fn init_test_db() -> TestDb {
    dotenvy::dotenv().ok();
    let test_url = env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let (admin_url, db_name) = admin_url_and_db_name(&test_url);

    let guard = TEST_DB_LOCK.get_or_init(|| Mutex::new(())).lock().await;

    let admin_pool = PgPool::connect(&admin_url).await.expect("connect admin db");

    // Guard against another test binary recreating the db at the same time.
    let _ = sqlx::query("SELECT pg_advisory_lock(710911)")
        .execute(&admin_pool)
        .await;

    let quoted = format!("\"{}\"", db_name.replace('"', "\"\""));
    let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {quoted} WITH (FORCE)"))
        .execute(&admin_pool)
        .await;
    sqlx::query(&format!("CREATE DATABASE {quoted}"))
        .execute(&admin_pool)
        .await
        .expect("create test db");

    let _ = sqlx::query("SELECT pg_advisory_unlock(710911)")
        .execute(&admin_pool)
        .await;
    admin_pool.close().await;

    let pool = PgPool::connect(&test_url).await.expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");

    TestDb { pool, _guard: guard }
}

#[allow(dead_code)]
pub fn build_state(pool: PgPool, stripe_webhook_key: &str) -> AppState {
    AppState {
        pool,
        stripe: StripeClient::new("test-stripe".to_string()),
        stripe_webhook_key: stripe_webhook_key.to_string(),
        internal_api_key: "test-internal".to_string(),
    }
}
