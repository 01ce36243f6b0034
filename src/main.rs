// src/main.rs
use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use dotenvy::dotenv;
use sqlx::PgPool;
use std::env;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use sitekey_billing::api::stripe_client::StripeClient;
use sitekey_billing::{AppState, api, docs, processor};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let stripe_api_key = env::var("STRIPE_API_KEY").expect("STRIPE_API_KEY required");
    let stripe_webhook_key = env::var("STRIPE_WEBHOOK_KEY").expect("STRIPE_WEBHOOK_KEY required");
    let internal_api_key = env::var("INTERNAL_API_KEY").expect("INTERNAL_API_KEY required");

    let stripe = StripeClient::new(stripe_api_key);

    // Periodic provisioning + refund loops; the HTTP triggers below drive
    // the same entry points for cron and manual runs.
    processor::start_queue_workers(pool.clone(), stripe.clone());

    let state = web::Data::new(AppState {
        pool,
        stripe,
        stripe_webhook_key,
        internal_api_key,
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            .service(api::webhooks_stripe::stripe_webhook)
            .service(api::ops::process_queue)
            .service(api::ops::refund_sweep)
            .service(api::ops::queue_stats)
    })
    .bind(("0.0.0.0", 8070))?
    .run()
    .await
}
