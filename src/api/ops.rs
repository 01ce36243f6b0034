// src/api/ops.rs
//
// Internal trigger surface for the schedulers: the same entry points the
// background loops use, callable from cron or by hand. Guarded by a shared
// secret header.

use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde::Deserialize;
use serde_json::json;

use crate::{AppState, processor, queue, refunds};

fn authorized(req: &HttpRequest, state: &AppState) -> bool {
    req.headers()
        .get("X-Internal-Key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == state.internal_api_key)
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/internal/queue/process",
    tag = "internal",
    responses(
        (status = 200, description = "Cycle summary", body = crate::models::CycleSummary),
        (status = 401, description = "Missing or wrong internal key")
    )
)]
#[post("/internal/queue/process")]
pub async fn process_queue(
    req: HttpRequest,
    query: web::Query<LimitQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    if !authorized(&req, &state) {
        return HttpResponse::Unauthorized().finish();
    }

    let limit = query.limit.unwrap_or(25).clamp(1, 500);
    let summary = processor::run_processing_cycle(&state.pool, &state.stripe, limit).await;
    HttpResponse::Ok().json(summary)
}

#[utoipa::path(
    post,
    path = "/internal/refunds/sweep",
    tag = "internal",
    responses(
        (status = 200, description = "Sweep summary", body = crate::models::CycleSummary),
        (status = 401, description = "Missing or wrong internal key")
    )
)]
#[post("/internal/refunds/sweep")]
pub async fn refund_sweep(
    req: HttpRequest,
    query: web::Query<LimitQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    if !authorized(&req, &state) {
        return HttpResponse::Unauthorized().finish();
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let summary = refunds::run_refund_sweep(&state.pool, &state.stripe, limit).await;
    HttpResponse::Ok().json(summary)
}

#[utoipa::path(
    get,
    path = "/internal/queue/stats",
    tag = "internal",
    responses(
        (status = 200, description = "Job counts by status"),
        (status = 401, description = "Missing or wrong internal key")
    )
)]
#[get("/internal/queue/stats")]
pub async fn queue_stats(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if !authorized(&req, &state) {
        return HttpResponse::Unauthorized().finish();
    }

    match queue::status_counts(&state.pool).await {
        Ok(counts) => {
            let stats: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(status, count)| (status, json!(count)))
                .collect();
            HttpResponse::Ok().json(stats)
        }
        Err(e) => {
            log::error!("queue stats error: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
