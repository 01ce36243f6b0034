use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::webhooks_stripe::stripe_webhook,
        crate::api::ops::process_queue,
        crate::api::ops::refund_sweep,
        crate::api::ops::queue_stats
    ),
    components(
        schemas(
            crate::models::CycleSummary,
            crate::producer::EnqueueSummary,
            crate::producer::SkippedEnqueue
        )
    ),
    tags(
        (name = "webhooks", description = "Payment provider callbacks"),
        (name = "internal", description = "Queue and refund triggers")
    )
)]
pub struct ApiDoc;
