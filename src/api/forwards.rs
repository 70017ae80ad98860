use rocket::{post, serde::json::Json, State};
use serde::{Deserialize, Serialize};

use crate::api::stats::ApiResponse;
use crate::models::{ForwardEvent, Transition};
use crate::server::ServerState;

#[derive(Serialize)]
pub struct ForwardQueued {
    pub queued: bool,
    pub candidates: usize,
}

/// Forward-event webhook. Events are queued to the per-repository
/// workers; admission decisions land in the snowball event log.
#[post("/forwards", data = "<body>")]
pub async fn submit_forward(
    state: &State<ServerState>,
    body: Json<ForwardEvent>,
) -> Json<ApiResponse<ForwardQueued>> {
    let event = body.into_inner();
    if event.candidate_emails.is_empty() {
        return Json(ApiResponse::error(
            "forward event names no candidate emails".to_string(),
        ));
    }

    let candidates = event.candidate_emails.len();
    match state.router.submit(event).await {
        Ok(()) => Json(ApiResponse::success(ForwardQueued {
            queued: true,
            candidates,
        })),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct DeliveryNotice {
    pub repository_id: i64,
    pub email: String,
}

/// Hard-bounce notification from the delivery layer.
#[post("/webhooks/bounce", data = "<body>")]
pub async fn record_bounce(
    state: &State<ServerState>,
    body: Json<DeliveryNotice>,
) -> Json<ApiResponse<Option<Transition>>> {
    match state
        .governor
        .record_bounce(body.repository_id, &body.email)
        .await
    {
        Ok(transition) => Json(ApiResponse::success(transition)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Spam-complaint notification from the delivery layer.
#[post("/webhooks/complaint", data = "<body>")]
pub async fn record_complaint(
    state: &State<ServerState>,
    body: Json<DeliveryNotice>,
) -> Json<ApiResponse<Option<Transition>>> {
    match state
        .governor
        .record_complaint(body.repository_id, &body.email)
        .await
    {
        Ok(transition) => Json(ApiResponse::success(transition)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}
