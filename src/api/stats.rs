use rocket::{get, serde::json::Json, State};
use serde::Serialize;

use crate::analytics::{snapshot, AnalyticsSnapshot};
use crate::server::ServerState;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[get("/repositories/<id>/analytics")]
pub async fn get_analytics(
    state: &State<ServerState>,
    id: i64,
) -> Json<ApiResponse<AnalyticsSnapshot>> {
    match snapshot(&state.db_pool, &state.config.analytics, &state.governor, id).await {
        Ok(snap) => Json(ApiResponse::success(snap)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}
