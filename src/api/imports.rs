use rocket::{delete, get, post, serde::json::Json, State};
use serde::{Deserialize, Serialize};

use crate::api::stats::ApiResponse;
use crate::models::CsvImportRecord;
use crate::server::ServerState;

#[derive(Deserialize)]
pub struct ImportUploadRequest {
    pub filename: String,
    /// CSV payload as text; the upload layer has already pulled the
    /// bytes off the wire.
    pub content: String,
    pub declared_size: Option<usize>,
    pub uploaded_by: String,
}

#[derive(Serialize)]
pub struct ImportEnqueued {
    pub import_id: String,
}

/// Enqueue a CSV import and return immediately with a tracking id.
#[post("/repositories/<id>/imports", data = "<body>")]
pub async fn upload_import(
    state: &State<ServerState>,
    id: i64,
    body: Json<ImportUploadRequest>,
) -> Json<ApiResponse<ImportEnqueued>> {
    let body = body.into_inner();
    let bytes = body.content.into_bytes();
    let declared = body.declared_size.unwrap_or(bytes.len());

    match state
        .imports
        .enqueue(id, &body.filename, &body.uploaded_by, bytes, declared)
        .await
    {
        Ok(import_id) => Json(ApiResponse::success(ImportEnqueued { import_id })),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[get("/imports/<import_id>")]
pub async fn get_import(
    state: &State<ServerState>,
    import_id: &str,
) -> Json<ApiResponse<CsvImportRecord>> {
    match state.imports.status(import_id).await {
        Ok(Some(record)) => Json(ApiResponse::success(record)),
        Ok(None) => Json(ApiResponse::error(format!("import {} not found", import_id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Cancel a running import. Rows admitted before the cancel stick; the
/// record finishes as failed with a partial-result log.
#[delete("/imports/<import_id>")]
pub async fn cancel_import(
    state: &State<ServerState>,
    import_id: &str,
) -> Json<ApiResponse<bool>> {
    match state.imports.cancel(import_id).await {
        Ok(cancelled) => Json(ApiResponse::success(cancelled)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}
