use rocket::{get, post, put, serde::json::Json, State};
use serde::Deserialize;

use crate::api::stats::ApiResponse;
use crate::database::{
    archive_repository, create_repository, get_repository, update_repository_settings,
    update_snowball_config, NewRepository,
};
use crate::membership::{AddOutcome, EngagementKind, StateChange};
use crate::models::{MemberSource, Repository, RepositorySettings, SnowballConfig};
use crate::server::ServerState;

#[derive(Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    pub owner: String,
    pub visibility: Option<String>,
    pub settings: Option<RepositorySettings>,
    pub snowball: Option<SnowballConfig>,
}

#[post("/repositories", data = "<body>")]
pub async fn create_repo(
    state: &State<ServerState>,
    body: Json<CreateRepositoryRequest>,
) -> Json<ApiResponse<Repository>> {
    let body = body.into_inner();
    let new = NewRepository {
        name: body.name,
        owner: body.owner,
        visibility: body.visibility.unwrap_or_else(|| "private".to_string()),
        settings: body.settings.unwrap_or_else(|| state.config.repository.clone()),
        snowball: body.snowball.unwrap_or_else(|| state.config.snowball.clone()),
    };

    match create_repository(&state.db_pool, new).await {
        Ok(repo) => Json(ApiResponse::success(repo)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[get("/repositories/<id>")]
pub async fn get_repo(state: &State<ServerState>, id: i64) -> Json<ApiResponse<Repository>> {
    match get_repository(&state.db_pool, id).await {
        Ok(Some(repo)) => Json(ApiResponse::success(repo)),
        Ok(None) => Json(ApiResponse::error(format!("repository {} not found", id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(serde::Serialize)]
pub struct SettingsView {
    pub settings: RepositorySettings,
    pub snowball: SnowballConfig,
}

#[get("/repositories/<id>/settings")]
pub async fn get_settings(state: &State<ServerState>, id: i64) -> Json<ApiResponse<SettingsView>> {
    match get_repository(&state.db_pool, id).await {
        Ok(Some(repo)) => Json(ApiResponse::success(SettingsView {
            settings: repo.settings,
            snowball: repo.snowball,
        })),
        Ok(None) => Json(ApiResponse::error(format!("repository {} not found", id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub settings: Option<RepositorySettings>,
    pub snowball: Option<SnowballConfig>,
}

/// Settings-update hook. Both sections are validated before anything is
/// written, so a bad snowball block cannot half-apply.
#[put("/repositories/<id>/settings", data = "<body>")]
pub async fn update_settings(
    state: &State<ServerState>,
    id: i64,
    body: Json<UpdateSettingsRequest>,
) -> Json<ApiResponse<SettingsView>> {
    let body = body.into_inner();

    if let Some(settings) = &body.settings {
        if let Err(e) = settings.validate() {
            return Json(ApiResponse::error(e));
        }
    }
    if let Some(snowball) = &body.snowball {
        if let Err(e) = snowball.validate() {
            return Json(ApiResponse::error(e));
        }
    }

    if let Some(settings) = &body.settings {
        match update_repository_settings(&state.db_pool, id, settings).await {
            Ok(true) => {}
            Ok(false) => {
                return Json(ApiResponse::error(format!("repository {} not found", id)))
            }
            Err(e) => return Json(ApiResponse::error(e.to_string())),
        }
    }
    if let Some(snowball) = &body.snowball {
        match update_snowball_config(&state.db_pool, id, snowball).await {
            Ok(true) => {}
            Ok(false) => {
                return Json(ApiResponse::error(format!("repository {} not found", id)))
            }
            Err(e) => return Json(ApiResponse::error(e.to_string())),
        }
    }

    match get_repository(&state.db_pool, id).await {
        Ok(Some(repo)) => Json(ApiResponse::success(SettingsView {
            settings: repo.settings,
            snowball: repo.snowball,
        })),
        Ok(None) => Json(ApiResponse::error(format!("repository {} not found", id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Soft archive. The repository and its members stay on disk; new
/// additions and snowball growth stop.
#[post("/repositories/<id>/archive")]
pub async fn archive_repo(state: &State<ServerState>, id: i64) -> Json<ApiResponse<bool>> {
    match archive_repository(&state.db_pool, id).await {
        Ok(true) => Json(ApiResponse::success(true)),
        Ok(false) => Json(ApiResponse::error(format!("repository {} not found", id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    pub added_by: Option<String>,
    pub tags: Option<Vec<String>>,
    pub subscribed: Option<bool>,
    pub override_removed: Option<bool>,
}

#[post("/repositories/<id>/members", data = "<body>")]
pub async fn add_member(
    state: &State<ServerState>,
    id: i64,
    body: Json<AddMemberRequest>,
) -> Json<ApiResponse<AddOutcome>> {
    let repo = match get_repository(&state.db_pool, id).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return Json(ApiResponse::error(format!("repository {} not found", id))),
        Err(e) => return Json(ApiResponse::error(e.to_string())),
    };

    let body = body.into_inner();
    let verdict = state.classifier.classify(&body.email);
    match state
        .store
        .add_member(
            &repo,
            &verdict,
            MemberSource::Api,
            body.added_by.as_deref(),
            &body.tags.unwrap_or_default(),
            body.subscribed.unwrap_or(true),
            body.override_removed.unwrap_or(false),
        )
        .await
    {
        Ok(outcome) => Json(ApiResponse::success(outcome)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct MemberActionRequest {
    pub email: String,
}

#[post("/repositories/<id>/members/verify", data = "<body>")]
pub async fn verify_member(
    state: &State<ServerState>,
    id: i64,
    body: Json<MemberActionRequest>,
) -> Json<ApiResponse<StateChange>> {
    match state.store.verify(id, &body.email).await {
        Ok(change) => Json(ApiResponse::success(change)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[post("/repositories/<id>/members/opt-out", data = "<body>")]
pub async fn opt_out_member(
    state: &State<ServerState>,
    id: i64,
    body: Json<MemberActionRequest>,
) -> Json<ApiResponse<StateChange>> {
    match state.store.opt_out(id, &body.email, "member request").await {
        Ok(change) => Json(ApiResponse::success(change)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[post("/repositories/<id>/members/remove", data = "<body>")]
pub async fn remove_member(
    state: &State<ServerState>,
    id: i64,
    body: Json<MemberActionRequest>,
) -> Json<ApiResponse<StateChange>> {
    match state.store.remove(id, &body.email).await {
        Ok(change) => Json(ApiResponse::success(change)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct EngagementRequest {
    pub email: String,
    pub kind: String,
}

#[post("/repositories/<id>/members/engagement", data = "<body>")]
pub async fn record_engagement(
    state: &State<ServerState>,
    id: i64,
    body: Json<EngagementRequest>,
) -> Json<ApiResponse<bool>> {
    let kind = match body.kind.as_str() {
        "open" => EngagementKind::Open,
        "click" => EngagementKind::Click,
        "reply" => EngagementKind::Reply,
        "forward" => EngagementKind::Forward,
        other => {
            return Json(ApiResponse::error(format!(
                "unknown engagement kind '{}'",
                other
            )))
        }
    };

    match state.store.record_engagement(id, &body.email, kind).await {
        Ok(recorded) => Json(ApiResponse::success(recorded)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[get("/repositories/<id>/digest-recipients")]
pub async fn get_digest_recipients(
    state: &State<ServerState>,
    id: i64,
) -> Json<ApiResponse<Vec<String>>> {
    match state.store.digest_recipients(id).await {
        Ok(recipients) => Json(ApiResponse::success(recipients)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}
