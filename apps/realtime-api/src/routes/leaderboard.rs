//! Leaderboard read endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::FanoutError;
use crate::models::leaderboard::{LeaderboardEntry, Period};
use crate::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/leaderboard/{period}", get(get_leaderboard))
        .route("/leaderboard/{period}/users/{user_id}", get(get_standing))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    /// Rows per page (max 100).
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderboardResponse {
    pub period: Period,
    pub entries: Vec<LeaderboardEntry>,
    pub limit: usize,
    pub offset: usize,
}

#[utoipa::path(
    get,
    path = "/api/v1/leaderboard/{period}",
    params(
        ("period" = String, Path, description = "daily, weekly, monthly, or alltime"),
        PageQuery,
    ),
    responses(
        (status = 200, description = "A page of the period's leaderboard", body = LeaderboardResponse),
        (status = 400, description = "Unknown period", body = crate::error::ApiErrorBody)
    )
)]
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Path(period): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<LeaderboardResponse>, FanoutError> {
    let period: Period = period
        .parse()
        .map_err(|e: String| FanoutError::validation(e))?;
    let limit = page.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = page.offset.unwrap_or(0);

    let entries = state.leaderboard.get(period, limit, offset);
    Ok(Json(LeaderboardResponse {
        period,
        entries,
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/leaderboard/{period}/users/{user_id}",
    params(
        ("period" = String, Path, description = "daily, weekly, monthly, or alltime"),
        ("user_id" = String, Path, description = "User to look up"),
    ),
    responses(
        (status = 200, description = "The user's rank and points in the period", body = LeaderboardEntry),
        (status = 404, description = "User not on the board", body = crate::error::ApiErrorBody)
    )
)]
pub async fn get_standing(
    State(state): State<AppState>,
    Path((period, user_id)): Path<(String, String)>,
) -> Result<Json<LeaderboardEntry>, FanoutError> {
    let period: Period = period
        .parse()
        .map_err(|e: String| FanoutError::validation(e))?;
    let entry = state
        .leaderboard
        .standing_of(period, &user_id)
        .ok_or_else(|| {
            FanoutError::not_found(format!("{user_id} has no {period} standing"))
        })?;
    Ok(Json(entry))
}
