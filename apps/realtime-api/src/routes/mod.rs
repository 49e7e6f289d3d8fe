pub mod health;
pub mod leaderboard;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", leaderboard::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        leaderboard::get_leaderboard,
        leaderboard::get_standing,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Models
            crate::models::message::Message,
            crate::models::message::DeliveryStatus,
            crate::models::transaction::PointTransaction,
            crate::models::transaction::TransactionStatus,
            crate::models::leaderboard::Period,
            crate::models::leaderboard::LeaderboardEntry,
            // Route request/response types
            health::HealthResponse,
            leaderboard::LeaderboardResponse,
        )
    ),
    info(
        title = "realtime-api",
        description = "Real-time fan-out core: message delivery, presence, points, leaderboards"
    )
)]
pub struct ApiDoc;
