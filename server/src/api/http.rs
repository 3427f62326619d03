use axum::{
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tourney_types::{PlayerId, TournamentWindow};

use crate::durable::DurableStore;
use crate::error::{StoreError, TournamentError};
use crate::fast::FastStore;
use crate::Tournament;

type SharedTournament<F, D> = Arc<Tournament<F, D>>;

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: u16,
    error: &'static str,
    message: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct RankResponse {
    rank: u32,
}

#[derive(Deserialize)]
pub(super) struct CreatePlayerRequest {
    username: String,
}

#[derive(Deserialize)]
pub(super) struct RankQuery {
    date: String,
}

fn status_of(err: &TournamentError) -> StatusCode {
    match err {
        TournamentError::Rejected(_) | TournamentError::InvalidPlayer(_) => {
            StatusCode::BAD_REQUEST
        }
        TournamentError::NotInTournament
        | TournamentError::NotInTournamentOn(_)
        | TournamentError::NoSuchGroup(_)
        | TournamentError::UnknownPlayer(_) => StatusCode::NOT_FOUND,
        TournamentError::Timeout => StatusCode::REQUEST_TIMEOUT,
        TournamentError::Store(StoreError::Duplicate { .. }) => StatusCode::CONFLICT,
        TournamentError::Cancelled
        | TournamentError::Consistency(_)
        | TournamentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = ErrorResponse {
        status: status.as_u16(),
        error: status.canonical_reason().unwrap_or("Unknown"),
        message,
        timestamp: Utc::now(),
    };
    (status, Json(body)).into_response()
}

fn failure(err: TournamentError) -> Response {
    let status = status_of(&err);
    if status.is_server_error() {
        tracing::error!(?err, "request failed");
        return error_response(status, "Internal server error".to_string());
    }
    error_response(status, err.to_string())
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, TournamentError>) -> Response {
    match result {
        Ok(value) => (status, Json(value)).into_response(),
        Err(err) => failure(err),
    }
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

/// Not ready until the fast store has been rebuilt from durable state.
pub(super) async fn readyz<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
) -> Response {
    if tournament.is_ready() {
        (StatusCode::OK, Json(ReadyResponse { ready: true, reason: None })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                reason: Some("rebuilding"),
            }),
        )
            .into_response()
    }
}

pub(super) async fn metrics<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
) -> Response {
    Json(tournament.metrics()).into_response()
}

pub(super) async fn create_player<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Json(request): Json<CreatePlayerRequest>,
) -> Response {
    respond(
        StatusCode::CREATED,
        tournament.create_player(request.username).await,
    )
}

pub(super) async fn get_player<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
) -> Response {
    respond(StatusCode::OK, tournament.player(player).await)
}

pub(super) async fn level_up<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
) -> Response {
    respond(StatusCode::OK, tournament.level_up(player).await)
}

/// Runs the join wait on its own task. If the client goes away the guard cancels
/// the wait and the player leaves their queue.
pub(super) async fn enter<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let wait = tokio::spawn(async move { tournament.enter(player, cancel).await });
    let joined = wait.await;
    guard.disarm();
    match joined {
        Ok(result) => respond(StatusCode::OK, result),
        Err(err) => {
            tracing::error!(%player, ?err, "join task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

pub(super) async fn group_leaderboard<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
) -> Response {
    respond(StatusCode::OK, tournament.group_leaderboard_for(player).await)
}

pub(super) async fn rank<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
    Query(query): Query<RankQuery>,
) -> Response {
    let Ok(day) = TournamentWindow::parse_day(&query.date) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid date '{}', expected YYYY-MM-DD", query.date),
        );
    };
    let result = tournament
        .rank_on(player, day)
        .await
        .map(|rank| RankResponse { rank });
    respond(StatusCode::OK, result)
}

pub(super) async fn claim_reward<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
    Path(player): Path<PlayerId>,
) -> Response {
    respond(StatusCode::OK, tournament.claim_reward(player).await)
}

pub(super) async fn country_leaderboard<F: FastStore, D: DurableStore>(
    AxumState(tournament): AxumState<SharedTournament<F, D>>,
) -> Response {
    respond(StatusCode::OK, tournament.country_leaderboard().await)
}
