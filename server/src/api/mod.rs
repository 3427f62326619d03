use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::durable::DurableStore;
use crate::fast::FastStore;
use crate::Tournament;

mod http;

pub struct Api<F, D> {
    tournament: Arc<Tournament<F, D>>,
}

impl<F: FastStore, D: DurableStore> Api<F, D> {
    pub fn new(tournament: Arc<Tournament<F, D>>) -> Self {
        Self { tournament }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(http::healthz))
            .route("/readyz", get(http::readyz::<F, D>))
            .route("/metrics", get(http::metrics::<F, D>))
            .route("/api/v1/players", post(http::create_player::<F, D>))
            .route("/api/v1/players/:id", get(http::get_player::<F, D>))
            .route("/api/v1/players/:id/level", put(http::level_up::<F, D>))
            .route(
                "/api/v1/players/:id/tournament/enter",
                post(http::enter::<F, D>),
            )
            .route(
                "/api/v1/players/:id/tournament/group-leaderboard",
                get(http::group_leaderboard::<F, D>),
            )
            .route(
                "/api/v1/players/:id/tournament/rank",
                get(http::rank::<F, D>),
            )
            .route(
                "/api/v1/players/:id/claim-reward",
                post(http::claim_reward::<F, D>),
            )
            .route(
                "/api/v1/tournament/country-leaderboard",
                get(http::country_leaderboard::<F, D>),
            )
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self.tournament.clone())
    }
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Clock, MemoryFastStore, SqliteStore, TournamentConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, StatusCode};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    type TestTournament = Tournament<MemoryFastStore, SqliteStore>;

    fn tournament(hour: u32) -> Arc<TestTournament> {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap());
        Arc::new(
            Tournament::new(
                TournamentConfig::default(),
                Arc::new(MemoryFastStore::new()),
                Arc::new(SqliteStore::open_in_memory().unwrap()),
                clock,
            )
            .unwrap(),
        )
    }

    async fn call(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_readyz_waits_for_rebuild() {
        let t = tournament(10);
        let router = Api::new(t.clone()).router();
        let (status, body) = call(router.clone(), Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        t.rebuild().await.unwrap();
        let (status, _) = call(router, Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_level_player() {
        let t = tournament(10);
        t.rebuild().await.unwrap();
        let router = Api::new(t).router();

        let (status, player) = call(
            router.clone(),
            Method::POST,
            "/api/v1/players",
            Some(json!({ "username": "mehmet" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(player["level"], 1);
        let id = player["id"].as_str().unwrap().to_string();

        let (status, leveled) = call(
            router.clone(),
            Method::PUT,
            &format!("/api/v1/players/{id}/level"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(leveled["level"], 2);
        assert_eq!(leveled["coins"], 5_025);

        let (status, body) = call(
            router,
            Method::POST,
            "/api/v1/players",
            Some(json!({ "username": "mehmet" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);
    }

    #[tokio::test]
    async fn test_rejection_is_json_bad_request() {
        let t = tournament(10);
        t.rebuild().await.unwrap();
        let player = t.create_player("newbie".to_string()).await.unwrap();
        let router = Api::new(t).router();

        let (status, body) = call(
            router,
            Method::POST,
            &format!("/api/v1/players/{}/tournament/enter", player.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert_eq!(body["error"], "Bad Request");
        assert_eq!(
            body["message"],
            "You must be at least level 20 in order to participate in a tournament"
        );
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_not_in_tournament_is_not_found() {
        let t = tournament(10);
        t.rebuild().await.unwrap();
        let player = t.create_player("ghost".to_string()).await.unwrap();
        let router = Api::new(t).router();

        let (status, body) = call(
            router.clone(),
            Method::GET,
            &format!("/api/v1/players/{}/tournament/group-leaderboard", player.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "You are not in the tournament at the moment");

        let (status, _) = call(
            router.clone(),
            Method::GET,
            &format!("/api/v1/players/{}/tournament/rank?date=2024-04-30", player.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            router,
            Method::GET,
            &format!("/api/v1/players/{}/tournament/rank?date=yesterday", player.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_country_leaderboard_and_metrics() {
        let t = tournament(10);
        t.rebuild().await.unwrap();
        let router = Api::new(t).router();

        let (status, body) = call(
            router.clone(),
            Method::GET,
            "/api/v1/tournament/country-leaderboard",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["standings"].as_array().unwrap().len(), 5);

        let (status, body) = call(router, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rebuilds"], 1);
    }
}
