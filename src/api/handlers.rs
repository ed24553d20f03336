//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use super::AppState;
use super::types::{ErrorResponse, ParticipantSummary, StateResponse, TickQuery};
use crate::sim::snapshot::MarketSnapshot;

/// Returns scenario, KPIs, and the state after the last tick.
///
/// `GET /state` → 200 + `StateResponse` JSON
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    Json(StateResponse {
        config: state.config.clone(),
        kpis: state.kpis.clone(),
        latest: state.reports.last().map(MarketSnapshot::from_report),
    })
}

/// Returns tick reports, optionally filtered by step range.
///
/// `GET /ticks` → 200 + every `TickReport`
/// `GET /ticks?from=N&to=M` → filtered range (inclusive)
/// `GET /ticks?from=10&to=5` → 400 + `ErrorResponse`
pub async fn get_ticks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TickQuery>,
) -> impl IntoResponse {
    let from = query.from.unwrap_or(0);
    let to = query.to.unwrap_or(usize::MAX);

    if from > to {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("`from` ({from}) must be <= `to` ({to})"),
            }),
        ));
    }

    let reports: Vec<_> = state
        .reports
        .iter()
        .filter(|r| r.step >= from && r.step <= to)
        .cloned()
        .collect();

    Ok(Json(reports))
}

/// Returns every participant's final state and run totals.
///
/// `GET /participants` → 200 + `Vec<ParticipantSummary>` JSON
pub async fn get_participants(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ParticipantSummary>> {
    let summaries = state
        .participants
        .iter()
        .map(|p| ParticipantSummary::from_reports(p, &state.reports))
        .collect();
    Json(summaries)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use super::*;
    use crate::api::router;
    use crate::config::ScenarioConfig;
    use crate::runner::run_scenario;

    fn make_test_state() -> Arc<AppState> {
        let mut config = ScenarioConfig::echo_grid();
        config.simulation.steps = 24;
        let out = run_scenario(&config).unwrap();
        Arc::new(AppState::from(out))
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let app = router(make_test_state());
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn state_returns_200() {
        let (status, json) = get_json("/state").await;

        assert_eq!(status, StatusCode::OK);
        assert!(json.get("config").is_some());
        assert!(json.get("kpis").is_some());
        assert_eq!(json["latest"]["step"], 23);
    }

    #[tokio::test]
    async fn ticks_returns_all_steps() {
        let (status, json) = get_json("/ticks").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(24));
    }

    #[tokio::test]
    async fn ticks_range_query() {
        let (status, json) = get_json("/ticks?from=5&to=10").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(6)); // steps 5..=10
        assert_eq!(json[0]["step"], 5);
        assert_eq!(json[5]["step"], 10);
        assert_eq!(json[0]["timestamp"], "02:30");
    }

    #[tokio::test]
    async fn ticks_invalid_range_returns_400() {
        let (status, json) = get_json("/ticks?from=10&to=5").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json.get("error").is_some());
    }

    #[tokio::test]
    async fn participants_lists_final_state() {
        let (status, json) = get_json("/participants").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["id"], "house_a");
        assert_eq!(json[1]["id"], "house_b");
        assert!(json[0].get("p2p_sold_kwh").is_some());
    }
}
