//! REST API over a finished market run.
//!
//! Provides three GET endpoints:
//! - `/state`: scenario, KPIs, and the last committed snapshot
//! - `/ticks`: tick reports with optional inclusive range filtering
//! - `/participants`: final participant state with run totals

mod handlers;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tracing::info;

use crate::config::ScenarioConfig;
use crate::runner::RunOutput;
use crate::sim::kpi::MarketKpis;
use crate::sim::types::{Participant, TickReport};

/// Immutable application state shared across all request handlers.
///
/// Constructed once after the run completes and wrapped in `Arc`; no locks
/// are needed since all data is read-only.
pub struct AppState {
    /// Scenario the run was built from.
    pub config: ScenarioConfig,
    /// Aggregate market KPIs.
    pub kpis: MarketKpis,
    /// Per-tick reports in step order.
    pub reports: Vec<TickReport>,
    /// Participant state after the last tick.
    pub participants: Vec<Participant>,
}

impl From<RunOutput> for AppState {
    fn from(out: RunOutput) -> Self {
        Self {
            config: out.config,
            kpis: out.kpis,
            reports: out.reports,
            participants: out.participants,
        }
    }
}

/// Builds the axum router with all API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/ticks", get(handlers::get_ticks))
        .route("/participants", get(handlers::get_participants))
        .with_state(state)
}

/// Binds to the given address and serves the API until the process exits.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await
}
