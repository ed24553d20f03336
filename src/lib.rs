//! Per-tick settlement engine for a peer-to-peer microgrid energy market.

/// REST API over a finished run (feature `api`).
#[cfg(feature = "api")]
pub mod api;
/// TOML scenario configuration and presets.
pub mod config;
/// Exogenous data feed: CSV reader and synthetic day generator.
pub mod feed;
/// CSV export of run results.
pub mod io {
    pub mod export;
}
/// Scenario wiring from configuration to finished run.
pub mod runner;
/// Market engine: balance, policy, matching, donation, grid, settlement.
pub mod sim;
