/// Balance calculator for per-participant net positions.
pub mod balance;
/// Simulation clock for tick management.
pub mod clock;
pub mod donation;
pub mod engine;
pub mod flow;
pub mod grid;
pub mod kpi;
pub mod matching;
pub mod policy;
pub mod reconcile;
pub mod settlement;
pub mod snapshot;
pub mod types;
/// Closed daily time windows.
pub mod window;
