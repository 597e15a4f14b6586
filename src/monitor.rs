//! The monitor state machine
//!
//! One [`Monitor::run_cycle`](driver::Monitor::run_cycle) takes a single
//! snapshot of the scheduler queue, then hands every tracked analysis to the
//! handler for its current [`LifecycleState`](state::LifecycleState). How
//! often cycles run is up to the caller (cron, a loop in `main`, a test).

/// Lifecycle states of a tracked analysis
pub mod state;
/// Per-analysis working set handed to a state handler
pub mod context;
/// One handler per lifecycle state
pub mod handlers;
/// Runs one monitor cycle over every analysis in a ledger
pub mod driver;

pub use driver::{CycleReport, Monitor};
pub use state::LifecycleState;
