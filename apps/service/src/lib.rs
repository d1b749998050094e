//! Network health monitor.
//!
//! Every monitored device gets its own supervised polling loop. Probe results
//! are buffered and written in batches, and a hysteresis state machine turns
//! them into `online` / `degraded` / `offline` transitions and notifications.

pub mod config;
pub mod database;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;
