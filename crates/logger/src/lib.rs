//! Shared tracing setup for the badping binaries.

mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};
