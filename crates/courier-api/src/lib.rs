//! Courier configuration and operator HTTP API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::Clock;
use courier_delivery::Operations;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    /// Operator surface of the running engine.
    pub operations: Operations,
    /// Clock used for timestamps in responses.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates handler state.
    pub fn new(operations: Operations, clock: Arc<dyn Clock>) -> Self {
        Self { operations, clock }
    }
}
