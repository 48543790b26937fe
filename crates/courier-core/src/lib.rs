//! Core domain models, persistence and shared primitives for courier.
//!
//! Provides strongly-typed identifiers, route and queue models, the clock
//! abstraction, delivery lifecycle events and the PostgreSQL repositories
//! backing checkpoints, rate-limit windows, failure counters and the
//! dead-letter queue. The delivery engine and operator API build on these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryContext, DeliveryEvent, EventHandler, MulticastEventHandler, NoOpEventHandler,
    TracingEventHandler,
};
pub use models::{
    DlqEntry, DlqEntryId, DlqFilter, DlqStatus, EventId, Route, RouteId, ScheduledDelivery,
    ScheduledDeliveryId, SourceEvent, TenantId,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
