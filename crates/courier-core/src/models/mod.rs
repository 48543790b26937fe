//! Core domain models and strongly-typed identifiers.
//!
//! Routes are owned by the configuration subsystem and are read-only here.
//! Everything else (checkpoints, dead letters, scheduled entries, outcome
//! and execution records) is state the delivery engine writes itself.

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Implements `Display`, `FromStr` and TEXT column encoding for a fieldless
/// enum from a fixed variant-to-string table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form used in storage and logs.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("invalid {}: {s}", stringify!($name))),
                }
            }
        }

        impl sqlx::Type<$crate::models::PgDb> for $name {
            fn type_info() -> $crate::models::PgTypeInfo {
                <str as sqlx::Type<$crate::models::PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, $crate::models::PgDb> for $name {
            fn decode(
                value: $crate::models::PgValueRef<'r>,
            ) -> Result<Self, $crate::models::BoxDynError> {
                let s = <&str as sqlx::Decode<$crate::models::PgDb>>::decode(value)?;
                s.parse::<Self>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, $crate::models::PgDb> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut $crate::models::PgArgumentBuffer,
            ) -> $crate::models::EncodeResult {
                <&str as sqlx::Encode<$crate::models::PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

mod ids;
mod queue;
mod records;
mod route;

pub use ids::{DlqEntryId, EventId, ExecutionId, RouteId, ScheduledDeliveryId, TenantId};
pub use queue::{DlqEntry, DlqFilter, DlqStatus, ScheduledDelivery, ScheduledStatus};
pub use records::{
    Checkpoint, DeliveryOrigin, FailureCounter, JobExecution, JobStage, JobState, OutcomeRecord,
    OutcomeStatus, ScheduledJob, SourceEvent, StageRecord, StageStatus,
};
pub use route::{
    AuthConfig, DataSourceConfig, DeliveryStep, Direction, HttpMethod, RateLimitPolicy,
    RetrySettings, Route, Schedule, Target, TenantScope, TransformConfig,
};
