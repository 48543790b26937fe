//! Strongly-typed identifiers.
//!
//! Every id wraps a UUID and encodes to the same PostgreSQL `uuid` column
//! type, but the wrappers keep a route id from ever being passed where a
//! tenant id is expected.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BoxDynError, EncodeResult, PgArgumentBuffer, PgDb, PgTypeInfo, PgValueRef};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier. Tenants form a hierarchy through their parent ids.
    TenantId
);

uuid_id!(
    /// Route (integration configuration) identifier.
    RouteId
);

uuid_id!(
    /// Upstream event identifier.
    EventId
);

uuid_id!(
    /// Dead-letter entry identifier.
    DlqEntryId
);

uuid_id!(
    /// Scheduled delivery entry identifier. Each occurrence of a recurring
    /// schedule gets its own id.
    ScheduledDeliveryId
);

uuid_id!(
    /// Scheduled job execution record identifier.
    ExecutionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = RouteId::new();
        let parsed: RouteId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn ids_serialize_as_bare_uuids() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_string(&TenantId(uuid)).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn invalid_strings_are_rejected() {
        assert!("not-a-uuid".parse::<DlqEntryId>().is_err());
    }
}
