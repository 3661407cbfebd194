//! Identity newtypes shared across the engine.
//!
//! Security, client, book and aggregation-unit identities are opaque to the
//! engine beyond equality and hashing (§3 of the spec). Keeping them as
//! distinct newtypes instead of bare `String`s prevents accidentally
//! swapping a client id for a security id at a call site.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Arc<str>);

        impl $name {
            pub fn new(raw: impl Into<Arc<str>>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::new(raw)
            }
        }
    };
}

opaque_id!(SecurityId);
opaque_id!(BookId);
opaque_id!(ClientId);
opaque_id!(AggregationUnitId);

/// Trading date a position or limit is attributed to. Distinct from
/// wall-clock ingest time.
pub type BusinessDate = NaiveDate;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
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
    };
}

uuid_id!(EventId);
uuid_id!(ReservationId);
uuid_id!(ValidationId);
uuid_id!(LocateId);

/// A two-letter market code, e.g. `TW`, `JP`, `US`. Selects the market-rule
/// plugin chain in the inventory calculator (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketCode(pub String);

impl MarketCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MarketCode {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
