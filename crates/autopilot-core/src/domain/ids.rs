//! Domain identifiers (strongly-typed IDs).
//!
//! Every record the core hands out carries a ULID wrapped in `Id<T>`, where
//! `T` is a zero-sized marker. The marker keeps a `SuggestionId` from being
//! passed where an `ExecutionId` is expected, and supplies the display prefix.
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 「新しい順」のクエリに連番が要らない
//! - **Phantom type**: `Id<T>` のマーカーで ID ファミリーを区別

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id family.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. `"sug-"`).
    fn prefix() -> &'static str;
}

/// Generic typed id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a textual id does not carry the expected prefix or
/// does not contain a valid ULID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{0}'")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| ParseIdError(s.to_string()))?;
        let ulid = Ulid::from_string(raw).map_err(|_| ParseIdError(s.to_string()))?;
        Ok(Self::from_ulid(ulid))
    }
}

macro_rules! id_marker {
    ($marker:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(Observation, "obs-");
id_marker!(Suggestion, "sug-");
id_marker!(Execution, "exec-");
id_marker!(QueryRecord, "qry-");
id_marker!(Failure, "fail-");

/// One observed task execution (Task Recorder).
pub type ObservationId = Id<Observation>;

/// One automation suggestion awaiting or past human review.
pub type SuggestionId = Id<Suggestion>;

/// One approved execution of a suggested automation.
pub type ExecutionId = Id<Execution>;

/// One recorded source query (Pattern Memory).
pub type QueryId = Id<QueryRecord>;

/// One recorded failure (Failure Memory).
pub type FailureId = Id<Failure>;
