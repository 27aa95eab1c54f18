//! Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares an `i64`-backed identifier with the conversions and sqlx bindings the store needs.
macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Create a new identifier
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

id_newtype!(
    /// Unique identifier for a download task, assigned by the store
    TaskId
);

id_newtype!(
    /// Identifier of the account that owns a task
    AccountId
);

/// Source kind of a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    /// No source kind given; rejected at creation
    Unspecified,
    /// Plain HTTP(S) GET
    Http,
}

impl DownloadType {
    /// Integer stored in the database
    pub fn to_i32(self) -> i32 {
        match self {
            DownloadType::Unspecified => 0,
            DownloadType::Http => 1,
        }
    }

    /// Decode a stored integer; `None` for values this build does not know
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(DownloadType::Unspecified),
            1 => Some(DownloadType::Http),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadType::Unspecified => write!(f, "unspecified"),
            DownloadType::Http => write!(f, "http"),
        }
    }
}

/// Lifecycle status of a download task
///
/// ```text
/// Pending ──▶ Downloading ──▶ Success
///    ▲             │
///    │             ▼
///    └──────── Failed
/// ```
///
/// Downloading and Failed return to Pending only through recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting to be executed
    Pending,
    /// Claimed by the execution engine, transfer in progress
    Downloading,
    /// Last attempt failed
    Failed,
    /// Content fetched and stored
    Success,
}

impl DownloadStatus {
    /// Integer stored in the database
    pub fn to_i32(self) -> i32 {
        match self {
            DownloadStatus::Pending => 1,
            DownloadStatus::Downloading => 2,
            DownloadStatus::Failed => 3,
            DownloadStatus::Success => 4,
        }
    }

    /// Decode a stored integer; `None` for anything outside the four known states
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(DownloadStatus::Pending),
            2 => Some(DownloadStatus::Downloading),
            3 => Some(DownloadStatus::Failed),
            4 => Some(DownloadStatus::Success),
            _ => None,
        }
    }

    /// Whether `self → next` is an edge of the task state machine
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Success)
                | (Downloading, Failed)
                | (Downloading, Pending)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadStatus::Pending => write!(f, "pending"),
            DownloadStatus::Downloading => write!(f, "downloading"),
            DownloadStatus::Failed => write!(f, "failed"),
            DownloadStatus::Success => write!(f, "success"),
        }
    }
}

/// A scalar metadata value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Bool(bool),
    /// Whole number
    Integer(i64),
    /// Fractional number
    Float(f64),
    /// Text
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Task metadata document: string keys to scalar values, stored as one JSON object
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A download task as seen by the rest of the crate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Store-assigned identifier
    pub id: TaskId,
    /// Owning account
    pub of_account_id: AccountId,
    /// Source kind
    pub download_type: DownloadType,
    /// Source URL
    pub url: String,
    /// Current lifecycle status
    pub download_status: DownloadStatus,
    /// Metadata recorded by the execution engine
    pub metadata: Metadata,
    /// How many times execution has started for this task
    pub attempt: i64,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task row was last written
    pub updated_at: DateTime<Utc>,
}

/// Event published when a task has been created
///
/// Carries only the id; consumers must treat it as idempotent input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreatedEvent {
    /// The created task
    pub id: TaskId,
}
