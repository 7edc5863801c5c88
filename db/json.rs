// This file is part of StreamVault, a live-stream recording supervisor.

//! JSON types stored as TEXT columns in the database schema (see `schema.rs`):
//! per-channel policy overrides and cleanup policy.

use rusqlite::types::{FromSqlError, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! sql {
    ($l:ident) => {
        impl rusqlite::types::FromSql for $l {
            fn column_result(value: ValueRef) -> Result<Self, FromSqlError> {
                match value {
                    ValueRef::Text(t) => {
                        Ok(serde_json::from_slice(t).map_err(|e| FromSqlError::Other(Box::new(e)))?)
                    }
                    _ => Err(FromSqlError::InvalidType),
                }
            }
        }

        impl rusqlite::types::ToSql for $l {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(serde_json::to_string(&self)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?
                    .into())
            }
        }
    };
}

/// Per-channel overrides of the global recording policy (spec.md §4.5). Any
/// field left `None` falls through to the global policy, then the built-in
/// default, per the Config Resolver's resolution order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverride {
    /// Whether an `online` event should trigger `start_recording` automatically.
    pub auto_record: Option<bool>,

    /// Quality ladder, e.g. `"1440p60,1080p60,best"`.
    pub quality: Option<String>,

    /// Codec preference list, e.g. `"h265,h264"`.
    pub codec_list: Option<String>,

    pub proxy: Option<String>,

    /// Name of the HTTP header carrying the platform auth token, if any.
    pub auth_header: Option<String>,

    pub filename_template: Option<String>,

    pub use_chapters: Option<bool>,
}
sql!(PolicyOverride);

/// The fully-resolved policy a Config Resolver call produces: no `Option`s,
/// every field has a concrete value (spec.md §4.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub auto_record: bool,
    pub quality: String,
    pub codec_list: String,
    pub proxy: Option<String>,
    pub auth_header: Option<String>,
    pub filename_template: String,
    pub use_chapters: bool,
    pub cleanup_policy: CleanupPolicy,
}

/// A channel's cleanup policy for the `cleanup` post-processing task kind
/// (spec.md §4.6).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPolicy {
    /// Keep at most this many completed recordings for the channel. `None` means unbounded.
    #[serde(default)]
    pub max_count: Option<u32>,

    /// Keep at most this many total bytes of completed recordings for the channel.
    #[serde(default)]
    pub max_bytes: Option<u64>,

    /// Delete completed recordings older than this many seconds.
    #[serde(default)]
    pub max_age_seconds: Option<u64>,

    /// Categories exempt from deletion regardless of the limits above.
    #[serde(default)]
    pub preserve_categories: Vec<String>,

    /// If true, recordings flagged as favorites by the operator are exempt.
    #[serde(default)]
    pub preserve_favorites: bool,
}
sql!(CleanupPolicy);

impl CleanupPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_count.is_none() && self.max_bytes.is_none() && self.max_age_seconds.is_none()
    }
}
