// This file is part of StreamVault, a live-stream recording supervisor.

//! Row types for the tables in `schema.rs`. These are plain data; all
//! mutation goes through `Database`/`LockedDatabase` in `db.rs`.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use uuid::Uuid;

/// A wrapper around `Uuid` which implements `FromSql`/`ToSql`, storing the id
/// as its 16-byte representation rather than as text.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SqlUuid(pub Uuid);

impl From<Uuid> for SqlUuid {
    fn from(u: Uuid) -> Self {
        SqlUuid(u)
    }
}

impl FromSql for SqlUuid {
    fn column_result(value: ValueRef) -> FromSqlResult<Self> {
        let uuid =
            Uuid::from_slice(value.as_blob()?).map_err(|e| FromSqlError::Other(Box::new(e)))?;
        Ok(SqlUuid(uuid))
    }
}

impl ToSql for SqlUuid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.0.as_bytes()[..].into())
    }
}

/// Stores a `chrono::DateTime<Utc>` as RFC 3339 text.
#[derive(Copy, Clone, Debug)]
pub struct SqlTime(pub DateTime<Utc>);

impl FromSql for SqlTime {
    fn column_result(value: ValueRef) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        let t = DateTime::parse_from_rfc3339(s)
            .map_err(|e| FromSqlError::Other(Box::new(e)))?
            .with_timezone(&Utc);
        Ok(SqlTime(t))
    }
}

impl ToSql for SqlTime {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.0.to_rfc3339().into())
    }
}

macro_rules! sql_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, String> {
                match s {
                    $($text => Ok($name::$variant)),+,
                    other => Err(format!(concat!(stringify!($name), " value {:?} unknown"), other)),
                }
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef) -> FromSqlResult<Self> {
                value.as_str()?.parse::<$name>().map_err(|_| FromSqlError::InvalidType)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }
    };
}

sql_enum!(RecordingStatus {
    Recording => "recording",
    Stopped => "stopped",
    Failed => "failed",
    Completed => "completed",
});

sql_enum!(TaskKind {
    Merge => "merge",
    Transmux => "transmux",
    MetadataEmbed => "metadata_embed",
    Thumbnail => "thumbnail",
    ChaptersEmbed => "chapters_embed",
    Cleanup => "cleanup",
});

impl TaskKind {
    /// The fixed execution order within one target's task chain (spec.md §4.3, §4.6).
    pub const ORDER: [TaskKind; 6] = [
        TaskKind::Merge,
        TaskKind::Transmux,
        TaskKind::MetadataEmbed,
        TaskKind::Thumbnail,
        TaskKind::ChaptersEmbed,
        TaskKind::Cleanup,
    ];
}

sql_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
    /// A later task in the same target's chain was short-circuited because
    /// an earlier-kind task for that target exhausted its retries.
    Skipped => "skipped",
});

sql_enum!(TaskPriority {
    High => "high",
    Normal => "normal",
    Low => "low",
});

#[derive(Clone, Debug)]
pub struct Channel {
    pub id: Uuid,
    pub platform_channel_id: String,
    pub login: String,
    pub display_name: String,
    pub live: bool,
    pub recording_enabled: bool,
    pub policy_overrides: crate::json::PolicyOverride,
    pub cleanup_policy: crate::json::CleanupPolicy,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Stream {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub platform_stream_id: String,
    pub episode: i64,
}

impl Stream {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct Recording {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub channel_id: Uuid,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub status: RecordingStatus,
    pub output_path: String,
    pub segment_count: i64,
    pub last_segment_index: i64,
    pub quality: Option<String>,
    pub last_error: Option<String>,
    /// Operator-set flag exempting this recording from `cleanup_policy`'s
    /// `preserve_favorites` (db/json.rs).
    pub favorite: bool,
}

#[derive(Clone, Debug)]
pub struct Segment {
    pub recording_id: Uuid,
    pub idx: i64,
    pub path: String,
    pub size_bytes: i64,
    pub duration_seconds: f64,
}

#[derive(Clone, Debug)]
pub struct StreamMetadata {
    pub stream_id: Uuid,
    pub thumbnail_path: Option<String>,
    pub category_image_path: Option<String>,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub chapters_path: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PostProcessingTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub target: Uuid,
    pub status: TaskStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub priority: TaskPriority,
    pub enqueued_at: chrono::DateTime<Utc>,
    /// The table's implicit `rowid`; doubles as the enqueue sequence number.
    pub seq: i64,
}

#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub id: i64,
    pub stream_id: Uuid,
    pub offset_seconds: f64,
    pub title: Option<String>,
    pub category: Option<String>,
    pub at: chrono::DateTime<Utc>,
}
