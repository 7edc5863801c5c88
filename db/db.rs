// This file is part of StreamVault, a live-stream recording supervisor.

//! Database access logic for the StreamVault SQLite schema (see `schema.rs`).
//!
//! [`Database`] wraps a single `rusqlite::Connection` behind a mutex and
//! assumes only one process accesses the database file at a time (the CLI
//! takes an exclusive `flock` on the db directory before opening it; see
//! `src/cmds/mod.rs`). It is a thin boundary: unlike a row cache, every call
//! here issues SQL directly, because the working set (a handful of live
//! channels and their queued tasks) is small enough that this is simply not
//! a hot path worth optimizing away.

use crate::json::{CleanupPolicy, PolicyOverride};
use crate::model::{
    Channel, PostProcessingTask, Recording, RecordingStatus, Segment, SqlTime, SqlUuid, Stream,
    StreamEvent, StreamMetadata, TaskKind, TaskPriority, TaskStatus,
};
use crate::schema::{EXPECTED_SCHEMA_VERSION, SCHEMA_SQL};
use base::{bail_t, Error, ErrorKind, ResultExt};
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use rusqlite::{named_params, Connection, OptionalExtension};
use std::marker::PhantomData;
use uuid::Uuid;

/// Creates the schema in a freshly-created, empty database file.
pub fn init(conn: &mut Connection) -> Result<(), Error> {
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(SCHEMA_SQL).err_kind(ErrorKind::Internal)?;
    tx.execute(
        "insert into meta (id, schema_version) values (0, :v)",
        named_params! {":v": EXPECTED_SCHEMA_VERSION},
    )
    .err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Returns the schema version stored in `meta`, or `None` if the database
/// hasn't been initialized (the `meta` table doesn't exist yet).
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>, Error> {
    let exists: bool = conn
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'meta'",
            [],
            |r| r.get::<_, i64>(0),
        )
        .err_kind(ErrorKind::Internal)?
        > 0;
    if !exists {
        return Ok(None);
    }
    conn.query_row("select schema_version from meta where id = 0", [], |r| {
        r.get(0)
    })
    .optional()
    .err_kind(ErrorKind::Internal)
}

/// The persistence adapter. Generic over `Clocks` only so that `now()` can be
/// replaced with a `SimulatedClocks` in tests; no query here actually depends
/// on the clock beyond stamping timestamps the caller could also supply.
pub struct Database<C> {
    conn: Mutex<Connection>,
    _clocks: PhantomData<C>,
}

// Safety/ergonomics note: `Database` doesn't hold `C` by value because every
// caller already has a clock of its own (for sleeps, retries, etc.); it's
// threaded through purely so call sites read `Database<RealClocks>` /
// `Database<SimulatedClocks>` consistently with the rest of the core.
impl<C> Database<C> {
    pub fn new(conn: Connection) -> Result<Self, Error> {
        match get_schema_version(&conn)? {
            Some(v) if v == EXPECTED_SCHEMA_VERSION => {}
            Some(v) => bail_t!(
                Internal,
                "schema version {} != expected {}; run `streamvault init` or upgrade",
                v,
                EXPECTED_SCHEMA_VERSION
            ),
            None => bail_t!(Internal, "database not initialized; run `streamvault init`"),
        }
        conn.execute_batch("pragma foreign_keys = on;")
            .err_kind(ErrorKind::Internal)?;
        Ok(Database {
            conn: Mutex::new(conn),
            _clocks: PhantomData,
        })
    }

    // -- channel -----------------------------------------------------------

    pub fn create_channel(
        &self,
        platform_channel_id: &str,
        login: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Channel, Error> {
        let id = Uuid::now_v7();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into channel (id, platform_channel_id, login, display_name, live,
                                  recording_enabled, policy_overrides, cleanup_policy, updated_at)
            values (:id, :platform_channel_id, :login, :display_name, 0, 1, '{}', '{}',
                    :updated_at)
            "#,
            named_params! {
                ":id": SqlUuid(id),
                ":platform_channel_id": platform_channel_id,
                ":login": login,
                ":display_name": display_name,
                ":updated_at": SqlTime(now),
            },
        )
        .err_kind(ErrorKind::Internal)?;
        drop(conn);
        self.get_channel(id)
    }

    pub fn get_channel(&self, id: Uuid) -> Result<Channel, Error> {
        let conn = self.conn.lock();
        row_to_channel(&conn, "id", &SqlUuid(id))
    }

    pub fn get_channel_by_platform_id(
        &self,
        platform_channel_id: &str,
    ) -> Result<Option<Channel>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            &channel_select_sql("platform_channel_id"),
            named_params! {":v": platform_channel_id},
            channel_from_row,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select * from channel order by login")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map([], channel_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    pub fn set_channel_live(&self, id: Uuid, live: bool, now: DateTime<Utc>) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update channel set live = :live, updated_at = :now where id = :id",
                named_params! {":live": live, ":now": SqlTime(now), ":id": SqlUuid(id)},
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no such channel {}", id);
        }
        Ok(())
    }

    // -- stream --------------------------------------------------------------

    pub fn get_open_stream(&self, channel_id: Uuid) -> Result<Option<Stream>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from stream where channel_id = :c and ended_at is null",
            named_params! {":c": SqlUuid(channel_id)},
            stream_from_row,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn get_stream(&self, id: Uuid) -> Result<Stream, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from stream where id = :id",
            named_params! {":id": SqlUuid(id)},
            stream_from_row,
        )
        .err_kind(ErrorKind::Internal)
    }

    /// Creates a new open `Stream`, computing the episode number (monotonic
    /// per channel per calendar month) per spec.md §3.
    pub fn create_stream(
        &self,
        channel_id: Uuid,
        platform_stream_id: &str,
        title: Option<&str>,
        category: Option<&str>,
        language: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<Stream, Error> {
        let conn = self.conn.lock();
        let month_start = started_at
            .with_day(1)
            .unwrap()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let prior: i64 = conn
            .query_row(
                "select count(*) from stream where channel_id = :c and started_at >= :month_start",
                named_params! {":c": SqlUuid(channel_id), ":month_start": SqlTime(month_start)},
                |r| r.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        let id = Uuid::now_v7();
        conn.execute(
            r#"
            insert into stream (id, channel_id, started_at, ended_at, title, category, language,
                                 platform_stream_id, episode)
            values (:id, :channel_id, :started_at, null, :title, :category, :language,
                    :platform_stream_id, :episode)
            "#,
            named_params! {
                ":id": SqlUuid(id),
                ":channel_id": SqlUuid(channel_id),
                ":started_at": SqlTime(started_at),
                ":title": title,
                ":category": category,
                ":language": language,
                ":platform_stream_id": platform_stream_id,
                ":episode": prior + 1,
            },
        )
        .err_kind(ErrorKind::Internal)?;
        drop(conn);
        self.get_stream(id)
    }

    pub fn close_stream(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update stream set ended_at = :e where id = :id and ended_at is null",
            named_params! {":e": SqlTime(ended_at), ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn update_stream_info(
        &self,
        id: Uuid,
        title: Option<&str>,
        category: Option<&str>,
        language: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            update stream set title = coalesce(:title, title),
                              category = coalesce(:category, category),
                              language = coalesce(:language, language)
            where id = :id
            "#,
            named_params! {":title": title, ":category": category, ":language": language, ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn list_open_streams(&self) -> Result<Vec<Stream>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select * from stream where ended_at is null")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map([], stream_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    // -- recording -----------------------------------------------------------

    pub fn get_recording(&self, id: Uuid) -> Result<Recording, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from recording where id = :id",
            named_params! {":id": SqlUuid(id)},
            recording_from_row,
        )
        .err_kind(ErrorKind::Internal)
    }

    pub fn get_active_recording_for_channel(
        &self,
        channel_id: Uuid,
    ) -> Result<Option<Recording>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from recording where channel_id = :c and status = 'recording'",
            named_params! {":c": SqlUuid(channel_id)},
            recording_from_row,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn list_recordings_with_status(
        &self,
        status: RecordingStatus,
    ) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select * from recording where status = :s")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(named_params! {":s": status}, recording_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    /// Inserts a new `Recording` row with `status = recording`,
    /// `segment_count = 1`, `last_segment_index = 1` (spec.md §4.3 step 4:
    /// this happens *before* the capture subprocess is spawned).
    pub fn insert_recording(
        &self,
        stream_id: Uuid,
        channel_id: Uuid,
        started_at: DateTime<Utc>,
        output_path: &str,
        quality: Option<&str>,
    ) -> Result<Recording, Error> {
        let id = Uuid::now_v7();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into recording (id, stream_id, channel_id, started_at, ended_at, status,
                                    output_path, segment_count, last_segment_index, quality,
                                    last_error)
            values (:id, :stream_id, :channel_id, :started_at, null, 'recording', :output_path,
                    1, 1, :quality, null)
            "#,
            named_params! {
                ":id": SqlUuid(id),
                ":stream_id": SqlUuid(stream_id),
                ":channel_id": SqlUuid(channel_id),
                ":started_at": SqlTime(started_at),
                ":output_path": output_path,
                ":quality": quality,
            },
        )
        .err_kind(ErrorKind::AlreadyExists)?;
        drop(conn);
        self.get_recording(id)
    }

    /// Ends a `Recording`, transitioning it to `stopped`, `failed` or
    /// `completed` (spec.md §5: the only legal forward transitions).
    pub fn update_recording_status(
        &self,
        id: Uuid,
        status: RecordingStatus,
        ended_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            update recording
            set status = :status,
                ended_at = coalesce(:ended_at, ended_at),
                last_error = coalesce(:last_error, last_error)
            where id = :id
            "#,
            named_params! {
                ":status": status,
                ":ended_at": ended_at.map(SqlTime),
                ":last_error": last_error,
                ":id": SqlUuid(id),
            },
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn update_recording_output_path(&self, id: Uuid, path: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update recording set output_path = :p where id = :id",
            named_params! {":p": path, ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Operator-controlled favorite flag, exempting a recording from
    /// `cleanup_policy.preserve_favorites` (spec.md §4.6).
    pub fn set_recording_favorite(&self, id: Uuid, favorite: bool) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update recording set favorite = :f where id = :id",
            named_params! {":f": favorite, ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Bumps `segment_count`/`last_segment_index` for a rotation and returns
    /// the new segment index (spec.md §4.3 `rotate_segment` step 4).
    pub fn begin_next_segment(&self, id: Uuid) -> Result<i64, Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            update recording
            set segment_count = segment_count + 1, last_segment_index = last_segment_index + 1
            where id = :id
            "#,
            named_params! {":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        conn.query_row(
            "select last_segment_index from recording where id = :id",
            named_params! {":id": SqlUuid(id)},
            |r| r.get(0),
        )
        .err_kind(ErrorKind::Internal)
    }

    // -- segment -------------------------------------------------------------

    pub fn insert_segment(
        &self,
        recording_id: Uuid,
        idx: i64,
        path: &str,
        size_bytes: i64,
        duration_seconds: f64,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into segment (recording_id, idx, path, size_bytes, duration_seconds)
            values (:r, :idx, :path, :size, :dur)
            "#,
            named_params! {
                ":r": SqlUuid(recording_id),
                ":idx": idx,
                ":path": path,
                ":size": size_bytes,
                ":dur": duration_seconds,
            },
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn list_segments(&self, recording_id: Uuid) -> Result<Vec<Segment>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select * from segment where recording_id = :r order by idx")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(named_params! {":r": SqlUuid(recording_id)}, segment_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    pub fn delete_segments(&self, recording_id: Uuid) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "delete from segment where recording_id = :r",
            named_params! {":r": SqlUuid(recording_id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    // -- stream metadata -------------------------------------------------------

    /// Creates or amends the one `StreamMetadata` row for a stream. The
    /// pipeline's transmux stage creates it; later stages (thumbnail,
    /// metadata_embed, chapters_embed) each amend their own column in place.
    pub fn insert_stream_metadata(&self, m: &StreamMetadata) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into stream_metadata (stream_id, thumbnail_path, category_image_path,
                                          duration_seconds, file_size_bytes, chapters_path)
            values (:s, :thumb, :cat_img, :dur, :size, :chapters)
            on conflict (stream_id) do update set
                thumbnail_path = excluded.thumbnail_path,
                category_image_path = excluded.category_image_path,
                duration_seconds = excluded.duration_seconds,
                file_size_bytes = excluded.file_size_bytes,
                chapters_path = excluded.chapters_path
            "#,
            named_params! {
                ":s": SqlUuid(m.stream_id),
                ":thumb": m.thumbnail_path,
                ":cat_img": m.category_image_path,
                ":dur": m.duration_seconds,
                ":size": m.file_size_bytes,
                ":chapters": m.chapters_path,
            },
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn get_stream_metadata(&self, stream_id: Uuid) -> Result<Option<StreamMetadata>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from stream_metadata where stream_id = :s",
            named_params! {":s": SqlUuid(stream_id)},
            stream_metadata_from_row,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    // -- stream events (chapter markers) ---------------------------------------

    pub fn insert_stream_event(
        &self,
        stream_id: Uuid,
        offset_seconds: f64,
        title: Option<&str>,
        category: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into stream_event (stream_id, offset_seconds, title, category, at)
            values (:s, :off, :title, :category, :at)
            "#,
            named_params! {
                ":s": SqlUuid(stream_id),
                ":off": offset_seconds,
                ":title": title,
                ":category": category,
                ":at": SqlTime(at),
            },
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn list_stream_events(&self, stream_id: Uuid) -> Result<Vec<StreamEvent>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select * from stream_event where stream_id = :s order by offset_seconds")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(named_params! {":s": SqlUuid(stream_id)}, stream_event_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    // -- post-processing tasks -------------------------------------------------

    pub fn enqueue_task(
        &self,
        kind: TaskKind,
        target: Uuid,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> Result<PostProcessingTask, Error> {
        let id = Uuid::now_v7();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            insert into post_processing_task (id, kind, target, status, attempts, last_error,
                                               priority, enqueued_at)
            values (:id, :kind, :target, 'pending', 0, null, :priority, :now)
            "#,
            named_params! {
                ":id": SqlUuid(id),
                ":kind": kind,
                ":target": SqlUuid(target),
                ":priority": priority,
                ":now": SqlTime(now),
            },
        )
        .err_kind(ErrorKind::Internal)?;
        drop(conn);
        self.get_task(id)
    }

    pub fn get_task(&self, id: Uuid) -> Result<PostProcessingTask, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select *, rowid from post_processing_task where id = :id",
            named_params! {":id": SqlUuid(id)},
            task_from_row,
        )
        .err_kind(ErrorKind::Internal)
    }

    /// Returns pending tasks in pick order (priority, then enqueue order),
    /// for the pipeline worker pool to filter by per-target lock ownership.
    pub fn list_pending_tasks(&self) -> Result<Vec<PostProcessingTask>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                select *, rowid from post_processing_task
                where status = 'pending'
                order by case priority when 'high' then 0 when 'normal' then 1 else 2 end, rowid
                "#,
            )
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map([], task_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    pub fn list_tasks_for_target(&self, target: Uuid) -> Result<Vec<PostProcessingTask>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select *, rowid from post_processing_task where target = :t order by rowid")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(named_params! {":t": SqlUuid(target)}, task_from_row)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .err_kind(ErrorKind::Internal)
    }

    pub fn mark_task_running(&self, id: Uuid) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update post_processing_task set status = 'running' where id = :id",
            named_params! {":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn mark_task_done(&self, id: Uuid) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update post_processing_task set status = 'done' where id = :id",
            named_params! {":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Records a failed attempt. If `attempts` (after this one) has reached
    /// `max_attempts`, the task is marked `failed` for good; otherwise it's
    /// left `pending` for a later retry (spec.md §4.6 backoff).
    pub fn record_task_attempt_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<TaskStatus, Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update post_processing_task set attempts = attempts + 1, last_error = :e where id = :id",
            named_params! {":e": error, ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        let attempts: i64 = conn
            .query_row(
                "select attempts from post_processing_task where id = :id",
                named_params! {":id": SqlUuid(id)},
                |r| r.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        let status = if attempts >= max_attempts as i64 {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        conn.execute(
            "update post_processing_task set status = :s where id = :id",
            named_params! {":s": status, ":id": SqlUuid(id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(status)
    }

    /// Transitions every `pending` task for `target` to `skipped` (spec.md
    /// §4.6: "the pipeline short-circuits further tasks for that target"),
    /// called once an earlier-kind task for the same target has exhausted
    /// its retries. Returns the number of tasks skipped.
    pub fn skip_pending_tasks_for_target(&self, target: Uuid) -> Result<usize, Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update post_processing_task set status = 'skipped' where target = :t and status = 'pending'",
            named_params! {":t": SqlUuid(target)},
        )
        .err_kind(ErrorKind::Internal)
    }

    /// Startup reconciliation step 3: any `running` task reverts to `pending`.
    pub fn revert_running_tasks_to_pending(&self) -> Result<usize, Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update post_processing_task set status = 'pending' where status = 'running'",
            [],
        )
        .err_kind(ErrorKind::Internal)
    }

    // -- policy ----------------------------------------------------------------

    pub fn get_policy_override(&self, channel_id: Uuid) -> Result<PolicyOverride, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select policy_overrides from channel where id = :id",
            named_params! {":id": SqlUuid(channel_id)},
            |r| r.get(0),
        )
        .err_kind(ErrorKind::Internal)
    }

    pub fn set_policy_override(
        &self,
        channel_id: Uuid,
        policy: &PolicyOverride,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update channel set policy_overrides = :p where id = :id",
            named_params! {":p": policy, ":id": SqlUuid(channel_id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn set_cleanup_policy(
        &self,
        channel_id: Uuid,
        policy: &CleanupPolicy,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "update channel set cleanup_policy = :p where id = :id",
            named_params! {":p": policy, ":id": SqlUuid(channel_id)},
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn get_cleanup_policy(&self, channel_id: Uuid) -> Result<CleanupPolicy, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select cleanup_policy from channel where id = :id",
            named_params! {":id": SqlUuid(channel_id)},
            |r| r.get(0),
        )
        .err_kind(ErrorKind::Internal)
    }
}

fn channel_select_sql(by: &str) -> String {
    format!("select * from channel where {by} = :v")
}

fn row_to_channel(
    conn: &Connection,
    by: &str,
    val: &dyn rusqlite::ToSql,
) -> Result<Channel, Error> {
    conn.query_row(
        &channel_select_sql(by),
        named_params! {":v": val},
        channel_from_row,
    )
    .err_kind(ErrorKind::Internal)
}

fn channel_from_row(r: &rusqlite::Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: r.get::<_, SqlUuid>("id")?.0,
        platform_channel_id: r.get("platform_channel_id")?,
        login: r.get("login")?,
        display_name: r.get("display_name")?,
        live: r.get("live")?,
        recording_enabled: r.get("recording_enabled")?,
        policy_overrides: r.get("policy_overrides")?,
        cleanup_policy: r.get("cleanup_policy")?,
        updated_at: r.get::<_, SqlTime>("updated_at")?.0,
    })
}

fn stream_from_row(r: &rusqlite::Row) -> rusqlite::Result<Stream> {
    Ok(Stream {
        id: r.get::<_, SqlUuid>("id")?.0,
        channel_id: r.get::<_, SqlUuid>("channel_id")?.0,
        started_at: r.get::<_, SqlTime>("started_at")?.0,
        ended_at: r.get::<_, Option<SqlTime>>("ended_at")?.map(|t| t.0),
        title: r.get("title")?,
        category: r.get("category")?,
        language: r.get("language")?,
        platform_stream_id: r.get("platform_stream_id")?,
        episode: r.get("episode")?,
    })
}

fn recording_from_row(r: &rusqlite::Row) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: r.get::<_, SqlUuid>("id")?.0,
        stream_id: r.get::<_, SqlUuid>("stream_id")?.0,
        channel_id: r.get::<_, SqlUuid>("channel_id")?.0,
        started_at: r.get::<_, SqlTime>("started_at")?.0,
        ended_at: r.get::<_, Option<SqlTime>>("ended_at")?.map(|t| t.0),
        status: r.get("status")?,
        output_path: r.get("output_path")?,
        segment_count: r.get("segment_count")?,
        last_segment_index: r.get("last_segment_index")?,
        quality: r.get("quality")?,
        last_error: r.get("last_error")?,
        favorite: r.get("favorite")?,
    })
}

fn segment_from_row(r: &rusqlite::Row) -> rusqlite::Result<Segment> {
    Ok(Segment {
        recording_id: r.get::<_, SqlUuid>("recording_id")?.0,
        idx: r.get("idx")?,
        path: r.get("path")?,
        size_bytes: r.get("size_bytes")?,
        duration_seconds: r.get("duration_seconds")?,
    })
}

fn stream_metadata_from_row(r: &rusqlite::Row) -> rusqlite::Result<StreamMetadata> {
    Ok(StreamMetadata {
        stream_id: r.get::<_, SqlUuid>("stream_id")?.0,
        thumbnail_path: r.get("thumbnail_path")?,
        category_image_path: r.get("category_image_path")?,
        duration_seconds: r.get("duration_seconds")?,
        file_size_bytes: r.get("file_size_bytes")?,
        chapters_path: r.get("chapters_path")?,
    })
}

fn stream_event_from_row(r: &rusqlite::Row) -> rusqlite::Result<StreamEvent> {
    Ok(StreamEvent {
        id: r.get("id")?,
        stream_id: r.get::<_, SqlUuid>("stream_id")?.0,
        offset_seconds: r.get("offset_seconds")?,
        title: r.get("title")?,
        category: r.get("category")?,
        at: r.get::<_, SqlTime>("at")?.0,
    })
}

fn task_from_row(r: &rusqlite::Row) -> rusqlite::Result<PostProcessingTask> {
    Ok(PostProcessingTask {
        id: r.get::<_, SqlUuid>("id")?.0,
        kind: r.get("kind")?,
        target: r.get::<_, SqlUuid>("target")?.0,
        status: r.get("status")?,
        attempts: r.get("attempts")?,
        last_error: r.get("last_error")?,
        priority: r.get("priority")?,
        enqueued_at: r.get::<_, SqlTime>("enqueued_at")?.0,
        seq: r.get("rowid")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordingStatus;
    use crate::testutil;
    use base::clock::SimulatedClocks;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn channel_and_stream_lifecycle() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("plat123", "someone", "Someone", now()).unwrap();
        assert!(!chan.live);

        db.set_channel_live(chan.id, true, now()).unwrap();
        assert!(db.get_channel(chan.id).unwrap().live);

        assert!(db.get_open_stream(chan.id).unwrap().is_none());
        let stream = db
            .create_stream(chan.id, "psid1", Some("hello"), Some("Just Chatting"), None, now())
            .unwrap();
        assert_eq!(stream.episode, 1);
        assert!(stream.is_open());

        let stream2 = db
            .create_stream(chan.id, "psid2", None, None, None, now())
            .unwrap();
        assert_eq!(stream2.episode, 2);

        db.close_stream(stream.id, now()).unwrap();
        assert!(db.get_stream(stream.id).unwrap().ended_at.is_some());
    }

    #[test]
    fn recording_rotation_bumps_segment_counters() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        let rec = db
            .insert_recording(stream.id, chan.id, now(), "/out/1.ts", Some("1080p60"))
            .unwrap();
        assert_eq!(rec.segment_count, 1);
        assert_eq!(rec.last_segment_index, 1);

        let idx = db.begin_next_segment(rec.id).unwrap();
        assert_eq!(idx, 2);
        let rec = db.get_recording(rec.id).unwrap();
        assert_eq!(rec.segment_count, 2);
        assert_eq!(rec.last_segment_index, 2);
    }

    #[test]
    fn only_one_active_recording_per_channel() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        db.insert_recording(stream.id, chan.id, now(), "/out/1.ts", None)
            .unwrap();
        let err = db
            .insert_recording(stream.id, chan.id, now(), "/out/2.ts", None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn task_queue_orders_by_priority_then_enqueue_order() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        let rec = db
            .insert_recording(stream.id, chan.id, now(), "/out/1.ts", None)
            .unwrap();
        let t1 = db
            .enqueue_task(TaskKind::Transmux, rec.id, TaskPriority::Normal, now())
            .unwrap();
        let t2 = db
            .enqueue_task(TaskKind::MetadataEmbed, rec.id, TaskPriority::High, now())
            .unwrap();
        let pending = db.list_pending_tasks().unwrap();
        assert_eq!(pending[0].id, t2.id);
        assert_eq!(pending[1].id, t1.id);
    }

    #[test]
    fn task_retries_then_fails_after_max_attempts() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        let rec = db
            .insert_recording(stream.id, chan.id, now(), "/out/1.ts", None)
            .unwrap();
        let t = db
            .enqueue_task(TaskKind::Transmux, rec.id, TaskPriority::Normal, now())
            .unwrap();
        assert_eq!(
            db.record_task_attempt_failure(t.id, "boom", 3).unwrap(),
            TaskStatus::Pending
        );
        assert_eq!(
            db.record_task_attempt_failure(t.id, "boom", 3).unwrap(),
            TaskStatus::Pending
        );
        assert_eq!(
            db.record_task_attempt_failure(t.id, "boom", 3).unwrap(),
            TaskStatus::Failed
        );
    }

    #[test]
    fn reconciliation_reverts_running_tasks() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        let rec = db
            .insert_recording(stream.id, chan.id, now(), "/out/1.ts", None)
            .unwrap();
        let t = db
            .enqueue_task(TaskKind::Merge, rec.id, TaskPriority::Normal, now())
            .unwrap();
        db.mark_task_running(t.id).unwrap();
        assert_eq!(db.revert_running_tasks_to_pending().unwrap(), 1);
        assert_eq!(db.get_task(t.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn zombie_scan_finds_recording_rows() {
        let db: Database<SimulatedClocks> = testutil::open_test_db();
        let chan = db.create_channel("p", "l", "L", now()).unwrap();
        let stream = db.create_stream(chan.id, "psid", None, None, None, now()).unwrap();
        db.insert_recording(stream.id, chan.id, now(), "/out/1.ts", None)
            .unwrap();
        let zombies = db.list_recordings_with_status(RecordingStatus::Recording).unwrap();
        assert_eq!(zombies.len(), 1);
    }
}
