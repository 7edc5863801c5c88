// This file is part of StreamVault, a live-stream recording supervisor.

//! The SQLite schema: `channels`, `streams`, `recordings`, `segments`,
//! `stream_metadata`, `post_processing_tasks` and `stream_events` (chapter
//! markers), per spec.md §3 and §6.

/// Schema version written to `meta.schema_version` by [`crate::init`].
///
/// Bumped whenever `SCHEMA_SQL` changes in a way that isn't purely additive.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

pub const SCHEMA_SQL: &str = r#"
create table meta (
  id              integer primary key check (id = 0),
  schema_version  integer not null
);

create table channel (
  id                   blob primary key check (length(id) = 16),
  platform_channel_id  text not null unique,
  login                text not null unique,
  display_name         text not null,
  live                 integer not null check (live in (0, 1)) default 0,
  recording_enabled    integer not null check (recording_enabled in (0, 1)) default 1,
  policy_overrides     text not null default '{}',
  cleanup_policy       text not null default '{}',
  updated_at           text not null
);

create table stream (
  id                  blob primary key check (length(id) = 16),
  channel_id          blob not null references channel (id),
  started_at          text not null,
  ended_at            text,
  title               text,
  category            text,
  language            text,
  platform_stream_id  text not null,
  episode             integer not null
);

create index stream_channel on stream (channel_id);
create unique index stream_open_per_channel on stream (channel_id) where ended_at is null;

create table recording (
  id                  blob primary key check (length(id) = 16),
  stream_id           blob not null references stream (id),
  channel_id          blob not null references channel (id),
  started_at          text not null,
  ended_at            text,
  status              text not null
                        check (status in ('recording', 'stopped', 'failed', 'completed')),
  output_path         text not null,
  segment_count       integer not null default 0,
  last_segment_index  integer not null default 0,
  quality             text,
  last_error          text,
  favorite            integer not null check (favorite in (0, 1)) default 0
);

create index recording_stream on recording (stream_id);
create unique index recording_active_per_channel on recording (channel_id)
  where status = 'recording';

create table segment (
  recording_id      blob not null references recording (id),
  idx               integer not null,
  path              text not null,
  size_bytes        integer not null,
  duration_seconds  real not null,
  primary key (recording_id, idx)
);

create table stream_metadata (
  stream_id            blob primary key references stream (id),
  thumbnail_path       text,
  category_image_path  text,
  duration_seconds     real not null,
  file_size_bytes      integer not null,
  chapters_path        text
);

-- `rowid` (implicit, since `id` is a blob primary key rather than
-- `integer primary key`) doubles as the enqueue sequence number: tasks are
-- always inserted in their execution order, so `order by rowid` recovers it.
create table post_processing_task (
  id           blob primary key check (length(id) = 16),
  kind         text not null
                 check (kind in
                   ('merge', 'transmux', 'metadata_embed', 'thumbnail', 'chapters_embed',
                    'cleanup')),
  target       blob not null,
  status       text not null
                 check (status in ('pending', 'running', 'done', 'failed', 'skipped'))
                 default 'pending',
  attempts     integer not null default 0,
  last_error   text,
  priority     text not null check (priority in ('high', 'normal', 'low')) default 'normal',
  enqueued_at  text not null
);

create index task_target on post_processing_task (target, rowid);
create index task_pending on post_processing_task (status, priority, rowid);

create table stream_event (
  id               integer primary key,
  stream_id        blob not null references stream (id),
  offset_seconds   real not null,
  title            text,
  category         text,
  at               text not null
);

create index stream_event_stream on stream_event (stream_id);
"#;
