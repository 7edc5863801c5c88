// This file is part of StreamVault, a live-stream recording supervisor.

//! Recording Lifecycle (C5): `start_recording`, `stop_recording`,
//! `rotate_segment`, and the monitor task that watches a live capture
//! subprocess and runs the stop path on exit (spec.md §4.3).

use crate::capture::{CaptureRunner, PollResult};
use crate::config::ConfigResolver;
use crate::ids::IdGenerator;
use crate::state::{ActiveRecording, StateManager};
use crate::template::{self, TemplateContext};
use base::clock::Clocks;
use base::shutdown;
use base::{ErrorKind, ResultExt};
use db::model::{RecordingStatus, TaskKind, TaskPriority};
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub type Error = base::Error;

fn now_utc<C: Clocks>(clocks: &C) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(clocks.realtime())
}

/// Everything `start_recording`/`stop_recording`/`rotate_segment` need,
/// bundled so the monitor task can be spawned with a single `Arc` clone
/// (spec.md §9: "explicit containers passed by reference", no ambient
/// globals — this is the composition root's single wiring point for C5).
pub struct Lifecycle<C: Clocks> {
    pub db: Arc<Database<C>>,
    pub state: Arc<StateManager>,
    pub runner: Arc<CaptureRunner>,
    pub config: Arc<ConfigResolver<C>>,
    pub ids: IdGenerator,
    pub clocks: Arc<C>,
    pub recordings_root: PathBuf,
    pub poll_interval: Duration,
    pub grace_terminate: Duration,
    pub grace_rotate: Duration,
}

impl<C: Clocks + 'static> Lifecycle<C> {
    /// spec.md §4.3 `start_recording` ordering, steps 1-8.
    pub async fn start_recording(
        &self,
        stream_id: Uuid,
        channel_id: Uuid,
        force: bool,
    ) -> Result<Uuid, Error> {
        // Step 1: fail-fast on an already-active recording unless forced.
        if !force && self.state.get_active(channel_id).is_some() {
            return Err(base::format_err_t!(
                AlreadyExists,
                "channel {} already has an active recording",
                channel_id
            ));
        }

        // Step 2: resolve effective policy.
        let policy = self.config.resolve(channel_id)?;
        let channel = self.db.get_channel(channel_id)?;
        let stream = self.db.get_stream(stream_id)?;

        // Step 3: compute output path from the filename template.
        let recording_id = self.ids.new_recording_id();
        let now = now_utc(self.clocks.as_ref());
        let ctx = TemplateContext {
            streamer: &channel.login,
            title: stream.title.as_deref().unwrap_or(""),
            game: stream.category.as_deref().unwrap_or(""),
            twitch_id: &stream.platform_stream_id,
            started_at: now,
            recording_id,
            episode: stream.episode,
            unique: &recording_id.to_string()[..8],
        };
        let rendered = template::render(&policy.filename_template, &ctx)?;
        let channel_dir = self.recordings_root.join(&channel.login);
        std::fs::create_dir_all(&channel_dir).err_kind(ErrorKind::Internal)?;
        let output_path = channel_dir.join(format!("{rendered}.ts"));

        // Step 4: insert the Recording row *before* spawning, so a crash
        // between here and step 5 still leaves a durable audit trail.
        let recording = self.db.insert_recording(
            stream_id,
            channel_id,
            now,
            output_path.to_string_lossy().as_ref(),
            Some(policy.quality.as_str()),
        )?;

        // Step 5: spawn.
        let log_path = channel_dir.join(format!("{rendered}.log"));
        let spawn_result = self.runner.start(
            recording.id,
            &channel.login,
            &output_path,
            &policy,
            &log_path,
        );
        let pid = match spawn_result {
            Ok(pid) => pid,
            Err(e) => {
                warn!(%recording_id, err = %e, "capture spawn failed; marking recording failed");
                self.db.update_recording_status(
                    recording.id,
                    RecordingStatus::Failed,
                    Some(now),
                    Some(&e.to_string()),
                )?;
                return Err(e);
            }
        };

        // Step 6: register in the State Manager.
        self.state.register(
            channel_id,
            ActiveRecording {
                recording_id: recording.id,
                stream_id,
                process_handle: pid,
                started_at: now,
                segment_count: 1,
                segment_started_at: now,
                segment_path: output_path.clone(),
            },
        )?;

        // Step 7: launch the monitor task.
        self.spawn_monitor(recording.id, channel_id);

        info!(%recording_id, channel = %channel.login, "recording started");
        Ok(recording.id)
    }

    /// spec.md §4.3 `stop_recording`: explicit stop from an offline event or
    /// operator action.
    pub async fn stop_recording(&self, recording_id: Uuid, reason: &str) -> Result<(), Error> {
        info!(%recording_id, reason, "stopping recording");
        self.runner
            .terminate(recording_id, self.grace_terminate)
            .await?;
        self.run_stop_path(recording_id).await
    }

    /// spec.md §4.3 `rotate_segment`, steps 1-5.
    pub async fn rotate_segment(&self, channel_id: Uuid) -> Result<(), Error> {
        let Some(descriptor) = self.state.get_active(channel_id) else {
            return Err(base::format_err_t!(
                NotFound,
                "no active recording for channel {} to rotate",
                channel_id
            ));
        };
        let recording_id = descriptor.recording_id;

        // Step 2+3: fail-forward terminate. Whatever happens, proceed.
        self.runner
            .terminate(recording_id, self.grace_rotate)
            .await?;

        // The just-finished segment never gets another chance to be
        // recorded once we move the descriptor onto the next one, so stat
        // and persist it now (spec.md §4.3 step 4).
        self.record_finished_segment(recording_id, &descriptor, now_utc(self.clocks.as_ref()));

        // Step 4: bump segment count, compute next path, spawn anew.
        let next_idx = self.db.begin_next_segment(recording_id)?;
        let recording = self.db.get_recording(recording_id)?;
        let channel = self.db.get_channel(channel_id)?;
        let policy = self.config.resolve(channel_id)?;
        let base_path = PathBuf::from(&recording.output_path);
        let stem = base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = base_path.parent().map(PathBuf::from).unwrap_or_default();
        let segment_path = dir.join(format!("{stem}_segment_{next_idx:03}.ts"));
        let log_path = dir.join(format!("{stem}.log"));

        match self.runner.start(
            recording_id,
            &channel.login,
            &segment_path,
            &policy,
            &log_path,
        ) {
            Ok(pid) => {
                self.state.update_after_rotation(
                    channel_id,
                    pid,
                    next_idx,
                    segment_path.clone(),
                    now_utc(self.clocks.as_ref()),
                )?;
                info!(%recording_id, segment = next_idx, "segment rotated");
                Ok(())
            }
            Err(e) => {
                // Step 5: spawn failure on rotation means the recording can't
                // continue; fall through to the normal stop path.
                warn!(%recording_id, err = %e, "rotation respawn failed; stopping recording");
                self.db.update_recording_status(
                    recording_id,
                    RecordingStatus::Failed,
                    Some(now_utc(self.clocks.as_ref())),
                    Some(&e.to_string()),
                )?;
                self.state.unregister(recording_id);
                self.enqueue_post_processing(recording_id).await?;
                Err(e)
            }
        }
    }

    /// The monitor task: polls the subprocess handle every `poll_interval`
    /// and runs the stop path once it exits (spec.md §4.3 "Monitor task").
    fn spawn_monitor(&self, recording_id: Uuid, channel_id: Uuid) {
        let db = self.db.clone();
        let state = self.state.clone();
        let runner = self.runner.clone();
        let clocks = self.clocks.clone();
        let poll_interval = self.poll_interval;
        let grace_terminate = self.grace_terminate;
        let config = self.config.clone();
        let ids = self.ids.clone();
        let recordings_root = self.recordings_root.clone();
        let grace_rotate = self.grace_rotate;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                match runner.poll(recording_id) {
                    Ok(PollResult::Running) => continue,
                    Ok(PollResult::Exited(code)) => {
                        info!(%recording_id, code, "capture subprocess exited");
                        break;
                    }
                    Ok(PollResult::Gone) => {
                        warn!(%recording_id, "capture subprocess externally gone");
                        break;
                    }
                    Err(e) => {
                        warn!(%recording_id, err = %e, "poll failed");
                        break;
                    }
                }
            }
            let lifecycle = Lifecycle {
                db,
                state,
                runner,
                config,
                ids,
                clocks,
                recordings_root,
                poll_interval,
                grace_terminate,
                grace_rotate,
            };
            if let Err(e) = lifecycle.run_stop_path(recording_id).await {
                warn!(%recording_id, channel_id = %channel_id, err = %e, "stop path failed");
            }
        });
    }

    /// Stats `descriptor`'s current segment file and records it in the
    /// `segment` table. The capture subprocess itself never writes a Segment
    /// row (it only produces bytes on disk), so this is the only place a
    /// segment becomes visible to the post-processing pipeline; called once
    /// a segment is known to be finished — on rotation, and in the stop path
    /// before it decides `Stopped` vs. `Failed`.
    ///
    /// Fails open: a stat or insert error is logged and swallowed rather
    /// than propagated, so a filesystem hiccup can't block the subprocess
    /// teardown that must still happen regardless.
    fn record_finished_segment(
        &self,
        recording_id: Uuid,
        descriptor: &ActiveRecording,
        ended_at: chrono::DateTime<chrono::Utc>,
    ) {
        let size_bytes = match std::fs::metadata(&descriptor.segment_path) {
            Ok(meta) => meta.len() as i64,
            Err(e) => {
                warn!(%recording_id, path = %descriptor.segment_path.display(), err = %e, "failed to stat finished segment");
                0
            }
        };
        let duration_seconds = (ended_at - descriptor.segment_started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        if let Err(e) = self.db.insert_segment(
            recording_id,
            descriptor.segment_count,
            &descriptor.segment_path.to_string_lossy(),
            size_bytes,
            duration_seconds,
        ) {
            warn!(%recording_id, err = %e, "failed to record finished segment");
        }
    }

    /// Shared by the monitor task exit handler and explicit `stop_recording`:
    /// stamp end time, transition status, unregister, enqueue post-processing.
    async fn run_stop_path(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        if recording.status != RecordingStatus::Recording {
            // Already stopped by a racing caller (e.g. explicit stop raced
            // the monitor's own exit detection); nothing further to do.
            return Ok(());
        }
        let now = now_utc(self.clocks.as_ref());
        if let Some(descriptor) = self.state.get_active_by_recording(recording_id) {
            self.record_finished_segment(recording_id, &descriptor, now);
        }
        let segments = self.db.list_segments(recording_id)?;
        let status = if segments.is_empty() {
            RecordingStatus::Failed
        } else {
            RecordingStatus::Stopped
        };
        self.db
            .update_recording_status(recording_id, status, Some(now), None)?;
        self.state.unregister(recording_id);
        if status == RecordingStatus::Stopped {
            self.enqueue_post_processing(recording_id).await?;
        }
        Ok(())
    }

    /// Enqueues the fixed task chain in kind-order (spec.md §4.3 "Monitor
    /// task"): merge (only if more than one segment) → transmux →
    /// metadata_embed → thumbnail → chapters_embed → cleanup.
    ///
    /// `pub(crate)` so the startup reconciler (C8) can reuse it for zombie
    /// recordings it discovers already have segments on disk.
    pub(crate) async fn enqueue_post_processing(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let now = now_utc(self.clocks.as_ref());
        let kinds = TaskKind::ORDER
            .iter()
            .filter(|kind| recording.segment_count > 1 || **kind != TaskKind::Merge);
        for kind in kinds {
            self.db
                .enqueue_task(*kind, recording_id, TaskPriority::Normal, now)?;
        }
        Ok(())
    }

    /// Service shutdown: terminate every tracked recording's subprocess with
    /// the shutdown grace, then persist `stopped` for each (spec.md §5
    /// "Service shutdown").
    pub async fn shutdown_all(&self, grace: Duration, _trigger: &shutdown::Receiver) {
        for descriptor in self.state.list_active() {
            if let Err(e) = self.runner.terminate(descriptor.recording_id, grace).await {
                warn!(recording_id = %descriptor.recording_id, err = %e, "shutdown terminate failed");
            }
            if let Err(e) = self.run_stop_path(descriptor.recording_id).await {
                warn!(recording_id = %descriptor.recording_id, err = %e, "shutdown stop path failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalPolicy;
    use base::clock::SimulatedClocks;
    use base::ids::SequentialIds;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc)
    }

    fn make_lifecycle(dir: &std::path::Path) -> Lifecycle<SimulatedClocks> {
        let dbh: Arc<Database<SimulatedClocks>> = Arc::new(db::testutil::open_test_db());
        Lifecycle {
            db: dbh.clone(),
            state: Arc::new(StateManager::new()),
            runner: Arc::new(CaptureRunner::new("/bin/true".into(), None)),
            config: Arc::new(ConfigResolver::new(dbh, GlobalPolicy::default())),
            ids: IdGenerator::new(Arc::new(SequentialIds::new())),
            clocks: Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH)),
            recordings_root: dir.to_path_buf(),
            poll_interval: Duration::from_millis(20),
            grace_terminate: Duration::from_millis(200),
            grace_rotate: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn start_recording_registers_state_and_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let lc = make_lifecycle(dir.path());
        let chan = lc.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = lc
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording_id = lc
            .start_recording(stream.id, chan.id, false)
            .await
            .unwrap();
        assert!(lc.state.get_active(chan.id).is_some());
        let recording = lc.db.get_recording(recording_id).unwrap();
        assert_eq!(recording.status, RecordingStatus::Recording);
    }

    #[tokio::test]
    async fn start_recording_second_time_without_force_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let lc = make_lifecycle(dir.path());
        let chan = lc.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = lc
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        lc.start_recording(stream.id, chan.id, false).await.unwrap();
        let err = lc
            .start_recording(stream.id, chan.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn stop_recording_records_segment_and_marks_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let lc = make_lifecycle(dir.path());
        let chan = lc.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = lc
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording_id = lc
            .start_recording(stream.id, chan.id, false)
            .await
            .unwrap();
        lc.stop_recording(recording_id, "test").await.unwrap();
        let recording = lc.db.get_recording(recording_id).unwrap();
        assert_eq!(recording.status, RecordingStatus::Stopped);
        assert!(lc.state.get_active(chan.id).is_none());
        let segments = lc.db.list_segments(recording_id).unwrap();
        assert_eq!(segments.len(), 1);
    }

    /// If the State Manager's descriptor for a recording has already gone
    /// missing (e.g. a racing unregister) by the time the stop path runs,
    /// there's nothing to stat and no segment can be recorded — the
    /// recording is marked `Failed` rather than silently `Stopped` with zero
    /// segments on file.
    #[tokio::test]
    async fn stop_path_marks_failed_when_state_descriptor_is_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let lc = make_lifecycle(dir.path());
        let chan = lc.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = lc
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording_id = lc
            .start_recording(stream.id, chan.id, false)
            .await
            .unwrap();
        lc.state.unregister(recording_id);
        lc.run_stop_path(recording_id).await.unwrap();
        let recording = lc.db.get_recording(recording_id).unwrap();
        assert_eq!(recording.status, RecordingStatus::Failed);
    }

    #[tokio::test]
    async fn stop_recording_enqueues_tasks_when_segments_exist() {
        let dir = tempfile::tempdir().unwrap();
        let lc = make_lifecycle(dir.path());
        let chan = lc.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = lc
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording_id = lc
            .start_recording(stream.id, chan.id, false)
            .await
            .unwrap();
        lc.stop_recording(recording_id, "test").await.unwrap();
        let recording = lc.db.get_recording(recording_id).unwrap();
        assert_eq!(recording.status, RecordingStatus::Stopped);
        let tasks = lc.db.list_tasks_for_target(recording_id).unwrap();
        assert_eq!(tasks.len(), 5); // single segment: no merge task
        assert_eq!(tasks[0].kind, TaskKind::Transmux);
    }
}
