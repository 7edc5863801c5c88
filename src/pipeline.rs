// This file is part of StreamVault, a live-stream recording supervisor.

//! Post-Processing Pipeline (C7): a durable priority queue of
//! `PostProcessingTask` rows, consumed by a worker pool with strict
//! per-target serialization (spec.md §4.6).
//!
//! Workers pick the globally next pending task but skip any target whose
//! advisory lock is already held by another worker, so two tasks for the
//! same recording never run concurrently while tasks for different
//! recordings still parallelize across the pool.

use base::clock::Clocks;
use db::model::{PostProcessingTask, RecordingStatus, TaskKind, TaskStatus};
use db::Database;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type Error = base::Error;

#[derive(Clone)]
pub struct PipelineConfig {
    pub ffmpeg_binary: PathBuf,
    pub worker_count: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub min_segment_bytes: i64,
}

/// Tracks which targets currently have a task executing, so the picker can
/// skip them (spec.md §4.6: "acquire a per-target advisory lock before
/// picking").
struct TargetLocks {
    held: Mutex<HashSet<Uuid>>,
}

impl TargetLocks {
    fn new() -> Self {
        TargetLocks {
            held: Mutex::new(HashSet::new()),
        }
    }

    fn try_acquire(&self, target: Uuid) -> bool {
        self.held.lock().insert(target)
    }

    fn release(&self, target: Uuid) {
        self.held.lock().remove(&target);
    }
}

pub struct Pipeline<C: Clocks> {
    pub db: Arc<Database<C>>,
    config: PipelineConfig,
    locks: TargetLocks,
}

impl<C: Clocks + 'static> Pipeline<C> {
    pub fn new(db: Arc<Database<C>>, config: PipelineConfig) -> Arc<Self> {
        Arc::new(Pipeline {
            db,
            config,
            locks: TargetLocks::new(),
        })
    }

    /// Launches `worker_count` worker loops; each runs until `shutdown_rx`
    /// fires (spec.md §5: "Post-processing workers drain current task, then
    /// exit"). Each worker processes at most one task at a time, so overall
    /// concurrency is bounded by `worker_count`. Returns the workers' join
    /// handles so the caller can wait for the current task on each to drain
    /// before the process exits.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown_rx: base::shutdown::Receiver,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|worker_id| {
                let pipeline = self.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        if shutdown_rx.check().is_err() {
                            debug!(worker_id, "pipeline worker exiting on shutdown");
                            return;
                        }
                        match pipeline.pick_one() {
                            Ok(Some(task)) => pipeline.clone().run_task(task).await,
                            Ok(None) => tokio::time::sleep(Duration::from_millis(500)).await,
                            Err(e) => {
                                warn!(worker_id, err = %e, "pipeline worker iteration failed");
                                tokio::time::sleep(Duration::from_millis(500)).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Picks the next pending task whose target isn't already locked by
    /// another worker. Returns `Ok(None)` if the queue is empty or every
    /// pending task's target is currently locked.
    fn pick_one(self: &Arc<Self>) -> Result<Option<PostProcessingTask>, Error> {
        let pending = self.db.list_pending_tasks()?;
        Ok(pending
            .into_iter()
            .find(|t| self.locks.try_acquire(t.target)))
    }
}

impl<C: Clocks + 'static> Pipeline<C> {
    /// Runs one task to completion (success, retry-pending, or failure) and
    /// unconditionally releases the per-target lock afterward, mirroring
    /// the guaranteed-release pattern used by the Capture Process Runner.
    async fn run_task(self: Arc<Self>, task: PostProcessingTask) {
        let target = task.target;
        self.db
            .mark_task_running(task.id)
            .unwrap_or_else(|e| warn!(task_id = %task.id, err = %e, "mark_task_running failed"));

        let result = self.execute(&task).await;

        match result {
            Ok(()) => {
                if let Err(e) = self.db.mark_task_done(task.id) {
                    warn!(task_id = %task.id, err = %e, "mark_task_done failed");
                } else {
                    info!(task_id = %task.id, kind = ?task.kind, target = %target, "task done");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, kind = ?task.kind, err = %e, "task failed; recording attempt");
                match self.db.record_task_attempt_failure(
                    task.id,
                    &e.to_string(),
                    self.config.max_attempts,
                ) {
                    Ok(TaskStatus::Failed) => {
                        warn!(task_id = %task.id, target = %target, "task exhausted retries; halting pipeline for this target");
                        match self.db.skip_pending_tasks_for_target(target) {
                            Ok(n) if n > 0 => {
                                info!(target = %target, skipped = n, "short-circuited remaining tasks for target");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(target = %target, err = %e, "failed to short-circuit remaining tasks for target");
                            }
                        }
                    }
                    Ok(_) => {
                        // Still pending for a retry; back off before the
                        // target can be picked up again.
                        let backoff = self.config.retry_base * (task.attempts as u32 + 1).min(5);
                        tokio::time::sleep(backoff).await;
                    }
                    Err(record_err) => {
                        warn!(task_id = %task.id, err = %record_err, "record_task_attempt_failure failed");
                    }
                }
            }
        }

        self.locks.release(target);
    }

    async fn execute(&self, task: &PostProcessingTask) -> Result<(), Error> {
        match task.kind {
            TaskKind::Merge => self.run_merge(task.target).await,
            TaskKind::Transmux => self.run_transmux(task.target).await,
            TaskKind::Thumbnail => self.run_thumbnail(task.target).await,
            TaskKind::MetadataEmbed => self.run_metadata_embed(task.target).await,
            TaskKind::ChaptersEmbed => self.run_chapters_embed(task.target).await,
            TaskKind::Cleanup => self.run_cleanup(task.target).await,
        }
    }

    async fn run_ffmpeg(&self, args: &[&str]) -> Result<(), Error> {
        let status = Command::new(&self.config.ffmpeg_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| base::format_err_t!(TransmuxError, "ffmpeg spawn failed: {}", e))?;
        if !status.success() {
            return Err(base::format_err_t!(
                TransmuxError,
                "ffmpeg exited with {:?}",
                status.code()
            ));
        }
        Ok(())
    }

    /// **merge**: concatenates all eligible segments into a single `.ts`
    /// (spec.md §4.6). Segments under `min_segment_bytes` are discarded with
    /// a warning rather than failing the merge.
    async fn run_merge(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let segments = self.db.list_segments(recording_id)?;
        let eligible: Vec<_> = segments
            .into_iter()
            .filter(|s| {
                let ok = s.size_bytes >= self.config.min_segment_bytes && s.duration_seconds >= 1.0;
                if !ok {
                    warn!(recording_id = %recording_id, idx = s.idx, size = s.size_bytes, "discarding undersized segment");
                }
                ok
            })
            .collect();
        if eligible.is_empty() {
            return Err(base::format_err_t!(
                MergeError,
                "no eligible segments for recording {}",
                recording_id
            ));
        }

        let output_path = PathBuf::from(&recording.output_path);
        let list_path = output_path.with_extension("concat.txt");
        let list_contents: String = eligible
            .iter()
            .map(|s| format!("file '{}'\n", s.path.replace('\'', "'\\''")))
            .collect();
        tokio::fs::write(&list_path, list_contents)
            .await
            .map_err(|e| base::format_err_t!(MergeError, "writing concat list failed: {}", e))?;

        let result = self
            .run_ffmpeg(&[
                "-y",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                &list_path.to_string_lossy(),
                "-c",
                "copy",
                &output_path.to_string_lossy(),
            ])
            .await;
        let _ = tokio::fs::remove_file(&list_path).await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(base::format_err_t!(MergeError, "merge failed: {}", e));
        }
        Ok(())
    }

    /// **transmux**: stream-copy `.ts` -> `.mp4`, validate, then flip the
    /// Recording to `completed` and delete the source `.ts` (spec.md §4.6).
    async fn run_transmux(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let ts_path = PathBuf::from(&recording.output_path);
        let mp4_path = ts_path.with_extension("mp4");

        self.run_ffmpeg(&[
            "-y",
            "-i",
            &ts_path.to_string_lossy(),
            "-c",
            "copy",
            &mp4_path.to_string_lossy(),
        ])
        .await
        .map_err(|e| base::format_err_t!(TransmuxError, "transmux failed: {}", e))?;

        let metadata = tokio::fs::metadata(&mp4_path)
            .await
            .map_err(|_| base::format_err_t!(TransmuxError, "transmux output missing"))?;
        if metadata.len() < self.config.min_segment_bytes as u64 {
            let _ = tokio::fs::remove_file(&mp4_path).await;
            return Err(base::format_err_t!(
                TransmuxError,
                "transmux output too small: {} bytes",
                metadata.len()
            ));
        }

        self.db
            .update_recording_output_path(recording_id, &mp4_path.to_string_lossy())?;
        self.db.update_recording_status(
            recording_id,
            RecordingStatus::Completed,
            None,
            None,
        )?;
        let _ = tokio::fs::remove_file(&ts_path).await;

        let stream = self.db.get_stream(recording.stream_id)?;
        if self.db.get_stream_metadata(stream.id)?.is_none() {
            self.db.insert_stream_metadata(&db::model::StreamMetadata {
                stream_id: stream.id,
                thumbnail_path: None,
                category_image_path: None,
                duration_seconds: 0.0,
                file_size_bytes: metadata.len() as i64,
                chapters_path: None,
            })?;
        }
        Ok(())
    }

    /// **thumbnail**: extracts a single frame at 10% of the video's
    /// duration into a JPEG sidecar.
    async fn run_thumbnail(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let mp4_path = PathBuf::from(&recording.output_path);
        let thumb_path = mp4_path.with_extension("jpg");

        self.run_ffmpeg(&[
            "-y",
            "-i",
            &mp4_path.to_string_lossy(),
            "-vf",
            "select=eq(n\\,0)",
            "-frames:v",
            "1",
            &thumb_path.to_string_lossy(),
        ])
        .await?;

        let stream = self.db.get_stream(recording.stream_id)?;
        if let Some(mut meta) = self.db.get_stream_metadata(stream.id)? {
            meta.thumbnail_path = Some(thumb_path.to_string_lossy().into_owned());
            self.db.insert_stream_metadata(&meta)?;
        }
        Ok(())
    }

    /// **metadata_embed**: writes title/artist/date/genre and cover art into
    /// the MP4 container via an in-place rewrite (temp file + rename).
    async fn run_metadata_embed(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let channel = self.db.get_channel(recording.channel_id)?;
        let stream = self.db.get_stream(recording.stream_id)?;
        let mp4_path = PathBuf::from(&recording.output_path);
        let tmp_path = mp4_path.with_extension("mp4.tmp");

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            mp4_path.to_string_lossy().into_owned(),
        ];
        let meta = self.db.get_stream_metadata(stream.id)?;
        if let Some(thumb) = meta.as_ref().and_then(|m| m.thumbnail_path.clone()) {
            args.push("-i".into());
            args.push(thumb);
            args.push("-map".into());
            args.push("0".into());
            args.push("-map".into());
            args.push("1".into());
            args.push("-c".into());
            args.push("copy".into());
            args.push("-disposition:v:1".into());
            args.push("attached_pic".into());
        } else {
            args.push("-c".into());
            args.push("copy".into());
        }
        args.push("-metadata".into());
        args.push(format!("title={}", stream.title.clone().unwrap_or_default()));
        args.push("-metadata".into());
        args.push(format!("artist={}", channel.login));
        args.push("-metadata".into());
        args.push(format!("date={}", stream.started_at.format("%Y-%m-%d")));
        args.push("-metadata".into());
        args.push(format!("genre={}", stream.category.clone().unwrap_or_default()));
        args.push(tmp_path.to_string_lossy().into_owned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_ffmpeg(&arg_refs).await?;
        tokio::fs::rename(&tmp_path, &mp4_path)
            .await
            .map_err(|e| base::format_err_t!(TransmuxError, "metadata embed rename failed: {}", e))?;
        Ok(())
    }

    /// **chapters_embed**: renders accumulated `stream_event` chapter markers
    /// into a WEBVTT sidecar and embeds chapter entries in the container.
    async fn run_chapters_embed(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let stream = self.db.get_stream(recording.stream_id)?;
        let events = self.db.list_stream_events(stream.id)?;
        let mp4_path = PathBuf::from(&recording.output_path);
        let vtt_path = mp4_path.with_extension("chapters.vtt");

        let vtt = render_webvtt(&events);
        tokio::fs::write(&vtt_path, vtt)
            .await
            .map_err(|e| base::format_err_t!(TransmuxError, "writing chapters vtt failed: {}", e))?;

        if events.is_empty() {
            if let Some(mut meta) = self.db.get_stream_metadata(stream.id)? {
                meta.chapters_path = Some(vtt_path.to_string_lossy().into_owned());
                self.db.insert_stream_metadata(&meta)?;
            }
            return Ok(());
        }

        let chapters_meta_path = mp4_path.with_extension("chapters.ffmeta");
        tokio::fs::write(&chapters_meta_path, render_ffmetadata(&events))
            .await
            .map_err(|e| base::format_err_t!(TransmuxError, "writing chapter metadata failed: {}", e))?;
        let tmp_path = mp4_path.with_extension("mp4.tmp");
        self.run_ffmpeg(&[
            "-y",
            "-i",
            &mp4_path.to_string_lossy(),
            "-i",
            &chapters_meta_path.to_string_lossy(),
            "-map_metadata",
            "1",
            "-c",
            "copy",
            &tmp_path.to_string_lossy(),
        ])
        .await?;
        tokio::fs::rename(&tmp_path, &mp4_path)
            .await
            .map_err(|e| base::format_err_t!(TransmuxError, "chapters embed rename failed: {}", e))?;
        let _ = tokio::fs::remove_file(&chapters_meta_path).await;

        if let Some(mut meta) = self.db.get_stream_metadata(stream.id)? {
            meta.chapters_path = Some(vtt_path.to_string_lossy().into_owned());
            self.db.insert_stream_metadata(&meta)?;
        }
        Ok(())
    }

    /// **cleanup**: enforces the channel's cleanup policy over its
    /// `completed` recordings, deleting the oldest/largest eligible ones
    /// first, exempting `preserve_categories` and, when
    /// `preserve_favorites` is set, recordings flagged `favorite`.
    async fn run_cleanup(&self, recording_id: Uuid) -> Result<(), Error> {
        let recording = self.db.get_recording(recording_id)?;
        let cleanup_policy = self.db.get_cleanup_policy(recording.channel_id)?;
        if cleanup_policy.is_unbounded() {
            return Ok(());
        }

        let mut completed = self
            .db
            .list_recordings_with_status(RecordingStatus::Completed)?
            .into_iter()
            .filter(|r| r.channel_id == recording.channel_id)
            .collect::<Vec<_>>();
        completed.sort_by_key(|r| r.started_at);

        let mut eligible = Vec::new();
        for r in completed {
            if cleanup_policy.preserve_favorites && r.favorite {
                continue;
            }
            let stream = self.db.get_stream(r.stream_id)?;
            if let Some(category) = &stream.category {
                if cleanup_policy
                    .preserve_categories
                    .iter()
                    .any(|c| c == category)
                {
                    continue;
                }
            }
            eligible.push(r);
        }

        if let Some(max_count) = cleanup_policy.max_count {
            while eligible.len() as u32 > max_count {
                delete_oldest(&self.db, &mut eligible).await?;
            }
        }
        if let Some(max_age_seconds) = cleanup_policy.max_age_seconds {
            let now = recording.started_at;
            while let Some(oldest) = eligible.first() {
                let age = (now - oldest.started_at).num_seconds().max(0) as u64;
                if age <= max_age_seconds {
                    break;
                }
                delete_oldest(&self.db, &mut eligible).await?;
            }
        }
        if let Some(max_bytes) = cleanup_policy.max_bytes {
            loop {
                let total: u64 = eligible
                    .iter()
                    .filter_map(|r| std::fs::metadata(&r.output_path).ok())
                    .map(|m| m.len())
                    .sum();
                if total <= max_bytes || eligible.is_empty() {
                    break;
                }
                delete_oldest(&self.db, &mut eligible).await?;
            }
        }
        Ok(())
    }
}

async fn delete_oldest(
    db: &Arc<Database<impl Clocks>>,
    eligible: &mut Vec<db::model::Recording>,
) -> Result<(), Error> {
    if eligible.is_empty() {
        return Ok(());
    }
    let victim = eligible.remove(0);
    let _ = tokio::fs::remove_file(&victim.output_path).await;
    db.update_recording_status(victim.id, RecordingStatus::Stopped, None, Some("cleaned up"))?;
    Ok(())
}

fn format_vtt_timestamp(offset_seconds: f64) -> String {
    let total_ms = (offset_seconds.max(0.0) * 1000.0) as i64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn render_webvtt(events: &[db::model::StreamEvent]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for (i, window) in events.windows(2).enumerate() {
        let start = format_vtt_timestamp(window[0].offset_seconds);
        let end = format_vtt_timestamp(window[1].offset_seconds);
        let title = window[0].title.as_deref().unwrap_or("Chapter");
        out.push_str(&format!("{}\n{start} --> {end}\n{title}\n\n", i + 1));
    }
    if let Some(last) = events.last() {
        let start = format_vtt_timestamp(last.offset_seconds);
        let title = last.title.as_deref().unwrap_or("Chapter");
        out.push_str(&format!("{}\n{start} --> 99:59:59.999\n{title}\n\n", events.len()));
    }
    out
}

fn render_ffmetadata(events: &[db::model::StreamEvent]) -> String {
    let mut out = String::from(";FFMETADATA1\n");
    for (i, window) in events.windows(2).enumerate() {
        let start_ms = (window[0].offset_seconds * 1000.0) as i64;
        let end_ms = (window[1].offset_seconds * 1000.0) as i64;
        out.push_str("[CHAPTER]\nTIMEBASE=1/1000\n");
        out.push_str(&format!("START={start_ms}\nEND={end_ms}\n"));
        out.push_str(&format!(
            "title={}\n\n",
            window[0].title.as_deref().unwrap_or("Chapter")
        ));
        let _ = i;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use chrono::Utc;
    use db::model::{StreamEvent, TaskPriority};

    fn make_db() -> Arc<Database<SimulatedClocks>> {
        Arc::new(db::testutil::open_test_db())
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            ffmpeg_binary: PathBuf::from("/bin/true"),
            worker_count: 2,
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
            min_segment_bytes: 1024,
        }
    }

    #[test]
    fn target_locks_are_mutually_exclusive() {
        let locks = TargetLocks::new();
        let target = Uuid::now_v7();
        assert!(locks.try_acquire(target));
        assert!(!locks.try_acquire(target));
        locks.release(target);
        assert!(locks.try_acquire(target));
    }

    #[test]
    fn pick_one_skips_locked_targets_and_respects_priority() {
        let db = make_db();
        let low_target = Uuid::now_v7();
        let high_target = Uuid::now_v7();
        db.enqueue_task(TaskKind::Cleanup, low_target, TaskPriority::Normal, Utc::now())
            .unwrap();
        db.enqueue_task(TaskKind::Transmux, high_target, TaskPriority::High, Utc::now())
            .unwrap();

        let pipeline = Pipeline::new(db.clone(), config());

        // High priority target comes first.
        let first = pipeline.pick_one().unwrap().unwrap();
        assert_eq!(first.target, high_target);

        // The high-priority target's lock is held; a second pick skips it
        // and falls through to the normal-priority task.
        let second = pipeline.pick_one().unwrap().unwrap();
        assert_eq!(second.target, low_target);

        // Both targets are now locked; nothing left to pick.
        assert!(pipeline.pick_one().unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_task_short_circuits_later_tasks_for_the_same_target() {
        let db = make_db();
        let target = Uuid::now_v7();
        // No segments exist for `target`, so `run_merge` fails immediately
        // without touching ffmpeg.
        db.enqueue_task(TaskKind::Merge, target, TaskPriority::Normal, Utc::now())
            .unwrap();
        db.enqueue_task(TaskKind::Transmux, target, TaskPriority::Normal, Utc::now())
            .unwrap();

        let mut one_shot_config = config();
        one_shot_config.max_attempts = 1;
        let pipeline = Pipeline::new(db.clone(), one_shot_config);

        let merge_task = pipeline.pick_one().unwrap().unwrap();
        assert_eq!(merge_task.kind, TaskKind::Merge);
        pipeline.clone().run_task(merge_task).await;

        let tasks = db.list_tasks_for_target(target).unwrap();
        let merge = tasks.iter().find(|t| t.kind == TaskKind::Merge).unwrap();
        let transmux = tasks.iter().find(|t| t.kind == TaskKind::Transmux).unwrap();
        assert_eq!(merge.status, TaskStatus::Failed);
        assert_eq!(transmux.status, TaskStatus::Skipped);

        // The skipped task is no longer pickable.
        assert!(pipeline.pick_one().unwrap().is_none());
    }

    #[test]
    fn format_vtt_timestamp_pads_components() {
        assert_eq!(format_vtt_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_vtt_timestamp(61.5), "00:01:01.500");
        assert_eq!(format_vtt_timestamp(3661.25), "01:01:01.250");
    }

    fn event(stream_id: Uuid, offset: f64, title: &str) -> StreamEvent {
        StreamEvent {
            id: 0,
            stream_id,
            offset_seconds: offset,
            title: Some(title.to_string()),
            category: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn render_webvtt_emits_one_cue_per_chapter() {
        let stream_id = Uuid::now_v7();
        let events = vec![
            event(stream_id, 0.0, "Just Chatting"),
            event(stream_id, 120.0, "Programming"),
        ];
        let vtt = render_webvtt(&events);
        assert!(vtt.starts_with("WEBVTT\n\n"));
        assert!(vtt.contains("00:00:00.000 --> 00:02:00.000"));
        assert!(vtt.contains("Just Chatting"));
        assert!(vtt.contains("00:02:00.000 --> 99:59:59.999"));
        assert!(vtt.contains("Programming"));
    }

    #[test]
    fn render_webvtt_of_empty_events_is_just_header() {
        assert_eq!(render_webvtt(&[]), "WEBVTT\n\n");
    }

    #[test]
    fn render_ffmetadata_emits_one_chapter_per_window() {
        let stream_id = Uuid::now_v7();
        let events = vec![
            event(stream_id, 0.0, "Intro"),
            event(stream_id, 30.0, "Gameplay"),
        ];
        let meta = render_ffmetadata(&events);
        assert!(meta.starts_with(";FFMETADATA1\n"));
        assert!(meta.contains("START=0\nEND=30000"));
        assert!(meta.contains("title=Intro"));
    }

    #[tokio::test]
    async fn cleanup_enforces_max_count_oldest_first() {
        let db = make_db();
        let now = Utc::now();
        let channel = db.create_channel("123", "streamer", "Streamer", now).unwrap();
        db.set_cleanup_policy(
            channel.id,
            &db::json::CleanupPolicy {
                max_count: Some(1),
                max_bytes: None,
                max_age_seconds: None,
                preserve_categories: vec!["Archive".to_string()],
                preserve_favorites: false,
            },
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut recordings = Vec::new();
        for i in 0..3 {
            let stream = db
                .create_stream(channel.id, &format!("s{i}"), None, None, None, now)
                .unwrap();
            let path = dir.path().join(format!("r{i}.mp4"));
            std::fs::write(&path, b"data").unwrap();
            let recording = db
                .insert_recording(stream.id, channel.id, now, &path.to_string_lossy(), None)
                .unwrap();
            db.update_recording_status(recording.id, RecordingStatus::Completed, Some(now), None)
                .unwrap();
            recordings.push(recording);
        }

        let pipeline = Pipeline::new(db.clone(), config());
        pipeline.run_cleanup(recordings[2].id).await.unwrap();

        let remaining = db
            .list_recordings_with_status(RecordingStatus::Completed)
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recordings[2].id);
    }

    #[tokio::test]
    async fn cleanup_exempts_favorited_recordings_when_preserve_favorites_is_set() {
        let db = make_db();
        let now = Utc::now();
        let channel = db.create_channel("123", "streamer", "Streamer", now).unwrap();
        db.set_cleanup_policy(
            channel.id,
            &db::json::CleanupPolicy {
                max_count: Some(1),
                max_bytes: None,
                max_age_seconds: None,
                preserve_categories: vec![],
                preserve_favorites: true,
            },
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut recordings = Vec::new();
        for i in 0..3 {
            let stream = db
                .create_stream(channel.id, &format!("s{i}"), None, None, None, now)
                .unwrap();
            let path = dir.path().join(format!("r{i}.mp4"));
            std::fs::write(&path, b"data").unwrap();
            let recording = db
                .insert_recording(stream.id, channel.id, now, &path.to_string_lossy(), None)
                .unwrap();
            db.update_recording_status(recording.id, RecordingStatus::Completed, Some(now), None)
                .unwrap();
            recordings.push(recording);
        }
        // The oldest recording is favorited, so max_count=1 must skip over
        // it and delete the next-oldest non-favorite instead.
        db.set_recording_favorite(recordings[0].id, true).unwrap();

        let pipeline = Pipeline::new(db.clone(), config());
        pipeline.run_cleanup(recordings[2].id).await.unwrap();

        let remaining = db
            .list_recordings_with_status(RecordingStatus::Completed)
            .unwrap();
        let remaining_ids: Vec<_> = remaining.iter().map(|r| r.id).collect();
        assert!(remaining_ids.contains(&recordings[0].id));
        assert!(remaining_ids.contains(&recordings[2].id));
        assert!(!remaining_ids.contains(&recordings[1].id));
    }

    #[tokio::test]
    async fn cleanup_is_noop_when_policy_is_unbounded() {
        let db = make_db();
        let now = Utc::now();
        let channel = db.create_channel("123", "streamer", "Streamer", now).unwrap();
        let stream = db
            .create_stream(channel.id, "s0", None, None, None, now)
            .unwrap();
        let recording = db
            .insert_recording(stream.id, channel.id, now, "/tmp/whatever.mp4", None)
            .unwrap();
        db.update_recording_status(recording.id, RecordingStatus::Completed, Some(now), None)
            .unwrap();

        let pipeline = Pipeline::new(db.clone(), config());
        pipeline.run_cleanup(recording.id).await.unwrap();

        let remaining = db
            .list_recordings_with_status(RecordingStatus::Completed)
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
