// This file is part of StreamVault, a live-stream recording supervisor.

//! Startup Reconciler (C8): runs exactly once before the event dispatcher
//! starts accepting events (spec.md §4.7).
//!
//! A cold start means the runner's in-memory process-handle map and the
//! State Manager's in-memory registry are both empty, no matter what the
//! database says — every `recording`-status row here is definitionally a
//! zombie, since no subprocess could have survived the restart.

use crate::lifecycle::Lifecycle;
use base::clock::Clocks;
use db::model::{Recording, RecordingStatus};
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub type Error = base::Error;

pub struct Reconciler<C: Clocks> {
    pub db: Arc<Database<C>>,
    pub lifecycle: Arc<Lifecycle<C>>,
}

impl<C: Clocks + 'static> Reconciler<C> {
    pub fn new(db: Arc<Database<C>>, lifecycle: Arc<Lifecycle<C>>) -> Self {
        Reconciler { db, lifecycle }
    }

    /// Runs all four reconciliation steps in order. Idempotent: a second
    /// call finds nothing left to reconcile and is a no-op.
    pub async fn run(&self, now: chrono::DateTime<chrono::Utc>) -> Result<(), Error> {
        let zombies = self.reconcile_zombie_recordings(now).await?;
        let resumed = self.reconcile_live_streams().await?;
        let reverted = self.db.revert_running_tasks_to_pending()?;
        let closed = self.reconcile_offline_streams(now)?;
        info!(
            zombies,
            resumed, reverted, closed, "startup reconciliation complete"
        );
        Ok(())
    }

    /// Step 1: every Recording left at status=`recording` across a restart
    /// is a zombie (no subprocess can have survived). Stop it, scheduling
    /// post-processing if it captured any segments, else marking it failed.
    ///
    /// A cold start means the State Manager is empty, so there's no
    /// `ActiveRecording` descriptor to stat the last segment from the way
    /// the live stop path does. Instead, reconstruct the segment files the
    /// capture subprocess would have produced from `output_path` and
    /// `last_segment_index` and recover whichever ones still exist on disk
    /// before deciding `Stopped` vs. `Failed`.
    async fn reconcile_zombie_recordings(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize, Error> {
        let zombies = self
            .db
            .list_recordings_with_status(RecordingStatus::Recording)?;
        let count = zombies.len();
        for recording in zombies {
            self.recover_segments_from_disk(&recording)?;
            let segments = self.db.list_segments(recording.id)?;
            let status = if segments.is_empty() {
                RecordingStatus::Failed
            } else {
                RecordingStatus::Stopped
            };
            self.db
                .update_recording_status(recording.id, status, Some(now), None)?;
            warn!(recording_id = %recording.id, ?status, "quarantined zombie recording at startup");
            if status == RecordingStatus::Stopped {
                self.lifecycle.enqueue_post_processing(recording.id).await?;
            }
        }
        Ok(count)
    }

    /// Recovers any segment files a crashed capture subprocess left on disk
    /// that never made it into the `segment` table. Segment 1 is always
    /// `output_path` itself; later segments follow the
    /// `{stem}_segment_{idx:03}.ts` naming `Lifecycle::rotate_segment` uses.
    /// Indices already present in `list_segments`, or whose file is missing
    /// from disk, are skipped rather than guessed at.
    ///
    /// Per-segment duration can't be recovered this way — no start/end
    /// timestamp for an individual segment survives a restart — so recovered
    /// rows carry `duration_seconds = 0.0`.
    fn recover_segments_from_disk(&self, recording: &Recording) -> Result<usize, Error> {
        let existing: std::collections::HashSet<i64> = self
            .db
            .list_segments(recording.id)?
            .into_iter()
            .map(|s| s.idx)
            .collect();
        let base_path = PathBuf::from(&recording.output_path);
        let stem = base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = base_path.parent().map(PathBuf::from).unwrap_or_default();
        let mut recovered = 0;
        for idx in 1..=recording.last_segment_index {
            if existing.contains(&idx) {
                continue;
            }
            let path = if idx == 1 {
                base_path.clone()
            } else {
                dir.join(format!("{stem}_segment_{idx:03}.ts"))
            };
            let size_bytes = match std::fs::metadata(&path) {
                Ok(meta) => meta.len() as i64,
                Err(_) => continue,
            };
            self.db
                .insert_segment(recording.id, idx, &path.to_string_lossy(), size_bytes, 0.0)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Step 2: any Stream still open whose Channel is live and wants
    /// auto-recording gets a fresh `start_recording` — the old capture
    /// subprocess is gone, so this begins a new segment sequence under the
    /// same Stream.
    async fn reconcile_live_streams(&self) -> Result<usize, Error> {
        let open_streams = self.db.list_open_streams()?;
        let mut resumed = 0;
        for stream in open_streams {
            let channel = self.db.get_channel(stream.channel_id)?;
            if !channel.live {
                continue;
            }
            let policy = self.lifecycle.config.resolve(channel.id)?;
            if !policy.auto_record || !channel.recording_enabled {
                continue;
            }
            if self
                .db
                .get_active_recording_for_channel(channel.id)?
                .is_some()
            {
                // Already reconciled into `recording` by a previous run, or
                // a concurrent start beat us to it; nothing to do.
                continue;
            }
            match self.lifecycle.start_recording(stream.id, channel.id, false).await {
                Ok(recording_id) => {
                    info!(%recording_id, channel = %channel.login, "resumed recording for still-live channel");
                    resumed += 1;
                }
                Err(e) => {
                    warn!(channel = %channel.login, err = %e, "failed to resume recording at startup");
                }
            }
        }
        Ok(resumed)
    }

    /// Step 4: any Stream still open whose Channel is offline gets its
    /// `ended_at` stamped from the last known activity on that stream (the
    /// most recent chapter-marker event, falling back to `now` if none was
    /// ever recorded).
    fn reconcile_offline_streams(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize, Error> {
        let open_streams = self.db.list_open_streams()?;
        let mut closed = 0;
        for stream in open_streams {
            let channel = self.db.get_channel(stream.channel_id)?;
            if channel.live {
                continue;
            }
            let events = self.db.list_stream_events(stream.id)?;
            let ended_at = events.last().map(|e| e.at).unwrap_or(now);
            self.db.close_stream(stream.id, ended_at)?;
            info!(stream_id = %stream.id, "closed stale open stream for offline channel");
            closed += 1;
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, GlobalPolicy};
    use crate::capture::CaptureRunner;
    use crate::ids::IdGenerator;
    use crate::state::StateManager;
    use base::clock::SimulatedClocks;
    use base::ids::SequentialIds;
    use std::time::Duration;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc)
    }

    fn make_reconciler(dir: &std::path::Path) -> Reconciler<SimulatedClocks> {
        let dbh: Arc<Database<SimulatedClocks>> = Arc::new(db::testutil::open_test_db());
        let lifecycle = Arc::new(Lifecycle {
            db: dbh.clone(),
            state: Arc::new(StateManager::new()),
            runner: Arc::new(CaptureRunner::new("/bin/true".into(), None)),
            config: Arc::new(ConfigResolver::new(dbh.clone(), GlobalPolicy::default())),
            ids: IdGenerator::new(Arc::new(SequentialIds::new())),
            clocks: Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH)),
            recordings_root: dir.to_path_buf(),
            poll_interval: Duration::from_millis(20),
            grace_terminate: Duration::from_millis(200),
            grace_rotate: Duration::from_millis(200),
        });
        Reconciler::new(dbh, lifecycle)
    }

    #[tokio::test]
    async fn zombie_recording_with_segments_is_stopped_and_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording = r
            .db
            .insert_recording(stream.id, chan.id, now(), "/tmp/out.ts", None)
            .unwrap();
        r.db.insert_segment(recording.id, 1, "seg1.ts", 1000, 5.0).unwrap();

        r.run(now()).await.unwrap();

        let got = r.db.get_recording(recording.id).unwrap();
        assert_eq!(got.status, RecordingStatus::Stopped);
        assert!(got.ended_at.is_some());
        let tasks = r.db.list_tasks_for_target(recording.id).unwrap();
        assert_eq!(tasks.len(), 5);
    }

    #[tokio::test]
    async fn zombie_recording_without_segments_is_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording = r
            .db
            .insert_recording(stream.id, chan.id, now(), "/tmp/out.ts", None)
            .unwrap();

        r.run(now()).await.unwrap();

        let got = r.db.get_recording(recording.id).unwrap();
        assert_eq!(got.status, RecordingStatus::Failed);
        assert!(r.db.list_tasks_for_target(recording.id).unwrap().is_empty());
    }

    /// The capture subprocess died without anyone ever calling
    /// `insert_segment` for it — the file it wrote is still on disk,
    /// unrecorded. Reconciliation must recover it from `output_path` rather
    /// than trusting an empty `segment` table and marking the recording
    /// `Failed` out from under a perfectly good capture.
    #[tokio::test]
    async fn zombie_recording_recovers_segment_file_left_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let output_path = dir.path().join("out.ts");
        std::fs::write(&output_path, b"fake ts bytes").unwrap();
        let recording = r
            .db
            .insert_recording(
                stream.id,
                chan.id,
                now(),
                output_path.to_str().unwrap(),
                None,
            )
            .unwrap();

        r.run(now()).await.unwrap();

        let got = r.db.get_recording(recording.id).unwrap();
        assert_eq!(got.status, RecordingStatus::Stopped);
        let segments = r.db.list_segments(recording.id).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].idx, 1);
        assert_eq!(segments[0].size_bytes, "fake ts bytes".len() as i64);
        let tasks = r.db.list_tasks_for_target(recording.id).unwrap();
        assert_eq!(tasks.len(), 5);
    }

    #[tokio::test]
    async fn open_stream_on_offline_channel_gets_closed() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();

        r.run(now()).await.unwrap();

        let got = r.db.get_stream(stream.id).unwrap();
        assert!(got.ended_at.is_some());
    }

    #[tokio::test]
    async fn open_stream_on_live_channel_resumes_recording() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        r.db.set_channel_live(chan.id, true, now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();

        r.run(now()).await.unwrap();

        let got = r.db.get_stream(stream.id).unwrap();
        assert!(got.ended_at.is_none());
        assert!(r
            .db
            .get_active_recording_for_channel(chan.id)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let r = make_reconciler(dir.path());
        let chan = r.db.create_channel("p", "someone", "Someone", now()).unwrap();
        let stream = r
            .db
            .create_stream(chan.id, "psid", Some("Hi"), None, None, now())
            .unwrap();
        let recording = r
            .db
            .insert_recording(stream.id, chan.id, now(), "/tmp/out.ts", None)
            .unwrap();
        r.db.insert_segment(recording.id, 1, "seg1.ts", 1000, 5.0).unwrap();

        r.run(now()).await.unwrap();
        r.run(now()).await.unwrap();

        // Second pass found nothing left in `recording` status, so no
        // duplicate post-processing chain was enqueued.
        let tasks = r.db.list_tasks_for_target(recording.id).unwrap();
        assert_eq!(tasks.len(), 5);
    }
}
