// This file is part of StreamVault, a live-stream recording supervisor.

//! Recording State Manager (C4): the in-memory registry of in-flight
//! recordings, keyed by channel id (spec.md §4.2).
//!
//! This is the single authoritative duplicate-prevention point: `register`
//! is the only place `DuplicateActiveRecording` can originate from the live
//! path (the database's `recording_active_per_channel` index is a backstop,
//! not the primary gate). A single mutex is sufficient; contention is
//! bounded by how many channels can go live per second.

use base::{Error, ErrorKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// The live state of one channel's active recording.
#[derive(Clone, Debug)]
pub struct ActiveRecording {
    pub recording_id: Uuid,
    pub stream_id: Uuid,
    pub process_handle: u32,
    pub started_at: DateTime<Utc>,
    pub segment_count: i64,
    /// When the *current* segment's subprocess was spawned — distinct from
    /// `started_at`, which never changes across rotations. The rotation
    /// check loop compares against this, not `started_at`.
    pub segment_started_at: DateTime<Utc>,
    /// Output file of the *current* segment, so the lifecycle can stat and
    /// record it in the `segment` table once it finishes.
    pub segment_path: PathBuf,
}

#[derive(Default)]
pub struct StateManager {
    // channel_id -> descriptor
    active: Mutex<HashMap<Uuid, ActiveRecording>>,
}

impl StateManager {
    pub fn new() -> Self {
        StateManager {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `descriptor` as the active recording for `channel_id`.
    /// Fails with `AlreadyExists` (spec.md's `DuplicateActiveRecording`) if
    /// the channel already has one; the caller (Lifecycle) is expected to
    /// treat that as a no-op on the event path, or surface it on the
    /// operator/API path.
    pub fn register(&self, channel_id: Uuid, descriptor: ActiveRecording) -> Result<(), Error> {
        let mut active = self.active.lock();
        if active.contains_key(&channel_id) {
            return Err(base::format_err_t!(
                AlreadyExists,
                "channel {} already has an active recording",
                channel_id
            ));
        }
        active.insert(channel_id, descriptor);
        Ok(())
    }

    /// Removes the descriptor whose `recording_id` matches, by whichever
    /// channel it's filed under. No-op if absent.
    pub fn unregister(&self, recording_id: Uuid) {
        let mut active = self.active.lock();
        active.retain(|_, d| d.recording_id != recording_id);
    }

    pub fn get_active(&self, channel_id: Uuid) -> Option<ActiveRecording> {
        self.active.lock().get(&channel_id).cloned()
    }

    /// Looks up the descriptor by `recording_id` rather than channel id, for
    /// callers (the stop path) that only have the recording id in hand.
    pub fn get_active_by_recording(&self, recording_id: Uuid) -> Option<ActiveRecording> {
        self.active
            .lock()
            .values()
            .find(|d| d.recording_id == recording_id)
            .cloned()
    }

    pub fn list_active(&self) -> Vec<ActiveRecording> {
        self.active.lock().values().cloned().collect()
    }

    /// Like `list_active`, but paired with the channel id each descriptor
    /// is filed under — needed by the rotation-check loop, which has to
    /// call back into `Lifecycle::rotate_segment(channel_id)`.
    pub fn list_active_with_channel(&self) -> Vec<(Uuid, ActiveRecording)> {
        self.active
            .lock()
            .iter()
            .map(|(channel_id, d)| (*channel_id, d.clone()))
            .collect()
    }

    /// Updates the descriptor's process handle and segment counter in one
    /// step, as used by segment rotation (spec.md §4.3 step 4: "update
    /// descriptor's process handle and segment counter atomically under the
    /// State lock").
    pub fn update_after_rotation(
        &self,
        channel_id: Uuid,
        new_process_handle: u32,
        new_segment_count: i64,
        new_segment_path: PathBuf,
        new_segment_started_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut active = self.active.lock();
        let Some(descriptor) = active.get_mut(&channel_id) else {
            return Err(base::format_err_t!(
                NotFound,
                "no active recording for channel {} to rotate",
                channel_id
            ));
        };
        descriptor.segment_started_at = new_segment_started_at;
        descriptor.process_handle = new_process_handle;
        descriptor.segment_count = new_segment_count;
        descriptor.segment_path = new_segment_path;
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(recording_id: Uuid) -> ActiveRecording {
        ActiveRecording {
            recording_id,
            stream_id: Uuid::now_v7(),
            process_handle: 1234,
            started_at: Utc::now(),
            segment_count: 1,
            segment_started_at: Utc::now(),
            segment_path: PathBuf::from("/tmp/rec.ts"),
        }
    }

    #[test]
    fn register_then_get_active() {
        let sm = StateManager::new();
        let channel = Uuid::now_v7();
        let recording = Uuid::now_v7();
        sm.register(channel, descriptor(recording)).unwrap();
        let got = sm.get_active(channel).unwrap();
        assert_eq!(got.recording_id, recording);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn duplicate_register_is_already_exists() {
        let sm = StateManager::new();
        let channel = Uuid::now_v7();
        sm.register(channel, descriptor(Uuid::now_v7())).unwrap();
        let err = sm
            .register(channel, descriptor(Uuid::now_v7()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn unregister_by_recording_id_is_idempotent() {
        let sm = StateManager::new();
        let channel = Uuid::now_v7();
        let recording = Uuid::now_v7();
        sm.register(channel, descriptor(recording)).unwrap();
        sm.unregister(recording);
        assert!(sm.get_active(channel).is_none());
        // Second call: no-op, doesn't panic.
        sm.unregister(recording);
    }

    #[test]
    fn unregister_of_unknown_recording_is_noop() {
        let sm = StateManager::new();
        sm.unregister(Uuid::now_v7());
        assert_eq!(sm.len(), 0);
    }

    #[test]
    fn list_active_reflects_all_registered_channels() {
        let sm = StateManager::new();
        sm.register(Uuid::now_v7(), descriptor(Uuid::now_v7()))
            .unwrap();
        sm.register(Uuid::now_v7(), descriptor(Uuid::now_v7()))
            .unwrap();
        assert_eq!(sm.list_active().len(), 2);
    }

    #[test]
    fn update_after_rotation_bumps_handle_and_count() {
        let sm = StateManager::new();
        let channel = Uuid::now_v7();
        sm.register(channel, descriptor(Uuid::now_v7())).unwrap();
        let rotated_at = Utc::now();
        let new_path = PathBuf::from("/tmp/rec_segment_002.ts");
        sm.update_after_rotation(channel, 5678, 2, new_path.clone(), rotated_at)
            .unwrap();
        let got = sm.get_active(channel).unwrap();
        assert_eq!(got.process_handle, 5678);
        assert_eq!(got.segment_count, 2);
        assert_eq!(got.segment_started_at, rotated_at);
        assert_eq!(got.segment_path, new_path);
    }

    #[test]
    fn update_after_rotation_of_unknown_channel_is_not_found() {
        let sm = StateManager::new();
        let err = sm
            .update_after_rotation(Uuid::now_v7(), 1, 1, PathBuf::from("/tmp/x.ts"), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn get_active_by_recording_finds_by_recording_id() {
        let sm = StateManager::new();
        let channel = Uuid::now_v7();
        let recording = Uuid::now_v7();
        sm.register(channel, descriptor(recording)).unwrap();
        let got = sm.get_active_by_recording(recording).unwrap();
        assert_eq!(got.recording_id, recording);
        assert!(sm.get_active_by_recording(Uuid::now_v7()).is_none());
    }
}
