// This file is part of StreamVault, a live-stream recording supervisor.

//! Event Dispatcher (C6): deduplicates incoming live/offline events and
//! routes them to the Recording Lifecycle (spec.md §4.4).
//!
//! Two invariants this module owns:
//! - a bounded, TTL-expiring dedup cache (spec.md §9: "unbounded dedup cache
//!   → bounded TTL cache" — a long-lived service must not leak cache entries
//!   forever);
//! - serialized handler execution per channel, so events for one channel are
//!   applied in arrival order even when dispatched concurrently (spec.md §5).

use crate::lifecycle::Lifecycle;
use base::clock::Clocks;
use base::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

pub type Error = base::Error;

const DEDUP_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    Online,
    Offline,
    ChannelUpdate,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub channel_id: Uuid,
    pub kind: EventKind,
    pub platform_stream_id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub arrived_at: DateTime<Utc>,
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct DedupKey {
    channel_id: Uuid,
    kind_tag: u8,
    platform_stream_id: String,
}

fn kind_tag(kind: &EventKind) -> u8 {
    match kind {
        EventKind::Online => 0,
        EventKind::Offline => 1,
        EventKind::ChannelUpdate => 2,
    }
}

/// Bounded TTL cache: entries are lazily swept on every insert attempt, so
/// there's no separate background task and no unbounded growth (spec.md §9).
struct DedupCache {
    seen: Mutex<HashMap<DedupKey, std::time::Instant>>,
}

impl DedupCache {
    fn new() -> Self {
        DedupCache {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this is a duplicate within the TTL window (and
    /// should be dropped); otherwise records it and returns `false`.
    fn check_and_insert(&self, key: DedupKey, now: std::time::Instant) -> bool {
        let mut seen = self.seen.lock();
        seen.retain(|_, inserted_at| now.saturating_duration_since(*inserted_at) < DEDUP_TTL);
        if seen.contains_key(&key) {
            return true;
        }
        seen.insert(key, now);
        false
    }
}

/// Per-channel serialization: one async mutex per channel id, so a handler
/// for channel A never blocks behind a handler for channel B.
struct ChannelLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl ChannelLocks {
    fn new() -> Self {
        ChannelLocks {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, channel_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(channel_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct EventDispatcher<C: Clocks> {
    pub db: Arc<db::Database<C>>,
    pub lifecycle: Arc<Lifecycle<C>>,
    dedup: DedupCache,
    channel_locks: ChannelLocks,
}

impl<C: Clocks + 'static> EventDispatcher<C> {
    pub fn new(db: Arc<db::Database<C>>, lifecycle: Arc<Lifecycle<C>>) -> Self {
        EventDispatcher {
            db,
            lifecycle,
            dedup: DedupCache::new(),
            channel_locks: ChannelLocks::new(),
        }
    }

    /// Dispatches one validated event. Serializes per channel; concurrent
    /// calls for different channels proceed independently.
    pub async fn dispatch(&self, event: Event) -> Result<(), Error> {
        let lock = self.channel_locks.get(event.channel_id);
        let _guard = lock.lock().await;

        let key = DedupKey {
            channel_id: event.channel_id,
            kind_tag: kind_tag(&event.kind),
            platform_stream_id: event.platform_stream_id.clone(),
        };
        if self
            .dedup
            .check_and_insert(key, std::time::Instant::now())
        {
            debug!(channel_id = %event.channel_id, kind = ?event.kind, "duplicate event dropped");
            return Ok(());
        }

        match event.kind {
            EventKind::Online => self.handle_online(event).await,
            EventKind::Offline => self.handle_offline(event).await,
            EventKind::ChannelUpdate => self.handle_channel_update(event).await,
        }
    }

    async fn handle_online(&self, event: Event) -> Result<(), Error> {
        self.db
            .set_channel_live(event.channel_id, true, event.arrived_at)?;
        let stream = match self.db.get_open_stream(event.channel_id)? {
            Some(s) => s,
            None => self.db.create_stream(
                event.channel_id,
                &event.platform_stream_id,
                event.title.as_deref(),
                event.category.as_deref(),
                event.language.as_deref(),
                event.arrived_at,
            )?,
        };

        let policy = self.lifecycle.config.resolve(event.channel_id)?;
        let channel = self.db.get_channel(event.channel_id)?;
        if policy.auto_record && channel.recording_enabled {
            match self
                .lifecycle
                .start_recording(stream.id, event.channel_id, false)
                .await
            {
                Ok(recording_id) => {
                    info!(%recording_id, channel_id = %event.channel_id, "recording started from online event")
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    // spec.md §4.8: simultaneous online events race the
                    // State Manager lock; the loser's duplicate is a no-op.
                    debug!(channel_id = %event.channel_id, "start_recording lost the race; treating as no-op");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn handle_offline(&self, event: Event) -> Result<(), Error> {
        if let Some(active) = self
            .lifecycle
            .state
            .get_active(event.channel_id)
        {
            self.lifecycle
                .stop_recording(active.recording_id, "stream_offline")
                .await?;
        }
        if let Some(stream) = self.db.get_open_stream(event.channel_id)? {
            self.db.close_stream(stream.id, event.arrived_at)?;
        }
        self.db
            .set_channel_live(event.channel_id, false, event.arrived_at)?;
        Ok(())
    }

    async fn handle_channel_update(&self, event: Event) -> Result<(), Error> {
        let Some(stream) = self.db.get_open_stream(event.channel_id)? else {
            return Ok(());
        };
        self.db.update_stream_info(
            stream.id,
            event.title.as_deref(),
            event.category.as_deref(),
            event.language.as_deref(),
        )?;
        let offset_seconds = (event.arrived_at - stream.started_at).num_milliseconds() as f64 / 1000.0;
        self.db.insert_stream_event(
            stream.id,
            offset_seconds.max(0.0),
            event.title.as_deref(),
            event.category.as_deref(),
            event.arrived_at,
        )?;
        Ok(())
    }
}
