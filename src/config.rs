// This file is part of StreamVault, a live-stream recording supervisor.

//! Config Resolver (C2): merges global + per-channel settings into one
//! effective recording policy (spec.md §4.5).
//!
//! Resolution order: per-channel override > global > built-in default. This
//! module is pure given a database snapshot; it never mutates state.

use db::json::{CleanupPolicy, EffectivePolicy, PolicyOverride};
use std::sync::Arc;
use uuid::Uuid;

/// Process-wide defaults and the single global policy override, read once at
/// startup (spec.md §6 "Configuration"). Per-channel overrides layer on top
/// of this at resolve time.
#[derive(Clone, Debug)]
pub struct GlobalPolicy {
    pub auto_record: bool,
    pub quality: String,
    pub codec_list: String,
    pub proxy: Option<String>,
    pub auth_header: Option<String>,
    pub filename_template: String,
    pub use_chapters: bool,
    pub cleanup_policy: CleanupPolicy,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        GlobalPolicy {
            auto_record: true,
            quality: "best".to_string(),
            codec_list: "h264".to_string(),
            proxy: None,
            auth_header: None,
            filename_template: "{streamer}/{streamer}_{datetime}_{title}".to_string(),
            use_chapters: true,
            cleanup_policy: CleanupPolicy::default(),
        }
    }
}

pub struct ConfigResolver<C> {
    global: GlobalPolicy,
    db: Arc<db::Database<C>>,
}

impl<C> ConfigResolver<C> {
    pub fn new(db: Arc<db::Database<C>>, global: GlobalPolicy) -> Self {
        ConfigResolver { global, db }
    }

    /// Resolves the effective policy for `channel_id`: the per-channel
    /// `PolicyOverride` on top of `self.global`.
    pub fn resolve(&self, channel_id: Uuid) -> Result<EffectivePolicy, base::Error> {
        let ov: PolicyOverride = self.db.get_policy_override(channel_id)?;
        let cleanup = self.db.get_cleanup_policy(channel_id)?;
        Ok(EffectivePolicy {
            auto_record: ov.auto_record.unwrap_or(self.global.auto_record),
            quality: ov.quality.unwrap_or_else(|| self.global.quality.clone()),
            codec_list: ov.codec_list.unwrap_or_else(|| self.global.codec_list.clone()),
            proxy: ov.proxy.or_else(|| self.global.proxy.clone()),
            auth_header: ov.auth_header.or_else(|| self.global.auth_header.clone()),
            filename_template: ov
                .filename_template
                .unwrap_or_else(|| self.global.filename_template.clone()),
            use_chapters: ov.use_chapters.unwrap_or(self.global.use_chapters),
            cleanup_policy: if cleanup.is_unbounded() {
                self.global.cleanup_policy.clone()
            } else {
                cleanup
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn resolve_falls_back_to_global_defaults() {
        let dbh: db::Database<SimulatedClocks> = db::testutil::open_test_db();
        let chan = dbh.create_channel("p", "l", "L", now()).unwrap();
        let dbh = Arc::new(dbh);
        let resolver = ConfigResolver::new(dbh.clone(), GlobalPolicy::default());
        let resolved = resolver.resolve(chan.id).unwrap();
        assert_eq!(resolved.quality, "best");
        assert!(resolved.auto_record);
    }

    #[test]
    fn per_channel_override_wins_over_global() {
        let dbh: db::Database<SimulatedClocks> = db::testutil::open_test_db();
        let chan = dbh.create_channel("p", "l", "L", now()).unwrap();
        dbh.set_policy_override(
            chan.id,
            &db::json::PolicyOverride {
                auto_record: Some(false),
                quality: Some("720p60".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let dbh = Arc::new(dbh);
        let resolver = ConfigResolver::new(dbh.clone(), GlobalPolicy::default());
        let resolved = resolver.resolve(chan.id).unwrap();
        assert_eq!(resolved.quality, "720p60");
        assert!(!resolved.auto_record);
    }
}
