// This file is part of StreamVault, a live-stream recording supervisor.

//! Capture Process Runner (C3): spawns, monitors and terminates the external
//! capture subprocess, streaming its stderr to a per-channel log file
//! (spec.md §4.1).
//!
//! State is an internal map from recording id to child handle, guarded by a
//! mutex; every mutation pairs with a matching removal in a guaranteed-release
//! scope (`terminate`'s `finally` block below) so a teardown error can never
//! leak a stale handle and block the next segment from registering
//! (spec.md §9 "Fail-forward on cleanup").

use base::{ErrorKind, ResultExt};
use db::json::EffectivePolicy;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type Error = base::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollResult {
    Running,
    /// The process exited; carries its exit code if the OS reported one.
    Exited(Option<i32>),
    /// No handle exists for this recording (already reaped, or never started).
    Gone,
}

impl PollResult {
    pub fn is_running(&self) -> bool {
        matches!(self, PollResult::Running)
    }
}

pub struct CaptureRunner {
    capture_binary: std::path::PathBuf,
    platform_oauth_token: Option<String>,
    handles: Mutex<HashMap<Uuid, Child>>,
}

impl CaptureRunner {
    pub fn new(capture_binary: std::path::PathBuf, platform_oauth_token: Option<String>) -> Self {
        CaptureRunner {
            capture_binary,
            platform_oauth_token,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the capture subprocess for `recording_id`, redirecting its
    /// stdout to `output_path` and its stderr to `log_path` (spec.md §6:
    /// "writes MPEG-TS to stdout redirected to the output path").
    pub fn start(
        &self,
        recording_id: Uuid,
        channel_login: &str,
        output_path: &Path,
        policy: &EffectivePolicy,
        log_path: &Path,
    ) -> Result<u32, Error> {
        let out_file = std::fs::File::create(output_path).err_kind(ErrorKind::SpawnError)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .err_kind(ErrorKind::SpawnError)?;

        let mut cmd = Command::new(&self.capture_binary);
        cmd.arg("--channel")
            .arg(channel_login)
            .arg("--quality")
            .arg(&policy.quality)
            .arg("--codecs")
            .arg(&policy.codec_list);
        if let Some(proxy) = &policy.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        if let (Some(header_name), Some(token)) = (&policy.auth_header, &self.platform_oauth_token)
        {
            cmd.arg("--header").arg(format!("{header_name}: {token}"));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(false);

        let child = cmd.spawn().err_kind(ErrorKind::SpawnError)?;
        let pid = child
            .id()
            .ok_or_else(|| base::format_err_t!(SpawnError, "child exited before its pid could be read"))?;
        info!(%recording_id, pid, channel_login, "spawned capture subprocess");

        self.handles.lock().insert(recording_id, child);
        Ok(pid)
    }

    /// Non-blocking, idempotent exit check.
    pub fn poll(&self, recording_id: Uuid) -> Result<PollResult, Error> {
        let mut handles = self.handles.lock();
        let Some(child) = handles.get_mut(&recording_id) else {
            return Ok(PollResult::Gone);
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                handles.remove(&recording_id);
                Ok(PollResult::Exited(status.code()))
            }
            Ok(None) => Ok(PollResult::Running),
            Err(e) => {
                // Treat a wait() failure the same as external death: the
                // handle can't be trusted, so release it and move on.
                handles.remove(&recording_id);
                warn!(%recording_id, err = %e, "try_wait failed; treating process as gone");
                Ok(PollResult::Gone)
            }
        }
    }

    /// Sends `SIGTERM`, waits up to `grace`, then `SIGKILL`s if still alive.
    /// Tolerates the process having already exited or never existed
    /// (spec.md §4.1: "MUST tolerate the process having already exited").
    ///
    /// The handle is unconditionally removed from the map before returning,
    /// regardless of which branch was taken, so the caller can always
    /// register a replacement process for the same recording id.
    pub async fn terminate(&self, recording_id: Uuid, grace: Duration) -> Result<(), Error> {
        let pid = match self.poll(recording_id)? {
            PollResult::Gone | PollResult::Exited(_) => None,
            PollResult::Running => self.handles.lock().get(&recording_id).and_then(Child::id),
        };

        if let Some(pid) = pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(%recording_id, pid, err = %e, "SIGTERM failed (process likely already gone)");
            }

            let deadline = tokio::time::Instant::now() + grace;
            loop {
                if !self.poll(recording_id)?.is_running() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(%recording_id, pid, "grace period expired; sending SIGKILL");
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100).min(grace)).await;
            }
        }

        // Guaranteed-release: whatever happened above, the slot is vacated.
        self.handles.lock().remove(&recording_id);
        Ok(())
    }

    pub fn is_tracked(&self, recording_id: Uuid) -> bool {
        self.handles.lock().contains_key(&recording_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EffectivePolicy {
        EffectivePolicy {
            auto_record: true,
            quality: "best".into(),
            codec_list: "h264".into(),
            proxy: None,
            auth_header: None,
            filename_template: String::new(),
            use_chapters: false,
            cleanup_policy: Default::default(),
        }
    }

    #[tokio::test]
    async fn start_poll_and_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.ts");
        let log = dir.path().join("out.log");
        let runner = CaptureRunner::new("/bin/true".into(), None);
        let id = Uuid::now_v7();
        runner.start(id, "someone", &out, &policy(), &log).unwrap();
        assert!(runner.is_tracked(id));

        // Give `/bin/true` a moment to exit, then poll to reap it.
        for _ in 0..50 {
            if let PollResult::Exited(code) = runner.poll(id).unwrap() {
                assert_eq!(code, Some(0));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process never exited");
    }

    #[tokio::test]
    async fn terminate_tolerates_already_gone_process() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.ts");
        let log = dir.path().join("out.log");
        let runner = CaptureRunner::new("/bin/true".into(), None);
        let id = Uuid::now_v7();
        runner.start(id, "someone", &out, &policy(), &log).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // No handle registered for a never-started recording: still a no-op success.
        runner
            .terminate(Uuid::now_v7(), Duration::from_millis(50))
            .await
            .unwrap();
        runner.terminate(id, Duration::from_millis(50)).await.unwrap();
        assert!(!runner.is_tracked(id));
    }

    #[tokio::test]
    async fn poll_of_unknown_recording_is_gone() {
        let runner = CaptureRunner::new("/bin/true".into(), None);
        assert_eq!(runner.poll(Uuid::now_v7()).unwrap(), PollResult::Gone);
    }

    #[test]
    fn start_with_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.ts");
        let log = dir.path().join("out.log");
        let runner = CaptureRunner::new("/nonexistent/capture-binary".into(), None);
        let err = runner
            .start(Uuid::now_v7(), "someone", &out, &policy(), &log)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnError);
    }
}
