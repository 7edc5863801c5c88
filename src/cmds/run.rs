// This file is part of StreamVault, a live-stream recording supervisor.

//! The composition root: wires C1-C8 together, runs the startup reconciler
//! once, then serves the webhook ingress and post-processing workers until a
//! shutdown signal arrives (spec.md §5 "Service shutdown").

use crate::capture::CaptureRunner;
use crate::config::{ConfigResolver, GlobalPolicy};
use crate::events::EventDispatcher;
use crate::ids::IdGenerator;
use crate::lifecycle::Lifecycle;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::reconcile::Reconciler;
use crate::rotation::{RotationPolicy, TimeBasedRotation};
use crate::state::StateManager;
use crate::webhook;
use base::clock::{Clocks, RealClocks};
use base::ids::RealIds;
use bpaf::Bpaf;
use db::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub type Error = base::Error;

/// Runs the recording supervisor against the database at `--db-dir`.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    #[bpaf(long("db-dir"), argument("PATH"), fallback("/var/lib/streamvault/db".into()))]
    db_dir: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long("worker-threads"), argument("N"), optional)]
    worker_threads: Option<usize>,
}

/// Process-level configuration, read once at startup from the environment
/// (spec.md §6 "Configuration"). Not hot-reloaded.
struct ProcessConfig {
    capture_binary: PathBuf,
    ffmpeg_binary: PathBuf,
    recordings_root: PathBuf,
    platform_oauth_token: Option<String>,
    worker_count: usize,
    max_attempts: u32,
    retry_base: Duration,
    grace_shutdown: Duration,
    grace_terminate: Duration,
    grace_rotate: Duration,
    poll_interval: Duration,
    segment_rotation: Duration,
    min_segment_bytes: i64,
    webhook_bind_addr: SocketAddr,
    webhook_hmac_secret: Vec<u8>,
}

fn env_var(name: &str) -> Result<String, Error> {
    std::env::var(name)
        .map_err(|_| base::format_err_t!(ConfigError, "missing required env var {}", name))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Error> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| base::format_err_t!(ConfigError, "invalid value for env var {}", name)),
        Err(_) => Ok(default),
    }
}

impl ProcessConfig {
    fn from_env() -> Result<Self, Error> {
        let secret_hex = env_var("WEBHOOK_HMAC_SECRET")?;
        let webhook_hmac_secret = hex::decode(&secret_hex).map_err(|e| {
            base::format_err_t!(ConfigError, "WEBHOOK_HMAC_SECRET is not valid hex: {}", e)
        })?;
        Ok(ProcessConfig {
            capture_binary: PathBuf::from(env_var("CAPTURE_BINARY")?),
            ffmpeg_binary: PathBuf::from(env_var("FFMPEG_BINARY")?),
            recordings_root: PathBuf::from(env_var("RECORDINGS_ROOT")?),
            platform_oauth_token: std::env::var("PLATFORM_OAUTH_TOKEN").ok(),
            worker_count: env_or("WORKER_COUNT", 4usize)?,
            max_attempts: env_or("MAX_ATTEMPTS", 5u32)?,
            retry_base: Duration::from_secs(env_or("RETRY_BASE_SECONDS", 10u64)?),
            grace_shutdown: Duration::from_secs(env_or("GRACE_SHUTDOWN_SECONDS", 15u64)?),
            grace_terminate: Duration::from_secs(env_or("GRACE_TERMINATE_SECONDS", 10u64)?),
            grace_rotate: Duration::from_secs(env_or("GRACE_ROTATE_SECONDS", 10u64)?),
            poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECONDS", 2u64)?),
            segment_rotation: Duration::from_secs(env_or("SEGMENT_ROTATION_SECONDS", 86_400u64)?),
            min_segment_bytes: env_or("MIN_SEGMENT_BYTES", 1024i64)?,
            webhook_bind_addr: env_or("WEBHOOK_BIND_ADDR", "127.0.0.1:8080".parse().unwrap())?,
            webhook_hmac_secret,
        })
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    builder
        .build()
        .map_err(|e| base::format_err_t!(Internal, "failed to build tokio runtime: {}", e))?
        .block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let process_config = ProcessConfig::from_env()?;
    let clocks = Arc::new(RealClocks {});

    let (_dir_lock, conn) = super::open_conn(&args.db_dir, super::OpenMode::ReadWrite)?;
    let db = Arc::new(Database::new(conn)?);
    info!("database loaded");

    let ids = IdGenerator::new(Arc::new(RealIds));
    let config = Arc::new(ConfigResolver::new(db.clone(), GlobalPolicy::default()));
    let state = Arc::new(StateManager::new());
    let runner = Arc::new(CaptureRunner::new(
        process_config.capture_binary.clone(),
        process_config.platform_oauth_token.clone(),
    ));
    let lifecycle = Arc::new(Lifecycle {
        db: db.clone(),
        state: state.clone(),
        runner,
        config,
        ids,
        clocks: clocks.clone(),
        recordings_root: process_config.recordings_root.clone(),
        poll_interval: process_config.poll_interval,
        grace_terminate: process_config.grace_terminate,
        grace_rotate: process_config.grace_rotate,
    });
    let dispatcher = Arc::new(EventDispatcher::new(db.clone(), lifecycle.clone()));
    let pipeline = Pipeline::new(
        db.clone(),
        PipelineConfig {
            ffmpeg_binary: process_config.ffmpeg_binary.clone(),
            worker_count: process_config.worker_count,
            max_attempts: process_config.max_attempts,
            retry_base: process_config.retry_base,
            min_segment_bytes: process_config.min_segment_bytes,
        },
    );
    let reconciler = Reconciler::new(db.clone(), lifecycle.clone());
    let rotation_policy: Arc<dyn RotationPolicy> = Arc::new(TimeBasedRotation {
        interval: process_config.segment_rotation,
    });

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    reconciler
        .run(chrono::DateTime::<chrono::Utc>::from(clocks.realtime()))
        .await?;
    info!("startup reconciliation done; accepting events");

    let worker_handles = pipeline.spawn_workers(shutdown_rx.clone());

    let webhook_rx = shutdown_rx.clone();
    let webhook_dispatcher = dispatcher.clone();
    let bind_addr = process_config.webhook_bind_addr;
    let hmac_secret = process_config.webhook_hmac_secret.clone();
    let webhook_handle = tokio::spawn(async move {
        webhook::serve(bind_addr, &hmac_secret, webhook_dispatcher, webhook_rx).await
    });

    let rotation_lifecycle = lifecycle.clone();
    let rotation_state = state.clone();
    let rotation_clocks = clocks.clone();
    let mut rotation_shutdown = shutdown_rx.clone();
    let rotation_handle = tokio::spawn(async move {
        loop {
            if rotation_shutdown.check().is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            let now = chrono::DateTime::<chrono::Utc>::from(rotation_clocks.realtime());
            for (channel_id, descriptor) in rotation_state.list_active_with_channel() {
                if rotation_policy.should_rotate(descriptor.segment_started_at, now, 0) {
                    if let Err(e) = rotation_lifecycle.rotate_segment(channel_id).await {
                        warn!(%channel_id, err = %e, "scheduled rotation failed");
                    }
                }
            }
        }
    });

    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| base::format_err_t!(Internal, "{}", e))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| base::format_err_t!(Internal, "{}", e))?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    drop(shutdown_tx);
    lifecycle
        .shutdown_all(process_config.grace_shutdown, &shutdown_rx)
        .await;
    rotation_handle.abort();

    info!("draining post-processing workers");
    for handle in worker_handles {
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!("pipeline worker task panicked");
            }
        }
    }

    match webhook_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(err = %e, "webhook server exited with error"),
        Err(e) if e.is_panic() => warn!("webhook server task panicked"),
        Err(_) => {}
    }

    info!("exiting");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::ErrorKind;

    #[test]
    fn env_or_falls_back_when_unset() {
        std::env::remove_var("STREAMVAULT_TEST_ENV_OR");
        let v: u64 = env_or("STREAMVAULT_TEST_ENV_OR", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_or_parses_when_set() {
        std::env::set_var("STREAMVAULT_TEST_ENV_OR_2", "7");
        let v: u64 = env_or("STREAMVAULT_TEST_ENV_OR_2", 42).unwrap();
        assert_eq!(v, 7);
        std::env::remove_var("STREAMVAULT_TEST_ENV_OR_2");
    }

    #[test]
    fn env_var_missing_is_config_error() {
        std::env::remove_var("STREAMVAULT_TEST_MISSING");
        let err = env_var("STREAMVAULT_TEST_MISSING").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}
