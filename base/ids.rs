// This file is part of StreamVault, a live-stream recording supervisor.

//! Id generation (component C1, the id half — the time half is `clock`).
//!
//! Channel, stream, recording and task primary keys are time-ordered UUIDs
//! (v7), so that ids sort chronologically and collide only astronomically
//! rarely across processes without any coordination. Generation is behind a
//! trait so tests can supply deterministic sequences instead of real
//! randomness.

use uuid::Uuid;

/// Generates ids. Implemented by `RealIds` in production and a deterministic
/// sequence in tests.
pub trait IdSource: Send + Sync + 'static {
    fn new_id(&self) -> Uuid;
}

#[derive(Copy, Clone, Default)]
pub struct RealIds;

impl IdSource for RealIds {
    fn new_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

/// Deterministic id source for tests: hands out v7-shaped but
/// fully-predictable ids in sequence, so assertions can name expected ids.
pub struct SequentialIds {
    next: std::sync::atomic::AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        SequentialIds {
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIds {
    fn new_id(&self) -> Uuid {
        let n = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Uuid::from_u128(n as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_distinct_and_ordered() {
        let src = SequentialIds::new();
        let a = src.new_id();
        let b = src.new_id();
        assert_ne!(a, b);
        assert!(a.as_u128() < b.as_u128());
    }

    #[test]
    fn real_ids_are_v7() {
        let id = RealIds.new_id();
        assert_eq!(id.get_version_num(), 7);
    }
}
