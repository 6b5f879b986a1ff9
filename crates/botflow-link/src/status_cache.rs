//! [`StatusCache`] – last known device telemetry.
//!
//! A single background subscriber writes, any number of readers read.  Reads
//! never touch the network.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use botflow_types::{BotError, MissionStatus};

/// Telemetry older than this is reported as stale.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(10);

struct CacheEntry {
    status: MissionStatus,
    last_updated: Instant,
}

pub struct StatusCache {
    entry: RwLock<Option<CacheEntry>>,
    freshness: Duration,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS)
    }
}

impl StatusCache {
    /// Create an empty cache with the given freshness window.
    pub fn new(freshness: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            freshness,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Return the cached status.
    ///
    /// # Errors
    ///
    /// * [`BotError::StatusNotAvailable`] before the first [`update`](Self::update).
    /// * [`BotError::StatusStale`] carrying the last known value once the
    ///   freshness window has passed without an update.
    pub fn get(&self) -> Result<MissionStatus, BotError> {
        let guard = self.entry.read().unwrap_or_else(|e| e.into_inner());
        let entry = guard.as_ref().ok_or(BotError::StatusNotAvailable)?;
        let age = entry.last_updated.elapsed();
        if age > self.freshness {
            return Err(BotError::StatusStale {
                last_known: Box::new(entry.status.clone()),
                age_ms: age.as_millis() as u64,
            });
        }
        Ok(entry.status.clone())
    }

    /// Replace the cached value and reset its age.
    pub fn update(&self, status: MissionStatus) {
        let mut guard = self.entry.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CacheEntry {
            status,
            last_updated: Instant::now(),
        });
    }

    /// `true` once at least one update has landed.
    pub fn is_ready(&self) -> bool {
        self.entry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
