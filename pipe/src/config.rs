//! Pipe manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipeError, PipeResult};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_JOIN_TIMEOUT_MS};

/// Android `THREAD_PRIORITY_URGENT_AUDIO`, expressed as a nice value
pub const URGENT_AUDIO_NICE: i32 = -19;

/// Configuration for the pipe manager
///
/// Missing fields fall back to their defaults when deserialized, so the app
/// can pass `{}` or only the values it wants to override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Bytes requested per read
    pub chunk_size: usize,
    /// Upper bound on how long `close()` waits for the reader thread
    pub join_timeout_ms: u64,
    /// Nice value requested for the reader thread (best effort).
    /// `None` leaves the thread at the default priority.
    pub reader_nice: Option<i32>,
    /// Consecutive zero-length reads after which the stream is treated as
    /// ended. `None` disables the limit.
    pub idle_read_limit: Option<u32>,
    /// Name given to the reader thread
    pub reader_thread_name: String,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            reader_nice: Some(URGENT_AUDIO_NICE),
            idle_read_limit: Some(1024),
            reader_thread_name: "aoa-reader".to_string(),
        }
    }
}

impl PipeConfig {
    /// Join timeout as a `Duration`
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> PipeResult<()> {
        if self.chunk_size == 0 {
            return Err(PipeError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if self.join_timeout_ms == 0 {
            return Err(PipeError::InvalidConfig(
                "join_timeout_ms must be non-zero".into(),
            ));
        }
        if self.reader_thread_name.is_empty() {
            return Err(PipeError::InvalidConfig(
                "reader_thread_name must not be empty".into(),
            ));
        }
        if let Some(nice) = self.reader_nice {
            if !(-20..=19).contains(&nice) {
                return Err(PipeError::InvalidConfig(format!(
                    "reader_nice {nice} outside -20..=19"
                )));
            }
        }
        Ok(())
    }
}
