//! # Accessory Pipe Core
//!
//! This crate owns the lifecycle of a single Android Open Accessory byte pipe:
//!
//! - **PipeManager**: serialized open/close state machine with one reader thread
//! - **ByteStream / AccessoryHandle**: abstraction over the opened device pipe
//! - **EventSink**: where received chunks and lifecycle notifications go
//!
//! ## Architecture
//!
//! ```text
//!  open(handle) / close()                        EventSink
//!  (any thread, serialized)                    ┌───────────┐
//!          │                                   │on_connected│
//!          ▼                                   │on_data     │
//! ┌─────────────────┐  spawn   ┌────────────┐  │on_error    │
//! │   PipeManager   │─────────►│ aoa-reader │─►└───────────┘
//! │  (pipe lock)    │  close   │  (blocking │
//! │                 │─────────►│   read)    │
//! └─────────────────┘  stream  └────────────┘
//! ```
//!
//! ## Cancellation
//!
//! A blocking read cannot be interrupted cooperatively. `close()` closes the
//! stream out from under the reader and then waits, bounded by the configured
//! join timeout, for the reader thread to exit.

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod fd;
pub mod manager;
mod reader;
pub mod sink;
pub mod stats;
pub mod stream;

// Re-export main types for convenience
pub use config::PipeConfig;
pub use error::{PipeError, PipeResult};
#[cfg(unix)]
pub use fd::{FdAccessory, FdStream};
pub use manager::{PipeManager, PipePhase};
pub use sink::{EventSink, PipeEvent};
pub use stats::PipeStats;
pub use stream::{AccessoryHandle, ByteStream, ReadOutcome};

/// Library version, reported by the bridge at init
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of a single read from the accessory stream.
/// Matches the largest bulk transfer the accessory driver hands out.
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// How long `close()` waits for the reader thread before abandoning it
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 500;
