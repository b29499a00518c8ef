//! # Byte Stream & Handle Abstractions
//!
//! This module defines the traits the pipe manager drives. The manager never
//! touches a platform API directly:
//!
//! - **AccessoryHandle**: a permission-granted device that can be opened once
//! - **ByteStream**: the opened pipe, read by the reader thread and closed by
//!   the manager, possibly at the same time
//!
//! ## Read Contract
//!
//! ```text
//!  platform read()   ReadOutcome        reader action
//!  ──────────────    ───────────        ─────────────
//!       n > 0     →  Data(n)        →  forward buf[..n]
//!       n == 0    →  Idle           →  read again (bounded)
//!       n < 0     →  EndOfStream    →  exit quietly
//!       error     →  Err(io::Error) →  exit, reported unless closing
//! ```

use std::io;

use crate::error::PipeResult;

/// Outcome of a single successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written to the start of the buffer
    Data(usize),
    /// No data right now, the stream is still alive
    Idle,
    /// The stream ended (cable unplugged, descriptor died)
    EndOfStream,
}

/// An opened accessory byte stream
///
/// Both methods take `&self`: the reader thread blocks in `read` while the
/// manager calls `close` from another thread.
pub trait ByteStream: Send + Sync + 'static {
    /// Blocking read into `buf`
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Close the stream.
    ///
    /// Must cause an in-flight `read` to return (error or end of stream)
    /// wherever the platform allows it, and must make every later `read`
    /// fail or report `EndOfStream`.
    fn close(&self) -> io::Result<()>;
}

/// A permission-granted accessory that can be opened into a stream
pub trait AccessoryHandle: Send {
    /// The stream type produced by a successful open
    type Stream: ByteStream;

    /// Acquire the stream.
    ///
    /// Fails with `PermissionDenied`, `DeviceUnavailable` or `OpenFailed`.
    fn open_stream(self) -> PipeResult<Self::Stream>;
}
