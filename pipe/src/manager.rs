//! # Pipe Manager
//!
//! Owns the open/close/read state machine for one accessory connection.
//!
//! ## State Machine
//!
//! ```text
//!            open()                stream ok, reader spawned
//!   ┌──────┐ ──────► ┌─────────┐ ─────────────────────────► ┌───────────┐
//!   │ Idle │         │ Opening │                            │ Connected │
//!   └──────┘ ◄────── └─────────┘                            └───────────┘
//!      ▲    open failed (on_error)                             │
//!      │                                 close() / next open() │
//!      │               ┌─────────┐ ◄───────────────────────────┘
//!      └────────────── │ Closing │   stream closed, reader joined
//!                      └─────────┘   (or abandoned after timeout)
//! ```
//!
//! ## Locking
//!
//! Two locks, neither ever taken by the reader:
//!
//! 1. **ops**: held for the whole of every `open`/`close` sequence, so only
//!    one sequence runs at a time and a new reader can never start before the
//!    previous one was joined.
//! 2. **state**: guards the connection slot and flags; held only for short
//!    sections, never across the join-wait or a read.
//!
//! A `close()` issued from a reader thread (a sink reacting to data) only
//! ever closes that reader's own connection. It gives up instead of waiting
//! on `ops` once another sequence has started closing that connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::PipeConfig;
use crate::error::{PipeError, PipeResult};
use crate::reader::{self, ConnectionFlags, ReaderContext};
use crate::sink::EventSink;
use crate::stats::{PipeStats, StatsCounters};
use crate::stream::{AccessoryHandle, ByteStream};

/// Lifecycle phase of the pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipePhase {
    Idle,
    Opening,
    Connected,
    Closing,
}

/// Handle to the accessory pipe lifecycle manager
///
/// Cheap to clone; all clones drive the same pipe. The connection is torn
/// down on `shutdown()` or when the last clone is dropped.
///
/// # Example
///
/// ```no_run
/// use std::sync::{mpsc, Arc};
/// use aoa_pipe::{FdAccessory, PipeConfig, PipeEvent, PipeManager};
///
/// # fn main() -> aoa_pipe::PipeResult<()> {
/// let (tx, rx) = mpsc::channel::<PipeEvent>();
/// let manager = PipeManager::new(PipeConfig::default(), Arc::new(tx))?;
///
/// # let fd = -1;
/// // fd handed over by the app once USB permission was granted
/// let accessory = unsafe { FdAccessory::from_raw_fd(fd) };
/// manager.open(accessory)?;
///
/// for event in rx.iter() {
///     println!("{event:?}");
/// }
/// manager.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PipeManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: PipeConfig,
    sink: Arc<dyn EventSink>,
    stats: Arc<StatsCounters>,
    ops: Mutex<()>,
    state: Mutex<PipeState>,
    shut_down: AtomicBool,
}

struct PipeState {
    phase: PipePhase,
    closing: bool,
    connection: Option<Connection>,
}

struct Connection {
    stream: Arc<dyn ByteStream>,
    flags: Arc<ConnectionFlags>,
    reader: ReaderTask,
}

struct ReaderTask {
    thread: JoinHandle<()>,
    /// Disconnects once the reader thread has exited
    done: mpsc::Receiver<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipeManager {
    /// Create an idle manager delivering events to `sink`
    pub fn new(config: PipeConfig, sink: Arc<dyn EventSink>) -> PipeResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sink,
                stats: Arc::new(StatsCounters::default()),
                ops: Mutex::new(()),
                state: Mutex::new(PipeState {
                    phase: PipePhase::Idle,
                    closing: false,
                    connection: None,
                }),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Open `handle`, closing any current connection first.
    ///
    /// Blocks while a previous reader is joined (bounded by the join
    /// timeout); callers on an interactive thread should dispatch it.
    /// Failures are reported to the sink as well as returned.
    pub fn open<H: AccessoryHandle>(&self, handle: H) -> PipeResult<()> {
        let shared = &self.shared;
        let _op = lock(&shared.ops);

        if shared.shut_down.load(Ordering::Acquire) {
            let err = PipeError::ShutDown;
            warn!("Open rejected: {}", err);
            shared.report_open_failure(&err);
            return Err(err);
        }

        debug!(">>> Opening accessory pipe");
        shared.teardown();
        lock(&shared.state).phase = PipePhase::Opening;

        match shared.establish(handle) {
            Ok(()) => Ok(()),
            Err(err) => {
                lock(&shared.state).phase = PipePhase::Idle;
                error!("Failed to open accessory: {}", err);
                shared.report_open_failure(&err);
                Err(err)
            }
        }
    }

    /// Close the current connection. No-op when nothing is open.
    ///
    /// Returns once the reader has exited or the join timeout elapsed.
    pub fn close(&self) {
        let own = reader::current_connection().filter(|flags| flags.is_owned_by(self.shared.owner_id()));
        let _op = match &own {
            Some(flags) => match self.shared.lock_ops_from_reader(flags) {
                Some(op) => op,
                None => {
                    debug!("Close from reader skipped; its connection is already closing");
                    return;
                }
            },
            None => lock(&self.shared.ops),
        };
        if !self.shared.teardown() {
            debug!("Close requested with no open connection");
        }
    }

    /// Close the connection and refuse every later `open`
    pub fn shutdown(&self) {
        if !self.shared.shut_down.swap(true, Ordering::AcqRel) {
            info!("Pipe manager shutting down");
        }
        self.close();
    }

    pub fn phase(&self) -> PipePhase {
        lock(&self.shared.state).phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == PipePhase::Connected
    }

    /// Whether the current connection's reader is still in its read loop
    pub fn is_reading(&self) -> bool {
        lock(&self.shared.state)
            .connection
            .as_ref()
            .is_some_and(|c| c.flags.is_reading())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PipeConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PipeStats {
        self.shared.stats.snapshot()
    }
}

impl Shared {
    fn owner_id(&self) -> usize {
        self as *const Shared as usize
    }

    /// Take `ops` on behalf of the reader owning `flags`, or give up once
    /// that connection starts closing. The sequence closing it may be
    /// waiting for this very thread to exit.
    fn lock_ops_from_reader(&self, flags: &ConnectionFlags) -> Option<MutexGuard<'_, ()>> {
        loop {
            if flags.is_closing() {
                return None;
            }
            let op = match self.ops.try_lock() {
                Ok(op) => op,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };
            // A whole close may have run between the check and the lock
            return (!flags.is_closing()).then_some(op);
        }
    }

    /// Acquire the stream and start its reader. Caller holds `ops`.
    fn establish<H: AccessoryHandle>(&self, handle: H) -> PipeResult<()> {
        let stream: Arc<dyn ByteStream> = Arc::new(handle.open_stream()?);
        let flags = Arc::new(ConnectionFlags::new(self.owner_id()));
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let ctx = ReaderContext {
            stream: Arc::clone(&stream),
            flags: Arc::clone(&flags),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            chunk_size: self.config.chunk_size,
            idle_read_limit: self.config.idle_read_limit,
            nice: self.config.reader_nice,
            done: done_tx,
        };

        // Announced before the reader can produce its first chunk
        self.sink.on_connected();

        let spawned = thread::Builder::new()
            .name(self.config.reader_thread_name.clone())
            .spawn(move || reader::run(ctx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let _ = stream.close();
                return Err(PipeError::OpenFailed(format!("could not start reader: {e}")));
            }
        };

        {
            let mut state = lock(&self.state);
            state.connection = Some(Connection {
                stream,
                flags,
                reader: ReaderTask {
                    thread,
                    done: done_rx,
                },
            });
            state.phase = PipePhase::Connected;
        }
        self.stats.record_open();
        info!("Accessory pipe connected");
        Ok(())
    }

    /// Close the stream and join the reader. Returns false when there was
    /// nothing to tear down. Caller holds `ops` (or has exclusive access).
    fn teardown(&self) -> bool {
        let connection = {
            let mut state = lock(&self.state);
            if state.closing {
                return false;
            }
            let Some(connection) = state.connection.take() else {
                return false;
            };
            state.closing = true;
            state.phase = PipePhase::Closing;
            connection
        };

        debug!("Closing accessory...");
        connection.flags.begin_close();

        // Closing the stream is what unblocks a pending read
        if let Err(e) = connection.stream.close() {
            debug!("Ignoring error while closing accessory stream: {}", e);
        }

        self.join_reader(connection.reader);
        drop(connection.stream);

        {
            let mut state = lock(&self.state);
            state.closing = false;
            state.phase = PipePhase::Idle;
        }
        self.stats.record_teardown();
        debug!("Accessory closed & reader joined");
        true
    }

    fn join_reader(&self, reader: ReaderTask) {
        if reader.thread.thread().id() == thread::current().id() {
            debug!("Close issued from the reader thread; not waiting on itself");
            return;
        }

        let timeout = self.config.join_timeout();
        match reader.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if reader.thread.join().is_err() {
                    error!("Reader thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Reader did not stop within {:?}; abandoning it",
                    timeout
                );
                self.stats.record_abandoned();
            }
        }
    }

    fn report_open_failure(&self, err: &PipeError) {
        self.stats.record_open_failure();
        self.sink.on_error(err.code(), &err.to_string());
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.teardown();
    }
}
