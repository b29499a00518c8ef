//! Reader thread body.
//!
//! The reader takes no lock. It owns `Arc` clones of the stream, its
//! connection flags, the sink and the counters, so a reader abandoned after
//! the join timeout keeps everything it touches alive on its own.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::sink::EventSink;
use crate::stats::StatsCounters;
use crate::stream::{ByteStream, ReadOutcome};

thread_local! {
    /// Flags of the connection this thread reads for, if it is a reader
    static CURRENT_CONNECTION: RefCell<Option<Arc<ConnectionFlags>>> = const { RefCell::new(None) };
}

/// Flags of the connection owned by the calling reader thread
pub(crate) fn current_connection() -> Option<Arc<ConnectionFlags>> {
    CURRENT_CONNECTION.with(|c| c.borrow().clone())
}

/// Per-connection flags, observed by the reader without locking
#[derive(Debug)]
pub(crate) struct ConnectionFlags {
    /// Address of the manager state that opened the connection
    owner: usize,
    reading: AtomicBool,
    closing: AtomicBool,
}

impl ConnectionFlags {
    pub(crate) fn new(owner: usize) -> Self {
        Self {
            owner,
            reading: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_owned_by(&self, owner: usize) -> bool {
        self.owner == owner
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Called by close before the stream is closed
    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.reading.store(false, Ordering::Release);
    }

    fn stop_reading(&self) {
        self.reading.store(false, Ordering::Release);
    }
}

/// Clears `reading` when the reader thread leaves `run`, unwinding included
struct StopOnExit<'a>(&'a ConnectionFlags);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.stop_reading();
    }
}

/// Everything a reader thread needs
pub(crate) struct ReaderContext {
    pub(crate) stream: Arc<dyn ByteStream>,
    pub(crate) flags: Arc<ConnectionFlags>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) chunk_size: usize,
    pub(crate) idle_read_limit: Option<u32>,
    pub(crate) nice: Option<i32>,
    /// Dropped when the thread exits, on every path including unwinding
    pub(crate) done: mpsc::Sender<()>,
}

/// Why the read loop ended
#[derive(Debug)]
pub(crate) enum ReaderExit {
    /// `reading` was cleared by close
    Stopped,
    EndOfStream,
    IdleLimit(u32),
    Failed(io::Error),
}

pub(crate) fn run(ctx: ReaderContext) {
    let ReaderContext {
        stream,
        flags,
        sink,
        stats,
        chunk_size,
        idle_read_limit,
        nice,
        done: _done,
    } = ctx;

    if let Some(nice) = nice {
        if let Err(e) = apply_priority(nice) {
            warn!("Could not raise reader priority to {}: {}", nice, e);
        }
    }

    CURRENT_CONNECTION.with(|c| *c.borrow_mut() = Some(Arc::clone(&flags)));
    // Dropped before `_done`, so a joined reader is never seen as reading
    let stop = StopOnExit(&flags);

    info!("Reader started");

    let exit = read_loop(stream.as_ref(), &flags, sink.as_ref(), &stats, chunk_size, idle_read_limit);

    drop(stop);

    match exit {
        ReaderExit::Stopped => debug!("Reader stopped by close"),
        ReaderExit::EndOfStream => info!("Reader reached end of stream"),
        ReaderExit::IdleLimit(n) => {
            warn!("Reader saw {} consecutive empty reads, treating as end of stream", n)
        }
        ReaderExit::Failed(e) if flags.is_closing() => {
            debug!("Read failed during close (expected): {}", e)
        }
        ReaderExit::Failed(e) => error!("Read failed, connection lost: {}", e),
    }

    info!("Reader stopped");
}

pub(crate) fn read_loop(
    stream: &dyn ByteStream,
    flags: &ConnectionFlags,
    sink: &dyn EventSink,
    stats: &StatsCounters,
    chunk_size: usize,
    idle_read_limit: Option<u32>,
) -> ReaderExit {
    let mut buffer = vec![0u8; chunk_size];
    let mut idle_reads: u32 = 0;

    while flags.is_reading() {
        match stream.read(&mut buffer) {
            Ok(ReadOutcome::Data(n)) => {
                idle_reads = 0;
                let n = n.min(buffer.len());
                if n == 0 {
                    continue;
                }
                // The read outlived close; its bytes belong to a dead connection
                if !flags.is_reading() {
                    debug!("Dropping {} bytes read after close", n);
                    return ReaderExit::Stopped;
                }
                stats.record_chunk(n);
                sink.on_data(buffer[..n].to_vec());
            }
            Ok(ReadOutcome::Idle) => {
                idle_reads = idle_reads.saturating_add(1);
                if idle_read_limit.is_some_and(|limit| idle_reads >= limit) {
                    return ReaderExit::IdleLimit(idle_reads);
                }
            }
            Ok(ReadOutcome::EndOfStream) => return ReaderExit::EndOfStream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReaderExit::Failed(e),
        }
    }

    ReaderExit::Stopped
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_priority(nice: i32) -> io::Result<()> {
    // SAFETY: gettid takes no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    // SAFETY: setpriority only reads its scalar arguments
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_priority(_nice: i32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::PipeEvent;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted(Mutex<VecDeque<io::Result<ReadOutcome>>>, u8);

    impl Scripted {
        fn new(fill: u8, script: Vec<io::Result<ReadOutcome>>) -> Self {
            Self(Mutex::new(script.into()), fill)
        }
    }

    impl ByteStream for Scripted {
        fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            let next = self.0.lock().unwrap().pop_front();
            let outcome = next.unwrap_or(Ok(ReadOutcome::EndOfStream))?;
            if let ReadOutcome::Data(n) = outcome {
                let len = n.min(buf.len());
                buf[..len].fill(self.1);
            }
            Ok(outcome)
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain(rx: &mpsc::Receiver<PipeEvent>) -> Vec<PipeEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_forwards_only_bytes_read() {
        let stream = Scripted::new(0xAB, vec![Ok(ReadOutcome::Data(3))]);
        let (tx, rx) = mpsc::channel::<PipeEvent>();
        let stats = StatsCounters::default();
        let flags = ConnectionFlags::new(0);

        let exit = read_loop(&stream, &flags, &tx, &stats, 16, None);

        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(drain(&rx), vec![PipeEvent::Data(vec![0xAB; 3])]);
        assert_eq!(stats.snapshot().bytes_received, 3);
    }

    #[test]
    fn test_idle_and_interrupted_reads_continue() {
        let stream = Scripted::new(
            1,
            vec![
                Ok(ReadOutcome::Idle),
                Err(io::Error::from(io::ErrorKind::Interrupted)),
                Ok(ReadOutcome::Data(2)),
            ],
        );
        let (tx, rx) = mpsc::channel::<PipeEvent>();
        let exit = read_loop(
            &stream,
            &ConnectionFlags::new(0),
            &tx,
            &StatsCounters::default(),
            8,
            Some(5),
        );

        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(drain(&rx), vec![PipeEvent::Data(vec![1, 1])]);
    }

    #[test]
    fn test_idle_limit_ends_reader() {
        let stream = Scripted::new(0, (0..10).map(|_| Ok(ReadOutcome::Idle)).collect());
        let (tx, _rx) = mpsc::channel::<PipeEvent>();
        let exit = read_loop(
            &stream,
            &ConnectionFlags::new(0),
            &tx,
            &StatsCounters::default(),
            8,
            Some(4),
        );
        assert!(matches!(exit, ReaderExit::IdleLimit(4)));
    }

    #[test]
    fn test_read_error_ends_reader() {
        let stream = Scripted::new(
            0,
            vec![Err(io::Error::from(io::ErrorKind::BrokenPipe))],
        );
        let (tx, rx) = mpsc::channel::<PipeEvent>();
        let exit = read_loop(
            &stream,
            &ConnectionFlags::new(0),
            &tx,
            &StatsCounters::default(),
            8,
            None,
        );
        assert!(matches!(exit, ReaderExit::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_cleared_flag_stops_before_reading() {
        let stream = Scripted::new(0, vec![Ok(ReadOutcome::Data(1))]);
        let flags = ConnectionFlags::new(0);
        flags.begin_close();
        let (tx, rx) = mpsc::channel::<PipeEvent>();

        let exit = read_loop(&stream, &flags, &tx, &StatsCounters::default(), 8, None);

        assert!(matches!(exit, ReaderExit::Stopped));
        assert!(flags.is_closing());
        assert!(drain(&rx).is_empty());
    }

    /// Runs `on_close` from inside the first read, then returns data
    struct CloseDuringRead<F: Fn() + Send + Sync + 'static>(F);

    impl<F: Fn() + Send + Sync + 'static> ByteStream for CloseDuringRead<F> {
        fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            (self.0)();
            buf[..2].fill(0xEE);
            Ok(ReadOutcome::Data(2))
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_data_returned_after_close_is_dropped() {
        let flags = Arc::new(ConnectionFlags::new(0));
        let closer = Arc::clone(&flags);
        let stream = CloseDuringRead(move || closer.begin_close());
        let (tx, rx) = mpsc::channel::<PipeEvent>();
        let stats = StatsCounters::default();

        let exit = read_loop(&stream, &flags, &tx, &stats, 8, None);

        assert!(matches!(exit, ReaderExit::Stopped));
        assert!(drain(&rx).is_empty());
        assert_eq!(stats.snapshot().chunks_received, 0);
    }

    struct PanicSink;

    impl EventSink for PanicSink {
        fn on_data(&self, _data: Vec<u8>) {
            panic!("sink failure");
        }

        fn on_connected(&self) {}

        fn on_error(&self, _code: &str, _message: &str) {}
    }

    #[test]
    fn test_panicking_sink_still_clears_reading() {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let flags = Arc::new(ConnectionFlags::new(0));
        let ctx = ReaderContext {
            stream: Arc::new(Scripted::new(1, vec![Ok(ReadOutcome::Data(1))])),
            flags: Arc::clone(&flags),
            sink: Arc::new(PanicSink),
            stats: Arc::new(StatsCounters::default()),
            chunk_size: 8,
            idle_read_limit: None,
            nice: None,
            done: done_tx,
        };

        let result = std::thread::spawn(move || run(ctx)).join();

        assert!(result.is_err());
        assert!(!flags.is_reading());
        assert_eq!(done_rx.try_recv(), Err(mpsc::TryRecvError::Disconnected));
    }

    #[test]
    fn test_reader_thread_knows_its_connection() {
        let (done_tx, _done_rx) = mpsc::channel::<()>();
        let (tx, _rx) = mpsc::channel::<PipeEvent>();
        let flags = Arc::new(ConnectionFlags::new(7));
        let ctx = ReaderContext {
            stream: Arc::new(Scripted::new(0, vec![])),
            flags: Arc::clone(&flags),
            sink: Arc::new(tx),
            stats: Arc::new(StatsCounters::default()),
            chunk_size: 8,
            idle_read_limit: None,
            nice: None,
            done: done_tx,
        };

        let seen = std::thread::spawn(move || {
            run(ctx);
            current_connection()
        })
        .join()
        .unwrap();

        assert!(seen.is_some_and(|f| Arc::ptr_eq(&f, &flags) && f.is_owned_by(7)));
        assert!(current_connection().is_none());
    }

    #[test]
    fn test_run_clears_reading_and_signals_done() {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let (tx, _rx) = mpsc::channel::<PipeEvent>();
        let flags = Arc::new(ConnectionFlags::new(0));

        run(ReaderContext {
            stream: Arc::new(Scripted::new(0, vec![])),
            flags: Arc::clone(&flags),
            sink: Arc::new(tx),
            stats: Arc::new(StatsCounters::default()),
            chunk_size: 8,
            idle_read_limit: None,
            nice: None,
            done: done_tx,
        });

        assert!(!flags.is_reading());
        assert_eq!(done_rx.try_recv(), Err(mpsc::TryRecvError::Disconnected));
    }
}
