//! Instrumented fake accessory streams shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use aoa_pipe::{AccessoryHandle, ByteStream, PipeConfig, PipeError, PipeEvent, PipeResult, ReadOutcome};

/// What a fake stream does once its scripted chunks are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// Report end of stream
    Eof,
    /// Block until closed, then end the read with an I/O error
    ErrorOnClose,
    /// Block until closed, then report end of stream
    EofOnClose,
    /// Block until the test calls `release`, ignoring close; then return the
    /// late chunk if one was set, else end of stream
    Hang,
}

/// Records how many reads are in flight across every stream sharing it
#[derive(Debug, Default)]
pub struct ReadTracker {
    active: AtomicUsize,
    max_active: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ReadTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|e| e == entry)
    }

    fn enter(&self, name: &str) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("{name}:enter"));
    }

    fn exit(&self, name: &str) {
        self.log.lock().unwrap().push(format!("{name}:exit"));
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ReadGuard<'a> {
    tracker: &'a ReadTracker,
    name: &'a str,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.tracker.exit(self.name);
    }
}

#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    released: bool,
}

struct Inner {
    name: String,
    chunks: Mutex<VecDeque<Vec<u8>>>,
    late: Mutex<Option<Vec<u8>>>,
    tail: Tail,
    gate: Mutex<Gate>,
    wake: Condvar,
    close_calls: AtomicUsize,
    tracker: Arc<ReadTracker>,
}

/// Scripted stream; clones share state so tests can observe the copy the
/// manager owns
#[derive(Clone)]
pub struct FakeStream(Arc<Inner>);

impl FakeStream {
    pub fn new(name: &str, chunks: Vec<Vec<u8>>, tail: Tail, tracker: &Arc<ReadTracker>) -> Self {
        Self(Arc::new(Inner {
            name: name.to_string(),
            chunks: Mutex::new(chunks.into()),
            late: Mutex::new(None),
            tail,
            gate: Mutex::new(Gate::default()),
            wake: Condvar::new(),
            close_calls: AtomicUsize::new(0),
            tracker: Arc::clone(tracker),
        }))
    }

    /// Bytes a released `Tail::Hang` read returns
    pub fn with_late_chunk(self, chunk: Vec<u8>) -> Self {
        *self.0.late.lock().unwrap() = Some(chunk);
        self
    }

    pub fn close_calls(&self) -> usize {
        self.0.close_calls.load(Ordering::SeqCst)
    }

    /// Let a `Tail::Hang` read return
    pub fn release(&self) {
        self.0.gate.lock().unwrap().released = true;
        self.0.wake.notify_all();
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle(Ok(self.clone()))
    }
}

impl ByteStream for FakeStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let inner = &self.0;
        inner.tracker.enter(&inner.name);
        let _guard = ReadGuard {
            tracker: &inner.tracker,
            name: &inner.name,
        };

        if inner.gate.lock().unwrap().closed && inner.tail != Tail::Hang {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }

        if let Some(chunk) = inner.chunks.lock().unwrap().pop_front() {
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Ok(ReadOutcome::Data(chunk.len()));
        }

        match inner.tail {
            Tail::Eof => Ok(ReadOutcome::EndOfStream),
            Tail::ErrorOnClose | Tail::EofOnClose => {
                let gate = inner
                    .wake
                    .wait_while(inner.gate.lock().unwrap(), |g| !g.closed)
                    .unwrap();
                drop(gate);
                if inner.tail == Tail::ErrorOnClose {
                    Err(io::Error::new(io::ErrorKind::Other, "interrupted by close"))
                } else {
                    Ok(ReadOutcome::EndOfStream)
                }
            }
            Tail::Hang => {
                let gate = inner
                    .wake
                    .wait_while(inner.gate.lock().unwrap(), |g| !g.released)
                    .unwrap();
                drop(gate);
                match inner.late.lock().unwrap().take() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(ReadOutcome::Data(chunk.len()))
                    }
                    None => Ok(ReadOutcome::EndOfStream),
                }
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.0.close_calls.fetch_add(1, Ordering::SeqCst);
        self.0.gate.lock().unwrap().closed = true;
        self.0.wake.notify_all();
        Ok(())
    }
}

/// Accessory handle yielding a fake stream or a fixed error
pub struct FakeHandle(Result<FakeStream, PipeError>);

impl FakeHandle {
    pub fn failing(err: PipeError) -> Self {
        Self(Err(err))
    }
}

impl AccessoryHandle for FakeHandle {
    type Stream = FakeStream;

    fn open_stream(self) -> PipeResult<FakeStream> {
        self.0
    }
}

pub fn test_config() -> PipeConfig {
    PipeConfig {
        reader_nice: None,
        ..PipeConfig::default()
    }
}

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Wait until the stream named `name` has a read in flight
pub fn wait_for_read(tracker: &ReadTracker, name: &str) {
    let entry = format!("{name}:enter");
    assert!(
        wait_until(Duration::from_secs(2), || tracker.position(&entry).is_some()),
        "{name} never started reading"
    );
}

pub fn events(rx: &mpsc::Receiver<PipeEvent>) -> Vec<PipeEvent> {
    rx.try_iter().collect()
}

pub fn has_error(events: &[PipeEvent]) -> bool {
    events.iter().any(|e| matches!(e, PipeEvent::Error { .. }))
}
