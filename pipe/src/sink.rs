//! Consumer side of the pipe: data chunks and lifecycle notifications.

use std::sync::mpsc;

/// Receives everything the pipe produces
///
/// `on_data` is called on the reader thread for every chunk, in read order.
/// Implementations must hand the chunk off without blocking: a slow sink
/// stalls the reader and the accessory's kernel buffer overflows.
///
/// `on_connected` and `on_error` run inside `open` while it holds the
/// operation lock; they must not call back into the manager synchronously.
/// `on_data` may call `close()`, which then only closes the reader's own
/// connection.
pub trait EventSink: Send + Sync {
    /// A chunk of exactly the bytes that were read
    fn on_data(&self, data: Vec<u8>);

    /// The stream was opened; data may follow
    fn on_connected(&self);

    /// Opening failed; `code` is a stable `PipeError::code`
    fn on_error(&self, code: &str, message: &str);
}

/// Owned form of a sink callback, for channel-backed sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    Connected,
    Data(Vec<u8>),
    Error { code: String, message: String },
}

impl PipeEvent {
    /// Replay this event into another sink
    pub fn dispatch(self, sink: &dyn EventSink) {
        match self {
            PipeEvent::Connected => sink.on_connected(),
            PipeEvent::Data(data) => sink.on_data(data),
            PipeEvent::Error { code, message } => sink.on_error(&code, &message),
        }
    }
}

/// Forwards every event into a channel; sends never block.
/// A dropped receiver silently discards events.
impl EventSink for mpsc::Sender<PipeEvent> {
    fn on_data(&self, data: Vec<u8>) {
        let _ = self.send(PipeEvent::Data(data));
    }

    fn on_connected(&self) {
        let _ = self.send(PipeEvent::Connected);
    }

    fn on_error(&self, code: &str, message: &str) {
        let _ = self.send(PipeEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}
