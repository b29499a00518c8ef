//! Native half of `PipeBridge`: owns the manager, the command worker that
//! runs open/close off the caller's thread, and the event queue feeding the
//! Java listener.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use aoa_pipe::{EventSink, FdAccessory, PipeConfig, PipeEvent, PipeManager};
use jni::objects::GlobalRef;
use jni::JavaVM;
use log::{debug, info, warn, LevelFilter};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::listener;
use crate::BridgeError;

/// Configuration accepted by `nativeInit` as JSON
///
/// Pipe settings sit at the top level next to `log_level`:
/// `{"join_timeout_ms": 500, "log_level": "info"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    #[serde(flatten)]
    pub pipe: PipeConfig,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipe: PipeConfig::default(),
            log_level: "debug".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Parse the JSON passed from Kotlin; an empty string means defaults
    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json).map_err(|e| BridgeError::InvalidConfig(e.to_string()))
    }

    pub fn level_filter(&self) -> Result<LevelFilter, BridgeError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| BridgeError::InvalidConfig(format!("unknown log level {:?}", self.log_level)))
    }
}

/// Work queued for the pipe worker thread
pub enum Command {
    Open(FdAccessory),
    Close,
    Shutdown,
}

/// Feeds manager events into the listener queue without blocking the reader
pub struct ChannelSink(pub UnboundedSender<PipeEvent>);

impl EventSink for ChannelSink {
    fn on_data(&self, data: Vec<u8>) {
        let _ = self.0.send(PipeEvent::Data(data));
    }

    fn on_connected(&self) {
        let _ = self.0.send(PipeEvent::Connected);
    }

    fn on_error(&self, code: &str, message: &str) {
        let _ = self.0.send(PipeEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}

/// Listener slot and command queue shared by the JNI entry points
pub struct Controls {
    listener: Arc<Mutex<Option<GlobalRef>>>,
    commands: UnboundedSender<Command>,
}

impl Controls {
    pub fn new(commands: UnboundedSender<Command>) -> Self {
        Self {
            listener: Arc::new(Mutex::new(None)),
            commands,
        }
    }

    /// Slot read by the event dispatcher
    pub fn listener(&self) -> Arc<Mutex<Option<GlobalRef>>> {
        Arc::clone(&self.listener)
    }

    /// Install the single active listener. `None` detaches it and closes
    /// the pipe.
    pub fn set_listener(&self, listener: Option<GlobalRef>) {
        let detached = listener.is_none();
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
        if detached {
            debug!("Listener detached, closing pipe");
            self.submit(Command::Close);
        }
    }

    pub fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Pipe worker is gone; command dropped");
        }
    }
}

/// State behind the `jlong` handed to Kotlin
pub struct Bridge {
    manager: PipeManager,
    controls: Controls,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(vm: JavaVM, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.pipe.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = PipeManager::new(config.pipe, Arc::new(ChannelSink(event_tx)))?;
        let (commands, worker) = spawn_worker(manager.clone())?;
        let controls = Controls::new(commands);
        listener::spawn_dispatcher(vm, controls.listener(), event_rx)?;

        info!("Pipe bridge ready");
        Ok(Self {
            manager,
            controls,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn manager(&self) -> &PipeManager {
        &self.manager
    }

    pub fn set_listener(&self, listener: Option<GlobalRef>) {
        self.controls.set_listener(listener);
    }

    pub fn submit(&self, command: Command) {
        self.controls.submit(command);
    }

    /// Shut the manager down and wait for the worker to finish
    pub fn shutdown(&self) {
        self.submit(Command::Shutdown);
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Pipe worker panicked");
            }
        }
    }
}

pub fn spawn_worker(
    manager: PipeManager,
) -> Result<(UnboundedSender<Command>, JoinHandle<()>), BridgeError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = thread::Builder::new()
        .name("aoa-pipe-ops".to_string())
        .spawn(move || run_commands(manager, rx))
        .map_err(BridgeError::Thread)?;
    Ok((tx, worker))
}

/// Commands run in submission order, one at a time
fn run_commands(manager: PipeManager, mut commands: UnboundedReceiver<Command>) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            // Failures were already logged and sent to the listener
            Command::Open(accessory) => {
                if let Err(e) = manager.open(accessory) {
                    debug!("Open command finished with {}", e.code());
                }
            }
            Command::Close => manager.close(),
            Command::Shutdown => {
                manager.shutdown();
                break;
            }
        }
    }
    debug!("Pipe worker exiting");
}
