//! # Android JNI Rust Core Library
//!
//! This library provides the native backend for the audio360 visualizer's
//! USB accessory link. It handles:
//!
//! - Owning the accessory pipe (open / close / blocking reads)
//! - Running open/close off the UI thread, in call order
//! - Delivering received chunks to the app's listener
//!
//! ## JNI Bridge Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Android App (Kotlin)                       │
//! │                                                                 │
//! │  ┌─────────────────┐  fd   ┌─────────────────────────────────┐  │
//! │  │  MainActivity   │──────►│   PipeBridge (external funs)    │  │
//! │  │ (USB permission)│       └─────────────────────────────────┘  │
//! │  └─────────────────┘          │ JNI Calls          ▲ onData     │
//! │                               ▼                    │            │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │                    rust_core (this lib)                   │  │
//! │  │                                                           │  │
//! │  │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────┐   │  │
//! │  │  │ aoa-pipe-ops│─►│ PipeManager  │─►│   aoa-events    │   │  │
//! │  │  │  (commands) │  │ + aoa-reader │  │  (dispatcher)   │   │  │
//! │  │  └─────────────┘  └──────────────┘  └─────────────────┘   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## JNI Functions Exported
//!
//! - `Java_com_audio360_aoa_PipeBridge_nativeInit`: Create the bridge
//! - `Java_com_audio360_aoa_PipeBridge_nativeSetListener`: Attach/detach the listener
//! - `Java_com_audio360_aoa_PipeBridge_nativeOpen`: Open an accessory fd
//! - `Java_com_audio360_aoa_PipeBridge_nativeClose`: Close the pipe
//! - `Java_com_audio360_aoa_PipeBridge_nativeIsConnected`: Query the phase
//! - `Java_com_audio360_aoa_PipeBridge_nativeGetStats`: Stats as JSON
//! - `Java_com_audio360_aoa_PipeBridge_nativeShutdown`: Tear down and free

use std::sync::Once;

use aoa_pipe::{FdAccessory, PipeError};
use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jint, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, error, info, warn, LevelFilter};
use thiserror::Error;

pub mod bridge;
mod listener;

use bridge::{Bridge, BridgeConfig, Command};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Errors that can occur in the JNI bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),
    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),
    #[error("Failed to start thread: {0}")]
    Thread(std::io::Error),
}

fn init_logging(level: LevelFilter) {
    INIT_LOGGER.call_once(|| {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("AoaPipe"),
        );
    });
}

/// Borrow the bridge behind a handle returned by `nativeInit`
fn bridge<'a>(handle: jlong) -> Option<&'a Bridge> {
    if handle == 0 {
        warn!("PipeBridge called with a null handle");
        return None;
    }
    // SAFETY: non-zero handles come from Box::into_raw in nativeInit and
    // stay valid until nativeShutdown
    Some(unsafe { &*(handle as *const Bridge) })
}

fn create_bridge(env: &mut JNIEnv, config_json: &JString) -> Result<Bridge, BridgeError> {
    let json: String = if config_json.is_null() {
        String::new()
    } else {
        env.get_string(config_json)?.into()
    };
    let config = BridgeConfig::from_json(&json);
    let level = config
        .as_ref()
        .ok()
        .and_then(|c| c.level_filter().ok())
        .unwrap_or(LevelFilter::Debug);
    init_logging(level);

    let config = config?;
    config.level_filter()?;

    let vm = env.get_java_vm()?;
    Bridge::new(vm, config)
}

/// Create the native bridge
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeInit(configJson: String?): Long
/// ```
///
/// Returns: Opaque handle, or 0 on error
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeInit(
    mut env: JNIEnv,
    _class: JClass,
    config_json: JString,
) -> jlong {
    match create_bridge(&mut env, &config_json) {
        Ok(bridge) => {
            info!("Rust core library initialized");
            info!("Pipe version: {}", aoa_pipe::VERSION);
            Box::into_raw(Box::new(bridge)) as jlong
        }
        Err(e) => {
            error!("Failed to initialize pipe bridge: {}", e);
            0
        }
    }
}

/// Attach the event listener, or detach it by passing null
///
/// Detaching closes the pipe.
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeSetListener(handle: Long, listener: PipeListener?)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeSetListener(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    listener: JObject,
) {
    let Some(bridge) = bridge(handle) else {
        return;
    };

    if listener.is_null() {
        bridge.set_listener(None);
        return;
    }

    match env.new_global_ref(&listener) {
        Ok(global) => {
            debug!("Listener attached");
            bridge.set_listener(Some(global));
        }
        Err(e) => error!("Failed to pin listener: {:?}", e),
    }
}

/// Open the accessory behind `fd`
///
/// The fd must come from `ParcelFileDescriptor.detachFd()`; native code owns
/// it from here on. Pass -1 when `openAccessory` returned null so the
/// listener receives the error.
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeOpen(handle: Long, fd: Int)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeOpen(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    fd: jint,
) {
    // SAFETY: the app detached the fd and hands its ownership over
    let accessory = unsafe { FdAccessory::from_raw_fd(fd) };
    let Some(bridge) = bridge(handle) else {
        return;
    };
    debug!("Queueing open for fd {}", fd);
    bridge.submit(Command::Open(accessory));
}

/// Close the accessory pipe
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeClose(handle: Long)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeClose(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(bridge) = bridge(handle) {
        debug!("Queueing close");
        bridge.submit(Command::Close);
    }
}

/// Check if the pipe is connected
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeIsConnected(handle: Long): Boolean
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeIsConnected(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    match bridge(handle) {
        Some(bridge) if bridge.manager().is_connected() => JNI_TRUE,
        _ => JNI_FALSE,
    }
}

/// Get pipe statistics as JSON
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeGetStats(handle: Long): String
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeGetStats(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let Some(bridge) = bridge(handle) else {
        return std::ptr::null_mut();
    };

    let manager = bridge.manager();
    let stats_json = serde_json::json!({
        "phase": manager.phase(),
        "reading": manager.is_reading(),
        "stats": manager.stats(),
    })
    .to_string();

    match env.new_string(&stats_json) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create stats string: {:?}", e);
            std::ptr::null_mut()
        }
    }
}

/// Shut the pipe down and free the bridge
///
/// The handle is invalid afterwards.
///
/// Called from Kotlin:
/// ```kotlin
/// external fun nativeShutdown(handle: Long)
/// ```
#[no_mangle]
pub extern "system" fn Java_com_audio360_aoa_PipeBridge_nativeShutdown(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    // SAFETY: handle came from Box::into_raw in nativeInit; Kotlin calls
    // shutdown once and drops its copy
    let bridge = unsafe { Box::from_raw(handle as *mut Bridge) };
    bridge.shutdown();
    drop(bridge);
    info!("Pipe bridge shut down");
}
