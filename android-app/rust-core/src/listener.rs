//! Delivers pipe events to the Java listener.
//!
//! One thread, permanently attached to the JVM, drains the event queue so
//! the reader thread never waits on Java. Events are delivered in queue
//! order; the listener posts them to the UI thread itself.
//!
//! Listener contract (Kotlin):
//!
//! ```kotlin
//! interface PipeListener {
//!     fun onConnected()
//!     fun onData(data: ByteArray)
//!     fun onError(code: String, message: String)
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use aoa_pipe::PipeEvent;
use jni::objects::{GlobalRef, JObject, JValue};
use jni::JNIEnv;
use jni::JavaVM;
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::BridgeError;

pub fn spawn_dispatcher(
    vm: JavaVM,
    listener: Arc<Mutex<Option<GlobalRef>>>,
    events: UnboundedReceiver<PipeEvent>,
) -> Result<(), BridgeError> {
    thread::Builder::new()
        .name("aoa-events".to_string())
        .spawn(move || dispatch(vm, listener, events))
        .map_err(BridgeError::Thread)?;
    Ok(())
}

fn dispatch(
    vm: JavaVM,
    listener: Arc<Mutex<Option<GlobalRef>>>,
    mut events: UnboundedReceiver<PipeEvent>,
) {
    let mut env = match vm.attach_current_thread_permanently() {
        Ok(env) => env,
        Err(e) => {
            error!("Event dispatcher could not attach to the JVM: {:?}", e);
            return;
        }
    };

    while let Some(event) = events.blocking_recv() {
        let target = listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(target) = target else {
            debug!("No listener attached, dropping {}", describe(&event));
            continue;
        };

        if let Err(e) = deliver(&mut env, target.as_obj(), event) {
            warn!("Listener call failed: {:?}", e);
            if env.exception_check().unwrap_or(false) {
                let _ = env.exception_describe();
                let _ = env.exception_clear();
            }
        }
    }

    debug!("Event dispatcher exiting");
}

fn deliver(env: &mut JNIEnv, target: &JObject, event: PipeEvent) -> jni::errors::Result<()> {
    // Local refs are freed per event; this thread never returns to Java
    env.with_local_frame(4, |env| -> jni::errors::Result<()> {
        match event {
            PipeEvent::Connected => {
                env.call_method(target, "onConnected", "()V", &[])?;
            }
            PipeEvent::Data(data) => {
                let array = env.byte_array_from_slice(&data)?;
                env.call_method(target, "onData", "([B)V", &[JValue::Object(&array)])?;
            }
            PipeEvent::Error { code, message } => {
                let code = env.new_string(code)?;
                let message = env.new_string(message)?;
                env.call_method(
                    target,
                    "onError",
                    "(Ljava/lang/String;Ljava/lang/String;)V",
                    &[JValue::Object(&code), JValue::Object(&message)],
                )?;
            }
        }
        Ok(())
    })
}

fn describe(event: &PipeEvent) -> String {
    match event {
        PipeEvent::Connected => "connected event".to_string(),
        PipeEvent::Data(data) => format!("{} bytes", data.len()),
        PipeEvent::Error { code, .. } => format!("error {code}"),
    }
}
