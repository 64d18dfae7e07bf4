//! Process-wide registry
//!
//! Owns the global device list, the process-wide and thread-local
//! current-context slots, the null-device error latch, and the one-shot
//! runtime initialization that reads config and selects the playback and
//! capture backend factories.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::backend::{self, BackendFactory, BackendKind};
use crate::config::Config;
use crate::context::Context;
use crate::device::Device;
use crate::effect::EffectParams;
use crate::error::{ErrorLatch, RtError};

/// Global device list; locking it is the structural "list lock" that
/// serializes enumeration, open/close sequencing, and verification
static DEVICE_LIST: Mutex<Vec<Arc<Device>>> = Mutex::new(Vec::new());

/// Process-wide current context
static GLOBAL_CONTEXT: Mutex<Option<Arc<Context>>> = Mutex::new(None);

thread_local! {
    /// Thread-local current context; overrides the global one.
    /// Dropping the slot at thread exit releases its reference.
    static LOCAL_CONTEXT: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
}

/// Error latch for operations with no device target
static NULL_DEVICE_ERROR: ErrorLatch = ErrorLatch::new();

/// One-shot runtime state
struct Runtime {
    config: Config,
    playback: Option<&'static dyn BackendFactory>,
    capture: Option<&'static dyn BackendFactory>,
    trap_error: bool,
    suspend_defers: bool,
    default_reverb: Option<EffectParams>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// One-shot process initialization
///
/// Reads configuration, applies the `drivers` directive to the built-in
/// backend table, and selects the first initializable factory for
/// playback and for capture. The loopback factory is always initialized.
pub fn init() {
    RUNTIME.get_or_init(|| {
        let config = Config::load();

        let table = backend::builtin_table();
        log::info!(
            "Supported backends: {}",
            table
                .iter()
                .map(|f| f.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let ordered = match config.drivers.as_deref() {
            Some(directive) => backend::apply_driver_directive(directive, table),
            None => table.to_vec(),
        };

        let mut playback: Option<&'static dyn BackendFactory> = None;
        let mut capture: Option<&'static dyn BackendFactory> = None;
        for factory in ordered {
            if playback.is_some() && capture.is_some() {
                break;
            }
            if !factory.init() {
                log::warn!("Failed to initialize backend \"{}\"", factory.name());
                continue;
            }
            log::info!("Initialized backend \"{}\"", factory.name());
            if playback.is_none() && factory.supports(BackendKind::Playback) {
                playback = Some(factory);
                log::info!("Added \"{}\" for playback", factory.name());
            }
            if capture.is_none() && factory.supports(BackendKind::Capture) {
                capture = Some(factory);
                log::info!("Added \"{}\" for capture", factory.name());
            }
        }
        backend::loopback_factory().init();

        if playback.is_none() {
            log::warn!("No playback backend available!");
        }
        if capture.is_none() {
            log::warn!("No capture backend available!");
        }

        let trap_error = config.trap_error.unwrap_or(false);
        let suspend_defers = config.suspend_defers();
        let default_reverb = config
            .default_reverb
            .as_deref()
            .and_then(|name| match EffectParams::reverb_preset(name) {
                Some(preset) => Some(preset),
                None => {
                    log::warn!("Unknown default-reverb preset: {}", name);
                    None
                }
            });

        Runtime {
            config,
            playback,
            capture,
            trap_error,
            suspend_defers,
            default_reverb,
        }
    });
}

fn runtime() -> &'static Runtime {
    init();
    RUNTIME.get().expect("runtime initialized")
}

pub fn config() -> &'static Config {
    &runtime().config
}

pub(crate) fn playback_factory() -> Option<&'static dyn BackendFactory> {
    runtime().playback
}

pub(crate) fn capture_factory() -> Option<&'static dyn BackendFactory> {
    runtime().capture
}

pub(crate) fn loopback_factory() -> &'static dyn BackendFactory {
    backend::loopback_factory()
}

pub(crate) fn suspend_defers() -> bool {
    runtime().suspend_defers
}

pub(crate) fn default_reverb() -> Option<EffectParams> {
    runtime().default_reverb.clone()
}

/// Endpoint names the selected playback backend can open
pub fn probe_playback_names() -> Vec<String> {
    playback_factory()
        .map(|f| f.probe(BackendKind::Playback))
        .unwrap_or_default()
}

/// Endpoint names the selected capture backend can open
pub fn probe_capture_names() -> Vec<String> {
    capture_factory()
        .map(|f| f.probe(BackendKind::Capture))
        .unwrap_or_default()
}

// ── Device list ──────────────────────────────────────────────────────

/// Take the structural list lock
pub(crate) fn list_lock() -> MutexGuard<'static, Vec<Arc<Device>>> {
    DEVICE_LIST.lock().unwrap()
}

pub(crate) fn insert_device(device: &Arc<Device>) {
    DEVICE_LIST.lock().unwrap().push(Arc::clone(device));
}

/// Validate a caller-supplied device handle against the live list
///
/// The sole mechanism by which opaque handles are validated; returns a
/// fresh counted reference on success.
pub fn verify_device(device: &Arc<Device>) -> Option<Arc<Device>> {
    let list = DEVICE_LIST.lock().unwrap();
    verify_device_in(&list, device)
}

/// Verification against an already-held list guard
pub(crate) fn verify_device_in(list: &[Arc<Device>], device: &Arc<Device>) -> Option<Arc<Device>> {
    list.iter().find(|d| Arc::ptr_eq(d, device)).cloned()
}

/// Validate a context handle by walking every device's context list
pub fn verify_context(context: &Arc<Context>) -> Option<Arc<Context>> {
    let list = DEVICE_LIST.lock().unwrap();
    verify_context_in(&list, context)
}

pub(crate) fn verify_context_in(
    list: &[Arc<Device>],
    context: &Arc<Context>,
) -> Option<Arc<Context>> {
    for device in list {
        let contexts = device.contexts.read().unwrap();
        if let Some(found) = contexts.iter().find(|c| Arc::ptr_eq(c, context)) {
            return Some(Arc::clone(found));
        }
    }
    None
}

/// Snapshot of the live device list (enumeration)
pub fn devices() -> Vec<Arc<Device>> {
    DEVICE_LIST.lock().unwrap().clone()
}

// ── Current context ──────────────────────────────────────────────────

/// Make a context the process-wide current one (None clears it)
///
/// Also clears the calling thread's thread-local slot, matching the
/// classic make-current semantics.
pub fn make_current(context: Option<&Arc<Context>>) -> Result<(), RtError> {
    let verified = match context {
        Some(ctx) => match verify_context(ctx) {
            Some(ctx) => Some(ctx),
            None => return Err(latch_error(None, RtError::InvalidContext)),
        },
        None => None,
    };
    *GLOBAL_CONTEXT.lock().unwrap() = verified;
    LOCAL_CONTEXT.with(|slot| slot.borrow_mut().take());
    Ok(())
}

/// Set the calling thread's current context (None clears it)
pub fn set_thread_context(context: Option<&Arc<Context>>) -> Result<(), RtError> {
    let verified = match context {
        Some(ctx) => match verify_context(ctx) {
            Some(ctx) => Some(ctx),
            None => return Err(latch_error(None, RtError::InvalidContext)),
        },
        None => None,
    };
    LOCAL_CONTEXT.with(|slot| *slot.borrow_mut() = verified);
    Ok(())
}

/// The effective current context: thread-local wins over global
pub fn current_context() -> Option<Arc<Context>> {
    let local = LOCAL_CONTEXT.with(|slot| slot.borrow().clone());
    if local.is_some() {
        return local;
    }
    GLOBAL_CONTEXT.lock().unwrap().clone()
}

/// The calling thread's current context only
pub fn thread_context() -> Option<Arc<Context>> {
    LOCAL_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Drop any current-context references to a dying context
pub(crate) fn clear_current_if(context: &Arc<Context>) {
    let mut global = GLOBAL_CONTEXT.lock().unwrap();
    if global
        .as_ref()
        .map(|c| Arc::ptr_eq(c, context))
        .unwrap_or(false)
    {
        *global = None;
    }
    drop(global);
    LOCAL_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let matches = slot
            .as_ref()
            .map(|c| Arc::ptr_eq(c, context))
            .unwrap_or(false);
        if matches {
            log::warn!("Context released while current on thread");
            *slot = None;
        }
    });
}

// ── Error latching ───────────────────────────────────────────────────

/// Latch an error on a device (or the process-wide null-device slot)
///
/// Returns the error for `?`-style chaining. With trap-error enabled the
/// process aborts instead of latching, leaving a debuggable core.
pub fn latch_error(device: Option<&Device>, err: RtError) -> RtError {
    match device {
        Some(device) => {
            log::warn!("Error on device \"{}\": {}", device.name(), err);
            device.error.set(err);
        }
        None => {
            log::warn!("Error with no device: {}", err);
            NULL_DEVICE_ERROR.set(err);
        }
    }
    if runtime().trap_error {
        log::error!("Trapping on error: {}", err);
        std::process::abort();
    }
    err
}

/// Return and clear the null-device error latch
pub fn take_null_device_error() -> Option<RtError> {
    NULL_DEVICE_ERROR.take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_device_error_latch() {
        take_null_device_error();
        latch_error(None, RtError::InvalidValue);
        assert_eq!(take_null_device_error(), Some(RtError::InvalidValue));
        assert_eq!(take_null_device_error(), None);
    }

    #[test]
    fn test_current_context_empty_by_default() {
        // No context has been made current in this fresh thread.
        assert!(thread_context().is_none());
    }
}
