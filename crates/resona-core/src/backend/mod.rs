//! Backend abstraction
//!
//! A backend adapts one platform audio API to the device core. The API
//! side drives it single-threaded under the device's backend lock; the
//! backend schedules its own audio thread internally and must hold its
//! mixer lock around every mix invocation so the API can exclude the
//! callback with [`Backend::mixer_lock`].

pub mod cpal_backend;
pub mod loopback;
pub mod null;

use std::sync::{Arc, MutexGuard};

use crate::device::Device;
use crate::error::{RtError, RtResult};

/// What a backend is asked to do for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Playback,
    Capture,
    Loopback,
}

/// A platform backend driving one device
///
/// `reset` is allowed to renegotiate the device format: it reads the
/// requested fields from the device params and may satisfy or override
/// them. The device layer compares and warns about unsatisfied pins.
pub trait Backend: Send {
    /// Open the named endpoint (None = default)
    fn open(&mut self, name: Option<&str>) -> RtResult<()>;

    /// (Re)negotiate the device format; false fails the device update
    fn reset(&mut self) -> bool;

    /// Start the audio thread / stream
    fn start(&mut self) -> bool;

    /// Stop the audio thread; no mix callback runs after this returns
    fn stop(&mut self);

    /// Scoped mutual exclusion against the mix callback
    fn mixer_lock(&self) -> MutexGuard<'_, ()>;

    /// Frames currently readable from a capture backend
    fn available_samples(&mut self) -> usize {
        0
    }

    /// Read `frames` captured frames into `out` (device sample format)
    fn capture_samples(&mut self, _out: &mut [u8], _frames: usize) -> RtResult<()> {
        Err(RtError::InvalidDevice)
    }
}

/// A backend implementation's entry in the driver table
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-shot initialization; false removes the entry from selection
    fn init(&self) -> bool;

    fn supports(&self, kind: BackendKind) -> bool;

    /// Endpoint names for device enumeration
    fn probe(&self, kind: BackendKind) -> Vec<String>;

    /// Construct a backend bound to `device`
    fn create(&self, device: Arc<Device>, kind: BackendKind) -> Option<Box<dyn Backend>>;
}

/// Built-in driver table, in priority order
///
/// The user's `drivers` config directive reorders or trims this list;
/// the loopback factory is not listed because it is always available.
pub fn builtin_table() -> &'static [&'static dyn BackendFactory] {
    static TABLE: [&'static dyn BackendFactory; 2] =
        [&cpal_backend::CpalFactory, &null::NullFactory];
    &TABLE
}

/// The always-initialized loopback factory
pub fn loopback_factory() -> &'static dyn BackendFactory {
    &loopback::LoopbackFactory
}

/// Apply a `drivers` directive to the built-in table
///
/// Comma-separated names: a leading `-` removes the entry; named entries
/// are promoted to the front in first-mention order (later duplicates
/// are ignored); a trailing non-empty entry truncates the table to the
/// explicitly listed set, while a trailing comma keeps the remainder.
pub fn apply_driver_directive(
    directive: &str,
    table: &[&'static dyn BackendFactory],
) -> Vec<&'static dyn BackendFactory> {
    let mut list: Vec<&'static dyn BackendFactory> = table.to_vec();
    let mut promoted = 0usize;
    let mut endlist = false;

    for raw in directive.split(',') {
        let mut name = raw.trim();
        endlist = !name.is_empty();
        let remove = name.starts_with('-');
        if remove {
            name = name[1..].trim();
        }
        if name.is_empty() {
            continue;
        }

        if let Some(pos) = list[promoted..]
            .iter()
            .position(|f| f.name().eq_ignore_ascii_case(name))
            .map(|p| p + promoted)
        {
            if remove {
                list.remove(pos);
            } else {
                let entry = list.remove(pos);
                list.insert(promoted, entry);
                promoted += 1;
            }
        } else if list[..promoted]
            .iter()
            .all(|f| !f.name().eq_ignore_ascii_case(name))
        {
            log::warn!("Unknown driver \"{}\" in drivers directive", name);
        }
    }

    if endlist {
        list.truncate(promoted);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&'static dyn BackendFactory]) -> Vec<&'static str> {
        list.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn test_directive_promotes_named_entry() {
        let table = builtin_table();
        let list = apply_driver_directive("null,", table);
        assert_eq!(names(&list), vec!["null", "cpal"]);
    }

    #[test]
    fn test_directive_trailing_name_truncates() {
        let table = builtin_table();
        let list = apply_driver_directive("null", table);
        assert_eq!(names(&list), vec!["null"]);
    }

    #[test]
    fn test_directive_removes_prefixed_entry() {
        let table = builtin_table();
        let list = apply_driver_directive("-cpal,", table);
        assert_eq!(names(&list), vec!["null"]);
    }

    #[test]
    fn test_directive_duplicate_promotes_once() {
        let table = builtin_table();
        let list = apply_driver_directive("null,null,", table);
        assert_eq!(names(&list), vec!["null", "cpal"]);
    }

    #[test]
    fn test_empty_directive_keeps_table() {
        let table = builtin_table();
        let list = apply_driver_directive("", table);
        assert_eq!(names(&list), names(&table.to_vec()));
    }
}
