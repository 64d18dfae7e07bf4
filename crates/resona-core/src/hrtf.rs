//! HRTF enumeration and selection
//!
//! The convolution data and file parsing live outside this crate; the
//! device core only needs to enumerate the available sets, load one by
//! index, and force the output format to the set's native layout. The
//! built-in table covers the two rates the renderer ships filters for.

use std::sync::Arc;

/// One entry in a device's enumerated HRTF list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrtfEntry {
    pub name: String,
    pub sample_rate: u32,
}

/// A loaded HRTF set
///
/// Playback devices using one are forced to stereo output at the set's
/// native sample rate.
#[derive(Debug)]
pub struct Hrtf {
    pub name: String,
    pub sample_rate: u32,
}

/// HRTF state reported through device queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HrtfStatus {
    #[default]
    Disabled,
    Enabled,
    /// Requested but no set could be loaded for the device format
    UnsupportedFormat,
}

/// Enumerate the HRTF sets available to a device
///
/// Per-device data paths are resolved by the renderer; the core always
/// offers the built-in sets so selection and format forcing stay
/// exercisable without data files on disk.
pub fn enumerate(device_name: Option<&str>) -> Vec<HrtfEntry> {
    let _ = device_name;
    vec![
        HrtfEntry {
            name: "Built-In 44100hz".to_string(),
            sample_rate: 44100,
        },
        HrtfEntry {
            name: "Built-In 48000hz".to_string(),
            sample_rate: 48000,
        },
    ]
}

/// Load the set behind an enumerated entry
pub fn load(entry: &HrtfEntry) -> Option<Arc<Hrtf>> {
    Some(Arc::new(Hrtf {
        name: entry.name.clone(),
        sample_rate: entry.sample_rate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sets_enumerate() {
        let list = enumerate(None);
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|e| e.sample_rate == 44100));
        assert!(list.iter().any(|e| e.sample_rate == 48000));
    }

    #[test]
    fn test_load_preserves_native_rate() {
        let list = enumerate(Some("whatever"));
        let hrtf = load(&list[1]).unwrap();
        assert_eq!(hrtf.sample_rate, list[1].sample_rate);
    }
}
