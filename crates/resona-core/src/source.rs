//! Sources
//!
//! A source is a playback cursor plus parameter set living in a context
//! sub-pool. It owns either a single static buffer reference or a queue
//! of buffer references, and one auxiliary send per device send slot.
//! Mutations clear the clean flag; the publish sweep snapshots dirty
//! sources into their assigned voice's update cell.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::slot::EffectSlot;
use crate::voice::VoiceSend;

/// Source playback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// One auxiliary send of a source
#[derive(Clone, Default)]
pub struct SourceSend {
    pub slot: Option<Arc<EffectSlot>>,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
}

impl SourceSend {
    fn identity() -> Self {
        SourceSend {
            slot: None,
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

/// One source slab entry
pub struct Source {
    pub state: SourceState,
    pub gain: f32,
    pub pitch: f32,
    pub looping: bool,
    pub relative: bool,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    /// Static buffer handle, exclusive with a non-empty queue
    pub static_buffer: Option<u32>,
    /// Streaming queue of buffer handles
    pub queue: VecDeque<u32>,
    pub sends: Vec<SourceSend>,
    /// Voice assigned while playing/paused
    pub voice_source_id: u32,
    props_clean: AtomicBool,
}

impl Source {
    pub fn new(num_sends: usize) -> Self {
        Source {
            state: SourceState::Initial,
            gain: 1.0,
            pitch: 1.0,
            looping: false,
            relative: false,
            position: [0.0; 3],
            velocity: [0.0; 3],
            static_buffer: None,
            queue: VecDeque::new(),
            sends: vec![SourceSend::identity(); num_sends],
            voice_source_id: 0,
            props_clean: AtomicBool::new(true),
        }
    }

    pub fn mark_dirty(&self) {
        self.props_clean.store(false, Ordering::Release);
    }

    /// Test-and-set gate used by the publish sweep
    pub fn try_set_clean(&self) -> bool {
        !self.props_clean.swap(true, Ordering::AcqRel)
    }

    /// Resize the send array for a new device send count
    ///
    /// Sends beyond the new count release their slot references; new
    /// sends start at identity gains.
    pub fn resize_sends(&mut self, num_sends: usize) {
        for send in self.sends.drain(num_sends.min(self.sends.len())..) {
            if let Some(slot) = send.slot {
                slot.release_ref();
            }
        }
        self.sends.resize_with(num_sends, SourceSend::identity);
        self.mark_dirty();
    }

    /// Point a send at an effect slot (or clear it), managing refcounts
    pub fn set_send(&mut self, index: usize, slot: Option<Arc<EffectSlot>>) -> bool {
        let Some(send) = self.sends.get_mut(index) else {
            return false;
        };
        if let Some(new_slot) = &slot {
            new_slot.add_ref();
        }
        if let Some(old) = send.slot.take() {
            old.release_ref();
        }
        send.slot = slot;
        self.mark_dirty();
        true
    }

    /// Set a send's wet-path gain and band attenuations
    pub fn set_send_gains(&mut self, index: usize, gain: f32, gain_hf: f32, gain_lf: f32) -> bool {
        let Some(send) = self.sends.get_mut(index) else {
            return false;
        };
        send.gain = gain;
        send.gain_hf = gain_hf;
        send.gain_lf = gain_lf;
        self.mark_dirty();
        true
    }

    /// Snapshot the send parameters for voice publication
    pub fn voice_sends(&self) -> Vec<VoiceSend> {
        self.sends
            .iter()
            .map(|s| VoiceSend {
                slot: s.slot.clone(),
                gain: s.gain,
                gain_hf: s.gain_hf,
                gain_lf: s.gain_lf,
            })
            .collect()
    }

    /// Buffer handles this source currently references, queue order
    pub fn referenced_buffers(&self) -> Vec<u32> {
        if let Some(id) = self.static_buffer {
            vec![id]
        } else {
            self.queue.iter().copied().collect()
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        for send in &mut self.sends {
            if let Some(slot) = send.slot.take() {
                slot.release_ref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_source_defaults() {
        let source = Source::new(2);
        assert_eq!(source.state, SourceState::Initial);
        assert_eq!(source.sends.len(), 2);
        assert!((source.gain - 1.0).abs() < f32::EPSILON);
        assert!(!source.try_set_clean());
    }

    #[test]
    fn test_dirty_flag_gate() {
        let source = Source::new(0);
        source.mark_dirty();
        assert!(source.try_set_clean());
        assert!(!source.try_set_clean());
    }

    #[test]
    fn test_send_assignment_tracks_slot_refs() {
        let slot = Arc::new(EffectSlot::new());
        let mut source = Source::new(2);

        assert!(source.set_send(1, Some(Arc::clone(&slot))));
        assert_eq!(slot.refs(), 1);

        // Replacing the same send releases the old reference.
        assert!(source.set_send(1, Some(Arc::clone(&slot))));
        assert_eq!(slot.refs(), 1);

        assert!(source.set_send(1, None));
        assert_eq!(slot.refs(), 0);

        assert!(!source.set_send(5, None));
    }

    #[test]
    fn test_send_gains_survive_snapshot() {
        let slot = Arc::new(EffectSlot::new());
        let mut source = Source::new(2);
        source.set_send(0, Some(Arc::clone(&slot)));

        assert!(source.set_send_gains(0, 0.5, 0.25, 0.75));
        assert!(!source.set_send_gains(3, 1.0, 1.0, 1.0));

        let sends = source.voice_sends();
        assert!((sends[0].gain - 0.5).abs() < f32::EPSILON);
        assert!((sends[0].gain_hf - 0.25).abs() < f32::EPSILON);
        assert!((sends[0].gain_lf - 0.75).abs() < f32::EPSILON);
        // Untouched sends stay at identity.
        assert!((sends[1].gain - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_resize_sends_releases_dropped_slots() {
        let slot = Arc::new(EffectSlot::new());
        let mut source = Source::new(2);
        source.set_send(1, Some(Arc::clone(&slot)));

        source.resize_sends(1);
        assert_eq!(source.sends.len(), 1);
        assert_eq!(slot.refs(), 0);

        source.resize_sends(3);
        assert_eq!(source.sends.len(), 3);
        assert!((source.sends[2].gain - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_drop_releases_slot_refs() {
        let slot = Arc::new(EffectSlot::new());
        {
            let mut source = Source::new(1);
            source.set_send(0, Some(Arc::clone(&slot)));
            assert_eq!(slot.refs(), 1);
        }
        assert_eq!(slot.refs(), 0);
    }
}
