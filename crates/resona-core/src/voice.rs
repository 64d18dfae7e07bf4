//! Mixer voices
//!
//! A voice is the mixer-side playback unit: it references a source by id
//! (0 = free), walks a queue of buffer references, and carries per-send
//! gain state sized to the device's send count. The pool is a flat
//! allocation; reallocation (send-count or voice-count change) happens
//! with the backend stopped and preserves in-flight playback state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use basedrop::Shared;

use crate::props::PropsCell;
use crate::slot::EffectSlot;

/// A queue entry snapshot handed to the mixer
///
/// Holds its own shared payload reference so the application deleting
/// the buffer cannot invalidate in-flight playback.
#[derive(Clone)]
pub struct VoiceBufferRef {
    pub data: Shared<Vec<f32>>,
    pub channels: usize,
    pub frames: usize,
    pub frequency: u32,
    /// Handle of the originating buffer, for completion events
    pub buffer_id: u32,
}

/// Per-send parameters published to a voice
#[derive(Clone)]
pub struct VoiceSend {
    pub slot: Option<Arc<EffectSlot>>,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
}

impl Default for VoiceSend {
    fn default() -> Self {
        VoiceSend {
            slot: None,
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

/// One-pole filter pair shaping a send's wet contribution
///
/// Splits the signal at the low and high reference frequencies so the
/// published `gain_lf`/`gain_hf` attenuations apply to their bands.
/// Mixer-owned scratch; survives parameter updates, reset on pool
/// reallocation.
#[derive(Clone, Copy, Default)]
pub struct SendFilter {
    pub low: f32,
    pub high: f32,
}

/// Snapshot published from a source to its assigned voice
pub struct VoiceUpdate {
    pub gain: f32,
    pub step: f32,
    pub looping: bool,
    pub sends: Vec<VoiceSend>,
    pub queue: Vec<VoiceBufferRef>,
}

impl Default for VoiceUpdate {
    fn default() -> Self {
        VoiceUpdate {
            gain: 1.0,
            step: 1.0,
            looping: false,
            sends: Vec::new(),
            queue: Vec::new(),
        }
    }
}

/// Mixer-owned playback state
pub struct VoiceMixState {
    pub gain: f32,
    pub step: f32,
    pub looping: bool,
    pub queue: Vec<VoiceBufferRef>,
    pub queue_index: usize,
    /// Fractional frame position carried across blocks
    pub frac: f64,
    pub sends: Vec<VoiceSend>,
    pub send_filters: Vec<SendFilter>,
    /// Near-field compensation coefficient, reset on device update
    pub nfc_w1: f32,
}

impl VoiceMixState {
    fn new(num_sends: usize) -> Self {
        VoiceMixState {
            gain: 1.0,
            step: 1.0,
            looping: false,
            queue: Vec::new(),
            queue_index: 0,
            frac: 0.0,
            sends: vec![VoiceSend::default(); num_sends],
            send_filters: vec![SendFilter::default(); num_sends],
            nfc_w1: 0.0,
        }
    }
}

/// One mixer voice
pub struct Voice {
    /// Id of the source driving this voice; 0 marks the voice free
    pub source_id: AtomicU32,
    pub playing: AtomicBool,
    /// Frame cursor within the current queue entry
    pub position: AtomicU64,
    pub props: PropsCell<VoiceUpdate>,
    pub mix: Mutex<VoiceMixState>,
}

impl Voice {
    fn new(num_sends: usize) -> Self {
        Voice {
            source_id: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            position: AtomicU64::new(0),
            props: PropsCell::new(),
            mix: Mutex::new(VoiceMixState::new(num_sends)),
        }
    }

    pub fn is_free(&self) -> bool {
        self.source_id.load(Ordering::Acquire) == 0
    }

    /// Release the voice back to the pool
    pub fn clear(&self) {
        self.playing.store(false, Ordering::Release);
        self.position.store(0, Ordering::Release);
        self.source_id.store(0, Ordering::Release);
    }

    /// Apply a pending parameter update (mixer thread)
    ///
    /// Vectors are swapped rather than cloned so the displaced buffer
    /// and slot references travel back to the API thread inside the
    /// recycled node.
    pub fn apply_update(&self) {
        let Ok(mut mix) = self.mix.try_lock() else {
            return;
        };
        self.props.consume(|update| {
            mix.gain = update.gain;
            mix.step = update.step;
            mix.looping = update.looping;
            std::mem::swap(&mut mix.sends, &mut update.sends);
            std::mem::swap(&mut mix.queue, &mut update.queue);
            let sends_len = mix.sends.len();
            if mix.send_filters.len() != sends_len {
                mix.send_filters.resize_with(sends_len, SendFilter::default);
            }
            if mix.queue_index > mix.queue.len() {
                mix.queue_index = 0;
            }
        });
    }
}

/// Flat pool of voices owned by a context
pub struct VoicePool {
    pub voices: Vec<Voice>,
    /// High-water mark of voices handed out so far
    pub count: usize,
    pub num_sends: usize,
}

impl VoicePool {
    pub fn new() -> Self {
        VoicePool {
            voices: Vec::new(),
            count: 0,
            num_sends: 0,
        }
    }

    /// Find the voice assigned to a source
    pub fn voice_for_source(&self, source_id: u32) -> Option<&Voice> {
        if source_id == 0 {
            return None;
        }
        self.voices[..self.count]
            .iter()
            .find(|v| v.source_id.load(Ordering::Acquire) == source_id)
    }

    /// Claim a free voice for a source, extending the active range
    pub fn claim(&mut self, source_id: u32) -> Option<&Voice> {
        let idx = self.voices[..self.count]
            .iter()
            .position(|v| v.is_free())
            .or_else(|| (self.count < self.voices.len()).then(|| self.count));
        let idx = idx?;
        self.count = self.count.max(idx + 1);

        let voice = &self.voices[idx];
        voice.position.store(0, Ordering::Release);
        voice.playing.store(false, Ordering::Release);
        voice.source_id.store(source_id, Ordering::Release);
        Some(voice)
    }

    /// Resize the pool and/or the per-voice send arrays
    ///
    /// Must only be called with the backend stopped: atomics are moved
    /// with relaxed ordering and the mix mutexes are taken uncontended.
    /// Pending per-voice updates are dropped; the caller republishes
    /// every live source afterwards.
    pub fn reallocate(&mut self, num_voices: usize, num_sends: usize) {
        if num_voices == self.voices.len() && num_sends == self.num_sends {
            return;
        }

        let mut voices = Vec::with_capacity(num_voices);
        let carry = self.count.min(num_voices);
        for old in self.voices.drain(..).take(carry) {
            let voice = Voice::new(num_sends);
            voice.source_id.store(
                old.source_id.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            voice
                .playing
                .store(old.playing.load(Ordering::Relaxed), Ordering::Relaxed);
            voice
                .position
                .store(old.position.load(Ordering::Relaxed), Ordering::Relaxed);

            {
                let mut old_mix = old.mix.lock().unwrap();
                let mut mix = voice.mix.lock().unwrap();
                mix.gain = old_mix.gain;
                mix.step = old_mix.step;
                mix.looping = old_mix.looping;
                mix.queue = std::mem::take(&mut old_mix.queue);
                mix.queue_index = old_mix.queue_index;
                mix.frac = old_mix.frac;
                // Keep surviving sends, identity-init the new tail. The
                // band-split scratch restarts from silence.
                let keep = old_mix.sends.len().min(num_sends);
                let mut sends: Vec<VoiceSend> = old_mix.sends.drain(..keep).collect();
                sends.resize_with(num_sends, VoiceSend::default);
                mix.sends = sends;
                mix.send_filters = vec![SendFilter::default(); num_sends];
            }
            voices.push(voice);
        }
        voices.resize_with(num_voices, || Voice::new(num_sends));

        self.voices = voices;
        self.count = carry;
        self.num_sends = num_sends;
    }
}

impl Default for VoicePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_clear() {
        let mut pool = VoicePool::new();
        pool.reallocate(4, 2);

        let voice = pool.claim(7).unwrap();
        assert_eq!(voice.source_id.load(Ordering::Acquire), 7);
        assert_eq!(pool.count, 1);

        pool.voice_for_source(7).unwrap().clear();
        assert!(pool.voices[0].is_free());

        // The freed voice is reused before the pool grows.
        pool.claim(8).unwrap();
        assert_eq!(pool.count, 1);
    }

    #[test]
    fn test_reallocate_preserves_playback_state() {
        let mut pool = VoicePool::new();
        pool.reallocate(8, 2);

        let voice = pool.claim(3).unwrap();
        voice.playing.store(true, Ordering::Release);
        voice.position.store(12345, Ordering::Release);
        {
            let mut mix = voice.mix.lock().unwrap();
            mix.gain = 0.5;
            mix.sends[1].gain = 0.25;
        }

        pool.reallocate(8, 1);

        let voice = pool.voice_for_source(3).unwrap();
        assert!(voice.playing.load(Ordering::Acquire));
        assert_eq!(voice.position.load(Ordering::Acquire), 12345);
        let mix = voice.mix.lock().unwrap();
        assert_eq!(mix.sends.len(), 1);
        assert!((mix.gain - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reallocate_grows_sends_with_identity() {
        let mut pool = VoicePool::new();
        pool.reallocate(2, 1);
        pool.claim(1);

        pool.reallocate(2, 3);
        let mix = pool.voices[0].mix.lock().unwrap();
        assert_eq!(mix.sends.len(), 3);
        assert!(mix.sends[2].slot.is_none());
        assert!((mix.sends[2].gain - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_voice_count_clamped_on_shrink() {
        let mut pool = VoicePool::new();
        pool.reallocate(4, 0);
        for id in 1..=4 {
            pool.claim(id);
        }
        assert_eq!(pool.count, 4);

        pool.reallocate(2, 0);
        assert_eq!(pool.count, 2);
        assert_eq!(pool.voices.len(), 2);
    }

    #[test]
    fn test_update_swaps_queue_into_mix_state() {
        let mut pool = VoicePool::new();
        pool.reallocate(1, 0);
        let voice = pool.claim(9).unwrap();

        voice.props.publish(|u| {
            u.gain = 0.75;
            u.step = 2.0;
        });
        voice.apply_update();

        let mix = voice.mix.lock().unwrap();
        assert!((mix.gain - 0.75).abs() < f32::EPSILON);
        assert!((mix.step - 2.0).abs() < f32::EPSILON);
    }
}
