//! Auxiliary effect slots
//!
//! A slot is a bus running one DSP effect. The API thread owns the
//! slot's user-visible configuration; the running `EffectState` is owned
//! by the mixer and only ever replaced through the slot's publication
//! cell. Replaced states ride the recycled update node back to the API
//! thread so their teardown never happens inside the audio callback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::effect::{create_state, EffectParams, EffectState};
use crate::props::PropsCell;

/// User-visible slot configuration
#[derive(Debug, Clone)]
pub struct SlotParams {
    pub gain: f32,
    /// Whether source send gains are scaled by distance automatically
    pub aux_send_auto: bool,
    pub effect: EffectParams,
}

impl Default for SlotParams {
    fn default() -> Self {
        SlotParams {
            gain: 1.0,
            aux_send_auto: true,
            effect: EffectParams::Null,
        }
    }
}

/// Snapshot published to the mixer
///
/// `new_state` carries a freshly constructed DSP instance when the
/// effect type changed; the mixer swaps its running state for it and
/// leaves the old one in the node for the API side to drop.
#[derive(Default)]
pub struct SlotUpdate {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub effect: EffectParams,
    pub new_state: Option<Box<dyn EffectState>>,
}

/// Mixer-owned running state
pub struct SlotMixState {
    pub state: Box<dyn EffectState>,
    pub gain: f32,
    pub aux_send_auto: bool,
    pub effect: EffectParams,
    /// Wet accumulation buffer, sized to the device update size
    pub wet_buffer: Vec<f32>,
}

/// One auxiliary effect slot
pub struct EffectSlot {
    params: Mutex<SlotParams>,
    pub props: PropsCell<SlotUpdate>,
    /// Number of source sends currently targeting this slot
    ref_count: AtomicU32,
    pub mix: Mutex<SlotMixState>,
}

impl EffectSlot {
    pub fn new() -> Self {
        EffectSlot {
            params: Mutex::new(SlotParams::default()),
            props: PropsCell::new(),
            ref_count: AtomicU32::new(0),
            mix: Mutex::new(SlotMixState {
                state: create_state(&EffectParams::Null),
                gain: 1.0,
                aux_send_auto: true,
                effect: EffectParams::Null,
                wet_buffer: Vec::new(),
            }),
        }
    }

    /// Load a new effect configuration
    ///
    /// A change of effect *type* constructs a fresh DSP state sized for
    /// the device format; parameter-only changes reuse the running one.
    pub fn set_effect(&self, effect: EffectParams, frequency: u32, channels: usize) -> bool {
        let type_changed = {
            let mut params = self.params.lock().unwrap();
            let changed = std::mem::discriminant(&params.effect) != std::mem::discriminant(&effect);
            params.effect = effect.clone();
            changed
        };

        let new_state = if type_changed {
            let mut state = create_state(&effect);
            if !state.device_update(frequency, channels) {
                return false;
            }
            Some(state)
        } else {
            None
        };

        self.props.mark_dirty();
        self.publish_locked(new_state);
        true
    }

    pub fn set_gain(&self, gain: f32) {
        self.params.lock().unwrap().gain = gain.clamp(0.0, 1.0);
        self.props.mark_dirty();
    }

    pub fn set_aux_send_auto(&self, auto: bool) {
        self.params.lock().unwrap().aux_send_auto = auto;
        self.props.mark_dirty();
    }

    pub fn params(&self) -> SlotParams {
        self.params.lock().unwrap().clone()
    }

    /// Publish the current configuration if it is dirty
    pub fn publish_if_dirty(&self) {
        if self.props.try_set_clean() {
            self.publish_locked(None);
        }
    }

    fn publish_locked(&self, new_state: Option<Box<dyn EffectState>>) {
        let params = self.params.lock().unwrap().clone();
        self.props.publish(move |update| {
            update.gain = params.gain;
            update.aux_send_auto = params.aux_send_auto;
            update.effect = params.effect.clone();
            // Dropping whatever state a recycled node still carried
            // happens here, on the API thread.
            update.new_state = new_state;
        });
        self.props.try_set_clean();
    }

    /// Apply a pending update to the running state (mixer thread)
    pub fn apply_update(&self) {
        let Ok(mut mix) = self.mix.try_lock() else {
            return;
        };
        self.props.consume(|update| {
            mix.gain = update.gain;
            mix.aux_send_auto = update.aux_send_auto;
            mix.effect = update.effect.clone();
            if let Some(mut state) = update.new_state.take() {
                std::mem::swap(&mut mix.state, &mut state);
                // The displaced state rides the node back for deferred
                // teardown off the mixer thread.
                update.new_state = Some(state);
            }
            let effect = mix.effect.clone();
            mix.state.update(&effect);
        });
    }

    /// Resize the running state for a new device format
    ///
    /// Only called with the backend stopped; false marks the device
    /// update as failed.
    pub fn device_update(&self, frequency: u32, channels: usize, update_size: usize) -> bool {
        let mut mix = self.mix.lock().unwrap();
        mix.wet_buffer.clear();
        mix.wet_buffer.resize(update_size, 0.0);
        mix.state.device_update(frequency, channels)
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "slot reference underflow");
    }

    pub fn refs(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }
}

impl Default for EffectSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::ReverbParams;

    #[test]
    fn test_effect_change_publishes_new_state() {
        let slot = EffectSlot::new();
        assert!(slot.set_effect(
            EffectParams::Reverb(ReverbParams::default()),
            48000,
            2
        ));

        slot.apply_update();
        let mix = slot.mix.lock().unwrap();
        assert!(matches!(mix.effect, EffectParams::Reverb(_)));
        assert!((mix.gain - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_gain_change_reuses_running_state() {
        let slot = EffectSlot::new();
        slot.set_gain(0.5);
        slot.publish_if_dirty();
        slot.apply_update();
        assert!((slot.mix.lock().unwrap().gain - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_send_refcount() {
        let slot = EffectSlot::new();
        slot.add_ref();
        slot.add_ref();
        assert_eq!(slot.refs(), 2);
        slot.release_ref();
        assert_eq!(slot.refs(), 1);
    }

    #[test]
    fn test_publish_if_dirty_is_idempotent() {
        let slot = EffectSlot::new();
        slot.set_gain(0.25);
        slot.publish_if_dirty();
        // Second sweep sees a clean slot and publishes nothing.
        slot.publish_if_dirty();
        slot.apply_update();
        assert!(!slot.props.consume(|_| {}));
    }
}
