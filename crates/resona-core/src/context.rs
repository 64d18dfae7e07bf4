//! Rendering contexts
//!
//! A context is one rendering universe bound to one device for its whole
//! lifetime: a listener, source and effect-slot pools, and the voice
//! pool the mixer consumes. Property mutations publish immediately
//! unless updates are deferred; `process_updates` then hands the mixer
//! the whole batch atomically via the hold/update-count rendezvous.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::backend::Backend;
use crate::device::{self, Device, DeviceKind};
use crate::error::{RtError, RtResult};
use crate::events::{self, AsyncEvent, EventCallback, EventSender, EventThread};
use crate::pool::Pool;
use crate::props::PropsCell;
use crate::registry;
use crate::slot::EffectSlot;
use crate::source::{Source, SourceState};
use crate::types::{Attr, DistanceModel};
use crate::voice::{VoiceBufferRef, VoicePool};

/// Speed of sound in meters per second, the listener-space default
pub const SPEED_OF_SOUND: f32 = 343.3;

/// Default voice pool size for a fresh context
const DEFAULT_VOICES: usize = 256;

/// Listener state
#[derive(Debug, Clone)]
pub struct Listener {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
    pub gain: f32,
    pub meters_per_unit: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            position: [0.0; 3],
            velocity: [0.0; 3],
            forward: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
            gain: 1.0,
            meters_per_unit: 1.0,
        }
    }
}

/// Listener snapshot published to the mixer
#[derive(Debug, Clone, Default)]
pub struct ListenerUpdate {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
    pub gain: f32,
    pub meters_per_unit: f32,
}

/// Context-level rendering parameters
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub distance_model: DistanceModel,
    pub source_distance_model: bool,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            distance_model: DistanceModel::default(),
            source_distance_model: false,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND,
        }
    }
}

/// Context snapshot published to the mixer
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub distance_model: DistanceModel,
    pub source_distance_model: bool,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    pub gain_boost: f32,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// One rendering context
pub struct Context {
    device: Arc<Device>,

    listener: Mutex<Listener>,
    pub(crate) listener_props: PropsCell<ListenerUpdate>,
    params: Mutex<ContextParams>,
    pub(crate) props: PropsCell<ContextUpdate>,
    /// Last snapshot the mixer applied
    pub(crate) mix_params: Mutex<ContextUpdate>,

    pub(crate) sources: Mutex<Pool<Source>>,
    slots: Mutex<Pool<Arc<EffectSlot>>>,
    default_slot: Option<Arc<EffectSlot>>,
    /// Snapshot the mixer iterates; rebuilt on slot create/delete
    pub(crate) active_slots: RwLock<Vec<Arc<EffectSlot>>>,

    pub(crate) voices: RwLock<VoicePool>,

    pub(crate) defer_updates: AtomicBool,
    pub(crate) hold_updates: AtomicBool,
    /// Odd while the mixer is applying updates for this context
    pub(crate) update_count: AtomicU64,

    /// Per-device volume-adjust, folded into every published update
    gain_boost: f32,

    event_sender: EventSender,
    event_thread: Mutex<Option<EventThread>>,
    event_callback: Arc<Mutex<Option<EventCallback>>>,
}

impl Context {
    fn new(device: Arc<Device>, gain_boost: f32, default_slot: Option<Arc<EffectSlot>>) -> Self {
        let (sources_limit, slots_limit) = {
            let params = device.params().read().unwrap();
            (params.sources_max as usize, params.slots_max as usize)
        };
        let event_callback: Arc<Mutex<Option<EventCallback>>> = Arc::new(Mutex::new(None));
        let (event_sender, event_thread) = events::start(Arc::clone(&event_callback));

        let active = default_slot.iter().cloned().collect::<Vec<_>>();
        Context {
            device,
            listener: Mutex::new(Listener::default()),
            listener_props: PropsCell::new(),
            params: Mutex::new(ContextParams::default()),
            props: PropsCell::new(),
            mix_params: Mutex::new(ContextUpdate::default()),
            sources: Mutex::new(Pool::new(sources_limit)),
            slots: Mutex::new(Pool::new(slots_limit)),
            default_slot,
            active_slots: RwLock::new(active),
            voices: RwLock::new(VoicePool::new()),
            defer_updates: AtomicBool::new(false),
            hold_updates: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            gain_boost,
            event_sender,
            event_thread: Mutex::new(Some(event_thread)),
            event_callback,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Register (or clear) the async event callback
    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        *self.event_callback.lock().unwrap() = callback;
    }

    pub(crate) fn post_event(&self, event: AsyncEvent) {
        self.event_sender.post(event);
    }

    // ── Deferred updates ─────────────────────────────────────────────

    /// Suspend update application (mixer keeps running on old state)
    pub fn suspend(self: &Arc<Self>) -> RtResult<()> {
        if !registry::suspend_defers() {
            return Ok(());
        }
        let Some(ctx) = registry::verify_context(self) else {
            return Err(registry::latch_error(None, RtError::InvalidContext));
        };
        ctx.defer_updates.store(true, Ordering::Release);
        Ok(())
    }

    /// Publish all pending state as one batch and resume application
    pub fn process(self: &Arc<Self>) -> RtResult<()> {
        if !registry::suspend_defers() {
            return Ok(());
        }
        let Some(ctx) = registry::verify_context(self) else {
            return Err(registry::latch_error(None, RtError::InvalidContext));
        };
        if ctx.defer_updates.swap(false, Ordering::AcqRel) {
            // Park the mixer's applicator, wait out any in-flight apply,
            // then hand over everything at once.
            ctx.hold_updates.store(true, Ordering::Release);
            while ctx.update_count.load(Ordering::Acquire) & 1 != 0 {
                std::thread::yield_now();
            }
            ctx.republish_all();
            ctx.hold_updates.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Publish context, listener, every slot, and every live source
    pub(crate) fn republish_all(&self) {
        self.publish_context_props();
        self.publish_listener_props();
        for slot in self.all_slots() {
            slot.props.mark_dirty();
            slot.publish_if_dirty();
        }
        let mut sources = self.sources.lock().unwrap();
        let voices = self.voices.read().unwrap();
        let ids: Vec<u32> = sources.iter().map(|(id, _)| id).collect();
        for id in ids {
            let queue = self.snapshot_queue_by_id(&sources, id);
            if let Some(source) = sources.get_mut(id) {
                source.try_set_clean();
                if let Some(voice) = voices.voice_for_source(id) {
                    let sends = source.voice_sends();
                    let gain = source.gain;
                    let pitch = source.pitch;
                    let looping = source.looping;
                    voice.props.publish(|update| {
                        update.gain = gain;
                        update.step = pitch;
                        update.looping = looping;
                        update.sends = sends.clone();
                        update.queue = queue.clone();
                    });
                }
            }
        }
    }

    fn publish_context_props(&self) {
        let params = self.params.lock().unwrap().clone();
        let gain_boost = self.gain_boost;
        self.props.publish(|update| {
            update.distance_model = params.distance_model;
            update.source_distance_model = params.source_distance_model;
            update.doppler_factor = params.doppler_factor;
            update.doppler_velocity = params.doppler_velocity;
            update.speed_of_sound = params.speed_of_sound;
            update.gain_boost = gain_boost;
        });
        self.props.try_set_clean();
    }

    fn publish_listener_props(&self) {
        let listener = self.listener.lock().unwrap().clone();
        self.listener_props.publish(|update| {
            update.position = listener.position;
            update.velocity = listener.velocity;
            update.forward = listener.forward;
            update.up = listener.up;
            update.gain = listener.gain;
            update.meters_per_unit = listener.meters_per_unit;
        });
        self.listener_props.try_set_clean();
    }

    fn context_props_changed(&self) {
        self.props.mark_dirty();
        if !self.defer_updates.load(Ordering::Acquire) {
            if self.props.try_set_clean() {
                self.publish_context_props();
            }
        }
    }

    fn listener_props_changed(&self) {
        self.listener_props.mark_dirty();
        if !self.defer_updates.load(Ordering::Acquire) {
            if self.listener_props.try_set_clean() {
                self.publish_listener_props();
            }
        }
    }

    // ── Context parameters ───────────────────────────────────────────

    pub fn set_distance_model(&self, model: DistanceModel) {
        self.params.lock().unwrap().distance_model = model;
        self.context_props_changed();
    }

    pub fn set_doppler_factor(self: &Arc<Self>, factor: f32) -> RtResult<()> {
        if !(factor >= 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.params.lock().unwrap().doppler_factor = factor;
        self.context_props_changed();
        Ok(())
    }

    pub fn set_doppler_velocity(self: &Arc<Self>, velocity: f32) -> RtResult<()> {
        if !(velocity > 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.params.lock().unwrap().doppler_velocity = velocity;
        self.context_props_changed();
        Ok(())
    }

    pub fn set_speed_of_sound(self: &Arc<Self>, speed: f32) -> RtResult<()> {
        if !(speed > 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.params.lock().unwrap().speed_of_sound = speed;
        self.context_props_changed();
        Ok(())
    }

    // ── Listener ─────────────────────────────────────────────────────

    pub fn set_listener_position(&self, position: [f32; 3]) {
        self.listener.lock().unwrap().position = position;
        self.listener_props_changed();
    }

    pub fn set_listener_velocity(&self, velocity: [f32; 3]) {
        self.listener.lock().unwrap().velocity = velocity;
        self.listener_props_changed();
    }

    pub fn set_listener_orientation(&self, forward: [f32; 3], up: [f32; 3]) {
        let mut listener = self.listener.lock().unwrap();
        listener.forward = forward;
        listener.up = up;
        drop(listener);
        self.listener_props_changed();
    }

    pub fn set_listener_gain(self: &Arc<Self>, gain: f32) -> RtResult<()> {
        if !(gain >= 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.listener.lock().unwrap().gain = gain;
        self.listener_props_changed();
        Ok(())
    }

    pub fn set_listener_meters_per_unit(self: &Arc<Self>, meters: f32) -> RtResult<()> {
        if !(meters > 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.listener.lock().unwrap().meters_per_unit = meters;
        self.listener_props_changed();
        Ok(())
    }

    pub fn listener(&self) -> Listener {
        self.listener.lock().unwrap().clone()
    }

    // ── Effect slots ─────────────────────────────────────────────────

    pub fn create_effect_slot(self: &Arc<Self>) -> RtResult<u32> {
        let (frequency, channels, update_size) = self.mix_format();
        let slot = Arc::new(EffectSlot::new());
        slot.device_update(frequency, channels, update_size);
        let id = self
            .slots
            .lock()
            .unwrap()
            .insert(slot)
            .ok_or(RtError::OutOfMemory)
            .map_err(|e| self.device.latch(e))?;
        self.rebuild_active_slots();
        Ok(id)
    }

    pub fn delete_effect_slot(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let referenced = match slots.get(id) {
            Some(slot) => slot.refs() > 0,
            None => return Err(self.device.latch(RtError::InvalidValue)),
        };
        if referenced {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        slots.remove(id);
        drop(slots);
        self.rebuild_active_slots();
        Ok(())
    }

    /// Load a device effect into a slot
    pub fn slot_set_effect(self: &Arc<Self>, slot_id: u32, effect_id: u32) -> RtResult<()> {
        let Some(params) = self.device.effect_params(effect_id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        let slot = self.slot(slot_id)?;
        let (frequency, channels, _) = self.mix_format();
        if !slot.set_effect(params, frequency, channels) {
            return Err(self.device.latch(RtError::OutOfMemory));
        }
        Ok(())
    }

    pub fn slot_set_gain(self: &Arc<Self>, slot_id: u32, gain: f32) -> RtResult<()> {
        if !(0.0..=1.0).contains(&gain) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.slot(slot_id)?.set_gain(gain);
        Ok(())
    }

    pub(crate) fn slot(self: &Arc<Self>, id: u32) -> RtResult<Arc<EffectSlot>> {
        self.slots
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| self.device.latch(RtError::InvalidValue))
    }

    /// Every slot including the default one
    pub(crate) fn all_slots(&self) -> Vec<Arc<EffectSlot>> {
        let mut all: Vec<Arc<EffectSlot>> = self.default_slot.iter().cloned().collect();
        all.extend(self.slots.lock().unwrap().iter().map(|(_, s)| s.clone()));
        all
    }

    fn rebuild_active_slots(&self) {
        let all = self.all_slots();
        *self.active_slots.write().unwrap() = all;
    }

    fn mix_format(&self) -> (u32, usize, usize) {
        let frequency = self.device.params().read().unwrap().frequency;
        let mix = self.device.mix.lock().unwrap();
        (frequency, mix.output_channels().max(1), mix.stride)
    }

    // ── Sources ──────────────────────────────────────────────────────

    pub fn create_source(self: &Arc<Self>) -> RtResult<u32> {
        let num_sends = self.device.params().read().unwrap().num_sends;
        self.sources
            .lock()
            .unwrap()
            .insert(Source::new(num_sends))
            .ok_or(RtError::OutOfMemory)
            .map_err(|e| self.device.latch(e))
    }

    pub fn delete_source(self: &Arc<Self>, id: u32) -> RtResult<()> {
        self.stop_source(id).ok();
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.remove(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        self.release_source_buffers(&source);
        Ok(())
    }

    fn release_source_buffers(&self, source: &Source) {
        let buffers = self.device.buffers.lock().unwrap();
        for id in source.referenced_buffers() {
            if let Some(buffer) = buffers.get(id) {
                buffer.release_ref();
            }
        }
    }

    pub fn source_state(self: &Arc<Self>, id: u32) -> RtResult<SourceState> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if source.state == SourceState::Playing {
            let voices = self.voices.read().unwrap();
            let alive = voices
                .voice_for_source(id)
                .map(|v| v.playing.load(Ordering::Acquire))
                .unwrap_or(false);
            if !alive {
                source.state = SourceState::Stopped;
                source.voice_source_id = 0;
            }
        }
        Ok(source.state)
    }

    /// Bind a static buffer (or clear with None)
    pub fn source_set_buffer(self: &Arc<Self>, id: u32, buffer: Option<u32>) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if matches!(source.state, SourceState::Playing | SourceState::Paused) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        if !source.queue.is_empty() {
            return Err(self.device.latch(RtError::InvalidValue));
        }

        let buffers = self.device.buffers.lock().unwrap();
        if let Some(new_id) = buffer {
            let Some(new_buffer) = buffers.get(new_id) else {
                return Err(self.device.latch(RtError::InvalidValue));
            };
            new_buffer.add_ref();
        }
        if let Some(old_id) = source.static_buffer.take() {
            if let Some(old) = buffers.get(old_id) {
                old.release_ref();
            }
        }
        source.static_buffer = buffer;
        source.mark_dirty();
        Ok(())
    }

    /// Append buffers to the streaming queue
    pub fn source_queue_buffers(self: &Arc<Self>, id: u32, buffer_ids: &[u32]) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if source.static_buffer.is_some() {
            return Err(self.device.latch(RtError::InvalidValue));
        }

        let buffers = self.device.buffers.lock().unwrap();
        if buffer_ids.iter().any(|&b| buffers.get(b).is_none()) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        for &buffer_id in buffer_ids {
            buffers.get(buffer_id).unwrap().add_ref();
            source.queue.push_back(buffer_id);
        }
        source.mark_dirty();
        Ok(())
    }

    /// Remove up to `count` buffers from the front of the queue
    ///
    /// Only legal while the source is not playing or paused; unqueued
    /// handles are returned in queue order.
    pub fn source_unqueue_buffers(self: &Arc<Self>, id: u32, count: usize) -> RtResult<Vec<u32>> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if matches!(source.state, SourceState::Playing | SourceState::Paused) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        if count > source.queue.len() {
            return Err(self.device.latch(RtError::InvalidValue));
        }

        let buffers = self.device.buffers.lock().unwrap();
        let mut removed = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer_id = source.queue.pop_front().unwrap();
            if let Some(buffer) = buffers.get(buffer_id) {
                buffer.release_ref();
            }
            removed.push(buffer_id);
        }
        source.mark_dirty();
        Ok(removed)
    }

    pub fn source_set_gain(self: &Arc<Self>, id: u32, gain: f32) -> RtResult<()> {
        if !(gain >= 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.mutate_source(id, |source| source.gain = gain)
    }

    pub fn source_set_pitch(self: &Arc<Self>, id: u32, pitch: f32) -> RtResult<()> {
        if !(pitch > 0.0) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        self.mutate_source(id, |source| source.pitch = pitch)
    }

    pub fn source_set_looping(self: &Arc<Self>, id: u32, looping: bool) -> RtResult<()> {
        self.mutate_source(id, |source| source.looping = looping)
    }

    pub fn source_set_position(self: &Arc<Self>, id: u32, position: [f32; 3]) -> RtResult<()> {
        self.mutate_source(id, |source| source.position = position)
    }

    pub fn source_set_velocity(self: &Arc<Self>, id: u32, velocity: [f32; 3]) -> RtResult<()> {
        self.mutate_source(id, |source| source.velocity = velocity)
    }

    /// Point a source send at an effect slot
    pub fn source_set_send(
        self: &Arc<Self>,
        id: u32,
        send: usize,
        slot_id: Option<u32>,
    ) -> RtResult<()> {
        let slot = match slot_id {
            Some(sid) => Some(self.slot(sid)?),
            None => None,
        };
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if !source.set_send(send, slot) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        if !self.defer_updates.load(Ordering::Acquire) {
            self.publish_source_locked(&mut sources, id);
        }
        Ok(())
    }

    /// Set a send's wet-path gain and high/low band attenuations
    ///
    /// All three values are linear gains in [0, 1]; the band gains shape
    /// the wet signal around the filter reference frequencies.
    pub fn source_set_send_gains(
        self: &Arc<Self>,
        id: u32,
        send: usize,
        gain: f32,
        gain_hf: f32,
        gain_lf: f32,
    ) -> RtResult<()> {
        let valid = [gain, gain_hf, gain_lf]
            .iter()
            .all(|g| (0.0..=1.0).contains(g));
        if !valid {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if !source.set_send_gains(send, gain, gain_hf, gain_lf) {
            return Err(self.device.latch(RtError::InvalidValue));
        }
        if !self.defer_updates.load(Ordering::Acquire) {
            self.publish_source_locked(&mut sources, id);
        }
        Ok(())
    }

    fn mutate_source(self: &Arc<Self>, id: u32, f: impl FnOnce(&mut Source)) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        f(source);
        source.mark_dirty();
        if !self.defer_updates.load(Ordering::Acquire) {
            self.publish_source_locked(&mut sources, id);
        }
        Ok(())
    }

    /// Snapshot a source's queue as mixer buffer references
    fn snapshot_queue_by_id(&self, sources: &Pool<Source>, id: u32) -> Vec<VoiceBufferRef> {
        let Some(source) = sources.get(id) else {
            return Vec::new();
        };
        let buffers = self.device.buffers.lock().unwrap();
        source
            .referenced_buffers()
            .into_iter()
            .filter_map(|buffer_id| {
                buffers.get(buffer_id).map(|b| VoiceBufferRef {
                    data: b.data.clone(),
                    channels: b.channels.max(1),
                    frames: b.frames,
                    frequency: b.frequency,
                    buffer_id,
                })
            })
            .collect()
    }

    /// Publish a source's parameters to its voice, if it has one
    fn publish_source_locked(&self, sources: &mut Pool<Source>, id: u32) {
        let queue = self.snapshot_queue_by_id(sources, id);
        let Some(source) = sources.get_mut(id) else {
            return;
        };
        source.try_set_clean();
        let voices = self.voices.read().unwrap();
        if let Some(voice) = voices.voice_for_source(id) {
            let sends = source.voice_sends();
            let gain = source.gain;
            let pitch = source.pitch;
            let looping = source.looping;
            voice.props.publish(|update| {
                update.gain = gain;
                update.step = pitch;
                update.looping = looping;
                update.sends = sends.clone();
                update.queue = queue.clone();
            });
        }
    }

    // ── Source transport ─────────────────────────────────────────────

    /// Start (or restart) playback of a source
    pub fn play_source(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        let resumed = source.state == SourceState::Paused;

        {
            let mut voices = self.voices.write().unwrap();
            let has_voice = voices.voice_for_source(id).is_some();
            let voice = if has_voice {
                voices.voice_for_source(id)
            } else {
                voices.claim(id)
            };
            let Some(voice) = voice else {
                return Err(self.device.latch(RtError::OutOfMemory));
            };
            if !resumed {
                voice.position.store(0, Ordering::Release);
                if let Ok(mut mix) = voice.mix.try_lock() {
                    mix.queue_index = 0;
                    mix.frac = 0.0;
                }
            }
            voice.playing.store(true, Ordering::Release);
        }

        let source = sources.get_mut(id).unwrap();
        source.state = SourceState::Playing;
        source.voice_source_id = id;
        source.mark_dirty();
        self.publish_source_locked(&mut sources, id);
        Ok(())
    }

    pub fn pause_source(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if source.state == SourceState::Playing {
            let voices = self.voices.read().unwrap();
            if let Some(voice) = voices.voice_for_source(id) {
                voice.playing.store(false, Ordering::Release);
            }
            source.state = SourceState::Paused;
        }
        Ok(())
    }

    pub fn stop_source(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        if source.state != SourceState::Initial {
            source.state = SourceState::Stopped;
        }
        source.voice_source_id = 0;
        let voices = self.voices.read().unwrap();
        if let Some(voice) = voices.voice_for_source(id) {
            voice.clear();
        }
        Ok(())
    }

    pub fn rewind_source(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut sources = self.sources.lock().unwrap();
        let Some(source) = sources.get_mut(id) else {
            return Err(self.device.latch(RtError::InvalidValue));
        };
        source.state = SourceState::Initial;
        source.voice_source_id = 0;
        let voices = self.voices.read().unwrap();
        if let Some(voice) = voices.voice_for_source(id) {
            voice.clear();
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Detach from the device and stop the event thread
    ///
    /// Called with the device's backend lock held. Returns true when
    /// other contexts remain attached to the device.
    pub(crate) fn release(self: &Arc<Self>, _backend: &mut Option<Box<dyn Backend>>) -> bool {
        registry::clear_current_if(self);

        let remaining = {
            let mut contexts = self.device.contexts.write().unwrap();
            contexts.retain(|c| !Arc::ptr_eq(c, self));
            !contexts.is_empty()
        };

        if let Some(mut thread) = self.event_thread.lock().unwrap().take() {
            thread.stop();
        }
        remaining
    }

    /// Destroy this context, removing it from its device
    pub fn destroy(self: &Arc<Self>) -> RtResult<()> {
        let ctx = {
            let list = registry::list_lock();
            let Some(ctx) = registry::verify_context_in(&list, self) else {
                drop(list);
                return Err(registry::latch_error(None, RtError::InvalidContext));
            };
            ctx
        };

        let device = Arc::clone(&ctx.device);
        let mut backend = device.backend.lock().unwrap();
        if !ctx.release(&mut backend) {
            // Last context out stops the device.
            if device.is_running() {
                if let Some(backend) = backend.as_mut() {
                    backend.stop();
                }
                device.set_running(false);
            }
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let leaked = self.sources.lock().unwrap().clear();
        if leaked > 0 {
            log::warn!("{} source(s) not deleted", leaked);
        }
        let leaked = self.slots.lock().unwrap().clear();
        if leaked > 0 {
            log::warn!("{} effect slot(s) not deleted", leaked);
        }
        if let Some(mut thread) = self.event_thread.lock().unwrap().take() {
            thread.stop();
        }
    }
}

// ── Creation ─────────────────────────────────────────────────────────

/// Create a context on a device, reconfiguring the device with `attrs`
pub fn create_context(device: &Arc<Device>, attrs: &[(Attr, i32)]) -> RtResult<Arc<Context>> {
    let dev = {
        let list = registry::list_lock();
        let Some(dev) = registry::verify_device_in(&list, device) else {
            drop(list);
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind() == DeviceKind::Capture || !dev.is_connected() {
            drop(list);
            return Err(dev.latch(RtError::InvalidDevice));
        }
        dev
    };

    let mut backend = dev.backend.lock().unwrap();
    dev.take_error();

    if let Err(err) = device::update_device_params(&dev, &mut backend, attrs) {
        if err == RtError::InvalidDevice {
            if let Some(b) = backend.as_deref() {
                let _guard = b.mixer_lock();
                device::handle_disconnect(&dev, "Device update failure");
            }
        }
        return Err(dev.latch(err));
    }

    let (num_sends, frequency, update_size, volume_adjust) = {
        let params = dev.params().read().unwrap();
        let config = registry::config();
        let overrides = config.for_device(Some(&dev.name()));
        (
            params.num_sends,
            params.frequency,
            params.update_size as usize,
            overrides.volume_adjust(),
        )
    };

    let gain_boost = match volume_adjust {
        Some(db) if db.is_finite() => {
            let clamped = db.clamp(-24.0, 24.0);
            if clamped != db {
                log::warn!("volume-adjust clamped: {} to +/-24dB", db);
            }
            10.0f32.powf(clamped / 20.0)
        }
        Some(db) => {
            log::error!("volume-adjust must be finite: {}", db);
            1.0
        }
        None => 1.0,
    };

    // Default effect slot from the configured reverb preset.
    let default_slot = if dev.kind() == DeviceKind::Playback {
        registry::default_reverb().map(|preset| {
            let channels = dev.mix.lock().unwrap().output_channels().max(1);
            let slot = Arc::new(EffectSlot::new());
            slot.device_update(frequency, channels, update_size);
            if !slot.set_effect(preset, frequency, channels) {
                log::error!("Failed to initialize the default effect");
            }
            slot
        })
    } else {
        None
    };

    let context = Arc::new(Context::new(Arc::clone(&dev), gain_boost, default_slot));
    context.voices.write().unwrap().reallocate(DEFAULT_VOICES, num_sends);
    context.publish_listener_props();
    context.publish_context_props();

    dev.contexts.write().unwrap().push(Arc::clone(&context));
    log::debug!("Created context on \"{}\"", dev.name());
    Ok(context)
}
