//! Devices: open/close, format negotiation, reconfiguration, disconnect
//!
//! A device is one open audio endpoint. All reconfigurable state lives in
//! `DeviceParams` and is only mutated with the backend stopped or under
//! the backend lock; the mixer-owned accumulation buffers live in
//! `MixState` behind their own mutex. The hardest path here is
//! [`update_device_params`]: it quiesces the mixer, renegotiates the
//! format, rebuilds the mix buffers, and rewrites every live voice and
//! effect slot of every attached context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::backend::{Backend, BackendKind};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::effect::{EffectParams, Filter};
use crate::error::{ErrorLatch, RtError, RtResult};
use crate::events::AsyncEvent;
use crate::hrtf::{self, HrtfEntry, HrtfStatus};
use crate::limiter::OutputLimiter;
use crate::pool::Pool;
use crate::registry;
use crate::types::{
    ambi_layout_from_attr, ambi_scaling_from_attr, channels_from_attr, sample_type_from_attr,
    AmbiLayout, AmbiScaling, Attr, ChannelLayout, CompositeFormat, FormatRequest, SampleType,
    TriState, DEFAULT_NUM_UPDATES, DEFAULT_OUTPUT_RATE, DEFAULT_SENDS, DEFAULT_UPDATE_SIZE,
    MAX_AMBI_ORDER, MAX_SENDS, MIN_OUTPUT_RATE,
};

/// Name reported for (and accepted as) the default device
pub const DEFAULT_DEVICE_NAME: &str = "Resona Default Device";

/// What kind of endpoint a device fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Playback,
    Capture,
    Loopback,
}

/// Reconfigurable device state
///
/// Mutated only while the backend is stopped or under the backend lock.
/// The mixer reads it through `try_read` and renders silence on the
/// (never-expected) contention case.
pub struct DeviceParams {
    pub channels: ChannelLayout,
    pub sample_type: SampleType,
    pub frequency: u32,
    pub update_size: u32,
    pub num_updates: u32,
    pub requests: FormatRequest,
    pub ambi_order: u32,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
    pub sources_max: u32,
    pub mono_sources: u32,
    pub stereo_sources: u32,
    pub slots_max: u32,
    pub num_sends: usize,
    pub hrtf_list: Vec<HrtfEntry>,
    pub hrtf: Option<Arc<hrtf::Hrtf>>,
    pub hrtf_status: HrtfStatus,
    pub limiter_state: TriState,
    pub dither_depth: f32,
    pub fixed_latency_ns: u64,
    /// Average speaker distance in meters; 0 disables NFC filters
    pub avg_speaker_dist: f32,
}

impl Default for DeviceParams {
    fn default() -> Self {
        DeviceParams {
            channels: ChannelLayout::Stereo,
            sample_type: SampleType::F32,
            frequency: DEFAULT_OUTPUT_RATE,
            update_size: DEFAULT_UPDATE_SIZE,
            num_updates: DEFAULT_NUM_UPDATES,
            requests: FormatRequest::default(),
            ambi_order: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::N3d,
            sources_max: 256,
            mono_sources: 255,
            stereo_sources: 1,
            slots_max: 64,
            num_sends: DEFAULT_SENDS,
            hrtf_list: Vec::new(),
            hrtf: None,
            hrtf_status: HrtfStatus::Disabled,
            limiter_state: TriState::DontCare,
            dither_depth: 0.0,
            fixed_latency_ns: 0,
            avg_speaker_dist: 0.0,
        }
    }
}

/// Mixer-owned accumulation state
///
/// The buffer is planar: `channel_total()` runs of `stride` samples.
/// The dry bus comes first, then the first-order bus (when distinct),
/// then the real output bus (when distinct). A zero-channel FOA or real
/// bus aliases the dry bus.
pub struct MixState {
    pub buffer: Vec<f32>,
    pub stride: usize,
    /// Device rate the buses were sized for; drives filter coefficients
    pub frequency: u32,
    pub dry_channels: usize,
    pub foa_channels: usize,
    pub real_channels: usize,
    pub limiter: Option<OutputLimiter>,
    /// Per-voice scratch for one block of frames
    pub scratch: Vec<f32>,
}

impl MixState {
    fn new() -> Self {
        MixState {
            buffer: Vec::new(),
            stride: 0,
            frequency: 0,
            dry_channels: 0,
            foa_channels: 0,
            real_channels: 0,
            limiter: None,
            scratch: Vec::new(),
        }
    }

    pub fn channel_total(&self) -> usize {
        self.dry_channels + self.foa_channels + self.real_channels
    }

    /// Planar offset (in channels) of the bus written to the endpoint
    pub fn output_offset(&self) -> usize {
        if self.real_channels > 0 {
            self.dry_channels + self.foa_channels
        } else {
            0
        }
    }

    pub fn output_channels(&self) -> usize {
        if self.real_channels > 0 {
            self.real_channels
        } else {
            self.dry_channels
        }
    }
}

/// One open audio endpoint
impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

pub struct Device {
    kind: DeviceKind,
    name: Mutex<String>,
    params: RwLock<DeviceParams>,
    pub(crate) mix: Mutex<MixState>,

    connected: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
    pub(crate) error: ErrorLatch,

    /// Even outside a mixer pass, odd within
    pub(crate) mix_count: AtomicU64,
    pub(crate) samples_done: AtomicU64,
    clock_base_ns: AtomicU64,

    /// Holding this mutex is the backend lock serializing device ops
    pub(crate) backend: Mutex<Option<Box<dyn Backend>>>,
    pub(crate) contexts: RwLock<Vec<Arc<Context>>>,

    pub(crate) buffers: Mutex<Pool<Buffer>>,
    pub(crate) effects: Mutex<Pool<EffectParams>>,
    pub(crate) filters: Mutex<Pool<Filter>>,
}

impl Device {
    pub(crate) fn new(kind: DeviceKind) -> Arc<Device> {
        Arc::new(Device {
            kind,
            name: Mutex::new(String::new()),
            params: RwLock::new(DeviceParams::default()),
            mix: Mutex::new(MixState::new()),
            connected: AtomicBool::new(true),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            error: ErrorLatch::new(),
            mix_count: AtomicU64::new(0),
            samples_done: AtomicU64::new(0),
            clock_base_ns: AtomicU64::new(0),
            backend: Mutex::new(None),
            contexts: RwLock::new(Vec::new()),
            buffers: Mutex::new(Pool::new(1 << 20)),
            effects: Mutex::new(Pool::new(1 << 16)),
            filters: Mutex::new(Pool::new(1 << 16)),
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn params(&self) -> &RwLock<DeviceParams> {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Return and clear the device's latched error
    pub fn take_error(&self) -> Option<RtError> {
        self.error.take()
    }

    /// Sample rate and update size, for backends pacing themselves
    pub fn mix_timing(&self) -> (u32, u32) {
        let params = self.params.read().unwrap();
        (params.frequency.max(1), params.update_size.max(1))
    }

    /// Fold the sample counter into the base clock
    ///
    /// Bracketed by two mix-count increments so a concurrent clock
    /// reader never observes the pair mid-update. Must not run while the
    /// device is mixing.
    pub(crate) fn update_clock_base(&self) {
        self.mix_count.fetch_add(1, Ordering::AcqRel);
        let frequency = {
            let params = self.params.read().unwrap();
            params.frequency.max(1) as u64
        };
        let done = self.samples_done.swap(0, Ordering::AcqRel);
        self.clock_base_ns
            .fetch_add(done * 1_000_000_000 / frequency, Ordering::AcqRel);
        self.mix_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Read a consistent device clock in nanoseconds
    ///
    /// Spins until the same even mix count is observed on both sides of
    /// the (clock base, samples done) pair.
    pub fn clock_ns(&self) -> u64 {
        loop {
            let before = self.mix_count.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::thread::yield_now();
                continue;
            }
            let base = self.clock_base_ns.load(Ordering::Acquire);
            let done = self.samples_done.load(Ordering::Acquire);
            let frequency = match self.params.try_read() {
                Ok(params) => params.frequency.max(1) as u64,
                Err(_) => DEFAULT_OUTPUT_RATE as u64,
            };
            if self.mix_count.load(Ordering::Acquire) == before {
                return base + done * 1_000_000_000 / frequency;
            }
        }
    }

    /// Current mix generation (even outside a mixer pass)
    pub fn mix_count(&self) -> u64 {
        self.mix_count.load(Ordering::Acquire)
    }

    // ── Buffer / effect / filter sub-pools ────────────────────────────

    pub fn create_buffer(self: &Arc<Self>) -> RtResult<u32> {
        self.buffers
            .lock()
            .unwrap()
            .insert(Buffer::new())
            .ok_or(RtError::OutOfMemory)
            .map_err(|e| self.latch(e))
    }

    pub fn delete_buffer(self: &Arc<Self>, id: u32) -> RtResult<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let attached = match buffers.get(id) {
            Some(buffer) => buffer.attached(),
            None => return Err(self.latch(RtError::InvalidValue)),
        };
        if attached {
            return Err(self.latch(RtError::InvalidValue));
        }
        buffers.remove(id);
        Ok(())
    }

    pub fn buffer_data(
        self: &Arc<Self>,
        id: u32,
        format: CompositeFormat,
        bytes: &[u8],
        frequency: u32,
    ) -> RtResult<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.get_mut(id).ok_or(RtError::InvalidValue);
        match buffer {
            Ok(buffer) => buffer.set_data(format, bytes, frequency).map_err(|e| self.latch(e)),
            Err(e) => Err(self.latch(e)),
        }
    }

    pub fn create_effect(self: &Arc<Self>) -> RtResult<u32> {
        self.effects
            .lock()
            .unwrap()
            .insert(EffectParams::Null)
            .ok_or(RtError::OutOfMemory)
            .map_err(|e| self.latch(e))
    }

    pub fn set_effect(self: &Arc<Self>, id: u32, params: EffectParams) -> RtResult<()> {
        match self.effects.lock().unwrap().get_mut(id) {
            Some(slot) => {
                *slot = params;
                Ok(())
            }
            None => Err(self.latch(RtError::InvalidValue)),
        }
    }

    pub fn effect_params(&self, id: u32) -> Option<EffectParams> {
        self.effects.lock().unwrap().get(id).cloned()
    }

    pub fn delete_effect(self: &Arc<Self>, id: u32) -> RtResult<()> {
        self.effects
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.latch(RtError::InvalidValue))
    }

    pub fn create_filter(self: &Arc<Self>) -> RtResult<u32> {
        self.filters
            .lock()
            .unwrap()
            .insert(Filter::default())
            .ok_or(RtError::OutOfMemory)
            .map_err(|e| self.latch(e))
    }

    pub fn set_filter(self: &Arc<Self>, id: u32, filter: Filter) -> RtResult<()> {
        match self.filters.lock().unwrap().get_mut(id) {
            Some(slot) => {
                *slot = filter;
                Ok(())
            }
            None => Err(self.latch(RtError::InvalidValue)),
        }
    }

    pub fn delete_filter(self: &Arc<Self>, id: u32) -> RtResult<()> {
        self.filters
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.latch(RtError::InvalidValue))
    }

    /// Latch an error on this device and pass it through
    pub(crate) fn latch(&self, err: RtError) -> RtError {
        registry::latch_error(Some(self), err);
        err
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Close a playback or loopback device
    ///
    /// Any contexts the application failed to destroy are released here
    /// with a warning.
    pub fn close(self: &Arc<Self>) -> RtResult<()> {
        {
            let mut list = registry::list_lock();
            if registry::verify_device_in(&list, self).is_none()
                || self.kind == DeviceKind::Capture
            {
                drop(list);
                return Err(registry::latch_error(None, RtError::InvalidDevice));
            }
            list.retain(|d| !Arc::ptr_eq(d, self));
        }

        let mut backend = self.backend.lock().unwrap();
        let contexts: Vec<Arc<Context>> = self.contexts.read().unwrap().clone();
        for context in contexts {
            log::warn!("Releasing orphaned context on \"{}\"", self.name());
            context.release(&mut backend);
        }
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend.as_mut() {
                backend.stop();
            }
        }
        // Dropping the backend here breaks the device<->backend cycle.
        *backend = None;

        let leaked = self.buffers.lock().unwrap().clear();
        if leaked > 0 {
            log::warn!("{} buffer(s) not deleted on \"{}\"", leaked, self.name());
        }
        let leaked = self.effects.lock().unwrap().clear();
        if leaked > 0 {
            log::warn!("{} effect(s) not deleted on \"{}\"", leaked, self.name());
        }
        let leaked = self.filters.lock().unwrap().clear();
        if leaked > 0 {
            log::warn!("{} filter(s) not deleted on \"{}\"", leaked, self.name());
        }
        Ok(())
    }

    /// Reset the device output with a new attribute list
    ///
    /// Also re-arms the connected flag so a lost device can attempt
    /// recovery.
    pub fn reset(self: &Arc<Self>, attrs: &[(Attr, i32)]) -> RtResult<()> {
        let dev = {
            let list = registry::list_lock();
            let Some(dev) = registry::verify_device_in(&list, self) else {
                drop(list);
                return Err(registry::latch_error(None, RtError::InvalidDevice));
            };
            if dev.kind == DeviceKind::Capture {
                drop(list);
                return Err(dev.latch(RtError::InvalidDevice));
            }
            dev
        };

        let mut backend = dev.backend.lock().unwrap();
        if dev.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend.as_mut() {
                backend.stop();
            }
        }
        dev.connected.store(true, Ordering::Release);

        match update_device_params(&dev, &mut backend, attrs) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err == RtError::InvalidDevice {
                    disconnect_locked(&dev, backend.as_deref(), "Device reset failure");
                }
                Err(dev.latch(err))
            }
        }
    }

    /// Stop mixing without losing device state
    pub fn pause(self: &Arc<Self>) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Playback {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        if dev.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend.as_mut() {
                backend.stop();
            }
        }
        dev.paused.store(true, Ordering::Release);
        Ok(())
    }

    /// Resume mixing after a pause
    pub fn resume(self: &Arc<Self>) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Playback {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        if !dev.paused.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if dev.contexts.read().unwrap().is_empty() {
            return Ok(());
        }
        let started = backend.as_mut().map(|b| b.start()).unwrap_or(false);
        if !started {
            disconnect_locked(&dev, backend.as_deref(), "Device start failure");
            return Err(dev.latch(RtError::InvalidDevice));
        }
        dev.set_running(true);
        Ok(())
    }

    // ── Capture ───────────────────────────────────────────────────────

    pub fn capture_start(self: &Arc<Self>) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Capture {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        if !dev.is_connected() {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        if dev.is_running() {
            return Ok(());
        }
        let started = backend.as_mut().map(|b| b.start()).unwrap_or(false);
        if !started {
            disconnect_locked(&dev, backend.as_deref(), "Device start failure");
            return Err(dev.latch(RtError::InvalidDevice));
        }
        dev.set_running(true);
        Ok(())
    }

    pub fn capture_stop(self: &Arc<Self>) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Capture {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        if dev.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend.as_mut() {
                backend.stop();
            }
        }
        Ok(())
    }

    /// Frames currently readable from the capture buffer
    pub fn capture_available(self: &Arc<Self>) -> RtResult<usize> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Capture {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        Ok(backend.as_mut().map(|b| b.available_samples()).unwrap_or(0))
    }

    /// Read captured frames into `out` in the device sample format
    pub fn capture_samples(self: &Arc<Self>, out: &mut [u8], frames: usize) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Capture {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        let mut backend = dev.backend.lock().unwrap();
        let result = match backend.as_mut() {
            Some(backend) => {
                if backend.available_samples() >= frames {
                    backend.capture_samples(out, frames)
                } else {
                    Err(RtError::InvalidValue)
                }
            }
            None => Err(RtError::InvalidValue),
        };
        result.map_err(|e| dev.latch(e))
    }

    /// Close a capture device
    pub fn capture_close(self: &Arc<Self>) -> RtResult<()> {
        {
            let mut list = registry::list_lock();
            if registry::verify_device_in(&list, self).is_none()
                || self.kind != DeviceKind::Capture
            {
                drop(list);
                return Err(registry::latch_error(None, RtError::InvalidDevice));
            }
            list.retain(|d| !Arc::ptr_eq(d, self));
        }
        let mut backend = self.backend.lock().unwrap();
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend.as_mut() {
                backend.stop();
            }
        }
        *backend = None;
        Ok(())
    }

    // ── Loopback rendering ────────────────────────────────────────────

    /// Whether a loopback device can render the given format
    pub fn is_render_format_supported(
        self: &Arc<Self>,
        frequency: i32,
        _channels: ChannelLayout,
        _sample_type: SampleType,
    ) -> bool {
        let Some(dev) = registry::verify_device(self) else {
            registry::latch_error(None, RtError::InvalidDevice);
            return false;
        };
        if dev.kind != DeviceKind::Loopback {
            dev.latch(RtError::InvalidDevice);
            return false;
        }
        if frequency <= 0 {
            dev.latch(RtError::InvalidValue);
            return false;
        }
        frequency as u32 >= MIN_OUTPUT_RATE
    }

    /// Render `frames` frames into `out` using the negotiated format
    ///
    /// Zero frames is a no-op success; a short output buffer is
    /// `InvalidValue`.
    pub fn render_samples(self: &Arc<Self>, out: &mut [u8], frames: usize) -> RtResult<()> {
        let Some(dev) = registry::verify_device(self) else {
            return Err(registry::latch_error(None, RtError::InvalidDevice));
        };
        if dev.kind != DeviceKind::Loopback {
            return Err(dev.latch(RtError::InvalidDevice));
        }
        if frames == 0 {
            return Ok(());
        }
        let frame_bytes = {
            let params = dev.params.read().unwrap();
            params.channels.channel_count(params.ambi_order) * params.sample_type.bytes()
        };
        if out.len() < frames * frame_bytes {
            return Err(dev.latch(RtError::InvalidValue));
        }

        let backend = dev.backend.lock().unwrap();
        let _mix_guard = backend.as_ref().map(|b| b.mixer_lock());
        crate::mixer::mix_typed(&dev, out, frames);
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// The attribute list reported for this device
    pub fn attributes(&self) -> Vec<(Attr, i32)> {
        let params = self.params.read().unwrap();
        let mut attrs = vec![
            (Attr::Frequency, params.frequency as i32),
            (
                Attr::Refresh,
                (params.frequency / params.update_size.max(1)) as i32,
            ),
            (Attr::Sync, 0),
            (Attr::MonoSources, params.mono_sources as i32),
            (Attr::StereoSources, params.stereo_sources as i32),
            (Attr::MaxAuxiliarySends, params.num_sends as i32),
            (
                Attr::Hrtf,
                (params.hrtf_status == HrtfStatus::Enabled) as i32,
            ),
            (
                Attr::OutputLimiter,
                self.mix.lock().unwrap().limiter.is_some() as i32,
            ),
        ];
        if self.kind == DeviceKind::Loopback && params.channels == ChannelLayout::Ambi3D {
            attrs.push((Attr::AmbisonicOrder, params.ambi_order as i32));
        }
        attrs
    }

    /// HRTF set names available on this device, by index
    pub fn hrtf_specifiers(&self) -> Vec<String> {
        let mut params = self.params.write().unwrap();
        if params.hrtf_list.is_empty() {
            params.hrtf_list = hrtf::enumerate(None);
        }
        params.hrtf_list.iter().map(|e| e.name.clone()).collect()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("Device \"{}\" dropped", self.name.lock().unwrap());
    }
}

// ── Integer / string queries with raw enumerants ─────────────────────

/// Raw integer query (enumerant-addressed, unknown codes latch InvalidEnum)
pub fn get_integer_raw(device: Option<&Arc<Device>>, param: i32) -> Option<i64> {
    const FREQUENCY: i32 = 0x1007;
    const REFRESH: i32 = 0x1008;
    const SYNC: i32 = 0x1009;
    const MONO_SOURCES: i32 = 0x1010;
    const STEREO_SOURCES: i32 = 0x1011;
    const CAPTURE_SAMPLES: i32 = 0x312;
    const CONNECTED: i32 = 0x313;
    const DEVICE_CLOCK: i32 = 0x1600;
    const DEVICE_LATENCY: i32 = 0x1601;
    const MAX_AUXILIARY_SENDS: i32 = 0x20003;

    let Some(device) = device else {
        registry::latch_error(None, RtError::InvalidDevice);
        return None;
    };
    let Some(dev) = registry::verify_device(device) else {
        registry::latch_error(None, RtError::InvalidDevice);
        return None;
    };

    match param {
        FREQUENCY => Some(dev.params.read().unwrap().frequency as i64),
        REFRESH => {
            let params = dev.params.read().unwrap();
            Some((params.frequency / params.update_size.max(1)) as i64)
        }
        SYNC => Some(0),
        MONO_SOURCES => Some(dev.params.read().unwrap().mono_sources as i64),
        STEREO_SOURCES => Some(dev.params.read().unwrap().stereo_sources as i64),
        MAX_AUXILIARY_SENDS => Some(dev.params.read().unwrap().num_sends as i64),
        CONNECTED => Some(dev.is_connected() as i64),
        DEVICE_CLOCK => Some(dev.clock_ns() as i64),
        DEVICE_LATENCY => {
            let params = dev.params.read().unwrap();
            let buffered = params.update_size as u64 * params.num_updates as u64;
            let latency = params.fixed_latency_ns
                + buffered * 1_000_000_000 / params.frequency.max(1) as u64;
            Some(latency as i64)
        }
        CAPTURE_SAMPLES => {
            if dev.kind() == DeviceKind::Capture {
                dev.capture_available().ok().map(|n| n as i64)
            } else {
                dev.latch(RtError::InvalidDevice);
                None
            }
        }
        _ => {
            dev.latch(RtError::InvalidEnum);
            None
        }
    }
}

/// Raw string query; `None` + latched `InvalidEnum` for unknown codes
pub fn get_string_raw(device: Option<&Arc<Device>>, param: i32) -> Option<String> {
    const DEVICE_SPECIFIER: i32 = 0x1005;
    const EXTENSIONS: i32 = 0x1006;
    const DEFAULT_DEVICE_SPECIFIER: i32 = 0x1004;
    const CAPTURE_DEVICE_SPECIFIER: i32 = 0x310;
    const CAPTURE_DEFAULT_DEVICE_SPECIFIER: i32 = 0x311;
    const HRTF_SPECIFIER: i32 = 0x1995;

    match param {
        DEFAULT_DEVICE_SPECIFIER => Some(DEFAULT_DEVICE_NAME.to_string()),
        DEVICE_SPECIFIER => match device.and_then(|d| registry::verify_device(d)) {
            Some(dev) => Some(dev.name()),
            None => Some(registry::probe_playback_names().join("\n")),
        },
        CAPTURE_DEVICE_SPECIFIER => match device.and_then(|d| registry::verify_device(d)) {
            Some(dev) => Some(dev.name()),
            None => Some(registry::probe_capture_names().join("\n")),
        },
        CAPTURE_DEFAULT_DEVICE_SPECIFIER => {
            Some(registry::probe_capture_names().into_iter().next().unwrap_or_default())
        }
        EXTENSIONS => Some("SOFT_loopback SOFT_HRTF SOFT_output_limiter SOFT_pause_device SOFT_device_clock".to_string()),
        HRTF_SPECIFIER => {
            let dev = device.and_then(|d| registry::verify_device(d))?;
            let params = dev.params.read().unwrap();
            Some(
                params
                    .hrtf
                    .as_ref()
                    .map(|h| h.name.clone())
                    .unwrap_or_default(),
            )
        }
        _ => {
            let dev = device.and_then(|d| registry::verify_device(d));
            registry::latch_error(dev.as_deref(), RtError::InvalidEnum);
            None
        }
    }
}

// ── Open paths ───────────────────────────────────────────────────────

fn normalize_name(name: Option<&str>) -> Option<&str> {
    match name {
        Some("") => None,
        Some(n) if n.eq_ignore_ascii_case(DEFAULT_DEVICE_NAME) => None,
        other => other,
    }
}

/// Open a playback device
pub fn open_playback(name: Option<&str>) -> RtResult<Arc<Device>> {
    registry::init();
    let Some(factory) = registry::playback_factory() else {
        return Err(registry::latch_error(None, RtError::InvalidValue));
    };
    let name = normalize_name(name);

    let device = Device::new(DeviceKind::Playback);
    seed_playback_defaults(&device, name);

    let mut backend_slot = device.backend.lock().unwrap();
    let Some(mut backend) = factory.create(Arc::clone(&device), BackendKind::Playback) else {
        return Err(registry::latch_error(None, RtError::OutOfMemory));
    };
    if let Err(err) = backend.open(name) {
        return Err(registry::latch_error(None, err));
    }
    *backend_slot = Some(backend);
    drop(backend_slot);

    apply_ambi_format_override(&device);

    registry::insert_device(&device);
    log::info!("Created playback device \"{}\"", device.name());
    Ok(device)
}

/// Open a capture device with a caller-pinned format
pub fn open_capture(
    name: Option<&str>,
    frequency: u32,
    format: CompositeFormat,
    buffer_frames: i32,
) -> RtResult<Arc<Device>> {
    registry::init();
    let Some(factory) = registry::capture_factory() else {
        return Err(registry::latch_error(None, RtError::InvalidValue));
    };
    if buffer_frames <= 0 {
        return Err(registry::latch_error(None, RtError::InvalidValue));
    }
    let name = normalize_name(name);

    let device = Device::new(DeviceKind::Capture);
    {
        let (channels, sample_type) = format.decompose();
        let mut params = device.params.write().unwrap();
        params.frequency = frequency;
        params.channels = channels;
        params.sample_type = sample_type;
        params.requests = FormatRequest {
            channels: true,
            sample_type: true,
            frequency: true,
        };
        params.update_size = buffer_frames as u32;
        params.num_updates = 1;
    }

    let mut backend_slot = device.backend.lock().unwrap();
    let Some(mut backend) = factory.create(Arc::clone(&device), BackendKind::Capture) else {
        return Err(registry::latch_error(None, RtError::OutOfMemory));
    };
    if let Err(err) = backend.open(name) {
        return Err(registry::latch_error(None, err));
    }
    *backend_slot = Some(backend);
    drop(backend_slot);

    registry::insert_device(&device);
    log::info!("Created capture device \"{}\"", device.name());
    Ok(device)
}

/// Open a loopback device for application-driven rendering
pub fn open_loopback() -> RtResult<Arc<Device>> {
    registry::init();
    let device = Device::new(DeviceKind::Loopback);
    {
        let config = registry::config();
        let overrides = config.for_device(None);
        let mut params = device.params.write().unwrap();
        params.update_size = 0;
        params.num_updates = 0;
        if let Some(sources) = overrides.sources() {
            params.sources_max = if sources == 0 { 256 } else { sources };
        }
        if let Some(slots) = overrides.slots() {
            params.slots_max = if slots == 0 { 64 } else { slots };
        }
        if let Some(sends) = overrides.sends() {
            params.num_sends = sends.clamp(0, MAX_SENDS as i32) as usize;
        }
        params.stereo_sources = 1;
        params.mono_sources = params.sources_max - 1;
    }

    let mut backend_slot = device.backend.lock().unwrap();
    let factory = registry::loopback_factory();
    let Some(mut backend) = factory.create(Arc::clone(&device), BackendKind::Loopback) else {
        return Err(registry::latch_error(None, RtError::OutOfMemory));
    };
    backend.open(None).expect("loopback open cannot fail");
    *backend_slot = Some(backend);
    drop(backend_slot);

    registry::insert_device(&device);
    log::info!("Created loopback device");
    Ok(device)
}

/// Seed a fresh playback device from config defaults and overrides
fn seed_playback_defaults(device: &Arc<Device>, name: Option<&str>) {
    let config = registry::config();
    let overrides = config.for_device(name);
    let mut params = device.params.write().unwrap();

    if let Some(spec) = overrides.channels() {
        match ChannelLayout::from_config(&spec) {
            Some((channels, order)) => {
                params.channels = channels;
                params.ambi_order = order;
                params.requests.channels = true;
            }
            None => log::error!("Unsupported channels override: {}", spec),
        }
    }
    if let Some(spec) = overrides.sample_type() {
        match SampleType::from_config(&spec) {
            Some(sample_type) => {
                params.sample_type = sample_type;
                params.requests.sample_type = true;
            }
            None => log::error!("Unsupported sample-type override: {}", spec),
        }
    }
    if let Some(freq) = overrides.frequency() {
        if freq > 0 {
            let freq = freq.max(MIN_OUTPUT_RATE);
            if freq != overrides.frequency().unwrap() {
                log::error!(
                    "{}hz frequency override clamped to {}hz minimum",
                    overrides.frequency().unwrap(),
                    freq
                );
            }
            params.num_updates =
                (params.num_updates * freq + params.frequency / 2) / params.frequency;
            params.frequency = freq;
            params.requests.frequency = true;
        }
    }
    if let Some(periods) = overrides.periods() {
        params.num_updates = periods;
    }
    params.num_updates = params.num_updates.clamp(2, 16);

    if let Some(size) = overrides.period_size() {
        params.update_size = size;
    }
    params.update_size = params.update_size.clamp(64, 8192);
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        // Vector mixers want update sizes in multiples of four frames.
        params.update_size = (params.update_size + 3) & !3;
    }

    if let Some(sources) = overrides.sources() {
        params.sources_max = if sources == 0 { 256 } else { sources };
    }
    if let Some(slots) = overrides.slots() {
        params.slots_max = if slots == 0 { 64 } else { slots };
    }
    if let Some(sends) = overrides.sends() {
        params.num_sends =
            (DEFAULT_SENDS as i32).clamp(0, sends.clamp(0, MAX_SENDS as i32)) as usize;
    }
    params.stereo_sources = 1;
    params.mono_sources = params.sources_max - 1;
}

/// Apply the per-device ambisonic format override after open resolved
/// the final device name
fn apply_ambi_format_override(device: &Arc<Device>) {
    let config = registry::config();
    let name = device.name();
    let overrides = config.for_device(Some(&name));
    let Some(spec) = overrides.ambi_format() else {
        return;
    };
    let mut params = device.params.write().unwrap();
    match spec.to_ascii_lowercase().as_str() {
        "fuma" => {
            if params.ambi_order > 3 {
                log::error!(
                    "FuMa is incompatible with order {} ambisonics (third order at most)",
                    params.ambi_order
                );
            } else {
                params.ambi_layout = AmbiLayout::Fuma;
                params.ambi_scaling = AmbiScaling::Fuma;
            }
        }
        "acn+sn3d" => {
            params.ambi_layout = AmbiLayout::Acn;
            params.ambi_scaling = AmbiScaling::Sn3d;
        }
        "acn+n3d" => {
            params.ambi_layout = AmbiLayout::Acn;
            params.ambi_scaling = AmbiScaling::N3d;
        }
        other => log::error!("Unsupported ambi-format override: {}", other),
    }
}

// ── Reconfiguration ──────────────────────────────────────────────────

/// Attribute values parsed out of an attribute list
#[derive(Default)]
struct ParsedAttrs {
    frequency: u32,
    channels: Option<ChannelLayout>,
    sample_type: Option<SampleType>,
    ambi_layout: Option<AmbiLayout>,
    ambi_scaling: Option<AmbiScaling>,
    ambi_order: u32,
    mono_sources: Option<i32>,
    stereo_sources: Option<i32>,
    sends: Option<i32>,
    hrtf: TriState,
    hrtf_id: Option<i32>,
    limiter: Option<TriState>,
}

fn parse_attrs(attrs: &[(Attr, i32)]) -> ParsedAttrs {
    let mut parsed = ParsedAttrs::default();
    for &(key, value) in attrs {
        log::trace!("{:?} = {}", key, value);
        match key {
            Attr::Frequency => parsed.frequency = value.max(0) as u32,
            Attr::FormatChannels => parsed.channels = channels_from_attr(value),
            Attr::FormatType => parsed.sample_type = sample_type_from_attr(value),
            Attr::AmbisonicLayout => parsed.ambi_layout = ambi_layout_from_attr(value),
            Attr::AmbisonicScaling => parsed.ambi_scaling = ambi_scaling_from_attr(value),
            Attr::AmbisonicOrder => parsed.ambi_order = value.max(0) as u32,
            Attr::MonoSources => parsed.mono_sources = Some(value.max(0)),
            Attr::StereoSources => parsed.stereo_sources = Some(value.max(0)),
            Attr::MaxAuxiliarySends => parsed.sends = Some(value.clamp(0, MAX_SENDS as i32)),
            Attr::Hrtf => parsed.hrtf = TriState::from_attr(value),
            Attr::HrtfId => parsed.hrtf_id = Some(value),
            Attr::OutputLimiter => parsed.limiter = Some(TriState::from_attr(value)),
            Attr::Refresh | Attr::Sync => {}
        }
    }
    parsed
}

/// The central device reconfiguration routine
///
/// Caller holds the backend lock. On failure the device is left stopped
/// but every source and slot coherent; on success the backend is
/// restarted unless the device is paused.
pub(crate) fn update_device_params(
    device: &Arc<Device>,
    backend_slot: &mut Option<Box<dyn Backend>>,
    attrs: &[(Attr, i32)],
) -> RtResult<()> {
    let loopback = device.kind == DeviceKind::Loopback;
    if attrs.is_empty() && loopback {
        log::warn!("Missing attributes for loopback device");
        return Err(RtError::InvalidValue);
    }

    let config = registry::config();
    let device_name = device.name();
    let overrides = config.for_device(Some(&device_name));

    let old_sends = device.params.read().unwrap().num_sends;
    let mut hrtf_appreq = TriState::DontCare;
    let mut hrtf_id: Option<i32> = None;
    let mut limiter_request = device.params.read().unwrap().limiter_state;

    if !attrs.is_empty() {
        let parsed = parse_attrs(attrs);
        hrtf_appreq = parsed.hrtf;
        hrtf_id = parsed.hrtf_id;
        if let Some(limiter) = parsed.limiter {
            limiter_request = limiter;
        }

        if loopback {
            let valid_format = parsed.channels.is_some()
                && parsed.sample_type.is_some()
                && parsed.frequency >= MIN_OUTPUT_RATE;
            if !valid_format {
                log::warn!("Missing or invalid format for loopback device");
                return Err(RtError::InvalidValue);
            }
            if parsed.channels == Some(ChannelLayout::Ambi3D) {
                let (Some(layout), Some(scaling)) = (parsed.ambi_layout, parsed.ambi_scaling)
                else {
                    log::warn!("Missing ambisonic info for loopback device");
                    return Err(RtError::InvalidValue);
                };
                if parsed.ambi_order < 1 || parsed.ambi_order > MAX_AMBI_ORDER {
                    return Err(RtError::InvalidValue);
                }
                let fuma = layout == AmbiLayout::Fuma || scaling == AmbiScaling::Fuma;
                if fuma && parsed.ambi_order > 3 {
                    return Err(RtError::InvalidValue);
                }
            }
        }

        // Stop playback so the device attributes can be updated.
        if device.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = backend_slot.as_mut() {
                backend.stop();
            }
        }
        device.update_clock_base();

        let mut params = device.params.write().unwrap();
        if !loopback {
            params.num_updates = DEFAULT_NUM_UPDATES;
            params.update_size = DEFAULT_UPDATE_SIZE;
            params.frequency = DEFAULT_OUTPUT_RATE;

            let mut freq = overrides.frequency().unwrap_or(parsed.frequency);
            if freq == 0 {
                params.requests.frequency = false;
            } else {
                freq = freq.max(MIN_OUTPUT_RATE);
                params.num_updates =
                    (params.num_updates * freq + params.num_updates / 2) / params.frequency;
                params.frequency = freq;
                params.requests.frequency = true;
            }

            if let Some(periods) = overrides.periods() {
                params.num_updates = periods;
            }
            params.num_updates = params.num_updates.clamp(2, 16);

            if let Some(size) = overrides.period_size() {
                params.update_size = size;
            }
            params.update_size = params.update_size.clamp(64, 8192);
            if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
                params.update_size = (params.update_size + 3) & !3;
            }
        } else {
            params.frequency = parsed.frequency;
            params.channels = parsed.channels.unwrap();
            params.sample_type = parsed.sample_type.unwrap();
            if params.channels == ChannelLayout::Ambi3D {
                params.ambi_order = parsed.ambi_order;
                params.ambi_layout = parsed.ambi_layout.unwrap();
                params.ambi_scaling = parsed.ambi_scaling.unwrap();
            }
        }

        // Resolve source counts: attribute request, then config override,
        // with a floor of 256 total.
        let mut mono = parsed
            .mono_sources
            .unwrap_or(params.mono_sources as i32)
            .max(0) as i64;
        let mut stereo = parsed
            .stereo_sources
            .unwrap_or(params.stereo_sources as i32)
            .max(0) as i64;
        let mut total = mono + stereo;
        match overrides.sources() {
            Some(config_total) if config_total > 0 => total = config_total as i64,
            Some(_) => total = 256,
            None => total = total.max(256),
        }
        stereo = stereo.min(total);
        mono = total - stereo;
        params.sources_max = total as u32;
        params.mono_sources = mono as u32;
        params.stereo_sources = stereo as u32;

        let requested_sends = parsed.sends.unwrap_or(old_sends as i32);
        params.num_sends = match overrides.sends() {
            Some(config_sends) => requested_sends.min(config_sends.clamp(0, MAX_SENDS as i32)),
            None => requested_sends,
        } as usize;
    }

    if device.is_running() {
        return Ok(());
    }

    device.update_clock_base();

    // ── HRTF resolution ──────────────────────────────────────────────
    let mut hrtf_userreq = TriState::DontCare;
    {
        let mut params = device.params.write().unwrap();
        params.hrtf_status = HrtfStatus::Disabled;
        params.fixed_latency_ns = 0;
        if !loopback {
            match overrides.hrtf().as_deref() {
                Some("true") => hrtf_userreq = TriState::Enabled,
                Some("false") => hrtf_userreq = TriState::Disabled,
                Some("auto") | None => {}
                Some(other) => log::error!("Unexpected hrtf value: {}", other),
            }

            let wanted = hrtf_userreq == TriState::Enabled
                || (hrtf_userreq != TriState::Disabled && hrtf_appreq == TriState::Enabled);
            if wanted {
                if params.hrtf_list.is_empty() {
                    params.hrtf_list = hrtf::enumerate(Some(&device_name));
                }
                let entry = match hrtf_id {
                    Some(id) if id >= 0 && (id as usize) < params.hrtf_list.len() => {
                        params.hrtf_list.get(id as usize)
                    }
                    _ => params.hrtf_list.first(),
                };
                match entry.and_then(hrtf::load) {
                    Some(loaded) => {
                        params.channels = ChannelLayout::Stereo;
                        params.frequency = loaded.sample_rate;
                        params.requests.channels = true;
                        params.requests.frequency = true;
                        // The previous handle is released only on a
                        // successful replacement.
                        params.hrtf = Some(loaded);
                        params.hrtf_status = HrtfStatus::Enabled;
                    }
                    None => {
                        params.hrtf_status = HrtfStatus::UnsupportedFormat;
                    }
                }
            }
        }
    }

    // ── Backend reset & request reconciliation ───────────────────────
    let (old_freq, old_chans, old_type) = {
        let params = device.params.read().unwrap();
        log::trace!(
            "Pre-reset: {}{}, {}{}, {}{}hz, {} update size x{}",
            if params.requests.channels { "*" } else { "" },
            params.channels.name(),
            if params.requests.sample_type { "*" } else { "" },
            params.sample_type.name(),
            if params.requests.frequency { "*" } else { "" },
            params.frequency,
            params.update_size,
            params.num_updates,
        );
        (params.frequency, params.channels, params.sample_type)
    };

    let reset_ok = backend_slot.as_mut().map(|b| b.reset()).unwrap_or(false);
    if !reset_ok {
        return Err(RtError::InvalidDevice);
    }

    {
        let mut params = device.params.write().unwrap();
        if params.channels != old_chans && params.requests.channels {
            log::error!(
                "Failed to set {}, got {} instead",
                old_chans.name(),
                params.channels.name()
            );
            params.requests.channels = false;
        }
        if params.sample_type != old_type && params.requests.sample_type {
            log::error!(
                "Failed to set {}, got {} instead",
                old_type.name(),
                params.sample_type.name()
            );
            params.requests.sample_type = false;
        }
        if params.frequency != old_freq && params.requests.frequency {
            log::error!(
                "Failed to set {}hz, got {}hz instead",
                old_freq,
                params.frequency
            );
            params.requests.frequency = false;
        }
        log::trace!(
            "Post-reset: {}, {}, {}hz, {} update size x{}",
            params.channels.name(),
            params.sample_type.name(),
            params.frequency,
            params.update_size,
            params.num_updates,
        );
    }

    // ── Mix buffer layout, dither, limiter ───────────────────────────
    let (new_sends, frequency, update_size, real_channels) = {
        let mut params = device.params.write().unwrap();

        let (dry, foa, real) = mix_channel_config(&params);
        // Loopback devices have no update size; mix in default blocks.
        let stride = match params.update_size {
            0 => DEFAULT_UPDATE_SIZE as usize,
            n => n as usize,
        };
        {
            let mut mix = device.mix.lock().unwrap();
            mix.stride = stride;
            mix.frequency = params.frequency;
            mix.dry_channels = dry;
            mix.foa_channels = foa;
            mix.real_channels = real;
            mix.buffer.clear();
            mix.buffer.resize((dry + foa + real) * stride, 0.0);
            mix.scratch.clear();
            mix.scratch.resize(stride, 0.0);
            log::trace!("Channel config, Dry: {}, FOA: {}, Real: {}", dry, foa, real);
        }

        // Dither depth by sample type unless config pins it.
        params.dither_depth = 0.0;
        if overrides.dither().unwrap_or(true) {
            let mut depth = overrides.dither_depth().unwrap_or(0);
            if depth <= 0 {
                depth = match params.sample_type {
                    SampleType::I8 | SampleType::U8 => 8,
                    SampleType::I16 | SampleType::U16 => 16,
                    _ => 0,
                };
            }
            if depth > 0 {
                params.dither_depth = 2.0f32.powi(depth.clamp(2, 24) - 1);
            }
        }
        if params.dither_depth > 0.0 {
            log::trace!("Dithering enabled ({:.0}-level)", params.dither_depth);
        }

        params.limiter_state = limiter_request;
        let limiter_on = match overrides.output_limiter() {
            Some(enabled) => enabled,
            None => match limiter_request {
                TriState::Enabled => true,
                TriState::Disabled => false,
                // Integer outputs must clamp; float can pass unclamped.
                TriState::DontCare => params.sample_type.is_integer(),
            },
        };
        let mut mix = device.mix.lock().unwrap();
        if limiter_on {
            let mut threshold = match params.sample_type {
                SampleType::I8 | SampleType::U8 => 127.0 / 128.0,
                SampleType::I16 | SampleType::U16 => 32767.0 / 32768.0,
                _ => 1.0,
            };
            if params.dither_depth > 0.0 {
                threshold -= 1.0 / params.dither_depth;
            }
            let limiter = OutputLimiter::new(
                mix.output_channels(),
                params.frequency,
                threshold.log10() * 20.0,
            );
            params.fixed_latency_ns += limiter.lookahead_samples() as u64 * 1_000_000_000
                / params.frequency.max(1) as u64;
            mix.limiter = Some(limiter);
        } else {
            mix.limiter = None;
        }
        log::trace!(
            "Output limiter {}",
            if mix.limiter.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );
        log::trace!("Fixed device latency: {}ns", params.fixed_latency_ns);

        (
            params.num_sends,
            params.frequency,
            mix.stride,
            mix.output_channels(),
        )
    };

    // ── Propagate to every attached context ──────────────────────────
    let mut update_failed = false;
    let contexts: Vec<Arc<Context>> = device.contexts.read().unwrap().clone();
    for context in &contexts {
        for slot in context.all_slots() {
            if !slot.device_update(frequency, real_channels, update_size as usize) {
                update_failed = true;
            } else {
                slot.props.mark_dirty();
                slot.publish_if_dirty();
            }
        }

        {
            let mut sources = context.sources.lock().unwrap();
            for (_, source) in sources.iter_mut() {
                if old_sends != new_sends {
                    source.resize_sends(new_sends);
                }
                source.mark_dirty();
            }
        }

        {
            // Stale voice updates reference the old send layout; drop
            // them before the pool is rebuilt.
            let mut voices = context.voices.write().unwrap();
            for voice in &voices.voices {
                voice.props.consume(|_| {});
                voice.props.purge_free();
            }
            let max_voices = voices.voices.len().max(256);
            voices.reallocate(max_voices, new_sends);

            let avg_dist = device.params.read().unwrap().avg_speaker_dist;
            if avg_dist > 0.0 {
                let w1 = 343.3 / (avg_dist * frequency as f32);
                for voice in &voices.voices {
                    if voice.source_id.load(Ordering::Acquire) != 0 {
                        if let Ok(mut mix) = voice.mix.try_lock() {
                            mix.nfc_w1 = w1;
                        }
                    }
                }
            }
        }

        context.republish_all();
    }

    if update_failed {
        return Err(RtError::InvalidDevice);
    }

    if !device.is_paused() {
        let started = backend_slot.as_mut().map(|b| b.start()).unwrap_or(false);
        if !started {
            disconnect_locked(device, backend_slot.as_deref(), "Device start failure");
            return Err(RtError::InvalidDevice);
        }
        device.set_running(true);
    }
    Ok(())
}

/// (dry, foa, real) channel counts for the current params
fn mix_channel_config(params: &DeviceParams) -> (usize, usize, usize) {
    if params.hrtf.is_some() {
        // Binaural render: first-order dry bus folded to real stereo.
        (4, 0, 2)
    } else if params.channels == ChannelLayout::Ambi3D {
        let dry = params.channels.channel_count(params.ambi_order);
        let foa = if params.ambi_order > 1 { 4 } else { 0 };
        (dry, foa, 0)
    } else {
        (params.channels.channel_count(0), 0, 0)
    }
}

// ── Disconnect ───────────────────────────────────────────────────────

/// Latch the device disconnected and notify every attached context
///
/// Safe to call from a backend's error callback: posting to the event
/// rings never blocks.
pub fn handle_disconnect(device: &Arc<Device>, reason: &str) {
    if !device.connected.swap(false, Ordering::AcqRel) {
        return;
    }
    log::warn!("Device \"{}\" disconnected: {}", device.name(), reason);

    if let Ok(contexts) = device.contexts.try_read() {
        for context in contexts.iter() {
            context.post_event(AsyncEvent::DeviceDisconnected {
                reason: reason.to_string(),
            });
        }
    }
}

/// Disconnect while the caller already holds the backend lock, taking
/// the backend's mixer exclusion around the state flip
fn disconnect_locked(device: &Arc<Device>, backend: Option<&dyn Backend>, reason: &str) {
    match backend {
        Some(backend) => {
            let _guard = backend.mixer_lock();
            handle_disconnect(device, reason);
        }
        None => handle_disconnect(device, reason),
    }
}
