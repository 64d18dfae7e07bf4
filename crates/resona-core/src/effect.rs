//! Effects and filters
//!
//! Effects and filters are parameter containers in device sub-pools; a
//! running DSP instance only exists once an effect is loaded into a slot.
//! The DSP here is deliberately thin — the interesting part for the core
//! is the `EffectState` contract: `device_update` is called with the
//! mixer stopped whenever the device format changes, and `process` runs
//! on the mixer thread.

use crate::types::DEFAULT_OUTPUT_RATE;

/// Reverb parameter set
#[derive(Debug, Clone, PartialEq)]
pub struct ReverbParams {
    pub density: f32,
    pub diffusion: f32,
    pub gain: f32,
    pub gain_hf: f32,
    pub decay_time: f32,
    pub decay_hf_ratio: f32,
    pub reflections_gain: f32,
    pub reflections_delay: f32,
    pub late_gain: f32,
    pub late_delay: f32,
    pub air_absorption_gain_hf: f32,
    pub room_rolloff_factor: f32,
    pub decay_hf_limit: bool,
}

impl Default for ReverbParams {
    fn default() -> Self {
        ReverbParams {
            density: 1.0,
            diffusion: 1.0,
            gain: 0.3162,
            gain_hf: 0.8913,
            decay_time: 1.49,
            decay_hf_ratio: 0.83,
            reflections_gain: 0.05,
            reflections_delay: 0.007,
            late_gain: 1.2589,
            late_delay: 0.011,
            air_absorption_gain_hf: 0.9943,
            room_rolloff_factor: 0.0,
            decay_hf_limit: true,
        }
    }
}

/// Equalizer parameter set (low shelf, two peaking bands, high shelf)
#[derive(Debug, Clone, PartialEq)]
pub struct EqualizerParams {
    pub low_gain: f32,
    pub low_cutoff: f32,
    pub mid1_gain: f32,
    pub mid1_center: f32,
    pub mid1_width: f32,
    pub mid2_gain: f32,
    pub mid2_center: f32,
    pub mid2_width: f32,
    pub high_gain: f32,
    pub high_cutoff: f32,
}

impl Default for EqualizerParams {
    fn default() -> Self {
        EqualizerParams {
            low_gain: 1.0,
            low_cutoff: 200.0,
            mid1_gain: 1.0,
            mid1_center: 500.0,
            mid1_width: 1.0,
            mid2_gain: 1.0,
            mid2_center: 3000.0,
            mid2_width: 1.0,
            high_gain: 1.0,
            high_cutoff: 6000.0,
        }
    }
}

/// Effect configuration stored in the device effect pool
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EffectParams {
    /// Pass-through; a slot loaded with this runs no DSP
    #[default]
    Null,
    Reverb(ReverbParams),
    Equalizer(EqualizerParams),
}

impl EffectParams {
    /// Resolve a named reverb preset from config
    pub fn reverb_preset(name: &str) -> Option<Self> {
        let params = match name.to_ascii_lowercase().as_str() {
            "generic" | "default" => ReverbParams::default(),
            "hall" => ReverbParams {
                decay_time: 3.92,
                decay_hf_ratio: 0.7,
                reflections_gain: 0.0224,
                late_gain: 0.9977,
                ..ReverbParams::default()
            },
            "room" => ReverbParams {
                decay_time: 0.4,
                decay_hf_ratio: 0.83,
                reflections_gain: 0.1503,
                late_gain: 0.0629,
                ..ReverbParams::default()
            },
            _ => return None,
        };
        Some(EffectParams::Reverb(params))
    }
}

/// Filter parameter container (direct and send path shaping)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Filter {
    pub kind: FilterKind,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    #[default]
    Null,
    LowPass,
    HighPass,
    BandPass,
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            kind: FilterKind::Null,
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

/// Running DSP instance owned by an effect slot
///
/// `device_update` is only invoked with the backend stopped; `process`
/// and `update` run on the mixer thread.
pub trait EffectState: Send {
    /// Resize internal buffers for a new device format; false on failure
    fn device_update(&mut self, frequency: u32, channels: usize) -> bool;

    /// Apply new parameters (mixer thread, between blocks)
    fn update(&mut self, params: &EffectParams);

    /// Render `frames` frames from the slot's wet input into `output`
    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize);
}

/// Instantiate the DSP for an effect configuration
pub fn create_state(params: &EffectParams) -> Box<dyn EffectState> {
    match params {
        EffectParams::Null => Box::new(NullState),
        EffectParams::Reverb(_) => Box::new(ReverbState::new()),
        EffectParams::Equalizer(_) => Box::new(EqualizerState::default()),
    }
}

/// Pass-through state for null effects
struct NullState;

impl EffectState for NullState {
    fn device_update(&mut self, _frequency: u32, _channels: usize) -> bool {
        true
    }

    fn update(&mut self, _params: &EffectParams) {}

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let n = frames.min(input.len()).min(output.len());
        for (out, sample) in output[..n].iter_mut().zip(&input[..n]) {
            *out += *sample;
        }
    }
}

/// Minimal feedback-delay reverb
///
/// A single pre-delay plus feedback loop; enough to give the slot a real
/// state with device-format-dependent allocation.
struct ReverbState {
    delay: Vec<f32>,
    write_pos: usize,
    feedback: f32,
    gain: f32,
}

impl ReverbState {
    fn new() -> Self {
        ReverbState {
            delay: Vec::new(),
            write_pos: 0,
            feedback: 0.5,
            gain: 0.3162,
        }
    }
}

impl EffectState for ReverbState {
    fn device_update(&mut self, frequency: u32, _channels: usize) -> bool {
        // 50 ms loop delay at the device rate.
        let len = (frequency as usize / 20).max(1);
        self.delay.clear();
        self.delay.resize(len, 0.0);
        self.write_pos = 0;
        true
    }

    fn update(&mut self, params: &EffectParams) {
        if let EffectParams::Reverb(r) = params {
            self.gain = r.gain;
            // Map decay time onto loop feedback: -60 dB over decay_time
            // with a 50 ms loop.
            let loops = (r.decay_time / 0.05).max(1.0);
            self.feedback = 0.001f32.powf(1.0 / loops);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        if self.delay.is_empty() {
            return;
        }
        let n = frames.min(input.len()).min(output.len());
        for i in 0..n {
            let delayed = self.delay[self.write_pos];
            self.delay[self.write_pos] = input[i] + delayed * self.feedback;
            output[i] += delayed * self.gain;
            self.write_pos = (self.write_pos + 1) % self.delay.len();
        }
    }
}

/// Biquad state for one equalizer band
#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    fn peaking(freq: f32, gain: f32, q: f32, sample_rate: f32) -> Self {
        let a = gain.max(1e-4).sqrt();
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha / a;
        Biquad {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * w0.cos()) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * w0.cos()) / a0,
            a2: (1.0 - alpha / a) / a0,
            ..Default::default()
        }
    }

    fn run(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Two peaking bands; shelves are folded into the same biquad form
#[derive(Default)]
struct EqualizerState {
    frequency: u32,
    band1: Biquad,
    band2: Biquad,
}

impl EffectState for EqualizerState {
    fn device_update(&mut self, frequency: u32, _channels: usize) -> bool {
        self.frequency = frequency;
        true
    }

    fn update(&mut self, params: &EffectParams) {
        if let EffectParams::Equalizer(eq) = params {
            let rate = if self.frequency > 0 {
                self.frequency as f32
            } else {
                DEFAULT_OUTPUT_RATE as f32
            };
            self.band1 = Biquad::peaking(eq.mid1_center, eq.mid1_gain, eq.mid1_width, rate);
            self.band2 = Biquad::peaking(eq.mid2_center, eq.mid2_gain, eq.mid2_width, rate);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let n = frames.min(input.len()).min(output.len());
        for i in 0..n {
            output[i] += self.band2.run(self.band1.run(input[i]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverb_preset_lookup() {
        assert!(matches!(
            EffectParams::reverb_preset("generic"),
            Some(EffectParams::Reverb(_))
        ));
        assert!(EffectParams::reverb_preset("nonexistent").is_none());
    }

    #[test]
    fn test_null_state_passes_through() {
        let mut state = create_state(&EffectParams::Null);
        assert!(state.device_update(48000, 2));
        let input = [0.25f32; 64];
        let mut output = [0.0f32; 64];
        state.process(&input, &mut output, 64);
        assert_eq!(output, input);
    }

    #[test]
    fn test_reverb_state_resizes_with_device() {
        let mut state = ReverbState::new();
        assert!(state.device_update(48000, 2));
        assert_eq!(state.delay.len(), 2400);
        assert!(state.device_update(44100, 2));
        assert_eq!(state.delay.len(), 2205);
    }

    #[test]
    fn test_reverb_produces_tail() {
        let mut state = ReverbState::new();
        state.device_update(8000, 1);
        state.update(&EffectParams::Reverb(ReverbParams::default()));

        // An impulse, then silence long enough to flush the pre-delay.
        let mut impulse = vec![0.0f32; 1024];
        impulse[0] = 1.0;
        let mut output = vec![0.0f32; 1024];
        state.process(&impulse, &mut output, 1024);

        let silence = vec![0.0f32; 1024];
        let mut tail = vec![0.0f32; 1024];
        state.process(&silence, &mut tail, 1024);
        assert!(tail.iter().any(|&s| s.abs() > 0.0));
    }
}
