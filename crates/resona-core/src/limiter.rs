//! Output gain limiter
//!
//! Feed-forward lookahead limiter installed on the device's real output
//! when the sample type (or config) asks for one. The lookahead delay it
//! introduces is reported through the device's fixed latency.
//!
//! The algorithm: every input frame is written to a per-channel delay
//! line; the frame peak against the threshold yields a target gain; a
//! sliding-window minimum over the lookahead window drives an
//! exponential envelope (fast attack that converges within the lookahead,
//! slow release), and the delayed audio is scaled by the smoothed gain.

/// Upper bound on the delay line (covers the lookahead at 192 kHz)
const MAX_DELAY: usize = 1024;

/// Lookahead window in seconds
const LOOKAHEAD_SECS: f32 = 0.0015;

/// Release time-constant in seconds
const RELEASE_SECS: f32 = 0.1;

/// Multichannel lookahead limiter for the device output stage
///
/// Only ever reduces gain; below-threshold audio passes through delayed
/// but otherwise untouched.
pub struct OutputLimiter {
    threshold: f32,
    lookahead: usize,
    channels: usize,

    /// Per-channel delay lines, all sharing one write cursor
    delay: Vec<[f32; MAX_DELAY]>,
    target_gains: [f32; MAX_DELAY],
    write_pos: usize,

    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl OutputLimiter {
    /// Create a limiter for `channels` output channels at `sample_rate`
    ///
    /// `threshold_db` is the ceiling in dBFS (0.0 or below).
    pub fn new(channels: usize, sample_rate: u32, threshold_db: f32) -> Self {
        let threshold = 10.0_f32.powf(threshold_db / 20.0);

        let lookahead = (LOOKAHEAD_SECS * sample_rate as f32).round() as usize;
        let lookahead = lookahead.clamp(1, MAX_DELAY);

        // Attack converges 99% within the lookahead window:
        //   coeff^N = 0.01  ->  coeff = exp(ln 0.01 / N)
        let attack_coeff = (-4.605_17 / lookahead as f32).exp();
        let release_coeff = (-1.0 / (RELEASE_SECS * sample_rate as f32)).exp();

        OutputLimiter {
            threshold,
            lookahead,
            channels,
            delay: vec![[0.0; MAX_DELAY]; channels],
            target_gains: [1.0; MAX_DELAY],
            write_pos: 0,
            gain: 1.0,
            attack_coeff,
            release_coeff,
        }
    }

    /// Delay introduced by the lookahead, in samples
    pub fn lookahead_samples(&self) -> usize {
        self.lookahead
    }

    /// Process `frames` frames of planar audio in place
    ///
    /// `planar` holds `channels` runs of `stride` samples each; only the
    /// first `frames` of every run are touched.
    pub fn process(&mut self, planar: &mut [f32], stride: usize, frames: usize) {
        debug_assert!(planar.len() >= self.channels * stride);
        debug_assert!(frames <= stride);

        for i in 0..frames {
            let mut peak = 0.0f32;
            for ch in 0..self.channels {
                peak = peak.max(planar[ch * stride + i].abs());
            }

            let target = if peak > self.threshold {
                self.threshold / peak
            } else {
                1.0
            };
            self.target_gains[self.write_pos] = target;

            let min_gain = self.window_min_gain();
            if min_gain < self.gain {
                self.gain = self.gain * self.attack_coeff + min_gain * (1.0 - self.attack_coeff);
            } else {
                self.gain = self.gain * self.release_coeff + min_gain * (1.0 - self.release_coeff);
            }

            let read_pos = (self.write_pos + MAX_DELAY - self.lookahead) % MAX_DELAY;
            for ch in 0..self.channels {
                let sample = &mut planar[ch * stride + i];
                let delayed = self.delay[ch][read_pos] * self.gain;
                self.delay[ch][self.write_pos] = *sample;
                *sample = delayed;
            }

            self.write_pos = (self.write_pos + 1) % MAX_DELAY;
        }
    }

    /// Minimum target gain across the current lookahead window
    #[inline]
    fn window_min_gain(&self) -> f32 {
        let mut min = 1.0f32;
        for i in 0..self.lookahead {
            let pos = (self.write_pos + MAX_DELAY - i) % MAX_DELAY;
            min = min.min(self.target_gains[pos]);
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(limiter: &mut OutputLimiter, level: f32, frames: usize) -> Vec<f32> {
        let mut buf = vec![level; frames];
        limiter.process(&mut buf, frames, frames);
        buf
    }

    #[test]
    fn test_below_threshold_is_transparent() {
        let mut limiter = OutputLimiter::new(1, 48000, -0.3);
        let level = limiter.threshold * 0.5;

        // Warm the delay line, then feed a steady sub-threshold signal.
        run(&mut limiter, 0.0, 256);
        let out = run(&mut limiter, level, 256);

        for &s in &out[limiter.lookahead..] {
            assert!((s - level).abs() < 1e-5, "sample {} vs {}", s, level);
        }
    }

    #[test]
    fn test_hot_signal_is_held_at_threshold() {
        let mut limiter = OutputLimiter::new(2, 48000, -0.3);
        let threshold = limiter.threshold;

        let mut buf = vec![threshold * 2.0; 2 * 512];
        limiter.process(&mut buf, 512, 512);

        // After the attack converges, output sits at or below the ceiling
        // (small tolerance for the exponential envelope).
        for &s in &buf[256..512] {
            assert!(s <= threshold * 1.05, "{} exceeds {}", s, threshold);
        }
    }

    #[test]
    fn test_lookahead_matches_rate() {
        let limiter = OutputLimiter::new(2, 48000, -0.3);
        assert_eq!(limiter.lookahead_samples(), 72);

        let limiter = OutputLimiter::new(2, 44100, -0.3);
        assert_eq!(limiter.lookahead_samples(), 66);
    }
}
