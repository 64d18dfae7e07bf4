//! The mix pass
//!
//! The sample-level DSP of the renderer lives elsewhere; what matters
//! here is the calling contract the device core guarantees around it:
//! every pass is bracketed by mix-count increments, published property
//! updates are applied at the top of each block (unless the context is
//! holding them), voices advance through their buffer queues, slot
//! effects run on their wet input, the limiter shapes the real output,
//! and the sample counter advances exactly once per rendered frame.
//!
//! The mixer never takes an API lock: everything shared is reached via
//! `try_lock`/`try_read`, and a contended structure (only possible while
//! an API thread is mid-reconfiguration) renders as silence.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::Context;
use crate::device::{Device, MixState};
use crate::events::AsyncEvent;
use crate::source::SourceState;
use crate::types::SampleType;
use crate::voice::{Voice, VoiceMixState};

/// Band edges for send wet-path shaping
const SEND_LF_REFERENCE: f32 = 250.0;
const SEND_HF_REFERENCE: f32 = 5000.0;

/// One-pole lowpass coefficient for a cutoff at the given rate
fn one_pole_coeff(cutoff: f32, sample_rate: f32) -> f32 {
    let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff);
    let dt = 1.0 / sample_rate;
    dt / (rc + dt)
}

/// Render and discard (null backend pacing)
pub fn mix_discard(device: &Arc<Device>, frames: usize) {
    run_mix(device, frames, |_, _, _| {});
}

/// Render into an interleaved f32 stream buffer (cpal output callback)
///
/// Extra stream channels beyond the mix layout are zero-filled.
pub fn mix_interleaved_f32(device: &Arc<Device>, data: &mut [f32], channels: usize) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    data.fill(0.0);
    run_mix(device, frames, |mix, offset, n| {
        let base = mix.output_offset();
        let out_channels = mix.output_channels();
        for i in 0..n {
            let frame = &mut data[(offset + i) * channels..(offset + i + 1) * channels];
            for (ch, sample) in frame.iter_mut().enumerate().take(out_channels.min(channels)) {
                *sample = mix.buffer[(base + ch) * mix.stride + i];
            }
        }
    });
}

/// Render into a typed interleaved byte buffer (loopback rendering)
pub fn mix_typed(device: &Arc<Device>, out: &mut [u8], frames: usize) {
    let sample_type = match device.params().try_read() {
        Ok(params) => params.sample_type,
        Err(_) => SampleType::F32,
    };
    let sample_bytes = sample_type.bytes();
    out.fill(0);
    run_mix(device, frames, |mix, offset, n| {
        let base = mix.output_offset();
        let out_channels = mix.output_channels();
        let frame_bytes = out_channels * sample_bytes;
        for i in 0..n {
            for ch in 0..out_channels {
                let sample = mix.buffer[(base + ch) * mix.stride + i];
                let at = (offset + i) * frame_bytes + ch * sample_bytes;
                sample_type.write_sample(sample, &mut out[at..at + sample_bytes]);
            }
        }
    });
}

/// One full mix pass, chunked by the device update size
fn run_mix(
    device: &Arc<Device>,
    total_frames: usize,
    mut sink: impl FnMut(&MixState, usize, usize),
) {
    device.mix_count.fetch_add(1, Ordering::AcqRel);

    if let Ok(mut mix) = device.mix.try_lock() {
        let stride = mix.stride.max(1);
        let connected = device.is_connected();
        let mut done = 0;
        while done < total_frames {
            let n = (total_frames - done).min(stride);
            mix_chunk(device, &mut mix, n, connected);
            sink(&mix, done, n);
            done += n;
        }
    }

    device
        .samples_done
        .fetch_add(total_frames as u64, Ordering::AcqRel);
    device.mix_count.fetch_add(1, Ordering::AcqRel);
}

fn mix_chunk(device: &Arc<Device>, mix: &mut MixState, frames: usize, connected: bool) {
    mix.buffer.fill(0.0);

    if connected {
        if let Ok(contexts) = device.contexts.try_read() {
            for context in contexts.iter() {
                process_context(context, mix, frames);
            }
        }
    }

    fold_output(mix, frames);

    if let Some(limiter) = mix.limiter.take() {
        // Taken out to split the borrow; the limiter processes the real
        // output region in place.
        let mut limiter = limiter;
        let base = mix.output_offset() * mix.stride;
        let len = mix.output_channels() * mix.stride;
        limiter.process(&mut mix.buffer[base..base + len], mix.stride, frames);
        mix.limiter = Some(limiter);
    }
}

fn process_context(context: &Arc<Context>, mix: &mut MixState, frames: usize) {
    // Apply published updates unless the API thread is staging a batch.
    if !context.hold_updates.load(Ordering::Acquire) {
        context.update_count.fetch_add(1, Ordering::AcqRel);

        context.props.consume(|update| {
            if let Ok(mut applied) = context.mix_params.try_lock() {
                *applied = update.clone();
            }
        });
        context.listener_props.consume(|_update| {
            // Listener parameters feed the spatializer; the state scaffold
            // only needs them consumed and recycled.
        });
        if let Ok(slots) = context.active_slots.try_read() {
            for slot in slots.iter() {
                slot.apply_update();
            }
        }
        if let Ok(voices) = context.voices.try_read() {
            for voice in &voices.voices[..voices.count] {
                voice.apply_update();
            }
        }

        context.update_count.fetch_add(1, Ordering::AcqRel);
    }

    let gain_boost = context
        .mix_params
        .try_lock()
        .map(|p| if p.gain_boost > 0.0 { p.gain_boost } else { 1.0 })
        .unwrap_or(1.0);

    if let Ok(voices) = context.voices.try_read() {
        for voice in &voices.voices[..voices.count] {
            let source_id = voice.source_id.load(Ordering::Acquire);
            if source_id == 0 || !voice.playing.load(Ordering::Acquire) {
                continue;
            }
            mix_voice(context, voice, source_id, mix, frames, gain_boost);
        }
    }

    // Run each slot's effect over the wet input the voices accumulated.
    if let Ok(slots) = context.active_slots.try_read() {
        for slot in slots.iter() {
            let Ok(mut slot_mix) = slot.mix.try_lock() else {
                continue;
            };
            if slot_mix.wet_buffer.is_empty() {
                continue;
            }
            let slot_gain = slot_mix.gain;
            let wet: Vec<f32> = slot_mix
                .wet_buffer
                .iter()
                .take(frames)
                .map(|s| s * slot_gain)
                .collect();
            let out = &mut mix.buffer[..frames.min(mix.stride)];
            slot_mix.state.process(&wet, out, frames);
            slot_mix.wet_buffer.fill(0.0);
        }
    }
}

fn mix_voice(
    context: &Arc<Context>,
    voice: &Voice,
    source_id: u32,
    mix: &mut MixState,
    frames: usize,
    gain_boost: f32,
) {
    let Ok(mut vm) = voice.mix.try_lock() else {
        return;
    };

    let MixState {
        buffer,
        scratch,
        stride,
        frequency,
        dry_channels,
        ..
    } = mix;
    let stride = *stride;
    let rate = (*frequency).max(1) as f32;
    let dry_channels = *dry_channels;

    let mut pos = voice.position.load(Ordering::Relaxed) as usize;
    let mut finished = false;

    for sample_out in scratch.iter_mut().take(frames) {
        let sample = loop {
            if vm.queue_index >= vm.queue.len() {
                if vm.looping && !vm.queue.is_empty() {
                    vm.queue_index = 0;
                    pos = 0;
                    continue;
                }
                finished = true;
                break 0.0;
            }
            let entry = &vm.queue[vm.queue_index];
            if entry.frames == 0 || pos >= entry.frames {
                vm.queue_index += 1;
                pos = 0;
                continue;
            }
            let index = pos * entry.channels;
            break entry.data.get(index).copied().unwrap_or(0.0);
        };
        if finished {
            *sample_out = 0.0;
            continue;
        }
        *sample_out = sample * vm.gain * gain_boost;

        vm.frac += vm.step.max(0.0) as f64;
        let advance = vm.frac as usize;
        vm.frac -= advance as f64;
        pos += advance;
    }

    for ch in 0..dry_channels {
        let channel = &mut buffer[ch * stride..ch * stride + frames];
        for (out, s) in channel.iter_mut().zip(scratch.iter()) {
            *out += *s;
        }
    }

    let low_coeff = one_pole_coeff(SEND_LF_REFERENCE, rate);
    let high_coeff = one_pole_coeff(SEND_HF_REFERENCE, rate);
    let VoiceMixState {
        sends,
        send_filters,
        ..
    } = &mut *vm;
    for (send, filter) in sends.iter().zip(send_filters.iter_mut()) {
        let Some(slot) = &send.slot else { continue };
        let Ok(mut slot_mix) = slot.mix.try_lock() else {
            continue;
        };
        let n = frames.min(slot_mix.wet_buffer.len());
        for i in 0..n {
            let x = scratch[i];
            // Split around the band references so gain_lf/gain_hf only
            // shape their share of the spectrum.
            filter.low += low_coeff * (x - filter.low);
            filter.high += high_coeff * (x - filter.high);
            let low = filter.low;
            let mid = filter.high - filter.low;
            let high = x - filter.high;
            slot_mix.wet_buffer[i] += (low * send.gain_lf + mid + high * send.gain_hf) * send.gain;
        }
    }

    voice.position.store(pos as u64, Ordering::Release);

    if finished {
        let completed = vm.queue.len();
        drop(vm);
        voice.clear();
        context.post_event(AsyncEvent::SourceStateChanged {
            source: source_id,
            state: SourceState::Stopped,
        });
        if completed > 0 {
            context.post_event(AsyncEvent::BufferCompleted {
                source: source_id,
                count: completed,
            });
        }
    }
}

/// Fold the dry bus into the real output bus when they are distinct
///
/// The full spatializer renders dry ambisonics and decodes to the real
/// layout; the scaffold folds the omni channel through evenly so output
/// levels stay meaningful.
fn fold_output(mix: &mut MixState, frames: usize) {
    if mix.real_channels == 0 {
        return;
    }
    let base = mix.output_offset();
    for ch in 0..mix.real_channels {
        for i in 0..frames {
            mix.buffer[(base + ch) * mix.stride + i] = mix.buffer[i];
        }
    }
}
