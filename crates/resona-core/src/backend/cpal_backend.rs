//! cpal backend
//!
//! Adapts cpal output/input streams to the backend contract. The stream
//! object stays on a dedicated worker thread for its whole life (several
//! cpal hosts hand out streams that must not cross threads); start/stop
//! talk to the worker through a handshake channel and a stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

use crate::device::{handle_disconnect, Device};
use crate::error::{RtError, RtResult};
use crate::mixer;
use crate::types::ChannelLayout;

use super::{Backend, BackendFactory, BackendKind};

pub struct CpalFactory;

impl BackendFactory for CpalFactory {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn init(&self) -> bool {
        // The default host always constructs; report failure only when it
        // cannot enumerate at all.
        true
    }

    fn supports(&self, kind: BackendKind) -> bool {
        matches!(kind, BackendKind::Playback | BackendKind::Capture)
    }

    fn probe(&self, kind: BackendKind) -> Vec<String> {
        let host = cpal::default_host();
        let devices = match kind {
            BackendKind::Playback => host.output_devices().ok().map(|d| d.collect::<Vec<_>>()),
            BackendKind::Capture => host.input_devices().ok().map(|d| d.collect::<Vec<_>>()),
            BackendKind::Loopback => None,
        };
        devices
            .unwrap_or_default()
            .iter()
            .filter_map(|d| d.name().ok())
            .collect()
    }

    fn create(&self, device: Arc<Device>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        match kind {
            BackendKind::Playback => Some(Box::new(CpalPlayback {
                device,
                endpoint: None,
                negotiated: None,
                mix_lock: Arc::new(Mutex::new(())),
                worker: None,
            })),
            BackendKind::Capture => Some(Box::new(CpalCapture {
                device,
                endpoint: None,
                consumer: None,
                mix_lock: Arc::new(Mutex::new(())),
                worker: None,
            })),
            BackendKind::Loopback => None,
        }
    }
}

/// Find an endpoint by name, or the default one
fn find_output(name: Option<&str>) -> Option<(cpal::Device, String)> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .map(|d| (d, wanted.to_string())),
        None => {
            let device = host.default_output_device()?;
            let name = device.name().unwrap_or_else(|_| "Default Output".into());
            Some((device, name))
        }
    }
}

fn find_input(name: Option<&str>) -> Option<(cpal::Device, String)> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .map(|d| (d, wanted.to_string())),
        None => {
            let device = host.default_input_device()?;
            let name = device.name().unwrap_or_else(|_| "Default Input".into());
            Some((device, name))
        }
    }
}

/// Map a negotiated channel count back onto a mix layout
fn layout_for_channels(count: u16) -> ChannelLayout {
    match count {
        1 => ChannelLayout::Mono,
        2 | 3 => ChannelLayout::Stereo,
        4 | 5 => ChannelLayout::Quad,
        6 => ChannelLayout::X51,
        7 => ChannelLayout::X61,
        _ => ChannelLayout::X71,
    }
}

/// Worker thread owning a cpal stream
struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StreamWorker {
    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
        let _ = self.handle.join();
    }
}

/// Negotiated stream parameters carried from reset to start
#[derive(Clone)]
struct Negotiated {
    channels: u16,
    sample_rate: u32,
    buffer_frames: u32,
}

pub struct CpalPlayback {
    device: Arc<Device>,
    endpoint: Option<String>,
    negotiated: Option<Negotiated>,
    mix_lock: Arc<Mutex<()>>,
    worker: Option<StreamWorker>,
}

impl Backend for CpalPlayback {
    fn open(&mut self, name: Option<&str>) -> RtResult<()> {
        let (_, resolved) = find_output(name).ok_or(RtError::InvalidValue)?;
        log::info!("Opened playback endpoint \"{}\"", resolved);
        self.device.set_name(&resolved);
        self.endpoint = Some(resolved);
        Ok(())
    }

    fn reset(&mut self) -> bool {
        let Some((endpoint, _)) = find_output(self.endpoint.as_deref()) else {
            log::error!("Playback endpoint disappeared during reset");
            return false;
        };

        let (want_freq, want_channels, update_size) = {
            let params = self.device.params().read().unwrap();
            (
                params.frequency,
                params.channels.channel_count(params.ambi_order) as u16,
                params.update_size,
            )
        };

        let ranges: Vec<_> = match endpoint.supported_output_configs() {
            Ok(r) => r.collect(),
            Err(e) => {
                log::error!("Failed to query output configs: {}", e);
                return false;
            }
        };
        if ranges.is_empty() {
            return false;
        }

        // Prefer f32, matching channel count, and the requested rate.
        let best = ranges
            .iter()
            .filter(|r| r.sample_format() == SampleFormat::F32)
            .filter(|r| r.channels() == want_channels)
            .find(|r| want_freq >= r.min_sample_rate().0 && want_freq <= r.max_sample_rate().0)
            .or_else(|| {
                ranges
                    .iter()
                    .filter(|r| r.sample_format() == SampleFormat::F32)
                    .find(|r| r.channels() >= 2)
            })
            .or_else(|| ranges.first());
        let Some(range) = best else { return false };

        let sample_rate = want_freq.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        let channels = range.channels();
        let buffer_frames = match range.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => update_size.clamp(*min, *max),
            cpal::SupportedBufferSize::Unknown => update_size,
        };

        {
            let mut params = self.device.params().write().unwrap();
            params.frequency = sample_rate;
            params.channels = layout_for_channels(channels);
            params.sample_type = crate::types::SampleType::F32;
            params.update_size = buffer_frames;
        }

        log::info!(
            "Negotiated playback stream: {} channels, {}Hz, {} frames",
            channels,
            sample_rate,
            buffer_frames
        );
        self.negotiated = Some(Negotiated {
            channels,
            sample_rate,
            buffer_frames,
        });
        true
    }

    fn start(&mut self) -> bool {
        if self.worker.is_some() {
            return true;
        }
        let Some(negotiated) = self.negotiated.clone() else {
            return false;
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let device = Arc::clone(&self.device);
        let mix_lock = Arc::clone(&self.mix_lock);
        let endpoint_name = self.endpoint.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<bool>();

        let handle = thread::Builder::new()
            .name("resona-cpal-out".to_string())
            .spawn(move || {
                let Some((endpoint, _)) = find_output(endpoint_name.as_deref()) else {
                    let _ = ready_tx.send(false);
                    return;
                };
                let config = StreamConfig {
                    channels: negotiated.channels,
                    sample_rate: SampleRate(negotiated.sample_rate),
                    buffer_size: cpal::BufferSize::Fixed(negotiated.buffer_frames),
                };
                let channels = negotiated.channels as usize;

                let cb_device = Arc::clone(&device);
                let cb_lock = Arc::clone(&mix_lock);
                let err_device = Arc::clone(&device);
                let stream = endpoint.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let _guard = cb_lock.lock().unwrap();
                        mixer::mix_interleaved_f32(&cb_device, data, channels);
                    },
                    move |err| {
                        log::error!("Playback stream error: {}", err);
                        handle_disconnect(&err_device, &format!("Stream failure: {}", err));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("Failed to build playback stream: {}", e);
                        let _ = ready_tx.send(false);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    log::error!("Failed to start playback stream: {}", e);
                    let _ = ready_tx.send(false);
                    return;
                }
                let _ = ready_tx.send(true);

                while !thread_stop.load(Ordering::Acquire) {
                    thread::park_timeout(Duration::from_millis(100));
                }
                drop(stream);
            });

        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                log::error!("Failed to spawn stream worker: {}", e);
                return false;
            }
        };

        if ready_rx.recv().unwrap_or(false) {
            self.worker = Some(StreamWorker { stop, handle });
            true
        } else {
            let _ = handle.join();
            false
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Exclude the callback for the final moments of the stream.
            worker.stop();
        }
    }

    fn mixer_lock(&self) -> MutexGuard<'_, ()> {
        self.mix_lock.lock().unwrap()
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        Backend::stop(self);
    }
}

pub struct CpalCapture {
    device: Arc<Device>,
    endpoint: Option<String>,
    consumer: Option<rtrb::Consumer<f32>>,
    mix_lock: Arc<Mutex<()>>,
    worker: Option<StreamWorker>,
}

impl Backend for CpalCapture {
    fn open(&mut self, name: Option<&str>) -> RtResult<()> {
        let (_, resolved) = find_input(name).ok_or(RtError::InvalidValue)?;
        log::info!("Opened capture endpoint \"{}\"", resolved);
        self.device.set_name(&resolved);
        self.endpoint = Some(resolved);
        Ok(())
    }

    fn reset(&mut self) -> bool {
        // Capture format is pinned by the caller at open time; the stream
        // itself is configured at start.
        true
    }

    fn start(&mut self) -> bool {
        if self.worker.is_some() {
            return true;
        }

        let (frequency, channels, buffer_frames) = {
            let params = self.device.params().read().unwrap();
            (
                params.frequency,
                params.channels.channel_count(0) as u16,
                (params.update_size * params.num_updates) as usize,
            )
        };

        // Ring sized to the requested buffer depth plus slack for timing
        // jitter between the stream and the reader.
        let capacity = (buffer_frames * channels as usize * 2).max(8192);
        let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let endpoint_name = self.endpoint.clone();
        let err_device = Arc::clone(&self.device);
        let (ready_tx, ready_rx) = mpsc::channel::<bool>();

        let handle = thread::Builder::new()
            .name("resona-cpal-in".to_string())
            .spawn(move || {
                let Some((endpoint, _)) = find_input(endpoint_name.as_deref()) else {
                    let _ = ready_tx.send(false);
                    return;
                };
                let config = StreamConfig {
                    channels,
                    sample_rate: SampleRate(frequency),
                    buffer_size: cpal::BufferSize::Default,
                };

                let stream = endpoint.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            if producer.push(sample).is_err() {
                                // Ring full: the reader fell behind; drop
                                // the remainder of this block.
                                break;
                            }
                        }
                    },
                    move |err| {
                        log::error!("Capture stream error: {}", err);
                        handle_disconnect(&err_device, &format!("Stream failure: {}", err));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("Failed to build capture stream: {}", e);
                        let _ = ready_tx.send(false);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    log::error!("Failed to start capture stream: {}", e);
                    let _ = ready_tx.send(false);
                    return;
                }
                let _ = ready_tx.send(true);

                while !thread_stop.load(Ordering::Acquire) {
                    thread::park_timeout(Duration::from_millis(100));
                }
                drop(stream);
            });

        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                log::error!("Failed to spawn capture worker: {}", e);
                return false;
            }
        };

        if ready_rx.recv().unwrap_or(false) {
            self.consumer = Some(consumer);
            self.worker = Some(StreamWorker { stop, handle });
            true
        } else {
            let _ = handle.join();
            false
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.consumer = None;
    }

    fn mixer_lock(&self) -> MutexGuard<'_, ()> {
        self.mix_lock.lock().unwrap()
    }

    fn available_samples(&mut self) -> usize {
        let channels = {
            let params = self.device.params().read().unwrap();
            params.channels.channel_count(0)
        };
        self.consumer
            .as_ref()
            .map(|c| c.slots() / channels)
            .unwrap_or(0)
    }

    fn capture_samples(&mut self, out: &mut [u8], frames: usize) -> RtResult<()> {
        let (channels, sample_type) = {
            let params = self.device.params().read().unwrap();
            (params.channels.channel_count(0), params.sample_type)
        };
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(RtError::InvalidDevice);
        };
        if consumer.slots() / channels < frames {
            return Err(RtError::InvalidValue);
        }

        let sample_bytes = sample_type.bytes();
        let needed = frames * channels * sample_bytes;
        if out.len() < needed {
            return Err(RtError::InvalidValue);
        }

        for i in 0..frames * channels {
            let sample = consumer.pop().unwrap_or(0.0);
            let offset = i * sample_bytes;
            sample_type.write_sample(sample, &mut out[offset..offset + sample_bytes]);
        }
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        Backend::stop(self);
    }
}
