//! Null backend
//!
//! Accepts any format and paces the mixer from a plain thread by wall
//! clock, discarding the rendered audio. Useful on machines without
//! audio hardware and for exercising the full device lifecycle in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::device::Device;
use crate::error::RtResult;
use crate::mixer;

use super::{Backend, BackendFactory, BackendKind};

const NULL_DEVICE_NAME: &str = "Null Output";

pub struct NullFactory;

impl BackendFactory for NullFactory {
    fn name(&self) -> &'static str {
        "null"
    }

    fn init(&self) -> bool {
        true
    }

    fn supports(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Playback
    }

    fn probe(&self, kind: BackendKind) -> Vec<String> {
        match kind {
            BackendKind::Playback => vec![NULL_DEVICE_NAME.to_string()],
            _ => Vec::new(),
        }
    }

    fn create(&self, device: Arc<Device>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        if kind != BackendKind::Playback {
            return None;
        }
        Some(Box::new(NullBackend {
            device,
            mix_lock: Arc::new(Mutex::new(())),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

struct NullBackend {
    device: Arc<Device>,
    mix_lock: Arc<Mutex<()>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Backend for NullBackend {
    fn open(&mut self, name: Option<&str>) -> RtResult<()> {
        if let Some(name) = name {
            if name != NULL_DEVICE_NAME {
                return Err(crate::error::RtError::InvalidValue);
            }
        }
        self.device.set_name(NULL_DEVICE_NAME);
        Ok(())
    }

    fn reset(&mut self) -> bool {
        // Every requested format is accepted as-is.
        true
    }

    fn start(&mut self) -> bool {
        if self.thread.is_some() {
            return true;
        }
        self.stop.store(false, Ordering::Release);

        let device = Arc::clone(&self.device);
        let mix_lock = Arc::clone(&self.mix_lock);
        let stop = Arc::clone(&self.stop);

        let handle = thread::Builder::new()
            .name("resona-null-mixer".to_string())
            .spawn(move || {
                let (frequency, update_size) = device.mix_timing();
                let step = Duration::from_secs_f64(update_size as f64 / frequency as f64);
                let mut deadline = Instant::now() + step;

                while !stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < deadline {
                        thread::sleep(deadline - now);
                    }
                    deadline += step;

                    let _guard = mix_lock.lock().unwrap();
                    mixer::mix_discard(&device, update_size as usize);
                }
            });

        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(e) => {
                log::error!("Failed to spawn null mixer thread: {}", e);
                false
            }
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn mixer_lock(&self) -> MutexGuard<'_, ()> {
        self.mix_lock.lock().unwrap()
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        Backend::stop(self);
    }
}
