//! Loopback backend
//!
//! No device, no thread: the application drives rendering explicitly
//! through `render_samples`, which mixes under this backend's lock. The
//! format comes entirely from context/reset attributes, so `reset`
//! accepts whatever the device params hold.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::Device;
use crate::error::RtResult;

use super::{Backend, BackendFactory, BackendKind};

pub struct LoopbackFactory;

impl BackendFactory for LoopbackFactory {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn init(&self) -> bool {
        true
    }

    fn supports(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Loopback
    }

    fn probe(&self, _kind: BackendKind) -> Vec<String> {
        Vec::new()
    }

    fn create(&self, device: Arc<Device>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        if kind != BackendKind::Loopback {
            return None;
        }
        Some(Box::new(LoopbackBackend {
            device,
            mix_lock: Arc::new(Mutex::new(())),
        }))
    }
}

struct LoopbackBackend {
    device: Arc<Device>,
    mix_lock: Arc<Mutex<()>>,
}

impl Backend for LoopbackBackend {
    fn open(&mut self, _name: Option<&str>) -> RtResult<()> {
        self.device.set_name("Loopback");
        Ok(())
    }

    fn reset(&mut self) -> bool {
        true
    }

    fn start(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {}

    fn mixer_lock(&self) -> MutexGuard<'_, ()> {
        self.mix_lock.lock().unwrap()
    }
}
