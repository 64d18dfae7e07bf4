//! Sample buffers
//!
//! Plain parameter containers living in a device sub-pool. The sample
//! payload is held behind a deferred-release shared pointer so a voice
//! can keep reading data whose buffer the application already deleted;
//! the attachment count blocks deletion while a source queue or static
//! binding still references the handle.

use std::sync::atomic::{AtomicU32, Ordering};

use basedrop::Shared;

use crate::error::{RtError, RtResult};
use crate::release::shared_handle;
use crate::types::{CompositeFormat, SampleType};

/// One buffer slab entry
pub struct Buffer {
    /// Interleaved f32 payload; empty until data is uploaded
    pub data: Shared<Vec<f32>>,
    pub channels: usize,
    pub frequency: u32,
    pub frames: usize,
    /// Source queue / static-binding attachments
    ref_count: AtomicU32,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            data: Shared::new(&shared_handle(), Vec::new()),
            channels: 1,
            frequency: 0,
            frames: 0,
            ref_count: AtomicU32::new(0),
        }
    }

    /// Upload samples, replacing the previous payload
    ///
    /// Fails with `InvalidValue` while the buffer is attached to any
    /// source, and with `InvalidValue` when `bytes` is not a whole number
    /// of frames.
    pub fn set_data(
        &mut self,
        format: CompositeFormat,
        bytes: &[u8],
        frequency: u32,
    ) -> RtResult<()> {
        if self.attached() {
            return Err(RtError::InvalidValue);
        }
        let (layout, sample_type) = format.decompose();
        let channels = layout.channel_count(0);
        let frame_bytes = channels * sample_type.bytes();
        if frame_bytes == 0 || bytes.len() % frame_bytes != 0 {
            return Err(RtError::InvalidValue);
        }

        let samples = decode_samples(sample_type, bytes);
        self.frames = samples.len() / channels;
        self.channels = channels;
        self.frequency = frequency;
        self.data = Shared::new(&shared_handle(), samples);
        Ok(())
    }

    pub fn attached(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) != 0
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "buffer reference underflow");
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode typed sample bytes into normalized f32
fn decode_samples(sample_type: SampleType, bytes: &[u8]) -> Vec<f32> {
    match sample_type {
        SampleType::U8 => bytes.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        SampleType::I8 => bytes.iter().map(|&b| b as i8 as f32 / 128.0).collect(),
        SampleType::I16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleType::U16 => bytes
            .chunks_exact(2)
            .map(|c| (u16::from_ne_bytes([c[0], c[1]]) as f32 - 32768.0) / 32768.0)
            .collect(),
        SampleType::I32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2147483648.0)
            .collect(),
        SampleType::U32 => bytes
            .chunks_exact(4)
            .map(|c| {
                (u32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2147483648.0 - 1.0) as f32
            })
            .collect(),
        SampleType::F32 => match bytemuck::try_cast_slice::<u8, f32>(bytes) {
            Ok(floats) => floats.to_vec(),
            // Caller data is not guaranteed 4-byte aligned.
            Err(_) => bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_decodes_i16() {
        let mut buffer = Buffer::new();
        let samples: [i16; 4] = [0, 16384, -16384, 32767];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        buffer
            .set_data(CompositeFormat::Mono16, bytes, 44100)
            .unwrap();

        assert_eq!(buffer.frames, 4);
        assert_eq!(buffer.channels, 1);
        assert!((buffer.data[1] - 0.5).abs() < 1e-4);
        assert!((buffer.data[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_upload_rejects_partial_frame() {
        let mut buffer = Buffer::new();
        // Stereo16 frames are 4 bytes; 6 bytes is one and a half frames.
        let err = buffer
            .set_data(CompositeFormat::Stereo16, &[0u8; 6], 44100)
            .unwrap_err();
        assert_eq!(err, RtError::InvalidValue);
    }

    #[test]
    fn test_upload_blocked_while_attached() {
        let mut buffer = Buffer::new();
        buffer.add_ref();
        let err = buffer
            .set_data(CompositeFormat::MonoF32, &[0u8; 8], 44100)
            .unwrap_err();
        assert_eq!(err, RtError::InvalidValue);

        buffer.release_ref();
        assert!(buffer
            .set_data(CompositeFormat::MonoF32, &[0u8; 8], 44100)
            .is_ok());
    }
}
