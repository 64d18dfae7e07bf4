//! Resona core — device/context lifecycle of a positional audio runtime
//!
//! Applications open audio [`Device`]s (playback, capture, or loopback),
//! create rendering [`Context`]s bound to them, and through contexts
//! create sources, buffers, effects, and effect slots whose state the
//! mixer consumes on a real-time audio thread.
//!
//! The crate's center of gravity is state management rather than DSP:
//! handle-addressed object pools, a lock-free publication protocol
//! between the API threads and the mixer, a device reconfiguration path
//! that quiesces the mixer and rewrites every live voice and slot, and a
//! pluggable backend abstraction (cpal, null, loopback).
//!
//! ```no_run
//! use resona_core as resona;
//!
//! let device = resona::open_playback(None)?;
//! let context = resona::create_context(&device, &[])?;
//! resona::make_current(Some(&context))?;
//!
//! let source = context.create_source()?;
//! context.play_source(source)?;
//! # Ok::<(), resona::RtError>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod effect;
pub mod error;
pub mod events;
pub mod hrtf;
pub mod limiter;
pub mod mixer;
pub mod pool;
pub mod props;
pub mod registry;
pub mod release;
pub mod slot;
pub mod source;
pub mod types;
pub mod voice;

pub use context::{create_context, Context, Listener};
pub use device::{
    get_integer_raw, get_string_raw, open_capture, open_loopback, open_playback, Device,
    DeviceKind, DEFAULT_DEVICE_NAME,
};
pub use error::{RtError, RtResult};
pub use events::{AsyncEvent, EventCallback};
pub use registry::{
    current_context, make_current, set_thread_context, take_null_device_error, thread_context,
};
pub use types::{
    Attr, ChannelLayout, CompositeFormat, DistanceModel, SampleType, TriState, MAX_SENDS,
    MIN_OUTPUT_RATE,
};
