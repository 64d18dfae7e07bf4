//! End-to-end device/context lifecycle tests
//!
//! Everything here runs against the loopback backend (render-driven, no
//! hardware) or the null backend (thread-driven), selected up front via
//! the drivers directive so the suite works on machines without audio.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use resona_core::{
    self as resona, AsyncEvent, Attr, ChannelLayout, CompositeFormat, RtError, SampleType,
};

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Promote the null backend for playback; trailing comma keeps the
        // rest of the table (cpal still serves capture).
        std::env::set_var("RESONA_DRIVERS", "null,");
    });
}

/// Attribute list pinning a stereo f32 loopback format
fn stereo_f32_attrs(frequency: i32) -> Vec<(Attr, i32)> {
    vec![
        (Attr::Frequency, frequency),
        (Attr::FormatChannels, 0x1501),
        (Attr::FormatType, 0x1406),
    ]
}

#[test]
fn test_open_close_restores_device_list() {
    setup();
    let before = resona::registry::devices().len();

    let device = resona::open_loopback().unwrap();
    assert_eq!(resona::registry::devices().len(), before + 1);

    device.close().unwrap();
    assert_eq!(resona::registry::devices().len(), before);

    // A closed handle no longer verifies.
    assert_eq!(device.close().unwrap_err(), RtError::InvalidDevice);
}

#[test]
fn test_loopback_requires_attributes() {
    setup();
    let device = resona::open_loopback().unwrap();
    assert_eq!(device.reset(&[]).unwrap_err(), RtError::InvalidValue);
    device.close().unwrap();
}

#[test]
fn test_loopback_rejects_low_frequency() {
    setup();
    let device = resona::open_loopback().unwrap();
    let err = device.reset(&stereo_f32_attrs(4000)).unwrap_err();
    assert_eq!(err, RtError::InvalidValue);
    device.close().unwrap();
}

#[test]
fn test_fuma_above_third_order_rejected() {
    setup();
    let device = resona::open_loopback().unwrap();
    let attrs = vec![
        (Attr::Frequency, 48000),
        (Attr::FormatChannels, 0x1507), // B-format 3D
        (Attr::FormatType, 0x1406),    // f32
        (Attr::AmbisonicLayout, 0x1600),  // FuMa
        (Attr::AmbisonicScaling, 0x1600), // FuMa
        (Attr::AmbisonicOrder, 4),
    ];
    assert_eq!(device.reset(&attrs).unwrap_err(), RtError::InvalidValue);

    // ACN/N3D at third order is fine: 16 channels of f32.
    let attrs = vec![
        (Attr::Frequency, 48000),
        (Attr::FormatChannels, 0x1507),
        (Attr::FormatType, 0x1406),
        (Attr::AmbisonicLayout, 0x1601),  // ACN
        (Attr::AmbisonicScaling, 0x1603), // N3D
        (Attr::AmbisonicOrder, 3),
    ];
    device.reset(&attrs).unwrap();
    let mut out = vec![0u8; 64 * 16 * 4];
    device.render_samples(&mut out, 64).unwrap();
    device.close().unwrap();
}

#[test]
fn test_loopback_render_fills_buffer() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(44100)).unwrap();

    // 1024 stereo f32 frames = 8192 bytes.
    let mut out = vec![0xAAu8; 1024 * 2 * 4];
    device.render_samples(&mut out, 1024).unwrap();
    assert!(out.iter().all(|&b| b == 0), "silence renders as zeros");

    // Zero frames is a no-op success; a short buffer is invalid.
    let mut empty: [u8; 0] = [];
    device.render_samples(&mut empty, 0).unwrap();
    let mut short = vec![0u8; 16];
    assert_eq!(
        device.render_samples(&mut short, 1024).unwrap_err(),
        RtError::InvalidValue
    );

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_render_advances_mix_generation_and_clock() {
    setup();
    let device = resona::open_loopback().unwrap();
    let _context = resona::create_context(&device, &stereo_f32_attrs(48000)).unwrap();

    let count_before = device.mix_count();
    assert_eq!(count_before % 2, 0, "mix count even outside a pass");
    let clock_before = device.clock_ns();

    let mut out = vec![0u8; 4800 * 2 * 4];
    device.render_samples(&mut out, 4800).unwrap();

    assert_eq!(device.mix_count(), count_before + 2);
    let clock_after = device.clock_ns();
    // 4800 frames at 48kHz = 100ms of device clock.
    assert_eq!(clock_after - clock_before, 100_000_000);

    device.close().unwrap();
}

#[test]
fn test_context_destroy_then_handle_is_dead() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(48000)).unwrap();

    resona::make_current(Some(&context)).unwrap();
    assert!(resona::current_context().is_some());

    context.destroy().unwrap();
    assert!(resona::current_context().is_none());
    assert_eq!(context.suspend().unwrap_err(), RtError::InvalidContext);

    // The device accepts a fresh context afterwards.
    let again = resona::create_context(&device, &stereo_f32_attrs(48000)).unwrap();
    again.destroy().unwrap();
    device.close().unwrap();
}

/// Upload a constant-valued mono f32 buffer and return its handle
fn constant_buffer(device: &Arc<resona::Device>, value: f32, frames: usize) -> u32 {
    let id = device.create_buffer().unwrap();
    let samples = vec![value; frames];
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
    device
        .buffer_data(id, CompositeFormat::MonoF32, &bytes, 44100)
        .unwrap();
    id
}

fn first_sample(out: &[u8]) -> f32 {
    f32::from_ne_bytes([out[0], out[1], out[2], out[3]])
}

/// Read channel `ch` of stereo frame `frame` from interleaved f32 bytes
fn sample_at(out: &[u8], frame: usize, ch: usize) -> f32 {
    let at = (frame * 2 + ch) * 4;
    f32::from_ne_bytes([out[at], out[at + 1], out[at + 2], out[at + 3]])
}

#[test]
fn test_playback_is_audible_in_rendered_output() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(44100)).unwrap();

    let buffer = constant_buffer(&device, 0.25, 44100);
    let source = context.create_source().unwrap();
    context.source_set_buffer(source, Some(buffer)).unwrap();
    context.source_set_looping(source, true).unwrap();
    context.play_source(source).unwrap();

    let mut out = vec![0u8; 256 * 2 * 4];
    device.render_samples(&mut out, 256).unwrap();
    assert!((first_sample(&out) - 0.25).abs() < 1e-5);

    context.stop_source(source).unwrap();
    device.render_samples(&mut out, 256).unwrap();
    assert_eq!(first_sample(&out), 0.0);

    context.delete_source(source).unwrap();
    device.delete_buffer(buffer).unwrap();
    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_defer_then_process_batches_updates() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(44100)).unwrap();

    let buffer = constant_buffer(&device, 0.5, 44100);
    let source = context.create_source().unwrap();
    context.source_set_buffer(source, Some(buffer)).unwrap();
    context.source_set_looping(source, true).unwrap();
    context.play_source(source).unwrap();

    let mut out = vec![0u8; 128 * 2 * 4];
    device.render_samples(&mut out, 128).unwrap();
    assert!((first_sample(&out) - 0.5).abs() < 1e-5);

    // Mutations while suspended are not observed by the mixer...
    context.suspend().unwrap();
    context.source_set_gain(source, 0.2).unwrap();
    device.render_samples(&mut out, 128).unwrap();
    assert!(
        (first_sample(&out) - 0.5).abs() < 1e-5,
        "deferred mutation must not reach the mixer"
    );

    // ...until processed, when the whole batch lands in one block.
    context.process().unwrap();
    device.render_samples(&mut out, 128).unwrap();
    assert!((first_sample(&out) - 0.1).abs() < 1e-5, "0.5 * 0.2 gain");

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_send_count_change_trims_source_sends() {
    setup();
    let device = resona::open_loopback().unwrap();
    let mut attrs = stereo_f32_attrs(48000);
    attrs.push((Attr::MaxAuxiliarySends, 2));
    let context = resona::create_context(&device, &attrs).unwrap();

    let slot = context.create_effect_slot().unwrap();
    let source = context.create_source().unwrap();
    context.source_set_send(source, 1, Some(slot)).unwrap();

    // A third send does not exist at two sends.
    assert_eq!(
        context.source_set_send(source, 2, Some(slot)).unwrap_err(),
        RtError::InvalidValue
    );
    // The slot is referenced, so it cannot be deleted.
    assert_eq!(
        context.delete_effect_slot(slot).unwrap_err(),
        RtError::InvalidValue
    );

    let mut attrs = stereo_f32_attrs(48000);
    attrs.push((Attr::MaxAuxiliarySends, 1));
    device.reset(&attrs).unwrap();

    // Send 1 was released by the reset: send 0 remains, and the slot is
    // free to delete.
    assert_eq!(
        context.source_set_send(source, 1, Some(slot)).unwrap_err(),
        RtError::InvalidValue
    );
    context.source_set_send(source, 0, Some(slot)).unwrap();
    context.source_set_send(source, 0, None).unwrap();
    context.delete_effect_slot(slot).unwrap();

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_send_gains_shape_the_wet_path() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(44100)).unwrap();

    // A pass-through slot makes the wet contribution directly audible on
    // the first output channel.
    let slot = context.create_effect_slot().unwrap();
    let buffer = constant_buffer(&device, 0.4, 44100);
    let source = context.create_source().unwrap();
    context.source_set_buffer(source, Some(buffer)).unwrap();
    context.source_set_looping(source, true).unwrap();
    context.source_set_send(source, 0, Some(slot)).unwrap();
    context.play_source(source).unwrap();

    // Identity gains: a settled DC input passes the low band at unity,
    // so channel 0 carries dry + wet = 0.8. Sample late in the block to
    // let the band-split filters converge.
    let mut out = vec![0u8; 512 * 2 * 4];
    device.render_samples(&mut out, 512).unwrap();
    assert!((sample_at(&out, 400, 0) - 0.8).abs() < 1e-2);
    // Channel 1 gets only the dry path.
    assert!((sample_at(&out, 400, 1) - 0.4).abs() < 1e-2);

    // Halving the send gain halves the wet contribution.
    context
        .source_set_send_gains(source, 0, 0.5, 1.0, 1.0)
        .unwrap();
    device.render_samples(&mut out, 512).unwrap();
    assert!((sample_at(&out, 400, 0) - 0.6).abs() < 1e-2);

    // Killing the low band silences a DC wet signal entirely.
    context
        .source_set_send_gains(source, 0, 1.0, 1.0, 0.0)
        .unwrap();
    device.render_samples(&mut out, 512).unwrap();
    device.render_samples(&mut out, 512).unwrap();
    assert!((sample_at(&out, 400, 0) - 0.4).abs() < 1e-2);

    // Out-of-range gains and bad send indices are rejected.
    assert_eq!(
        context
            .source_set_send_gains(source, 0, 1.5, 1.0, 1.0)
            .unwrap_err(),
        RtError::InvalidValue
    );
    assert_eq!(
        context
            .source_set_send_gains(source, 9, 1.0, 1.0, 1.0)
            .unwrap_err(),
        RtError::InvalidValue
    );

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_disconnect_is_sticky_and_blocks_new_contexts() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(48000)).unwrap();

    let events: Arc<Mutex<Vec<AsyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    context.set_event_callback(Some(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
    })));

    resona::device::handle_disconnect(&device, "backend failure");
    assert!(!device.is_connected());

    // Rendering a disconnected device is silent, not an error.
    let mut out = vec![0u8; 64 * 2 * 4];
    device.render_samples(&mut out, 64).unwrap();

    // New contexts are refused with InvalidDevice.
    let err = resona::create_context(&device, &stereo_f32_attrs(48000)).unwrap_err();
    assert_eq!(err, RtError::InvalidDevice);
    assert_eq!(device.take_error(), Some(RtError::InvalidDevice));

    // CONNECTED reports 0.
    assert_eq!(resona::get_integer_raw(Some(&device), 0x313), Some(0));

    // Disconnect is latched exactly once per session.
    resona::device::handle_disconnect(&device, "again");
    std::thread::sleep(Duration::from_millis(50));
    let seen = events.lock().unwrap();
    let disconnects = seen
        .iter()
        .filter(|e| matches!(e, AsyncEvent::DeviceDisconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
    drop(seen);

    // An explicit reset re-arms the connection.
    device.reset(&stereo_f32_attrs(48000)).unwrap();
    assert!(device.is_connected());

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_unknown_string_query_latches_invalid_enum() {
    setup();
    let device = resona::open_loopback().unwrap();
    assert!(device.take_error().is_none());

    assert_eq!(resona::get_string_raw(Some(&device), 0x12345), None);
    assert_eq!(device.take_error(), Some(RtError::InvalidEnum));
    // The latch clears on read.
    assert_eq!(device.take_error(), None);

    device.close().unwrap();
}

#[test]
fn test_source_completion_posts_events() {
    setup();
    let device = resona::open_loopback().unwrap();
    let context = resona::create_context(&device, &stereo_f32_attrs(44100)).unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&completions);
    context.set_event_callback(Some(Box::new(move |event| {
        if matches!(event, AsyncEvent::SourceStateChanged { .. }) {
            sink.fetch_add(1, Ordering::SeqCst);
        }
    })));

    // A short non-looping buffer finishes within one render.
    let buffer = constant_buffer(&device, 0.1, 64);
    let source = context.create_source().unwrap();
    context.source_set_buffer(source, Some(buffer)).unwrap();
    context.play_source(source).unwrap();

    let mut out = vec![0u8; 512 * 2 * 4];
    device.render_samples(&mut out, 512).unwrap();

    assert_eq!(
        context.source_state(source).unwrap(),
        resona::source::SourceState::Stopped
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_null_backend_drives_mixer() {
    setup();
    let device = resona::open_playback(None).unwrap();
    assert_eq!(device.name(), "Null Output");

    let context = resona::create_context(&device, &[(Attr::Frequency, 48000)]).unwrap();
    assert!(device.is_running());

    let count = device.mix_count();
    std::thread::sleep(Duration::from_millis(120));
    assert!(
        device.mix_count() > count,
        "the null backend paces mix passes by wall clock"
    );

    // REFRESH reports updates per second.
    let (frequency, update_size) = device.mix_timing();
    let refresh = resona::get_integer_raw(Some(&device), 0x1008).unwrap();
    assert_eq!(refresh, (frequency / update_size) as i64);

    // Pause stops the mixer; resume restarts it.
    device.pause().unwrap();
    assert!(!device.is_running());
    let count = device.mix_count();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(device.mix_count(), count);

    device.resume().unwrap();
    assert!(device.is_running());

    context.destroy().unwrap();
    assert!(!device.is_running(), "last context out stops the device");
    device.close().unwrap();
}

#[test]
fn test_empty_attrs_on_playback_device_uses_defaults() {
    setup();
    let device = resona::open_playback(None).unwrap();
    // Unlike loopback, a playback device accepts an empty attribute list.
    let context = resona::create_context(&device, &[]).unwrap();
    assert!(device.is_running());

    let frequency = resona::get_integer_raw(Some(&device), 0x1007).unwrap();
    assert!(frequency > 0);

    context.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_capture_format_validation() {
    setup();
    // A non-positive buffer depth is rejected before any backend work.
    let err = resona::open_capture(None, 44100, CompositeFormat::Stereo16, 0).unwrap_err();
    assert_eq!(err, RtError::InvalidValue);
    assert_eq!(
        resona::take_null_device_error(),
        Some(RtError::InvalidValue)
    );
}

#[test]
fn test_composite_format_table() {
    setup();
    assert_eq!(
        CompositeFormat::Quad16.decompose(),
        (ChannelLayout::Quad, SampleType::I16)
    );
    assert_eq!(
        CompositeFormat::MonoF32.decompose(),
        (ChannelLayout::Mono, SampleType::F32)
    );
}
