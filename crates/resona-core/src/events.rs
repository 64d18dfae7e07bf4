//! Asynchronous event delivery
//!
//! The mixer and the disconnect path post events into a per-context
//! SPSC ring; a dedicated event thread drains the ring and invokes the
//! application callback outside any audio-critical path. Posting never
//! blocks: a full ring drops the event (with a debug log from the
//! non-realtime side only).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::source::SourceState;

/// Ring capacity in events
pub const EVENT_RING_SIZE: usize = 512;

/// Poll interval of the event thread when the ring is idle
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Events delivered to the application callback
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncEvent {
    /// The device behind this context's output is gone
    DeviceDisconnected { reason: String },
    /// A source changed playback state on the mixer thread
    SourceStateChanged { source: u32, state: SourceState },
    /// A source finished processing queued buffers
    BufferCompleted { source: u32, count: usize },
}

/// Application event callback
pub type EventCallback = Box<dyn Fn(&AsyncEvent) + Send>;

/// Producer half owned by the context (pushed from the mixer and the
/// disconnect path, both under the backend's mixer exclusion)
pub struct EventSender {
    producer: Mutex<rtrb::Producer<AsyncEvent>>,
}

impl EventSender {
    /// Post an event; silently drops when the ring is full or busy
    pub fn post(&self, event: AsyncEvent) {
        if let Ok(mut producer) = self.producer.try_lock() {
            let _ = producer.push(event);
        }
    }
}

/// Handle to a context's event thread
pub struct EventThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Ask the thread to drain remaining events and exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create the event ring and start the draining thread
pub fn start(
    callback: Arc<Mutex<Option<EventCallback>>>,
) -> (EventSender, EventThread) {
    let (producer, mut consumer) = rtrb::RingBuffer::<AsyncEvent>::new(EVENT_RING_SIZE);
    let stop = Arc::new(AtomicBool::new(false));

    let thread_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("resona-events".to_string())
        .spawn(move || loop {
            while let Ok(event) = consumer.pop() {
                if let Some(cb) = callback.lock().unwrap().as_ref() {
                    cb(&event);
                }
            }
            if thread_stop.load(Ordering::Acquire) {
                // Final drain so nothing posted before the stop is lost.
                while let Ok(event) = consumer.pop() {
                    if let Some(cb) = callback.lock().unwrap().as_ref() {
                        cb(&event);
                    }
                }
                return;
            }
            thread::park_timeout(DRAIN_INTERVAL);
        })
        .expect("failed to spawn event thread");

    (
        EventSender {
            producer: Mutex::new(producer),
        },
        EventThread {
            stop,
            handle: Some(handle),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_events_reach_callback() {
        let received = Arc::new(AtomicUsize::new(0));
        let callback: Arc<Mutex<Option<EventCallback>>> = {
            let received = Arc::clone(&received);
            Arc::new(Mutex::new(Some(Box::new(move |_event: &AsyncEvent| {
                received.fetch_add(1, Ordering::SeqCst);
            }) as EventCallback)))
        };

        let (sender, mut thread) = start(callback);
        for i in 0..5 {
            sender.post(AsyncEvent::BufferCompleted {
                source: 1,
                count: i,
            });
        }
        thread.stop();
        assert_eq!(received.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_post_without_callback_is_dropped() {
        let callback: Arc<Mutex<Option<EventCallback>>> = Arc::new(Mutex::new(None));
        let (sender, mut thread) = start(callback);
        sender.post(AsyncEvent::DeviceDisconnected {
            reason: "gone".to_string(),
        });
        thread.stop();
    }
}
