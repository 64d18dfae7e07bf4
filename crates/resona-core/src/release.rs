//! Deferred release of mixer-reachable allocations
//!
//! Buffer sample payloads can see their last reference dropped on the
//! mixer thread (a voice finishing a buffer the application already
//! deleted), and freeing a multi-megabyte payload there would put an
//! unbounded system call inside the audio callback. Those payloads live
//! in `basedrop::Shared` pointers: dropping one enqueues the node for a
//! background sweeper instead of deallocating in place.
//!
//! The sweeper also keeps a gauge of live shared allocations. A steadily
//! climbing gauge means buffers are being created faster than they are
//! retired (an application leak, or a stalled sweep), which shows up in
//! the log at the backlog watermark instead of as silent memory growth.
//! Sweeps speed up while the allocation set is changing and relax once
//! it is stable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread;
use std::time::Duration;

use basedrop::{Collector, Handle};

/// Sweep cadence while allocations are being created or retired
const BUSY_INTERVAL: Duration = Duration::from_millis(20);

/// Sweep cadence while the allocation set is stable
const IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// Live-allocation count that triggers a backlog warning
const BACKLOG_WATERMARK: usize = 4096;

struct ReleasePool {
    handle: Handle,
    /// Live shared allocations as of the last sweep
    live: Arc<AtomicUsize>,
}

static POOL: OnceLock<ReleasePool> = OnceLock::new();

fn spawn_sweeper() -> ReleasePool {
    let live = Arc::new(AtomicUsize::new(0));
    let gauge = Arc::clone(&live);
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("resona-release".to_string())
        .spawn(move || {
            // The collector is !Sync and lives on this thread; only its
            // cloneable handle crosses back out.
            let mut collector = Collector::new();
            tx.send(collector.handle())
                .expect("failed to hand off release handle");

            let mut last_count = 0usize;
            let mut over_watermark = false;
            loop {
                collector.collect();
                let count = collector.alloc_count();
                gauge.store(count, Ordering::Release);

                if count > BACKLOG_WATERMARK {
                    if !over_watermark {
                        log::warn!(
                            "{} shared audio allocations outstanding (watermark {})",
                            count,
                            BACKLOG_WATERMARK
                        );
                        over_watermark = true;
                    }
                } else if count <= BACKLOG_WATERMARK / 2 {
                    over_watermark = false;
                }

                let interval = if count != last_count {
                    BUSY_INTERVAL
                } else {
                    IDLE_INTERVAL
                };
                last_count = count;
                thread::sleep(interval);
            }
        })
        .expect("failed to spawn release thread");

    ReleasePool {
        handle: rx.recv().expect("failed to receive release handle"),
        live,
    }
}

/// Handle for creating `Shared<T>` allocations
///
/// Lazily starts the sweeper thread on first use.
pub fn shared_handle() -> Handle {
    POOL.get_or_init(spawn_sweeper).handle.clone()
}

/// Live shared allocations as of the last sweep
///
/// Diagnostic gauge; a value stuck above the watermark means payloads
/// are outliving their buffers faster than they are retired.
pub fn live_allocations() -> usize {
    POOL.get_or_init(spawn_sweeper).live.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_clone_and_deferred_drop() {
        let data = Shared::new(&shared_handle(), vec![1.0f32; 1024]);
        let clone = Shared::clone(&data);
        assert_eq!(clone.len(), 1024);
        drop(data);
        // The clone still reads valid data after the original dropped.
        assert_eq!(clone[0], 1.0);
        drop(clone);
    }

    #[test]
    fn test_gauge_sees_held_allocation() {
        let held = Shared::new(&shared_handle(), vec![0u8; 64]);
        // Wait out at least one sweep so the gauge includes `held`.
        std::thread::sleep(Duration::from_millis(300));
        assert!(live_allocations() >= 1);
        drop(held);
    }
}
