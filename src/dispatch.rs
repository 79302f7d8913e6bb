//! Callback dispatch off the inference threads.
//!
//! Every user-supplied callback (tokens, audio chunks, progress, pipeline
//! events) is invoked from a dedicated dispatcher thread per logical
//! stream, fed through a bounded queue:
//!
//! - a callback never runs concurrently with itself on the same stream
//! - items are delivered in exactly the order they were produced
//! - a blocking callback backpressures the producer once the queue fills,
//!   instead of stalling the inference thread unboundedly
//!
//! Callbacks must not re-enter engine operations that hold the same
//! handle's lock; doing so deadlocks, and the contract is on the caller.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::thread::JoinHandle;
use tracing::debug;

/// Queue capacity per stream. Mirrors the bounded stage channels used by
/// the voice pipeline.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// One logical callback stream with its dispatcher thread.
pub struct CallbackStream<T: Send + 'static> {
    tx: Option<Sender<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> CallbackStream<T> {
    /// Spawn a dispatcher thread running `callback` for every item sent.
    pub fn spawn(name: &str, capacity: usize, mut callback: impl FnMut(T) + Send + 'static) -> Self {
        let (tx, rx): (Sender<T>, Receiver<T>) = bounded(capacity.max(1));
        let thread_name = format!("lyra-cb-{name}");
        let worker = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for item in rx {
                    callback(item);
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn dispatcher thread {thread_name}: {e}"));
        Self { tx: Some(tx), worker: Some(worker) }
    }

    /// Enqueue an item, blocking when the queue is full (backpressure).
    ///
    /// Returns `false` once the stream is dead (its callback panicked);
    /// producers treat that as "stop delivering", not as an error.
    pub fn send(&self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Close the stream and wait for every queued item to be delivered.
    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!("callback stream worker panicked in user callback");
            }
        }
    }
}

impl<T: Send + 'static> Drop for CallbackStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    #[test]
    fn items_arrive_in_order_exactly_once() {
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let stream = CallbackStream::spawn("order", 8, move |i: usize| {
            sink.lock().unwrap().push(i);
        });
        for i in 0..100 {
            assert!(stream.send(i));
        }
        stream.finish();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn finish_drains_everything_before_returning() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&delivered);
        let stream = CallbackStream::spawn("drain", 64, move |_: u32| {
            std::thread::sleep(Duration::from_millis(1));
            sink.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..50u32 {
            stream.send(i);
        }
        stream.finish();
        assert_eq!(delivered.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn full_queue_backpressures_the_producer() {
        // A slow callback with a tiny queue must make the 10th send wait.
        let stream = CallbackStream::spawn("slow", 2, move |_: u32| {
            std::thread::sleep(Duration::from_millis(20));
        });
        let start = Instant::now();
        for i in 0..10u32 {
            stream.send(i);
        }
        let elapsed = start.elapsed();
        stream.finish();
        assert!(
            elapsed >= Duration::from_millis(100),
            "sends returned too fast ({elapsed:?}) for a backpressured queue"
        );
    }

    #[test]
    fn no_self_concurrency_on_one_stream() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (active_c, overlapped_c) = (Arc::clone(&active), Arc::clone(&overlapped));
        let stream = CallbackStream::spawn("serial", 16, move |_: u32| {
            if active_c.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped_c.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            active_c.fetch_sub(1, Ordering::SeqCst);
        });
        for i in 0..20u32 {
            stream.send(i);
        }
        stream.finish();
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_kills_the_stream_not_the_producer() {
        let stream = CallbackStream::spawn("panicky", 4, |_: u32| {
            panic!("user callback exploded");
        });
        stream.send(1);
        // Eventually sends start reporting a dead stream; none of them panic.
        let mut dead = false;
        for i in 0..100u32 {
            if !stream.send(i) {
                dead = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(dead, "dead stream never reported");
        stream.finish();
    }
}
