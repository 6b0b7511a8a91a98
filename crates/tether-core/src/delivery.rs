//! Single-flight ordered delivery queue.
//!
//! A [`DeliveryQueue`] processes its backlog strictly one item at a time in
//! submission order. The head item is handed to the completion function; if
//! that returns `false` the item stays at the head and is retried after the
//! poll interval. Only a `true` result advances the queue.
//!
//! At most one processing task runs per queue: [`DeliveryQueue::push`] starts
//! one when the queue is idle and the task exits once the backlog is empty.
//! Waits use `tokio::time`, so tests can accelerate them with paused time.
//!
//! Must be used from within a tokio runtime.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

/// Completion function: `true` once the item is done, `false` to retry later.
pub type Completion<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct QueueState<T> {
    items: VecDeque<T>,
    active: bool,
    closed: bool,
}

struct Inner<T> {
    name: &'static str,
    poll_interval: Duration,
    complete: Completion<T>,
    state: Mutex<QueueState<T>>,
    wake: Notify,
}

/// Ordered, retry-until-done processor.
pub struct DeliveryQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> DeliveryQueue<T> {
    /// Create a queue. `name` only labels log output.
    pub fn new(
        name: &'static str,
        poll_interval: Duration,
        complete: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                poll_interval,
                complete: Box::new(complete),
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    active: false,
                    closed: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Append an item and start processing if the queue is idle.
    ///
    /// Returns the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let start = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
            !std::mem::replace(&mut state.active, true)
        };
        if start {
            let _ = tokio::spawn(run(Arc::clone(&self.inner)));
        }
        Ok(())
    }

    /// Cut the current retry wait short, e.g. once a socket became writable.
    pub fn nudge(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop processing and return the discarded backlog, head first.
    pub fn close(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.inner.wake.notify_one();
        debug!(queue = self.inner.name, discarded = drained.len(), "delivery queue closed");
        drained
    }

    /// Items waiting, including the head being retried.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a processing task is currently running.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

async fn run<T: Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let item = {
            let mut state = inner.state.lock();
            match state.items.pop_front() {
                Some(item) if !state.closed => item,
                _ => {
                    state.active = false;
                    return;
                }
            }
        };

        let done = match catch_unwind(AssertUnwindSafe(|| (inner.complete)(&item))) {
            Ok(done) => done,
            Err(_) => {
                error!(queue = inner.name, "completion function panicked, dropping item");
                true
            }
        };
        if done {
            continue;
        }

        {
            let mut state = inner.state.lock();
            if state.closed {
                state.active = false;
                return;
            }
            state.items.push_front(item);
        }
        trace!(queue = inner.name, "head not complete, retrying after poll interval");
        tokio::select! {
            () = tokio::time::sleep(inner.poll_interval) => {}
            () = inner.wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const POLL: Duration = Duration::from_millis(100);

    fn recording_queue(
        fail_first: usize,
    ) -> (DeliveryQueue<u32>, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (s, a) = (Arc::clone(&seen), Arc::clone(&attempts));
        let queue = DeliveryQueue::new("test", POLL, move |item: &u32| {
            let n = a.fetch_add(1, Ordering::SeqCst);
            if n < fail_first {
                return false;
            }
            s.lock().push(*item);
            true
        });
        (queue, seen, attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn processes_in_submission_order() {
        let (queue, seen, _) = recording_queue(0);
        for i in 1..=5 {
            queue.push(i).unwrap();
        }
        tokio::time::sleep(POLL).await;
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
        assert!(!queue.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_head_blocks_until_it_succeeds() {
        let (queue, seen, attempts) = recording_queue(3);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        tokio::time::sleep(POLL / 2).await;
        assert!(seen.lock().is_empty());
        assert_eq!(queue.len(), 2);

        tokio::time::sleep(POLL * 4).await;
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_one_poll_interval() {
        let (queue, seen, attempts) = recording_queue(1);
        queue.push(7).unwrap();
        tokio::time::sleep(POLL - Duration::from_millis(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_processing_task_runs() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (f, o) = (Arc::clone(&in_flight), Arc::clone(&overlapped));
        let queue = DeliveryQueue::new("single", POLL, move |_: &u32| {
            if f.fetch_add(1, Ordering::SeqCst) > 0 {
                o.store(true, Ordering::SeqCst);
            }
            std::thread::yield_now();
            let _ = f.fetch_sub(1, Ordering::SeqCst);
            true
        });
        for i in 0..100 {
            queue.push(i).unwrap();
        }
        tokio::time::sleep(POLL).await;
        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_going_idle() {
        let (queue, seen, _) = recording_queue(0);
        queue.push(1).unwrap();
        tokio::time::sleep(POLL).await;
        assert!(!queue.is_active());
        queue.push(2).unwrap();
        tokio::time::sleep(POLL).await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_discards_backlog_and_refuses_pushes() {
        let (queue, seen, _) = recording_queue(usize::MAX);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        tokio::time::sleep(POLL / 2).await;

        let drained = queue.close();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_closed());
        assert_eq!(queue.push(3), Err(3));

        tokio::time::sleep(POLL * 2).await;
        assert!(!queue.is_active());
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_skips_the_remaining_wait() {
        let ready = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ready);
        let queue = DeliveryQueue::new("nudge", Duration::from_secs(60), move |_: &u32| {
            r.load(Ordering::SeqCst)
        });
        queue.push(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        ready.store(true, Ordering::SeqCst);
        queue.nudge();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_completion_does_not_stall_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let queue = DeliveryQueue::new("panics", POLL, move |item: &u32| {
            assert!(*item != 2, "bad item");
            s.lock().push(*item);
            true
        });
        for i in 1..=3 {
            queue.push(i).unwrap();
        }
        tokio::time::sleep(POLL).await;
        assert_eq!(*seen.lock(), vec![1, 3]);
    }
}
