//! The generic FIFO primitive underneath every sink queue.
//!
//! Responsibilities:
//! - blocking and non-blocking pops with an abort switch that wakes all waiters
//! - flush/purge that hand every removed entry to a cleanup hook
//! - accounting hooks that run under the queue lock, so counters derived from
//!   queue contents are always exact
//!
//! The queue itself is unbounded; boundedness comes from the producer backing
//! off when the accounted size crosses a sink's threshold.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Accounting callbacks invoked while the queue lock is held.
///
/// Hooks must be cheap and must not touch the queue they belong to.
pub(crate) trait QueueHooks<T>: Send + Sync {
    /// An entry was appended.
    fn on_put(&self, _item: &T) {}

    /// An entry was popped by a consumer.
    fn on_get(&self, _item: &T) {}

    /// An entry was dropped without being consumed (flush or purge).
    fn on_cleanup(&self, item: T) {
        drop(item);
    }
}

/// Hook set that does nothing; useful standalone and in tests.
pub(crate) struct NoHooks;

impl<T> QueueHooks<T> for NoHooks {}

struct Inner<T> {
    items: VecDeque<T>,
    aborted: bool,
}

pub(crate) struct Queue<T, H: QueueHooks<T> = NoHooks> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    hooks: H,
}

impl<T, H: QueueHooks<T>> Queue<T, H> {
    pub fn new(hooks: H) -> Self {
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                aborted: false,
            }),
            not_empty: Condvar::new(),
            hooks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A poisoned queue means a consumer panicked mid-pop; the structure
        // itself is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry. Returns `false` when the queue is aborted; the entry
    /// is dropped without running any hook.
    pub fn put(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.aborted {
            return false;
        }
        self.hooks.on_put(&item);
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Pop the next entry.
    ///
    /// Returns `None` when the queue is aborted, or when `block` is `false`
    /// and the queue is empty.
    pub fn get(&self, block: bool) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if inner.aborted {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.hooks.on_get(&item);
                return Some(item);
            }
            if !block {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drain every entry, invoking the cleanup hook for each.
    pub fn flush(&self) {
        let mut inner = self.lock();
        while let Some(item) = inner.items.pop_front() {
            self.hooks.on_cleanup(item);
        }
    }

    /// Remove every entry matching `pred`, invoking the cleanup hook for each.
    pub fn purge(&self, mut pred: impl FnMut(&T) -> bool) {
        let mut inner = self.lock();
        let mut kept = VecDeque::with_capacity(inner.items.len());
        while let Some(item) = inner.items.pop_front() {
            if pred(&item) {
                self.hooks.on_cleanup(item);
            } else {
                kept.push_back(item);
            }
        }
        inner.items = kept;
    }

    /// Wake all blocked getters; subsequent puts and gets fail until
    /// [`Queue::reset`].
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.not_empty.notify_all();
    }

    /// Clear the abort state.
    pub fn reset(&self) {
        self.lock().aborted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved() {
        let q: Queue<u32> = Queue::new(NoHooks);
        for i in 0..4 {
            assert!(q.put(i));
        }
        for i in 0..4 {
            assert_eq!(q.get(false), Some(i));
        }
        assert_eq!(q.get(false), None);
    }

    #[test]
    fn abort_wakes_blocked_getter() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::new(NoHooks));
        let q2 = Arc::clone(&q);
        let getter = thread::spawn(move || q2.get(true));
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert_eq!(getter.join().ok().flatten(), None);
    }

    #[test]
    fn put_fails_while_aborted_and_reset_recovers() {
        let q: Queue<u32> = Queue::new(NoHooks);
        q.abort();
        assert!(!q.put(1));
        assert_eq!(q.get(false), None);
        q.reset();
        assert!(q.put(2));
        assert_eq!(q.get(false), Some(2));
    }

    struct Counting {
        puts: AtomicUsize,
        gets: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl QueueHooks<u32> for Arc<Counting> {
        fn on_put(&self, _item: &u32) {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_get(&self, _item: &u32) {
            self.gets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_cleanup(&self, _item: u32) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_balance_across_get_flush_and_purge() {
        let counts = Arc::new(Counting {
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        });
        let q: Queue<u32, Arc<Counting>> = Queue::new(Arc::clone(&counts));

        for i in 0..6 {
            q.put(i);
        }
        assert_eq!(q.get(false), Some(0));

        // Purge the even entries still queued: 2 and 4.
        q.purge(|v| v % 2 == 0);
        // Flush the rest: 1, 3, 5.
        q.flush();

        assert_eq!(counts.puts.load(Ordering::SeqCst), 6);
        assert_eq!(counts.gets.load(Ordering::SeqCst), 1);
        assert_eq!(counts.cleanups.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn purge_keeps_relative_order() {
        let q: Queue<u32> = Queue::new(NoHooks);
        for i in 0..5 {
            q.put(i);
        }
        q.purge(|v| *v == 2);
        let drained: Vec<u32> = std::iter::from_fn(|| q.get(false)).collect();
        assert_eq!(drained, vec![0, 1, 3, 4]);
    }
}
