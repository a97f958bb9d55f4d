//! Load groups and the older counted-barrier synchronization API.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

use crate::{database::AssetHandle, handle::Handle};

/// Marker type for group handles.
pub enum GroupTag {}
/// Handle to a load group.
pub type GroupHandle = Handle<GroupTag>;

/// Marker type for barrier handles.
pub enum BarrierTag {}
/// Handle to a barrier.
pub type BarrierHandle = Handle<BarrierTag>;

/// Lifecycle state of a group. Only the scheduler transitions it, on the
/// main thread; observers read it with acquire ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GroupState {
    /// No load in flight and nothing retained-as-loading.
    Idle = 0,
    /// A load job is running.
    Loading = 1,
    /// The last load job completed; every retained handle is serviced.
    Loaded = 2,
    /// An unload job is running.
    Unloading = 3,
}

impl GroupState {
    pub(crate) fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Loading,
            2 => Self::Loaded,
            3 => Self::Unloading,
            _ => Self::Idle,
        }
    }
}

#[derive(Default)]
pub(crate) struct GroupLists {
    /// Handles queued for the next load job. Drains when the job finishes.
    pub load_list: Vec<AssetHandle>,
    /// Every handle this group holds a reference on; superset of the load
    /// list.
    pub retained: Vec<AssetHandle>,
}

pub(crate) struct GroupData {
    pub state: Arc<AtomicU32>,
    pub lists: Arc<Mutex<GroupLists>>,
    pub barrier: Mutex<Option<Arc<BarrierInner>>>,
}

impl GroupData {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(AtomicU32::new(GroupState::Idle as u32)),
            lists: Arc::new(Mutex::new(GroupLists::default())),
            barrier: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> GroupState {
        GroupState::from_u32(self.state.load(Ordering::Acquire))
    }
}

/// Counted signal: incremented when a load begins, decremented when it
/// completes; waiting blocks until the count is zero.
pub(crate) struct BarrierInner {
    count: Mutex<u32>,
    zero: Condvar,
}

impl BarrierInner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        })
    }

    pub(crate) fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    pub(crate) fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Blocks until the count reaches zero; false on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap();
        let (count, result) = self
            .zero
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap();
        drop(count);
        !result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_at_zero() {
        let barrier = BarrierInner::new();
        barrier.increment();
        barrier.increment();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait(Duration::from_secs(5)))
        };

        barrier.decrement();
        barrier.decrement();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_times_out_while_counted() {
        let barrier = BarrierInner::new();
        barrier.increment();
        assert!(!barrier.wait(Duration::from_millis(20)));
    }

    #[test]
    fn zero_count_wait_returns_immediately() {
        let barrier = BarrierInner::new();
        assert!(barrier.wait(Duration::from_millis(1)));
    }
}
