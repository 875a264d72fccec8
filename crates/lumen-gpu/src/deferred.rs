//! Deferred destruction of GPU objects.
//!
//! With several frames in flight an object cannot be destroyed the moment the
//! client drops it: a previous submission may still reference it. The
//! [`DeferredDeleter`] consults the [`InflightTracker`] and parks such objects
//! until the last record referencing them is cleared.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::RawDevice;
use crate::handle::ObjectHandle;
use crate::inflight::{InflightEvent, InflightTracker, SubscriptionId};

struct DeleterInner {
    device: Arc<dyn RawDevice>,
    /// Objects waiting for their inflight records to clear.
    pending: Mutex<Vec<ObjectHandle>>,
}

impl DeleterInner {
    /// Destroy every pending object that is no longer in flight.
    fn collect(&self, tracker: &InflightTracker) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|&handle| {
            if tracker.is_inflight(handle) {
                true
            } else {
                self.device.destroy_object(handle);
                false
            }
        });
        if pending.len() != before {
            tracing::trace!(
                "Destroyed {} deferred objects, {} still pending",
                before - pending.len(),
                pending.len()
            );
        }
    }
}

/// Destroys objects once no unfinished submission references them.
pub struct DeferredDeleter {
    inner: Arc<DeleterInner>,
    tracker: Arc<InflightTracker>,
    subscription: SubscriptionId,
}

impl DeferredDeleter {
    /// Create a deleter bound to a tracker.
    pub fn new(device: Arc<dyn RawDevice>, tracker: Arc<InflightTracker>) -> Self {
        let inner = Arc::new(DeleterInner {
            device,
            pending: Mutex::new(Vec::new()),
        });

        let weak_inner: Weak<DeleterInner> = Arc::downgrade(&inner);
        let weak_tracker: Weak<InflightTracker> = Arc::downgrade(&tracker);
        let subscription = tracker.subscribe(move |event| {
            if matches!(event, InflightEvent::Added(_)) {
                return;
            }
            if let (Some(inner), Some(tracker)) = (weak_inner.upgrade(), weak_tracker.upgrade()) {
                inner.collect(&tracker);
            }
        });

        Self {
            inner,
            tracker,
            subscription,
        }
    }

    /// Destroy `handle` now if it is idle, otherwise once it stops being in flight.
    ///
    /// Returns `true` when the object was destroyed immediately.
    pub fn safe_destroy(&self, handle: impl Into<ObjectHandle>) -> bool {
        let handle = handle.into();
        // The pending lock is held across the check so a concurrent clear
        // cannot slip between the check and the push.
        let mut pending = self.inner.pending.lock();
        if pending.contains(&handle) {
            return false;
        }
        if self.tracker.is_inflight(handle) {
            tracing::trace!("Deferring destruction of {:?}", handle);
            pending.push(handle);
            false
        } else {
            self.inner.device.destroy_object(handle);
            true
        }
    }

    /// Number of objects waiting to be destroyed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Whether the handle is waiting to be destroyed.
    #[must_use]
    pub fn is_pending(&self, handle: impl Into<ObjectHandle>) -> bool {
        self.inner.pending.lock().contains(&handle.into())
    }

    /// Destroy everything still pending.
    ///
    /// Only valid at teardown after a device-idle wait.
    pub fn flush(&self) {
        let mut pending = self.inner.pending.lock();
        for handle in pending.drain(..) {
            self.inner.device.destroy_object(handle);
        }
    }
}

impl Drop for DeferredDeleter {
    fn drop(&mut self) {
        self.tracker.unsubscribe(self.subscription);
        let leaked = self.pending_count();
        if leaked > 0 {
            tracing::warn!("Deferred deleter dropped with {} objects still pending", leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ObjectSet;
    use crate::headless::HeadlessDevice;
    use ash::vk::{self, Handle};

    fn setup() -> (Arc<HeadlessDevice>, Arc<InflightTracker>, DeferredDeleter) {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = Arc::new(InflightTracker::new());
        let deleter = DeferredDeleter::new(device.clone(), tracker.clone());
        (device, tracker, deleter)
    }

    #[test]
    fn idle_objects_are_destroyed_immediately() {
        let (device, _tracker, deleter) = setup();
        let buffer = vk::Buffer::from_raw(5);

        assert!(deleter.safe_destroy(buffer));
        assert!(device.was_destroyed(buffer));
    }

    #[test]
    fn inflight_objects_wait_for_their_fence() {
        let (device, tracker, deleter) = setup();
        let buffer = vk::Buffer::from_raw(5);
        let fence = vk::Fence::from_raw(1);
        tracker.add(fence, [buffer].into_iter().collect::<ObjectSet>());

        assert!(!deleter.safe_destroy(buffer));
        assert!(!device.was_destroyed(buffer));
        assert_eq!(deleter.pending_count(), 1);

        tracker.clear(fence);
        assert!(device.was_destroyed(buffer));
        assert_eq!(deleter.pending_count(), 0);
    }

    #[test]
    fn waits_for_the_last_of_several_records() {
        let (device, tracker, deleter) = setup();
        let image = vk::Image::from_raw(9);
        let set = || [image].into_iter().collect::<ObjectSet>();
        tracker.add(vk::Fence::from_raw(1), set());
        tracker.add(vk::Fence::from_raw(2), set());

        deleter.safe_destroy(image);
        tracker.clear(vk::Fence::from_raw(2));
        assert!(!device.was_destroyed(image));

        tracker.clear(vk::Fence::from_raw(1));
        assert!(device.was_destroyed(image));
    }

    #[test]
    fn duplicate_requests_destroy_once() {
        let (device, tracker, deleter) = setup();
        let buffer = vk::Buffer::from_raw(5);
        let fence = vk::Fence::from_raw(1);
        tracker.add(fence, [buffer].into_iter().collect::<ObjectSet>());

        deleter.safe_destroy(buffer);
        deleter.safe_destroy(buffer);
        tracker.clear(fence);

        assert_eq!(device.destroy_count(buffer), 1);
    }

    #[test]
    fn clear_all_releases_pending_objects() {
        let (device, tracker, deleter) = setup();
        let buffer = vk::Buffer::from_raw(5);
        tracker.add(vk::Fence::from_raw(1), [buffer].into_iter().collect::<ObjectSet>());

        deleter.safe_destroy(buffer);
        tracker.clear_all();

        assert!(device.was_destroyed(buffer));
    }

    #[test]
    fn dropping_the_deleter_unsubscribes() {
        let (_device, tracker, deleter) = setup();
        drop(deleter);

        // Would call into a dead deleter if the subscription survived.
        tracker.add(vk::Fence::from_raw(1), ObjectSet::new());
        tracker.clear(vk::Fence::from_raw(1));
    }
}
