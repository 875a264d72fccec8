//! Tracking of GPU objects referenced by unfinished work.
//!
//! Every submission registers an inflight record: its completion fence and
//! the objects its command lists reference. A handle is in flight while at
//! least one record containing it has not been cleared. Records are cleared
//! explicitly by whoever observed the fence signal; the tracker itself never
//! polls fences.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::handle::{ObjectHandle, ObjectSet};

/// Notification sent to tracker subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightEvent {
    /// A record was registered for the fence.
    Added(vk::Fence),
    /// The record for the fence was cleared.
    Cleared(vk::Fence),
    /// All records were dropped at teardown.
    ClearedAll,
}

/// Identifies a subscription for [`InflightTracker::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(InflightEvent) + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    /// Fence raw handle to the objects it protects.
    records: HashMap<u64, ObjectSet>,
    /// How many live records reference each handle.
    refcounts: HashMap<ObjectHandle, usize>,
}

impl TrackerState {
    fn retain(&mut self, objects: &ObjectSet) {
        for handle in objects.iter() {
            *self.refcounts.entry(handle).or_insert(0) += 1;
        }
    }

    fn forget(&mut self, objects: &ObjectSet) {
        for handle in objects.iter() {
            if let Some(count) = self.refcounts.get_mut(&handle) {
                *count -= 1;
                if *count == 0 {
                    self.refcounts.remove(&handle);
                }
            }
        }
    }
}

/// Maps completion fences to the objects they keep alive.
#[derive(Default)]
pub struct InflightTracker {
    state: Mutex<TrackerState>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_subscription: AtomicU64,
}

impl InflightTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the objects protected by `fence`.
    ///
    /// Adding to a fence that already has a record extends that record.
    pub fn add(&self, fence: vk::Fence, objects: ObjectSet) {
        {
            let mut state = self.state.lock();
            let record = state.records.entry(fence.as_raw()).or_default();
            let mut fresh = ObjectSet::new();
            for handle in objects {
                if !record.contains(handle) {
                    fresh.insert(handle);
                }
            }
            record.merge(fresh.clone());
            state.retain(&fresh);
            tracing::trace!(
                "Inflight record {:?}: +{} objects, {} records live",
                fence,
                fresh.len(),
                state.records.len()
            );
        }
        self.notify(InflightEvent::Added(fence));
    }

    /// Whether any uncleared record references the handle.
    #[must_use]
    pub fn is_inflight(&self, handle: impl Into<ObjectHandle>) -> bool {
        self.state.lock().refcounts.contains_key(&handle.into())
    }

    /// Whether a record exists for the fence.
    #[must_use]
    pub fn is_tracked(&self, fence: vk::Fence) -> bool {
        self.state.lock().records.contains_key(&fence.as_raw())
    }

    /// Number of live records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Drop the record of a fence the caller has seen signaled.
    ///
    /// Returns whether a record existed.
    pub fn clear(&self, fence: vk::Fence) -> bool {
        let existed = {
            let mut state = self.state.lock();
            match state.records.remove(&fence.as_raw()) {
                Some(objects) => {
                    state.forget(&objects);
                    true
                }
                None => false,
            }
        };
        if existed {
            self.notify(InflightEvent::Cleared(fence));
        }
        existed
    }

    /// Drop every record without per-fence confirmation.
    ///
    /// Only valid at teardown after a device-idle wait.
    pub fn clear_all(&self) {
        {
            let mut state = self.state.lock();
            if !state.records.is_empty() {
                tracing::debug!("Clearing {} inflight records", state.records.len());
            }
            state.records.clear();
            state.refcounts.clear();
        }
        self.notify(InflightEvent::ClearedAll);
    }

    /// Register a callback invoked after every add or clear.
    ///
    /// Callbacks run on the thread that mutated the tracker, after the
    /// tracker lock is released, so they may query the tracker.
    pub fn subscribe(&self, callback: impl Fn(InflightEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    fn notify(&self, event: InflightEvent) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    fn buffer(raw: u64) -> vk::Buffer {
        vk::Buffer::from_raw(raw)
    }

    fn objects(raws: &[u64]) -> ObjectSet {
        raws.iter().map(|&raw| buffer(raw)).collect()
    }

    #[test]
    fn unknown_handles_are_not_inflight() {
        let tracker = InflightTracker::new();
        assert!(!tracker.is_inflight(buffer(1)));
        assert!(!tracker.clear(fence(1)));
    }

    #[test]
    fn handle_stays_inflight_until_every_record_is_cleared() {
        let tracker = InflightTracker::new();
        tracker.add(fence(1), objects(&[10, 11]));
        tracker.add(fence(2), objects(&[10]));

        assert!(tracker.clear(fence(1)));
        assert!(tracker.is_inflight(buffer(10)));
        assert!(!tracker.is_inflight(buffer(11)));

        assert!(tracker.clear(fence(2)));
        assert!(!tracker.is_inflight(buffer(10)));
        assert_eq!(tracker.record_count(), 0);
    }

    #[test]
    fn clear_is_not_repeated() {
        let tracker = InflightTracker::new();
        tracker.add(fence(1), objects(&[10]));

        assert!(tracker.clear(fence(1)));
        assert!(!tracker.clear(fence(1)));
    }

    #[test]
    fn adding_to_the_same_fence_extends_the_record() {
        let tracker = InflightTracker::new();
        tracker.add(fence(1), objects(&[10]));
        tracker.add(fence(1), objects(&[10, 11]));

        assert_eq!(tracker.record_count(), 1);
        tracker.clear(fence(1));
        assert!(!tracker.is_inflight(buffer(10)));
        assert!(!tracker.is_inflight(buffer(11)));
    }

    #[test]
    fn category_is_part_of_identity() {
        let tracker = InflightTracker::new();
        tracker.add(fence(1), objects(&[10]));

        assert!(tracker.is_inflight(buffer(10)));
        assert!(!tracker.is_inflight(vk::Image::from_raw(10)));
    }

    #[test]
    fn random_add_clear_sequences_match_a_model() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x2545_f491);
        let tracker = InflightTracker::new();
        let mut model: std::collections::HashMap<u64, Vec<u64>> = Default::default();

        for _ in 0..500 {
            let f = rng.gen_range(1..=8);
            if rng.gen_bool(0.5) {
                let count = rng.gen_range(1..=4);
                let raws: Vec<u64> = (0..count).map(|_| rng.gen_range(1..=16)).collect();
                tracker.add(fence(f), objects(&raws));
                model.entry(f).or_default().extend(raws);
            } else {
                assert_eq!(tracker.clear(fence(f)), model.remove(&f).is_some());
            }

            for h in 1..=16 {
                let expected = model.values().any(|raws| raws.contains(&h));
                assert_eq!(tracker.is_inflight(buffer(h)), expected, "handle {h}");
            }
        }
    }

    #[test]
    fn clear_all_drops_everything() {
        let tracker = InflightTracker::new();
        tracker.add(fence(1), objects(&[10]));
        tracker.add(fence(2), objects(&[11]));

        tracker.clear_all();
        assert_eq!(tracker.record_count(), 0);
        assert!(!tracker.is_inflight(buffer(10)));
        assert!(!tracker.is_tracked(fence(2)));
    }

    #[test]
    fn subscribers_see_events_and_can_query() {
        let tracker = Arc::new(InflightTracker::new());
        let events = Arc::new(Mutex::new(Vec::new()));

        let id = {
            let events = events.clone();
            let weak = Arc::downgrade(&tracker);
            tracker.subscribe(move |event| {
                let inflight = weak
                    .upgrade()
                    .is_some_and(|tracker| tracker.is_inflight(buffer(10)));
                events.lock().push((event, inflight));
            })
        };

        tracker.add(fence(1), objects(&[10]));
        tracker.clear(fence(1));
        assert!(tracker.unsubscribe(id));
        tracker.add(fence(2), objects(&[10]));

        assert_eq!(
            *events.lock(),
            vec![
                (InflightEvent::Added(fence(1)), true),
                (InflightEvent::Cleared(fence(1)), false),
            ]
        );
        assert!(!tracker.unsubscribe(id));
    }
}
