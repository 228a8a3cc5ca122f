//! Process-wide abort signal.
//!
//! Subscribers register a callback with [`AbortBus::subscribe`] and stay registered for as
//! long as they hold the returned [`AbortSubscription`]. [`AbortBus::trigger`] invokes every
//! registered callback, synchronously, on the triggering thread.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<(u64, Callback)>,
}

#[derive(Clone, Default)]
pub struct AbortBus {
    subs: Arc<Mutex<Subscribers>>,
}

/// Keeps a callback registered; dropping it deregisters.
pub struct AbortSubscription {
    subs: Weak<Mutex<Subscribers>>,
    id: u64,
}

impl AbortBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> AbortSubscription {
        let mut subs = self.subs.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.list.push((id, Arc::new(callback)));
        AbortSubscription {
            subs: Arc::downgrade(&self.subs),
            id,
        }
    }

    /// Invokes every subscriber once. Returns how many were invoked.
    pub fn trigger(&self) -> usize {
        let snapshot: Vec<Callback> = self.subs.lock().list.iter().map(|(_, c)| c.clone()).collect();
        tracing::info!(subscribers = snapshot.len(), "abort triggered");
        for callback in snapshot.iter() {
            callback();
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().list.len()
    }
}

impl Drop for AbortSubscription {
    fn drop(&mut self) {
        if let Some(subs) = self.subs.upgrade() {
            subs.lock().list.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_trigger_drop() {
        let bus = AbortBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.trigger(), 1);
        assert_eq!(bus.trigger(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.trigger(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscriber_may_unsubscribe_others_during_trigger() {
        let bus = AbortBus::new();
        let other = Arc::new(Mutex::new(Some(bus.subscribe(|| {}))));
        let o = other.clone();
        let _sub = bus.subscribe(move || {
            o.lock().take();
        });
        assert_eq!(bus.trigger(), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
