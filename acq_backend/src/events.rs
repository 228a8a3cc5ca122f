//! Minimal typed event emitter.
//!
//! An [`Emitter<E>`] holds a list of listeners for one event type. [`Emitter::emit`] calls
//! every listener synchronously, on the thread that called `emit`, in registration order.
//! Listeners are snapshotted before delivery, so a listener may register or remove other
//! listeners without deadlocking.

use parking_lot::Mutex;
use std::sync::Arc;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Identifier returned by [`Emitter::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Emitter<E> {
    listeners: Mutex<(u64, Vec<(ListenerId, Listener<E>)>)>,
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new((0, Vec::new())),
        }
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut guard = self.listeners.lock();
        let (next_id, listeners) = &mut *guard;
        let id = ListenerId(*next_id);
        *next_id += 1;
        listeners.push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.lock();
        let before = guard.1.len();
        guard.1.retain(|(lid, _)| *lid != id);
        guard.1.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .1
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().1.len()
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_and_remove() {
        let emitter: Emitter<usize> = Emitter::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t = total.clone();
        let id = emitter.on(move |v| {
            t.fetch_add(*v, Ordering::SeqCst);
        });
        emitter.emit(&3);
        emitter.emit(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(&10);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn delivered_on_emitting_thread() {
        let emitter: Arc<Emitter<()>> = Arc::new(Emitter::new());
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        emitter.on(move |_| {
            *s.lock() = Some(std::thread::current().id());
        });
        let e = emitter.clone();
        let emitter_thread = std::thread::spawn(move || {
            e.emit(&());
            std::thread::current().id()
        })
        .join()
        .unwrap();
        assert_eq!(*seen.lock(), Some(emitter_thread));
    }
}
