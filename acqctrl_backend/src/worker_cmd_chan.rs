use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Versioned single-value channel between a controller and a worker thread.
///
/// The controller posts a whole new value with [`CmdChan::send`] (or edits it in place
/// with [`CmdChan::update`]); every post bumps the version number. Workers hold a
/// [`CmdRecvr`] and decide themselves when to look at the latest value, so a post never
/// interrupts work in progress: the worker picks it up at its next check.
pub struct CmdChan<T> {
    cmd: Arc<Mutex<(usize, T)>>, // (msg_num, value)
    condvar: Arc<Condvar>,
}

impl<T: Clone> CmdChan<T> {
    pub fn new(init: T) -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, init))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr<T> {
        // A receiver created late has already "seen" everything posted so far
        let (msg_num, _) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, value: T) -> usize {
        self.update(|v| *v = value)
    }

    /// Edits the posted value under the lock and publishes it. Returns the new version.
    pub fn update<F: FnOnce(&mut T)>(&self, edit: F) -> usize {
        let mut guard = self.cmd.lock();
        let (msg_num, value) = &mut *guard;
        edit(value);
        *msg_num += 1;
        self.condvar.notify_all();
        *msg_num
    }

    /// Like [`CmdChan::update`], but the edit may reject the change, leaving value and
    /// version untouched.
    pub fn try_update<E, F: FnOnce(&mut T) -> Result<(), E>>(&self, edit: F) -> Result<usize, E> {
        let mut guard = self.cmd.lock();
        let (msg_num, value) = &mut *guard;
        let mut edited = value.clone();
        edit(&mut edited)?;
        *value = edited;
        *msg_num += 1;
        self.condvar.notify_all();
        Ok(*msg_num)
    }

    /// Current (version, value).
    pub fn latest(&self) -> (usize, T) {
        let guard = self.cmd.lock();
        (guard.0, guard.1.clone())
    }
}

impl<T> Clone for CmdChan<T> {
    fn clone(&self) -> Self {
        Self {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
        }
    }
}

pub struct CmdRecvr<T> {
    cmd: Arc<Mutex<(usize, T)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl<T: Clone> CmdRecvr<T> {
    /// Latest (version, value); marks it viewed.
    pub fn latest(&mut self) -> (usize, T) {
        let guard = self.cmd.lock();
        self.viewed_msg_num = guard.0;
        (guard.0, guard.1.clone())
    }

    /// True if a value was posted since the last [`CmdRecvr::latest`].
    pub fn has_news(&self) -> bool {
        self.cmd.lock().0 != self.viewed_msg_num
    }

    /// Waits up to `timeout` for a post newer than the last viewed one.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<(usize, T)> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.cmd.lock();
        while guard.0 == self.viewed_msg_num {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return None;
            }
        }
        self.viewed_msg_num = guard.0;
        Some((guard.0, guard.1.clone()))
    }
}
