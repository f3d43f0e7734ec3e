//! Cancellation for work detached from a slot lifecycle
//!
//! Every `start()` begins a new generation. Helper threads hold a
//! [`LifecycleToken`]; once the slot stops or restarts the token goes
//! stale and any sleep on it wakes immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

struct Inner {
    generation: AtomicU64,
    stopping: AtomicBool,
    /// Dropped to wake every sleeper of the current generation
    cancel: Mutex<(Option<Sender<()>>, Receiver<()>)>,
}

/// Generation counter plus stop flag owned by a slot
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

/// Handle for detached work started during one generation
#[derive(Clone)]
pub struct LifecycleToken {
    generation: u64,
    cancel_rx: Receiver<()>,
    inner: Arc<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                generation: AtomicU64::new(0),
                stopping: AtomicBool::new(true),
                cancel: Mutex::new((Some(tx), rx)),
            }),
        }
    }

    /// Start a new generation, invalidating all earlier tokens
    pub fn begin(&self) -> LifecycleToken {
        let mut cancel = self.inner.cancel.lock();
        let (tx, rx) = bounded(0);
        *cancel = (Some(tx), rx.clone());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.stopping.store(false, Ordering::SeqCst);
        LifecycleToken {
            generation,
            cancel_rx: rx,
            inner: self.inner.clone(),
        }
    }

    /// Mark the lifecycle as stopping and wake all sleepers
    pub fn cancel(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.cancel.lock().0.take();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Token for the current generation
    pub fn token(&self) -> LifecycleToken {
        let cancel = self.inner.cancel.lock();
        LifecycleToken {
            generation: self.generation(),
            cancel_rx: cancel.1.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl LifecycleToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Still the running generation and not stopping
    pub fn is_current(&self) -> bool {
        !self.inner.stopping.load(Ordering::SeqCst)
            && self.inner.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Sleep for `duration`; false if the token went stale meanwhile
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.cancel_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_current(),
            _ => false,
        }
    }
}
