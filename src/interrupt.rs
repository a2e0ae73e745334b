//! Kernel-initiated request cancellation.
//!
//! A `FUSE_INTERRUPT` message names the unique ID of an earlier request.
//! While a request is outstanding its unique ID maps to an [`Interrupt`]
//! token here; the handler observes the token through
//! [`Request::interrupted`][crate::Request::interrupted] and may give up and
//! reply `EINTR`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_notify::Notify;

/// Cancellation token for one in-flight request.
#[derive(Debug)]
pub(crate) struct Interrupt {
    fired: AtomicBool,
    notify: Notify,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

impl Interrupt {
    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub(crate) async fn fired(&self) {
        if self.is_fired() {
            return;
        }

        self.notify.notified().await;
    }
}

#[derive(Debug, Default)]
pub(crate) struct InterruptRegistry {
    requests: Mutex<HashMap<u64, Arc<Interrupt>>>,
}

impl InterruptRegistry {
    pub(crate) fn register(&self, unique: u64) -> Arc<Interrupt> {
        let interrupt = Arc::new(Interrupt::default());

        self.requests
            .lock()
            .expect("interrupt registry lock never poisoned")
            .insert(unique, interrupt.clone());

        interrupt
    }

    /// Fire the token for `unique`. A miss is normal: the request may have
    /// completed before the interrupt arrived.
    pub(crate) fn fire(&self, unique: u64) -> bool {
        let interrupt = self
            .requests
            .lock()
            .expect("interrupt registry lock never poisoned")
            .get(&unique)
            .cloned();

        match interrupt {
            None => false,
            Some(interrupt) => {
                interrupt.fire();

                true
            }
        }
    }

    pub(crate) fn remove(&self, unique: u64) {
        self.requests
            .lock()
            .expect("interrupt registry lock never poisoned")
            .remove(&unique);
    }
}
