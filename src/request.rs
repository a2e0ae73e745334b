use std::sync::Arc;

use crate::abi::fuse_in_header;
use crate::interrupt::Interrupt;

#[derive(Debug, Clone)]
/// Request data
pub struct Request {
    /// the unique identifier of this request.
    pub unique: u64,
    /// the uid of this request.
    pub uid: u32,
    /// the gid of this request.
    pub gid: u32,
    /// the pid of this request.
    pub pid: u32,
    interrupt: Arc<Interrupt>,
}

impl Request {
    pub(crate) fn new(header: &fuse_in_header, interrupt: Arc<Interrupt>) -> Self {
        Self {
            unique: header.unique,
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
            interrupt,
        }
    }

    /// a request the kernel did not ask for, used when the library calls
    /// into the filesystem on its own (destroy on teardown)
    pub(crate) fn background() -> Self {
        Self {
            unique: 0,
            uid: 0,
            gid: 0,
            pid: 0,
            interrupt: Arc::new(Interrupt::default()),
        }
    }

    /// whether the kernel has interrupted this request. A handler that
    /// honors the interrupt should reply [`EINTR`][libc::EINTR].
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_fired()
    }

    /// resolves when the kernel interrupts this request. Intended for
    /// `select`-style use next to slow work inside a handler.
    pub async fn interrupted(&self) {
        self.interrupt.fired().await
    }
}
