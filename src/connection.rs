//! The fuse device endpoint.
//!
//! A connection wraps one non-blocking `/dev/fuse` file descriptor: either
//! the FD the mount helper delivered, or a clone bound to the same mount via
//! the `FUSE_DEV_IOC_CLONE` ioctl. Each clone has its own request queue in
//! the kernel; a reply must go back on the FD whose read produced the
//! request.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use async_notify::Notify;
use futures_util::lock::Mutex;
use nix::fcntl::{FcntlArg, OFlag};
use nix::unistd;
use tokio::io::unix::AsyncFd;

const DEV_FUSE: &str = "/dev/fuse";

nix::ioctl_read!(fuse_dev_ioc_clone, 229, 0, u32);

#[derive(Debug)]
pub(crate) struct FuseConnection {
    fd: AsyncFd<OwnedFd>,
    read: Mutex<()>,
    write: Mutex<()>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl FuseConnection {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        set_fd_non_blocking(&fd)?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            read: Mutex::new(()),
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Open a fresh `/dev/fuse` FD and bind it to this connection's mount.
    /// The clone gets its own request queue in the kernel.
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(DEV_FUSE)?;

        let mut parent_fd = self.fd.get_ref().as_raw_fd() as u32;

        // Safety: both fds are open and parent_fd points at a live u32
        unsafe {
            fuse_dev_ioc_clone(file.as_raw_fd(), &mut parent_fd)?;
        }

        Self::new(OwnedFd::from(file))
    }

    /// Read one framed request. The fuse device hands over exactly one
    /// message per read.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _guard = self.read.lock().await;

        loop {
            let mut read_guard = self.fd.readable().await?;

            if let Ok(result) =
                read_guard.try_io(|fd| unistd::read(fd.as_raw_fd(), buf).map_err(io::Error::from))
            {
                return result;
            }
        }
    }

    /// Write one reply frame. Writers on the same FD are serialized, so a
    /// reply is never interleaved with another.
    pub(crate) async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.write.lock().await;

        unistd::write(self.fd.get_ref(), buf).map_err(Into::into)
    }

    /// Mark the connection broken and wake its poll loop.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn closed(&self) {
        if self.is_closed() {
            return;
        }

        self.close_notify.notified().await;
    }
}

impl AsFd for FuseConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.get_ref().as_fd()
    }
}

fn set_fd_non_blocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = nix::fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;

    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;

    nix::fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn clone_ioctl_matches_the_kernel_command_code() {
        let code = nix::request_code_read!(229, 0, std::mem::size_of::<u32>()) as u32;
        assert_eq!(code, crate::abi::FUSE_DEV_IOC_CLONE);
    }
}
