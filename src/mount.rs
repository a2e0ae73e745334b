//! Mount lifecycle glue.
//!
//! Mounting is the only host-specific part of the library, so it hides
//! behind the [`Mounter`] trait: the engine only needs `mount(target)` to
//! produce a device FD and `umount(target)` to undo it. The default
//! implementation drives the setuid `fusermount` helper, which performs the
//! privileged mount and hands the `/dev/fuse` FD back over a unix socket.

use std::io::{self, ErrorKind, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{self, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType};
use tokio::process::Command;
use tokio::task;
use tracing::debug;

use crate::find_fusermount;

/// the fd number the fusermount helper expects to find the socket on
const FUSE_COMMFD: RawFd = 3;

const FUSE_COMMFD_ENV: &str = "_FUSE_COMMFD";

#[trait_make::make(Send)]
/// Attaches a fuse device endpoint to a mount target. Implemented by
/// [`Fusermount`] for real mounts; tests substitute a mock delivering one
/// end of a socketpair.
pub trait Mounter {
    /// mount the target and return the device FD serving it
    async fn mount(&self, target: &Path) -> io::Result<OwnedFd>;

    /// unmount the target
    async fn umount(&self, target: &Path) -> io::Result<()>;
}

/// Mounts through the host `fusermount` binary.
#[derive(Debug, Default, Clone)]
pub struct Fusermount {
    _private: (),
}

impl Fusermount {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mounter for Fusermount {
    async fn mount(&self, target: &Path) -> io::Result<OwnedFd> {
        let binary_path = find_fusermount()?;

        let (sock, child_sock) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        debug!("running {:?} for target {:?}", binary_path, target);

        let mut command = Command::new(binary_path);
        command.env(FUSE_COMMFD_ENV, FUSE_COMMFD.to_string()).arg(target);

        let child_fd = child_sock.as_raw_fd();
        // Safety: dup2 is async-signal-safe and child_fd outlives the spawn
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(child_fd, FUSE_COMMFD) == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            });
        }

        let output = command.output().await?;
        drop(child_sock);

        if !output.status.success() {
            return Err(io::Error::new(
                ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let fd = sock.as_raw_fd();
        let device_fd = task::spawn_blocking(move || receive_device_fd(fd))
            .await
            .expect("receive task never panics")?;
        drop(sock);

        // Safety: the fd was just received and is owned by no one else
        Ok(unsafe { OwnedFd::from_raw_fd(device_fd) })
    }

    async fn umount(&self, target: &Path) -> io::Result<()> {
        let binary_path = find_fusermount()?;

        debug!("running {:?} -u for target {:?}", binary_path, target);

        let output = Command::new(binary_path).arg("-u").arg(target).output().await?;

        if !output.status.success() {
            return Err(io::Error::new(
                ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(())
    }
}

/// Receive exactly one device FD from the helper as an `SCM_RIGHTS` control
/// message, then mark it non-blocking and close-on-exec.
fn receive_device_fd(sock: RawFd) -> io::Result<RawFd> {
    let mut buf = vec![];

    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let mut bufs = [IoSliceMut::new(&mut buf)];

    let msg = socket::recvmsg::<()>(sock, &mut bufs[..], Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(io::Error::from)?;

    let fd = if let Some(ControlMessageOwned::ScmRights(fds)) = msg.cmsgs()?.next() {
        if fds.is_empty() {
            return Err(io::Error::new(ErrorKind::Other, "no fuse fd"));
        }

        fds[0]
    } else {
        return Err(io::Error::new(ErrorKind::Other, "get fuse fd failed"));
    };

    if fd < 0 {
        return Err(io::Error::new(ErrorKind::Other, "received bad fuse fd"));
    }

    nix::fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;

    let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    nix::fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

    Ok(fd)
}
