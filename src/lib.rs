//! FUSE user-space library speaking the kernel 7.x protocol directly.
//!
//! This crate implements the device side of FUSE (Filesystem in Userspace):
//! it reads framed requests from a `/dev/fuse` endpoint, decodes them into
//! typed operations, dispatches them to a user supplied [`Filesystem`] and
//! writes the replies back. It owns protocol version negotiation, the
//! per-request buffer lifetime, concurrent dispatch, deadline handling,
//! errno mapping, the mount lifecycle and graceful shutdown.
//!
//! The library doesn't depend on `libfuse`; mounting goes through the
//! setuid `fusermount` helper binary, so no root permission is required.
//!
//! # Notes:
//!
//! The API is inode based: the library carries 64-bit node IDs verbatim and
//! the filesystem owns their meaning. Node ID 1 is the root.
//!
//! ```no_run
//! use fuse7::{Filesystem, Options, Server};
//!
//! struct NullFs;
//!
//! impl Filesystem for NullFs {}
//!
//! # async fn run() -> Result<(), fuse7::Error> {
//! let server = Server::new(Options::default());
//! server.serve(NullFs, "/tmp/mount").await?;
//! server.shutdown(Some(std::time::Duration::from_secs(1))).await
//! # }
//! ```

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::stat::mode_t;

use crate::abi::{
    fuse_setattr_in, FATTR_ATIME, FATTR_ATIME_NOW, FATTR_CTIME, FATTR_GID, FATTR_LOCKOWNER,
    FATTR_MODE, FATTR_MTIME, FATTR_MTIME_NOW, FATTR_SIZE, FATTR_UID,
};
pub use crate::abi::FUSE_ROOT_ID;
pub use crate::errno::Errno;
pub use crate::error::{Error, ProtocolError};
pub use crate::filesystem::Filesystem;
pub use crate::helper::{mode_from_kind_and_perm, perm_from_mode_and_kind};
pub use crate::mount::{Fusermount, Mounter};
pub use crate::request::Request;
pub use crate::server::{Options, Server};

pub(crate) mod abi;
mod buffer;
mod connection;
mod errno;
mod error;
mod filesystem;
mod fleet;
mod helper;
mod interrupt;
mod mount;
pub mod reply;
mod request;
mod server;
pub(crate) mod session;

pub mod prelude {
    pub use crate::reply::FileAttr;
    pub use crate::reply::*;
    pub use crate::Errno;
    pub use crate::FileType;
    pub use crate::Filesystem;
    pub use crate::Options;
    pub use crate::Request;
    pub use crate::Server;
    pub use crate::SetAttr;
}

/// Filesystem Inode.
pub type Inode = u64;

/// pre-defined Result, the Err type is [`Errno`].
pub type Result<T> = std::result::Result<T, Errno>;

/// File types
#[derive(Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum FileType {
    /// Named pipe (S_IFIFO)
    NamedPipe,
    /// Character device (S_IFCHR)
    CharDevice,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Directory (S_IFDIR)
    Directory,
    /// Regular file (S_IFREG)
    RegularFile,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Unix domain socket (S_IFSOCK)
    Socket,
}

impl FileType {
    /// convert [`FileType`] into [`mode_t`]
    pub const fn const_into_mode_t(self) -> mode_t {
        match self {
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Directory => libc::S_IFDIR,
            FileType::RegularFile => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
        }
    }
}

impl From<FileType> for mode_t {
    fn from(kind: FileType) -> Self {
        kind.const_into_mode_t()
    }
}

/// the setattr argument.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SetAttr {
    /// set file or directory mode.
    pub mode: Option<mode_t>,
    /// set file or directory uid.
    pub uid: Option<u32>,
    /// set file or directory gid.
    pub gid: Option<u32>,
    /// set file or directory size.
    pub size: Option<u64>,
    /// the lock_owner argument.
    pub lock_owner: Option<u64>,
    /// set file or directory atime.
    pub atime: Option<Timestamp>,
    /// set file or directory mtime.
    pub mtime: Option<Timestamp>,
    /// set file or directory ctime.
    pub ctime: Option<Timestamp>,
}

/// Helper for constructing Timestamps from fuse_setattr_in, which sign-casts
/// the seconds.
macro_rules! fsai2ts {
    ( $secs: expr, $nsecs: expr) => {
        Some(Timestamp::new($secs as i64, $nsecs))
    };
}

impl From<&fuse_setattr_in> for SetAttr {
    fn from(setattr_in: &fuse_setattr_in) -> Self {
        let mut set_attr = Self::default();

        if setattr_in.valid & FATTR_MODE > 0 {
            set_attr.mode = Some(setattr_in.mode as mode_t);
        }

        if setattr_in.valid & FATTR_UID > 0 {
            set_attr.uid = Some(setattr_in.uid);
        }

        if setattr_in.valid & FATTR_GID > 0 {
            set_attr.gid = Some(setattr_in.gid);
        }

        if setattr_in.valid & FATTR_SIZE > 0 {
            set_attr.size = Some(setattr_in.size);
        }

        if setattr_in.valid & FATTR_ATIME > 0 {
            set_attr.atime = fsai2ts!(setattr_in.atime, setattr_in.atimensec);
        }

        if setattr_in.valid & FATTR_ATIME_NOW > 0 {
            set_attr.atime = Some(SystemTime::now().into());
        }

        if setattr_in.valid & FATTR_MTIME > 0 {
            set_attr.mtime = fsai2ts!(setattr_in.mtime, setattr_in.mtimensec);
        }

        if setattr_in.valid & FATTR_MTIME_NOW > 0 {
            set_attr.mtime = Some(SystemTime::now().into());
        }

        if setattr_in.valid & FATTR_LOCKOWNER > 0 {
            set_attr.lock_owner = Some(setattr_in.lock_owner);
        }

        if setattr_in.valid & FATTR_CTIME > 0 {
            set_attr.ctime = fsai2ts!(setattr_in.ctime, setattr_in.ctimensec);
        }

        set_attr
    }
}

/// A file's timestamp, according to FUSE.
///
/// Nearly the same as a `libc::timespec`, except for the width of the nsec
/// field.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    /// Create a new timestamp from its component parts.
    ///
    /// `nsec` should be less than 1_000_000_000.
    pub fn new(sec: i64, nsec: u32) -> Self {
        Timestamp { sec, nsec }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let d = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Timestamp {
            sec: d.as_secs().try_into().unwrap_or(i64::MAX),
            nsec: d.subsec_nanos(),
        }
    }
}

fn find_fusermount() -> io::Result<PathBuf> {
    which::which("fusermount").map_err(|err| {
        io::Error::new(
            ErrorKind::Other,
            format!("find fusermount binary failed {err:?}"),
        )
    })
}
