use std::ffi::OsStr;

use crate::reply::*;
use crate::request::Request;
use crate::{Inode, Result, SetAttr};

#[allow(unused_variables)]
#[trait_make::make(Send)]
/// Inode based filesystem trait.
///
/// The library is stateless about inodes: it carries the 64-bit node IDs the
/// filesystem chooses and never owns a node graph. ID 1 is the root.
pub trait Filesystem {
    /// Initialize filesystem. Called as part of protocol negotiation, before
    /// any other filesystem method. `proposed` holds the values the library
    /// is about to commit; the implementation may tighten them. Values may
    /// never exceed what the kernel offered, the library verifies the result
    /// and fails negotiation with `EPROTO` when the callback widened
    /// anything.
    async fn init(&self, req: Request, proposed: &mut ReplyInit) -> Result<()> {
        Ok(())
    }

    /// clean up filesystem. Called on filesystem exit, or when the kernel
    /// tears the mount down underneath the library.
    async fn destroy(&self, req: Request) {}

    /// look up a directory entry by name and get its attributes. Unless the
    /// `FUSE_EXPORT_SUPPORT` capability was negotiated, the kernel resolves
    /// `.` and `..` itself and never sends them here.
    async fn lookup(&self, req: Request, parent: Inode, name: &OsStr) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// forget an inode. The nlookup parameter indicates the number of
    /// lookups previously performed on this inode. The filesystem may ignore
    /// forget calls if the inodes don't need to have a limited lifetime. On
    /// unmount it is not guaranteed that all referenced inodes will receive
    /// a forget message. This operation carries no reply.
    async fn forget(&self, req: Request, inode: Inode, nlookup: u64) {}

    /// forget more than one inode, a batch version of
    /// [`forget`][Filesystem::forget]. This operation carries no reply.
    async fn batch_forget(&self, req: Request, inodes: &[Inode]) {}

    /// get file attributes. `fh` contains the value set by the open method,
    /// if the kernel passed one along.
    async fn getattr(
        &self,
        req: Request,
        inode: Inode,
        fh: Option<u64>,
        flags: u32,
    ) -> Result<ReplyAttr> {
        Err(libc::ENOSYS.into())
    }

    /// set file attributes. `fh` contains the value set by the open method,
    /// if the caller had the file open.
    async fn setattr(
        &self,
        req: Request,
        inode: Inode,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        Err(libc::ENOSYS.into())
    }

    /// read symbolic link.
    async fn readlink(&self, req: Request, inode: Inode) -> Result<ReplyData> {
        Err(libc::ENOSYS.into())
    }

    /// create a symbolic link.
    async fn symlink(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        link: &OsStr,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// create file node. Create a regular file, character device, block
    /// device, fifo or socket node.
    async fn mknod(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// create a directory.
    async fn mkdir(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// remove a file.
    async fn unlink(&self, req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// remove a directory.
    async fn rmdir(&self, req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// rename a file or directory. For a plain rename `flags` is 0; a
    /// `RENAME2` request passes the kernel's flags through verbatim.
    async fn rename(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// create a hard link.
    async fn link(
        &self,
        req: Request,
        inode: Inode,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// open a file. Open flags (with the exception of
    /// [`O_CREAT`](libc::O_CREAT), [`O_EXCL`](libc::O_EXCL) and
    /// [`O_NOCTTY`](libc::O_NOCTTY)) are available as flags. The filesystem
    /// may store an arbitrary file handle (pointer, index, etc) in `fh`, and
    /// use this in other file operations (read, release, lseek). A
    /// filesystem may also implement stateless file I/O and not store
    /// anything in `fh`.
    async fn open(&self, req: Request, inode: Inode, flags: u32) -> Result<ReplyOpen> {
        Err(libc::ENOSYS.into())
    }

    /// read data. The filesystem fills `buf` from the start and returns how
    /// many bytes it put there; the library sends exactly that many. `buf`
    /// may be shorter than `size` when the request does not leave enough
    /// reply room in the transfer buffer; a short fill is a short read,
    /// which the kernel handles.
    async fn read(
        &self,
        req: Request,
        inode: Inode,
        fh: u64,
        offset: u64,
        size: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        Err(libc::ENOSYS.into())
    }

    /// release an open file. Release is called when there are no more
    /// references to an open file: all file descriptors are closed and all
    /// memory mappings are unmapped. For every open call there will be
    /// exactly one release call. The filesystem may reply with an error, but
    /// error values are not returned to the `close()` or `munmap()` which
    /// triggered the release. `flags` will contain the same flags as for
    /// open. `flush` means flush the data or not when closing file.
    async fn release(
        &self,
        req: Request,
        inode: Inode,
        fh: u64,
        flags: u32,
        lock_owner: u64,
        flush: bool,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// Get an extended attribute. If `size` is 0, the kernel is probing for
    /// the value size: answer with [`ReplyXAttr::Size`]. Otherwise answer
    /// with [`ReplyXAttr::Data`], or `Err(ERANGE)` when the value does not
    /// fit in `size` bytes.
    async fn getxattr(
        &self,
        req: Request,
        inode: Inode,
        name: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr> {
        Err(libc::ENOSYS.into())
    }

    /// check file access permissions. This will be called for the `access()`
    /// system call. If the `default_permissions` mount option is given, this
    /// method is not called.
    async fn access(&self, req: Request, inode: Inode, mask: u32) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// find next data or hole after the specified offset.
    async fn lseek(
        &self,
        req: Request,
        inode: Inode,
        fh: u64,
        offset: u64,
        whence: u32,
    ) -> Result<ReplyLSeek> {
        Err(libc::ENOSYS.into())
    }

    /// copy a range of data from one file to another. This can improve
    /// performance because it reduces data copying: normally data would
    /// travel from the FUSE server to the kernel, then to user-space, then
    /// to the kernel, and finally back to the FUSE server.
    #[allow(clippy::too_many_arguments)]
    async fn copy_file_range(
        &self,
        req: Request,
        inode: Inode,
        fh_in: u64,
        off_in: u64,
        inode_out: Inode,
        fh_out: u64,
        off_out: u64,
        length: u64,
        flags: u64,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }
}
