//! Protocol negotiation and request dispatch.
//!
//! A session is the process-wide state behind one mount: the configuration
//! the INIT exchange committed, the capacity semaphore, the live
//! connections, and the user filesystem. Dispatch is an enum match over the
//! opcode; each arm decodes the operation record off the request buffer,
//! calls the filesystem, and stages the reply in the same buffer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_notify::Notify;
use futures_util::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, instrument, warn};

use crate::abi::*;
use crate::buffer::{BufferPool, Context};
use crate::connection::FuseConnection;
use crate::error::{DispatchError, Error};
use crate::filesystem::Filesystem;
use crate::interrupt::{Interrupt, InterruptRegistry};
use crate::reply::{ReplyInit, ReplyXAttr};
use crate::request::Request;
use crate::server::Options;
use crate::{Errno, SetAttr};

/// What dispatch decided about writing back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// write the staged reply
    Reply,
    /// the operation carries no reply; writing would be a protocol violation
    NoReply,
}

type OpResult = Result<Disposition, DispatchError>;

/// The configuration an accepted INIT exchange committed. Written once by
/// the negotiating worker, read by everyone afterwards.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Negotiated {
    pub(crate) minor: u32,
    pub(crate) flags: u32,
    pub(crate) max_readahead: u32,
    pub(crate) max_background: u16,
    pub(crate) congestion_threshold: u16,
    pub(crate) max_write: u32,
    pub(crate) time_gran: u32,
    pub(crate) max_pages: u16,
}

/// Session state that the server keeps a handle on without knowing the
/// filesystem type: shutdown signalling, error bookkeeping, capacity and the
/// connection registry.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) capacity: Arc<Semaphore>,
    pub(crate) starved: Notify,
    pub(crate) pool: Arc<BufferPool>,
    connections: Mutex<Vec<Arc<FuseConnection>>>,
    done: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    first_error: Mutex<Option<Error>>,
}

impl Shared {
    fn new(options: Options) -> Self {
        let (done, done_rx) = watch::channel(false);

        Self {
            capacity: Arc::new(Semaphore::new(DEFAULT_MAX_BACKGROUND as usize)),
            starved: Notify::new(),
            pool: BufferPool::new(),
            connections: Mutex::new(vec![]),
            done,
            done_rx,
            first_error: Mutex::new(None),
            options,
        }
    }

    pub(crate) fn signal_done(&self) {
        let _ = self.done.send(true);
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    pub(crate) fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// record the first fatal error; later ones are dropped
    pub(crate) fn record_error(&self, err: Error) {
        let mut first_error = self
            .first_error
            .lock()
            .expect("session error lock never poisoned");

        if first_error.is_none() {
            first_error.replace(err);
        }
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.first_error
            .lock()
            .expect("session error lock never poisoned")
            .take()
    }

    pub(crate) fn register_connection(&self, conn: Arc<FuseConnection>) {
        self.connections
            .lock()
            .expect("connection list lock never poisoned")
            .push(conn);
    }

    pub(crate) fn deregister_connection(&self, conn: &Arc<FuseConnection>) {
        self.connections
            .lock()
            .expect("connection list lock never poisoned")
            .retain(|live| !Arc::ptr_eq(live, conn));
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection list lock never poisoned")
            .len()
    }

    /// Drop an idle clone from the registry, refusing to go below one live
    /// connection. Returns whether the caller should exit its loop.
    pub(crate) fn reclaim_idle(&self, conn: &Arc<FuseConnection>) -> bool {
        let mut connections = self
            .connections
            .lock()
            .expect("connection list lock never poisoned");

        if connections.len() <= 1 {
            return false;
        }

        connections.retain(|live| !Arc::ptr_eq(live, conn));

        true
    }
}

pub(crate) struct Session<FS> {
    pub(crate) shared: Arc<Shared>,
    filesystem: FS,
    negotiated: OnceLock<Negotiated>,
    init_attempts: AtomicU32,
    interrupts: InterruptRegistry,
    destroyed: AtomicBool,
}

impl<FS: Filesystem + Send + Sync + 'static> Session<FS> {
    pub(crate) fn new(filesystem: FS, options: Options) -> Self {
        Self {
            shared: Arc::new(Shared::new(options)),
            filesystem,
            negotiated: OnceLock::new(),
            init_attempts: AtomicU32::new(0),
            interrupts: InterruptRegistry::default(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.negotiated.get().is_some()
    }

    fn minor(&self) -> u32 {
        self.negotiated
            .get()
            .map(|negotiated| negotiated.minor)
            .unwrap_or(FUSE_KERNEL_MINOR_VERSION)
    }

    #[cfg(test)]
    pub(crate) fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated.get().copied()
    }

    #[cfg(test)]
    pub(crate) fn force_negotiated(&self, negotiated: Negotiated) {
        let _ = self.negotiated.set(negotiated);
    }

    /// Call destroy on the filesystem exactly once, no matter how many
    /// connections observe the teardown.
    pub(crate) async fn destroy_once(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.filesystem.destroy(Request::background()).await;
        }
    }

    /// Register the cancellation token for a request before its worker task
    /// spawns, so an INTERRUPT read right behind it can never miss.
    pub(crate) fn register_interrupt(&self, unique: u64) -> Arc<Interrupt> {
        self.interrupts.register(unique)
    }

    /// Run one request to completion: dispatch, then write back the reply on
    /// the connection that read the request. Fatal errors close that
    /// connection; the capacity permit and the buffer free on return.
    pub(crate) async fn process(
        self: Arc<Self>,
        mut ctx: Context,
        conn: Arc<FuseConnection>,
        permit: Option<OwnedSemaphorePermit>,
        interrupt: Arc<Interrupt>,
    ) {
        let _permit = permit;

        let unique = ctx.in_header().unique;
        let request = Request::new(ctx.in_header(), interrupt);

        let result = AssertUnwindSafe(self.handle_request(&mut ctx, request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("filesystem handler panicked, request unique {}", unique);

                Err(Errno(libc::EIO).into())
            });

        self.interrupts.remove(unique);

        let errno = match result {
            Ok(Disposition::NoReply) => return,
            Ok(Disposition::Reply) => None,
            Err(DispatchError::Errno(errno)) => Some(errno),
            Err(DispatchError::Fatal(err)) => {
                error!("fatal error handling request unique {}: {}", unique, err);

                self.shared.record_error(err);
                conn.close();

                return;
            }
        };

        let reply = match ctx.finish(errno) {
            Err(err) => {
                self.shared.record_error(err.into());
                conn.close();

                return;
            }

            Ok(reply) => reply,
        };

        let write = async {
            match self.shared.options.write_timeout {
                None => conn.write(reply).await,
                Some(write_timeout) => tokio::time::timeout(write_timeout, conn.write(reply))
                    .await
                    .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into())),
            }
        };

        if let Err(err) = write.await {
            if err.raw_os_error() == Some(libc::ENOENT) {
                // the kernel already gave up on this request
                warn!("may reply interrupted fuse request, ignore this error {}", err);

                return;
            }

            error!("reply fuse failed {}", err);

            self.shared.record_error(err.into());
            conn.close();
        }
    }

    async fn handle_request(&self, ctx: &mut Context, request: Request) -> OpResult {
        let opcode = match fuse_opcode::try_from(ctx.in_header().opcode) {
            Err(err) => {
                debug!("receive unknown opcode {}", err.0);

                return Err(Errno(libc::ENOSYS).into());
            }

            Ok(opcode) => opcode,
        };

        debug!("receive opcode {}", opcode);

        if !self.ready() && opcode != fuse_opcode::FUSE_INIT {
            debug!("opcode {} received before init is done", opcode);

            return Err(Errno(libc::ENOSYS).into());
        }

        match opcode {
            fuse_opcode::FUSE_INIT => self.handle_init(ctx, request).await,
            fuse_opcode::FUSE_DESTROY => self.handle_destroy(request).await,
            fuse_opcode::FUSE_LOOKUP => self.handle_lookup(ctx, request).await,
            fuse_opcode::FUSE_FORGET => self.handle_forget(ctx, request).await,
            fuse_opcode::FUSE_BATCH_FORGET => self.handle_batch_forget(ctx, request).await,
            fuse_opcode::FUSE_GETATTR => self.handle_getattr(ctx, request).await,
            fuse_opcode::FUSE_SETATTR => self.handle_setattr(ctx, request).await,
            fuse_opcode::FUSE_READLINK => self.handle_readlink(ctx, request).await,
            fuse_opcode::FUSE_SYMLINK => self.handle_symlink(ctx, request).await,
            fuse_opcode::FUSE_MKNOD => self.handle_mknod(ctx, request).await,
            fuse_opcode::FUSE_MKDIR => self.handle_mkdir(ctx, request).await,
            fuse_opcode::FUSE_UNLINK => self.handle_unlink(ctx, request).await,
            fuse_opcode::FUSE_RMDIR => self.handle_rmdir(ctx, request).await,
            fuse_opcode::FUSE_RENAME => self.handle_rename(ctx, request).await,
            fuse_opcode::FUSE_RENAME2 => self.handle_rename2(ctx, request).await,
            fuse_opcode::FUSE_LINK => self.handle_link(ctx, request).await,
            fuse_opcode::FUSE_OPEN => self.handle_open(ctx, request).await,
            fuse_opcode::FUSE_READ => self.handle_read(ctx, request).await,
            fuse_opcode::FUSE_RELEASE => self.handle_release(ctx, request).await,
            fuse_opcode::FUSE_GETXATTR => self.handle_getxattr(ctx, request).await,
            fuse_opcode::FUSE_ACCESS => self.handle_access(ctx, request).await,
            fuse_opcode::FUSE_INTERRUPT => self.handle_interrupt(ctx),
            fuse_opcode::FUSE_LSEEK => self.handle_lseek(ctx, request).await,
            fuse_opcode::FUSE_COPY_FILE_RANGE => self.handle_copy_file_range(ctx, request).await,

            // everything else, CUSE included, has no handler here
            _ => {
                debug!("opcode {} has no handler, reply ENOSYS", opcode);

                Err(Errno(libc::ENOSYS).into())
            }
        }
    }

    /// one more INIT exchange went by without the session becoming ready
    fn note_failed_init(&self) {
        let attempts = self.init_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if attempts >= MAX_INIT_ATTEMPTS {
            error!("fuse init did not converge after {} attempts", attempts);

            self.shared
                .record_error(Error::BadInit("negotiation did not converge"));
            self.shared.signal_done();
        }
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_init(&self, ctx: &mut Context, request: Request) -> OpResult {
        let init_in: fuse_init_in = ctx
            .decode("fuse_init_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        debug!("fuse_init {:?}", init_in);

        if init_in.major < FUSE_KERNEL_VERSION {
            error!("kernel fuse major version {} too old", init_in.major);

            self.note_failed_init();

            return Err(Errno(libc::EPROTO).into());
        }

        if init_in.major > FUSE_KERNEL_VERSION {
            // tell the kernel our major and wait for it to re-issue INIT
            debug!(
                "kernel fuse major version {} is newer, ask for a downgrade",
                init_in.major
            );

            let init_out = fuse_init_out {
                major: FUSE_KERNEL_VERSION,
                minor: FUSE_KERNEL_MINOR_VERSION,
                max_readahead: 0,
                flags: 0,
                max_background: 0,
                congestion_threshold: 0,
                max_write: 0,
                time_gran: 0,
                max_pages: 0,
                _padding: 0,
                unused: [0; 8],
            };

            ctx.append_out(&init_out);
            ctx.truncate_out(init_out_reply_size(init_in.minor));

            self.note_failed_init();

            return Ok(Disposition::Reply);
        }

        let mut flags = init_in.flags & FUSE_SUPPORTED_FLAGS;

        // replies go through plain write, local splice is not available in
        // either direction
        flags &= !(FUSE_SPLICE_READ | FUSE_SPLICE_WRITE | FUSE_SPLICE_MOVE);

        let mut proposed = ReplyInit {
            flags,
            max_readahead: init_in.max_readahead,
            max_background: DEFAULT_MAX_BACKGROUND,
            congestion_threshold: DEFAULT_CONGESTION_THRESHOLD,
            max_write: 32 * page_size(),
            time_gran: DEFAULT_TIME_GRAN,
            max_pages: if flags & FUSE_MAX_PAGES > 0 {
                DEFAULT_MAX_PAGES
            } else {
                0
            },
        };

        if let Err(errno) = self.filesystem.init(request, &mut proposed).await {
            error!("filesystem init failed {}", errno);

            self.note_failed_init();

            return Err(errno.into());
        }

        if let Err(reason) = validate_init_reply(&proposed, &init_in) {
            error!("filesystem init tightened into an invalid reply: {}", reason);

            self.note_failed_init();

            return Err(Errno(libc::EPROTO).into());
        }

        let minor = init_in.minor.min(FUSE_KERNEL_MINOR_VERSION);
        let negotiated = Negotiated {
            minor,
            flags: proposed.flags,
            max_readahead: proposed.max_readahead,
            max_background: proposed.max_background,
            congestion_threshold: proposed.congestion_threshold,
            max_write: proposed.max_write,
            time_gran: proposed.time_gran,
            max_pages: proposed.max_pages,
        };

        // a second successful INIT on an already ready session changes
        // nothing
        let _ = self.negotiated.set(negotiated);

        let init_out = fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: negotiated.max_readahead,
            flags: negotiated.flags,
            max_background: negotiated.max_background,
            congestion_threshold: negotiated.congestion_threshold,
            max_write: negotiated.max_write,
            time_gran: negotiated.time_gran,
            max_pages: negotiated.max_pages,
            _padding: 0,
            unused: [0; 8],
        };

        debug!("fuse init out {:?}", init_out);

        ctx.append_out(&init_out);
        ctx.truncate_out(init_out_reply_size(minor));

        debug!("fuse init done, negotiated minor {}", minor);

        Ok(Disposition::Reply)
    }

    async fn handle_destroy(&self, request: Request) -> OpResult {
        debug!("receive fuse destroy");

        self.destroyed.store(true, Ordering::SeqCst);
        self.filesystem.destroy(request).await;

        debug!("fuse destroyed");

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_lookup(&self, ctx: &mut Context, request: Request) -> OpResult {
        let name = ctx.read_name()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "lookup unique {} name {:?} in parent {}",
            request.unique, name, parent
        );

        let entry = self.filesystem.lookup(request, parent, &name).await?;

        ctx.append_out(&fuse_entry_out::from(entry));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_forget(&self, ctx: &mut Context, request: Request) -> OpResult {
        let inode = ctx.in_header().nodeid;
        let forget_in: fuse_forget_in = match ctx.decode("fuse_forget_in") {
            Err(err) => {
                // no reply to repair this one with
                error!("deserialize fuse_forget_in failed: {}", err);

                return Ok(Disposition::NoReply);
            }

            Ok(forget_in) => forget_in,
        };

        debug!(
            "forget unique {} inode {} nlookup {}",
            request.unique, inode, forget_in.nlookup
        );

        self.filesystem
            .forget(request, inode, forget_in.nlookup)
            .await;

        Ok(Disposition::NoReply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_batch_forget(&self, ctx: &mut Context, request: Request) -> OpResult {
        let batch_forget_in: fuse_batch_forget_in = match ctx.decode("fuse_batch_forget_in") {
            Err(err) => {
                error!("deserialize fuse_batch_forget_in failed: {}", err);

                return Ok(Disposition::NoReply);
            }

            Ok(batch_forget_in) => batch_forget_in,
        };

        // cap the allocation: a count the payload cannot actually hold is
        // caught by the per-entry decode below
        let capacity = (batch_forget_in.count as usize).min(BUFFER_SIZE / FUSE_FORGET_ONE_SIZE);
        let mut inodes = Vec::with_capacity(capacity);

        for _ in 0..batch_forget_in.count {
            match ctx.decode::<fuse_forget_one>("fuse_forget_one") {
                Err(err) => {
                    error!("deserialize fuse_forget_one failed: {}", err);

                    return Ok(Disposition::NoReply);
                }

                Ok(forget_one) => inodes.push(forget_one.nodeid),
            }
        }

        debug!(
            "batch forget unique {} count {}",
            request.unique,
            inodes.len()
        );

        self.filesystem.batch_forget(request, &inodes).await;

        Ok(Disposition::NoReply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_getattr(&self, ctx: &mut Context, request: Request) -> OpResult {
        let getattr_in = if self.minor() < 9 {
            // kernels before 7.9 omit the flags preamble and send the file
            // handle tail alone; present a zeroed preamble to the handler
            let fh: u64 = ctx.decode("fuse_getattr_in").map_err(|_| Errno(libc::EINVAL))?;

            fuse_getattr_in {
                getattr_flags: 0,
                dummy: 0,
                fh,
            }
        } else {
            ctx.decode("fuse_getattr_in").map_err(|_| Errno(libc::EINVAL))?
        };

        let inode = ctx.in_header().nodeid;
        let fh = (getattr_in.getattr_flags & FUSE_GETATTR_FH > 0).then_some(getattr_in.fh);

        debug!("getattr unique {} inode {}", request.unique, inode);

        let attr = self
            .filesystem
            .getattr(request, inode, fh, getattr_in.getattr_flags)
            .await?;

        ctx.append_out(&fuse_attr_out::from(attr));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_setattr(&self, ctx: &mut Context, request: Request) -> OpResult {
        let setattr_in: fuse_setattr_in = ctx
            .decode("fuse_setattr_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;
        let fh = (setattr_in.valid & FATTR_FH > 0).then_some(setattr_in.fh);
        let set_attr = SetAttr::from(&setattr_in);

        debug!(
            "setattr unique {} inode {} {:?}",
            request.unique, inode, set_attr
        );

        let attr = self.filesystem.setattr(request, inode, fh, set_attr).await?;

        ctx.append_out(&fuse_attr_out::from(attr));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_readlink(&self, ctx: &mut Context, request: Request) -> OpResult {
        let inode = ctx.in_header().nodeid;

        debug!("readlink unique {} inode {}", request.unique, inode);

        let data = self.filesystem.readlink(request, inode).await?;

        ctx.append_out_bytes(&data.data);

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_symlink(&self, ctx: &mut Context, request: Request) -> OpResult {
        let [name, link] = ctx.read_names()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "symlink unique {} name {:?} link {:?} in parent {}",
            request.unique, name, link, parent
        );

        let entry = self.filesystem.symlink(request, parent, &name, &link).await?;

        ctx.append_out(&fuse_entry_out::from(entry));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_mknod(&self, ctx: &mut Context, request: Request) -> OpResult {
        let (mode, rdev) = if self.minor() < 12 {
            // kernels before 7.12 send the record without the umask tail
            let mknod_in: fuse_mknod_compat_in = ctx
                .decode("fuse_mknod_in")
                .map_err(|_| Errno(libc::EINVAL))?;

            (mknod_in.mode, mknod_in.rdev)
        } else {
            let mknod_in: fuse_mknod_in = ctx
                .decode("fuse_mknod_in")
                .map_err(|_| Errno(libc::EINVAL))?;

            (mknod_in.mode, mknod_in.rdev)
        };

        let name = ctx.read_name()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "mknod unique {} name {:?} mode {:o} in parent {}",
            request.unique, name, mode, parent
        );

        let entry = self
            .filesystem
            .mknod(request, parent, &name, mode, rdev)
            .await?;

        ctx.append_out(&fuse_entry_out::from(entry));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_mkdir(&self, ctx: &mut Context, request: Request) -> OpResult {
        let mkdir_in: fuse_mkdir_in = ctx
            .decode("fuse_mkdir_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let name = ctx.read_name()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "mkdir unique {} name {:?} mode {:o} in parent {}",
            request.unique, name, mkdir_in.mode, parent
        );

        let entry = self
            .filesystem
            .mkdir(request, parent, &name, mkdir_in.mode, mkdir_in.umask)
            .await?;

        ctx.append_out(&fuse_entry_out::from(entry));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_unlink(&self, ctx: &mut Context, request: Request) -> OpResult {
        let name = ctx.read_name()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "unlink unique {} name {:?} in parent {}",
            request.unique, name, parent
        );

        self.filesystem.unlink(request, parent, &name).await?;

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_rmdir(&self, ctx: &mut Context, request: Request) -> OpResult {
        let name = ctx.read_name()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "rmdir unique {} name {:?} in parent {}",
            request.unique, name, parent
        );

        self.filesystem.rmdir(request, parent, &name).await?;

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_rename(&self, ctx: &mut Context, request: Request) -> OpResult {
        let rename_in: fuse_rename_in = ctx
            .decode("fuse_rename_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let [name, new_name] = ctx.read_names()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "rename unique {} name {:?} in parent {} to name {:?} in parent {}",
            request.unique, name, parent, new_name, rename_in.newdir
        );

        self.filesystem
            .rename(request, parent, &name, rename_in.newdir, &new_name, 0)
            .await?;

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_rename2(&self, ctx: &mut Context, request: Request) -> OpResult {
        let rename2_in: fuse_rename2_in = ctx
            .decode("fuse_rename2_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let [name, new_name] = ctx.read_names()?;
        let parent = ctx.in_header().nodeid;

        debug!(
            "rename2 unique {} name {:?} in parent {} to name {:?} in parent {} flags {:x}",
            request.unique, name, parent, new_name, rename2_in.newdir, rename2_in.flags
        );

        self.filesystem
            .rename(
                request,
                parent,
                &name,
                rename2_in.newdir,
                &new_name,
                rename2_in.flags,
            )
            .await?;

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_link(&self, ctx: &mut Context, request: Request) -> OpResult {
        let link_in: fuse_link_in = ctx
            .decode("fuse_link_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let name = ctx.read_name()?;
        let new_parent = ctx.in_header().nodeid;

        debug!(
            "link unique {} inode {} to name {:?} in parent {}",
            request.unique, link_in.oldnodeid, name, new_parent
        );

        let entry = self
            .filesystem
            .link(request, link_in.oldnodeid, new_parent, &name)
            .await?;

        ctx.append_out(&fuse_entry_out::from(entry));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_open(&self, ctx: &mut Context, request: Request) -> OpResult {
        let open_in: fuse_open_in = ctx
            .decode("fuse_open_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;

        debug!(
            "open unique {} inode {} flags {:o}",
            request.unique, inode, open_in.flags
        );

        let opened = self.filesystem.open(request, inode, open_in.flags).await?;

        ctx.append_out(&fuse_open_out::from(opened));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_read(&self, ctx: &mut Context, request: Request) -> OpResult {
        let read_in: fuse_read_in = ctx
            .decode("fuse_read_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;

        debug!(
            "read unique {} inode {} fh {} offset {} size {}",
            request.unique, inode, read_in.fh, read_in.offset, read_in.size
        );

        let window_size = (read_in.size as usize).min(ctx.out_capacity());
        let window = ctx.out_buf(window_size);

        let filled = self
            .filesystem
            .read(
                request,
                inode,
                read_in.fh,
                read_in.offset,
                read_in.size,
                window,
            )
            .await?;

        if filled > window_size {
            error!(
                "filesystem read returned {} bytes for a {} byte window",
                filled, window_size
            );

            return Err(Errno(libc::EIO).into());
        }

        ctx.truncate_out(filled);

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_release(&self, ctx: &mut Context, request: Request) -> OpResult {
        let release_in: fuse_release_in = ctx
            .decode("fuse_release_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;
        let flush = release_in.release_flags & FUSE_RELEASE_FLUSH > 0;

        debug!(
            "release unique {} inode {} fh {}",
            request.unique, inode, release_in.fh
        );

        self.filesystem
            .release(
                request,
                inode,
                release_in.fh,
                release_in.flags,
                release_in.lock_owner,
                flush,
            )
            .await?;

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_getxattr(&self, ctx: &mut Context, request: Request) -> OpResult {
        let getxattr_in: fuse_getxattr_in = ctx
            .decode("fuse_getxattr_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let name = ctx.read_name()?;
        let inode = ctx.in_header().nodeid;

        debug!(
            "getxattr unique {} inode {} name {:?} size {}",
            request.unique, inode, name, getxattr_in.size
        );

        let xattr = self
            .filesystem
            .getxattr(request, inode, &name, getxattr_in.size)
            .await?;

        match xattr {
            ReplyXAttr::Size(size) => {
                ctx.append_out(&fuse_getxattr_out { size, _padding: 0 });
            }

            ReplyXAttr::Data(data) => {
                if data.len() > getxattr_in.size as usize {
                    return Err(Errno(libc::ERANGE).into());
                }

                ctx.append_out_bytes(&data);
            }
        }

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_access(&self, ctx: &mut Context, request: Request) -> OpResult {
        let access_in: fuse_access_in = ctx
            .decode("fuse_access_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;

        debug!(
            "access unique {} inode {} mask {:o}",
            request.unique, inode, access_in.mask
        );

        self.filesystem.access(request, inode, access_in.mask).await?;

        Ok(Disposition::Reply)
    }

    /// The kernel never waits on a reply to INTERRUPT itself: the named
    /// request answers EINTR if its handler honors the signal.
    fn handle_interrupt(&self, ctx: &mut Context) -> OpResult {
        let interrupt_in: fuse_interrupt_in = match ctx.decode("fuse_interrupt_in") {
            Err(err) => {
                error!("deserialize fuse_interrupt_in failed: {}", err);

                return Ok(Disposition::NoReply);
            }

            Ok(interrupt_in) => interrupt_in,
        };

        let hit = self.interrupts.fire(interrupt_in.unique);

        debug!(
            "interrupt for request unique {}, in flight {}",
            interrupt_in.unique, hit
        );

        Ok(Disposition::NoReply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_lseek(&self, ctx: &mut Context, request: Request) -> OpResult {
        let lseek_in: fuse_lseek_in = ctx
            .decode("fuse_lseek_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;

        debug!(
            "lseek unique {} inode {} fh {} offset {} whence {}",
            request.unique, inode, lseek_in.fh, lseek_in.offset, lseek_in.whence
        );

        let seek = self
            .filesystem
            .lseek(request, inode, lseek_in.fh, lseek_in.offset, lseek_in.whence)
            .await?;

        ctx.append_out(&fuse_lseek_out::from(seek));

        Ok(Disposition::Reply)
    }

    #[instrument(skip(self, ctx, request))]
    async fn handle_copy_file_range(&self, ctx: &mut Context, request: Request) -> OpResult {
        let copy_in: fuse_copy_file_range_in = ctx
            .decode("fuse_copy_file_range_in")
            .map_err(|_| Errno(libc::EINVAL))?;

        let inode = ctx.in_header().nodeid;

        debug!(
            "copy_file_range unique {} inode {} to inode {} len {}",
            request.unique, inode, copy_in.nodeid_out, copy_in.len
        );

        self.filesystem
            .copy_file_range(
                request,
                inode,
                copy_in.fh_in,
                copy_in.off_in,
                copy_in.nodeid_out,
                copy_in.fh_out,
                copy_in.off_out,
                copy_in.len,
                copy_in.flags,
            )
            .await?;

        Ok(Disposition::Reply)
    }
}

/// How much of `fuse_init_out` a kernel of the given minor version reads.
fn init_out_reply_size(minor: u32) -> usize {
    let minor = minor.min(FUSE_KERNEL_MINOR_VERSION);

    if minor < 5 {
        FUSE_COMPAT_INIT_OUT_SIZE
    } else if minor < 23 {
        FUSE_COMPAT_22_INIT_OUT_SIZE
    } else {
        FUSE_INIT_OUT_SIZE
    }
}

/// The init callback may only ever tighten the proposal; anything widened or
/// out of range fails negotiation.
fn validate_init_reply(reply: &ReplyInit, init_in: &fuse_init_in) -> Result<(), &'static str> {
    if reply.flags & !init_in.flags > 0 {
        return Err("flags must be a subset of what the kernel advertised");
    }

    if reply.max_readahead > init_in.max_readahead {
        return Err("max_readahead exceeds the kernel's advertised value");
    }

    if reply.congestion_threshold > reply.max_background {
        return Err("congestion_threshold exceeds max_background");
    }

    if reply.max_write < MIN_MAX_WRITE {
        return Err("max_write below the buffer header reserve");
    }

    if reply.time_gran < 1 || reply.time_gran > MAX_TIME_GRAN {
        return Err("time_gran out of range");
    }

    if reply.max_pages > MAX_MAX_PAGES {
        return Err("max_pages exceeds the kernel limit");
    }

    Ok(())
}

fn page_size() -> u32 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as u32)
        .unwrap_or(4096)
}
