//! The top-level server lifecycle.
//!
//! `Serve` mounts the target, spins up the session and returns; `shutdown`
//! winds everything back down, bounded by the caller's deadline. Both run
//! exactly once per server, enforced by a small CAS state machine.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::connection::FuseConnection;
use crate::error::Error;
use crate::filesystem::Filesystem;
use crate::fleet;
use crate::mount::{Fusermount, Mounter};
use crate::session::{Session, Shared};

const STATE_NEW: u32 = 0;
const STATE_STARTING: u32 = 1;
const STATE_SERVING: u32 = 2;
const STATE_STOPPED: u32 = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// permit cloning the device FD for extra request queues, default
    /// enabled
    pub clone_fd: bool,

    /// ceiling on concurrent device connections, default 4
    pub max_workers: usize,

    /// how long a poll loop waits for a kernel request before recycling,
    /// default 15s
    pub read_timeout: Option<Duration>,

    /// how long one reply write may take before the connection counts as
    /// broken, default 1s
    pub write_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            clone_fd: true,
            max_workers: 4,
            read_timeout: Some(Duration::from_secs(15)),
            write_timeout: Some(Duration::from_secs(1)),
        }
    }
}

struct Serving {
    target: PathBuf,
    created: Option<PathBuf>,
    shared: Arc<Shared>,
    fleet: JoinHandle<()>,
}

/// A FUSE server: one mount, one session, served until [`shutdown`][Server::shutdown].
pub struct Server<M = Fusermount> {
    options: Options,
    mounter: M,
    state: AtomicU32,
    serving: Mutex<Option<Serving>>,
}

impl Server<Fusermount> {
    pub fn new(options: Options) -> Self {
        Self::with_mounter(options, Fusermount::new())
    }
}

impl Default for Server<Fusermount> {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<M: Mounter + Send + Sync> Server<M> {
    /// Build a server over a custom [`Mounter`], the seam tests use to serve
    /// a mock device.
    pub fn with_mounter(options: Options, mounter: M) -> Self {
        Self {
            options,
            mounter,
            state: AtomicU32::new(STATE_NEW),
            serving: Mutex::new(None),
        }
    }

    /// Mount the FUSE filesystem on `target` and start serving requests,
    /// creating the target directory if necessary. Returns once the session
    /// is up; requests are handled in the background until
    /// [`shutdown`][Server::shutdown].
    ///
    /// [`Error::Closed`] is returned after a call to `shutdown`, or on
    /// subsequent calls to `serve`.
    pub async fn serve<FS>(&self, filesystem: FS, target: impl AsRef<Path>) -> Result<(), Error>
    where
        FS: Filesystem + Send + Sync + 'static,
    {
        if self
            .state
            .compare_exchange(STATE_NEW, STATE_STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Closed);
        }

        let target = target.as_ref().to_path_buf();

        match self.start_serving(filesystem, &target).await {
            Ok(serving) => {
                self.serving
                    .lock()
                    .expect("serving lock never poisoned")
                    .replace(serving);
                self.state.store(STATE_SERVING, Ordering::SeqCst);

                Ok(())
            }

            Err((err, created)) => {
                error!("session error: {}", err);

                self.state.store(STATE_STOPPED, Ordering::SeqCst);

                // best-effort cleanup of whatever got half set up
                let _ = self.mounter.umount(&target).await;
                if let Some(dir) = created {
                    let _ = tokio::fs::remove_dir(dir).await;
                }

                Err(err)
            }
        }
    }

    async fn start_serving<FS>(
        &self,
        filesystem: FS,
        target: &Path,
    ) -> Result<Serving, (Error, Option<PathBuf>)>
    where
        FS: Filesystem + Send + Sync + 'static,
    {
        let mut created = None;

        match tokio::fs::metadata(target).await {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("mkdir {:?} -m 755", target);

                if let Err(err) = create_mount_dir(target).await {
                    return Err((err.into(), None));
                }

                created = Some(target.to_path_buf());
            }

            Err(err) => return Err((err.into(), None)),

            Ok(_) => {}
        }

        // clear any stale mount left behind by an earlier crash
        if let Err(err) = self.mounter.umount(target).await {
            debug!("stale umount attempt: {}", err);
        }

        debug!("mounting target {:?}", target);

        let device_fd = match self.mounter.mount(target).await {
            Err(err) => return Err((err.into(), created)),
            Ok(device_fd) => device_fd,
        };

        let connection = match FuseConnection::new(device_fd) {
            Err(err) => return Err((err.into(), created)),
            Ok(connection) => connection,
        };

        let session = Arc::new(Session::new(filesystem, self.options.clone()));
        let shared = session.shared.clone();

        let fleet = tokio::spawn(fleet::run(session, connection));

        debug!("mount {:?} success", target);

        Ok(Serving {
            target: target.to_path_buf(),
            created,
            shared,
            fleet,
        })
    }

    /// Gracefully shut the server down: no new requests are read, in-flight
    /// requests finish, then the target is unmounted and a directory this
    /// server created is removed.
    ///
    /// If `timeout` elapses before every connection has wound down, the
    /// remaining poll loops are aborted and the device FDs closed out from
    /// under them.
    ///
    /// Returns the first error the session recorded, if any. After
    /// `shutdown`, further calls to `serve` and `shutdown` return
    /// [`Error::Closed`].
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                STATE_SERVING,
                STATE_STOPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::Closed);
        }

        let Some(serving) = self
            .serving
            .lock()
            .expect("serving lock never poisoned")
            .take()
        else {
            return Ok(());
        };

        let mut errors = vec![];

        debug!("closing session");

        serving.shared.signal_done();

        let mut fleet = serving.fleet;
        let finished = match timeout {
            None => {
                let _ = (&mut fleet).await;

                true
            }

            Some(timeout) => tokio::time::timeout(timeout, &mut fleet).await.is_ok(),
        };

        if !finished {
            warn!("graceful shutdown deadline passed, aborting connections");

            fleet.abort();
            let _ = fleet.await;
        }

        if let Some(err) = serving.shared.take_error() {
            errors.push(err);
        }

        debug!("unmounting target {:?}", serving.target);

        if let Err(err) = self.mounter.umount(&serving.target).await {
            errors.push(err.into());
        }

        if let Some(dir) = serving.created {
            debug!("removing directory {:?}", dir);

            if let Err(err) = tokio::fs::remove_dir(&dir).await {
                errors.push(err.into());
            }
        }

        // report the first error encountered
        match errors.into_iter().next() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

async fn create_mount_dir(target: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir(target).await?;
    tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).await
}
