//! The connection fleet.
//!
//! One session multiplexes over one or more device FDs: the original mount
//! FD plus clones the kernel binds to the same mount, each with its own
//! request queue. The controller starts with the primary connection and adds
//! a clone whenever a poll loop reads while the capacity semaphore is empty,
//! up to `max_workers`. Idle clones retire on read-deadline expiry; the
//! fleet never drops below one connection.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::connection::FuseConnection;
use crate::filesystem::Filesystem;
use crate::session::Session;

/// Drive the whole fleet until the session is over. Returns once every poll
/// loop has exited; the first fatal error, if any, is recorded on the
/// session for the server to pick up.
pub(crate) async fn run<FS>(session: Arc<Session<FS>>, primary: FuseConnection)
where
    FS: Filesystem + Send + Sync + 'static,
{
    let primary = Arc::new(primary);
    session.shared.register_connection(primary.clone());

    let mut loops = JoinSet::new();
    loops.spawn(poll_loop(session.clone(), primary.clone(), true));

    loop {
        tokio::select! {
            _ = session.shared.starved.notified() => {
                scale_up(&session, &primary, &mut loops);
            }

            joined = loops.join_next() => match joined {
                None => break,

                Some(Err(err)) if err.is_panic() => {
                    error!("connection poll loop panicked: {}", err);

                    session
                        .shared
                        .record_error(io::Error::new(ErrorKind::Other, err.to_string()).into());
                }

                Some(_) => {}
            }
        }
    }

    debug!("all fuse connections finished");
}

/// Starvation observed: add one cloned connection, if allowed and still
/// under the ceiling.
fn scale_up<FS>(
    session: &Arc<Session<FS>>,
    primary: &Arc<FuseConnection>,
    loops: &mut JoinSet<()>,
) where
    FS: Filesystem + Send + Sync + 'static,
{
    if !session.shared.options.clone_fd || session.shared.is_done() {
        return;
    }

    let connections = session.shared.connection_count();
    if connections >= session.shared.options.max_workers.max(1) {
        return;
    }

    match primary.try_clone() {
        Err(err) => warn!("clone fuse device failed: {}", err),

        Ok(clone) => {
            let clone = Arc::new(clone);

            session.shared.capacity.add_permits(1);
            session.shared.register_connection(clone.clone());
            loops.spawn(poll_loop(session.clone(), clone, false));

            debug!("fuse device cloned, {} connections now", connections + 1);
        }
    }
}

/// One connection's read/dispatch cycle. Requests fan out to spawned
/// workers; the loop itself only reads.
async fn poll_loop<FS>(session: Arc<Session<FS>>, conn: Arc<FuseConnection>, primary: bool)
where
    FS: Filesystem + Send + Sync + 'static,
{
    let mut done = session.shared.subscribe_done();
    let read_timeout = session.shared.options.read_timeout;

    loop {
        if *done.borrow() {
            break;
        }

        // starvation is a signal, never a stall: the read proceeds with or
        // without a permit
        let permit = session.shared.capacity.clone().try_acquire_owned().ok();
        if permit.is_none() {
            session.shared.starved.notify();
        }

        let mut ctx = session.shared.pool.acquire();

        let read = {
            let read_fut = read_with_deadline(&conn, ctx.read_buf(), read_timeout);
            tokio::pin!(read_fut);

            tokio::select! {
                _ = done.changed() => break,
                _ = conn.closed() => break,
                read = &mut read_fut => read,
            }
        };

        let read_len = match read {
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                if !primary && session.shared.reclaim_idle(&conn) {
                    debug!("idle cloned connection reclaimed");

                    conn.close();

                    return;
                }

                continue;
            }

            Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                // the kernel unmounted underneath us; this ends the session
                debug!("read from fuse device failed with ENODEV, session is over");

                session.destroy_once().await;
                session.shared.signal_done();

                break;
            }

            Err(err) => {
                error!("read from fuse device failed {}", err);

                session.shared.record_error(err.into());
                conn.close();

                break;
            }

            Ok(read_len) => read_len,
        };

        if let Err(err) = ctx.set_len(read_len) {
            error!("fuse request framing error: {}", err);

            session.shared.record_error(err.into());
            conn.close();

            break;
        }

        let interrupt = session.register_interrupt(ctx.in_header().unique);
        tokio::spawn(session.clone().process(ctx, conn.clone(), permit, interrupt));
    }

    session.shared.deregister_connection(&conn);
}

async fn read_with_deadline(
    conn: &FuseConnection,
    buf: &mut [u8],
    deadline: Option<Duration>,
) -> io::Result<usize> {
    match deadline {
        None => conn.read(buf).await,
        Some(deadline) => tokio::time::timeout(deadline, conn.read(buf))
            .await
            .unwrap_or_else(|_| Err(ErrorKind::TimedOut.into())),
    }
}
