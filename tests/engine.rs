//! End-to-end engine tests.
//!
//! A `SOCK_SEQPACKET` socketpair stands in for `/dev/fuse`: like the real
//! device, every read hands over exactly one framed message. The test plays
//! the kernel on one end while the server runs against the other, delivered
//! through a mock mounter.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::task;

use fuse7::prelude::*;
use fuse7::{Error, Inode, Mounter, Request, Result, Server, Timestamp};

const IN_HEADER_SIZE: usize = 40;
const OUT_HEADER_SIZE: usize = 16;
const ENTRY_OUT_SIZE: usize = 128;
const INIT_OUT_SIZE: usize = 64;

const OP_LOOKUP: u32 = 1;
const OP_FORGET: u32 = 2;
const OP_UNLINK: u32 = 10;
const OP_READ: u32 = 15;
const OP_INIT: u32 = 26;
const OP_INTERRUPT: u32 = 36;

struct MockMounter {
    device: Mutex<Option<OwnedFd>>,
    umounts: Arc<AtomicUsize>,
}

impl MockMounter {
    fn new(device: OwnedFd) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            umounts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Mounter for MockMounter {
    async fn mount(&self, _target: &Path) -> io::Result<OwnedFd> {
        self.device
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "already mounted"))
    }

    async fn umount(&self, _target: &Path) -> io::Result<()> {
        self.umounts.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}

#[derive(Debug, Default)]
struct HelloFs;

impl Filesystem for HelloFs {
    async fn lookup(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<ReplyEntry> {
        if parent == 1 && name == "foo" {
            Ok(ReplyEntry {
                ttl: Duration::from_secs(1),
                attr: FileAttr {
                    ino: 2,
                    size: 5,
                    blocks: 1,
                    atime: Timestamp::new(0, 0),
                    mtime: Timestamp::new(0, 0),
                    ctime: Timestamp::new(0, 0),
                    kind: FileType::RegularFile,
                    perm: 0o644,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    blksize: 4096,
                },
                generation: 1,
            })
        } else {
            Err(libc::ENOENT.into())
        }
    }

    async fn unlink(&self, _req: Request, _parent: Inode, _name: &OsStr) -> Result<()> {
        Err(libc::ENOENT.into())
    }

    async fn read(
        &self,
        req: Request,
        _inode: Inode,
        fh: u64,
        _offset: u64,
        _size: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        // fh 99 asks for a slow read the kernel will interrupt
        if fh == 99 {
            req.interrupted().await;

            return Err(libc::EINTR.into());
        }

        let data = b"hello";
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);

        Ok(n)
    }
}

fn push_u32(frame: &mut Vec<u8>, value: u32) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(frame: &mut Vec<u8>, value: u64) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn request_frame(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(IN_HEADER_SIZE + payload.len());
    push_u32(&mut frame, (IN_HEADER_SIZE + payload.len()) as u32);
    push_u32(&mut frame, opcode);
    push_u64(&mut frame, unique);
    push_u64(&mut frame, nodeid);
    push_u32(&mut frame, 1000); // uid
    push_u32(&mut frame, 1000); // gid
    push_u32(&mut frame, 4242); // pid
    push_u32(&mut frame, 0);
    frame.extend_from_slice(payload);
    frame
}

fn init_frame(unique: u64, major: u32, minor: u32, max_readahead: u32, flags: u32) -> Vec<u8> {
    let mut payload = vec![];
    push_u32(&mut payload, major);
    push_u32(&mut payload, minor);
    push_u32(&mut payload, max_readahead);
    push_u32(&mut payload, flags);
    request_frame(OP_INIT, unique, 0, &payload)
}

async fn kernel_send(fd: RawFd, frame: Vec<u8>) {
    task::spawn_blocking(move || {
        nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &frame)
            .expect("kernel side write")
    })
    .await
    .expect("write task");
}

async fn kernel_recv(fd: RawFd) -> Vec<u8> {
    task::spawn_blocking(move || {
        let mut buf = vec![0u8; 64 * 1024];
        let n = nix::unistd::read(fd, &mut buf).expect("kernel side read");
        buf.truncate(n);
        buf
    })
    .await
    .expect("read task")
}

struct Reply {
    len: u32,
    error: i32,
    unique: u64,
    payload: Vec<u8>,
}

fn parse_reply(raw: &[u8]) -> Reply {
    assert!(raw.len() >= OUT_HEADER_SIZE, "reply shorter than its header");

    let reply = Reply {
        len: u32::from_le_bytes(raw[..4].try_into().unwrap()),
        error: i32::from_le_bytes(raw[4..8].try_into().unwrap()),
        unique: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
        payload: raw[OUT_HEADER_SIZE..].to_vec(),
    };
    assert_eq!(reply.len as usize, raw.len(), "header length mismatch");

    reply
}

fn device_pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .expect("socketpair")
}

fn mount_target() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("mnt");
    (dir, target)
}

async fn handshake(kernel: RawFd) {
    kernel_send(kernel, init_frame(1, 7, 31, 131072, 0)).await;

    let reply = parse_reply(&kernel_recv(kernel).await);
    assert_eq!(reply.unique, 1);
    assert_eq!(reply.error, 0);
    assert_eq!(reply.payload.len(), INIT_OUT_SIZE);
    assert_eq!(&reply.payload[..4], &7u32.to_le_bytes());
    assert_eq!(&reply.payload[4..8], &31u32.to_le_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn serve_lookup_and_errno_replies() {
    let (device, kernel) = device_pair();
    let kernel_fd = kernel.as_raw_fd();

    let server = Server::with_mounter(
        Options {
            clone_fd: false,
            ..Options::default()
        },
        MockMounter::new(device),
    );

    let (_dir, target) = mount_target();
    server.serve(HelloFs, &target).await.expect("serve");
    assert!(target.is_dir(), "server creates the mount directory");

    handshake(kernel_fd).await;

    // lookup of "foo" answers with the entry the filesystem built
    kernel_send(kernel_fd, request_frame(OP_LOOKUP, 7, 1, b"foo\0")).await;
    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 7);
    assert_eq!(reply.error, 0);
    assert_eq!(reply.payload.len(), ENTRY_OUT_SIZE);
    assert_eq!(&reply.payload[..8], &2u64.to_le_bytes());

    // handler errno becomes the reply error, payload stays empty
    kernel_send(kernel_fd, request_frame(OP_UNLINK, 99, 1, b"bar\0")).await;
    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 99);
    assert_eq!(reply.error, -libc::ENOENT);
    assert!(reply.payload.is_empty());

    // unknown opcode is ENOSYS, not fatal
    kernel_send(kernel_fd, request_frame(99, 42, 1, &[])).await;
    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 42);
    assert_eq!(reply.error, -libc::ENOSYS);

    // the connection survived: read data flows
    let mut payload = vec![];
    push_u64(&mut payload, 3); // fh
    push_u64(&mut payload, 0); // offset
    push_u32(&mut payload, 4096); // size
    push_u32(&mut payload, 0);
    push_u64(&mut payload, 0);
    push_u32(&mut payload, 0);
    push_u32(&mut payload, 0);
    kernel_send(kernel_fd, request_frame(OP_READ, 50, 2, &payload)).await;
    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 50);
    assert_eq!(reply.error, 0);
    assert_eq!(reply.payload, b"hello");

    server.shutdown(Some(Duration::from_secs(5))).await.expect("shutdown");
    assert!(!target.exists(), "server removes the directory it created");
}

#[tokio::test(flavor = "multi_thread")]
async fn forget_writes_nothing() {
    let (device, kernel) = device_pair();
    let kernel_fd = kernel.as_raw_fd();

    let server = Server::with_mounter(
        Options {
            clone_fd: false,
            ..Options::default()
        },
        MockMounter::new(device),
    );

    let (_dir, target) = mount_target();
    server.serve(HelloFs, &target).await.expect("serve");

    handshake(kernel_fd).await;

    // a forget, then a lookup: the next reply on the wire must answer the
    // lookup, proving the forget wrote nothing
    let mut payload = vec![];
    push_u64(&mut payload, 1); // nlookup
    kernel_send(kernel_fd, request_frame(OP_FORGET, 8, 2, &payload)).await;
    kernel_send(kernel_fd, request_frame(OP_LOOKUP, 9, 1, b"foo\0")).await;

    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 9);
    assert_eq!(reply.error, 0);

    server.shutdown(Some(Duration::from_secs(5))).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_unblocks_a_slow_read() {
    let (device, kernel) = device_pair();
    let kernel_fd = kernel.as_raw_fd();

    let server = Server::with_mounter(
        Options {
            clone_fd: false,
            ..Options::default()
        },
        MockMounter::new(device),
    );

    let (_dir, target) = mount_target();
    server.serve(HelloFs, &target).await.expect("serve");

    handshake(kernel_fd).await;

    // fh 99 parks the read until the interrupt fires
    let mut payload = vec![];
    push_u64(&mut payload, 99); // fh
    push_u64(&mut payload, 0); // offset
    push_u32(&mut payload, 4096); // size
    push_u32(&mut payload, 0);
    push_u64(&mut payload, 0);
    push_u32(&mut payload, 0);
    push_u32(&mut payload, 0);
    kernel_send(kernel_fd, request_frame(OP_READ, 77, 2, &payload)).await;

    let mut interrupt_payload = vec![];
    push_u64(&mut interrupt_payload, 77);
    kernel_send(
        kernel_fd,
        request_frame(OP_INTERRUPT, 78, 0, &interrupt_payload),
    )
    .await;

    let reply = parse_reply(&kernel_recv(kernel_fd).await);
    assert_eq!(reply.unique, 77);
    assert_eq!(reply.error, -libc::EINTR);

    server.shutdown(Some(Duration::from_secs(5))).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_runs_once() {
    let (device, kernel) = device_pair();
    let _kernel = kernel;

    let server = Server::with_mounter(
        Options {
            clone_fd: false,
            ..Options::default()
        },
        MockMounter::new(device),
    );

    let (_dir, target) = mount_target();
    server.serve(HelloFs, &target).await.expect("serve");

    // a second serve on the same server is refused
    assert!(matches!(
        server.serve(HelloFs, &target).await,
        Err(Error::Closed)
    ));

    server.shutdown(Some(Duration::from_secs(5))).await.expect("shutdown");

    assert!(matches!(
        server.shutdown(Some(Duration::from_secs(1))).await,
        Err(Error::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_unmounts_the_target() {
    let (device, kernel) = device_pair();
    let _kernel = kernel;

    let mounter = MockMounter::new(device);
    let umounts = mounter.umounts.clone();
    let server = Server::with_mounter(
        Options {
            clone_fd: false,
            ..Options::default()
        },
        mounter,
    );

    let (_dir, target) = mount_target();
    server.serve(HelloFs, &target).await.expect("serve");
    // serve attempts one stale umount before mounting
    let baseline = umounts.load(Ordering::SeqCst);

    server.shutdown(Some(Duration::from_secs(5))).await.expect("shutdown");
    assert_eq!(umounts.load(Ordering::SeqCst), baseline + 1);
}
