//! Pooled request buffers.
//!
//! One buffer carries a whole request/reply exchange, layered as
//! `fuse_in_header | input payload | fuse_out_header | output payload`. The
//! output header sits at offset `fuse_in_header::len`, behind all input
//! bytes, so a reply can be assembled while the input is still being read
//! and written back to the device in a single call.

use std::ffi::OsString;
use std::mem;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStringExt;
use std::sync::{Arc, Mutex};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::abi::{
    fuse_in_header, fuse_out_header, BUFFER_SIZE, FUSE_IN_HEADER_SIZE, FUSE_MIN_READ_BUFFER_SIZE,
    FUSE_OUT_HEADER_SIZE,
};
use crate::error::ProtocolError;
use crate::helper::{get_bincode_config, get_first_null_position};
use crate::Errno;

// the kernel refuses device reads into anything smaller
const _: () = assert!(BUFFER_SIZE >= FUSE_MIN_READ_BUFFER_SIZE);

/// A thread-safe bag of request buffers. Buffers released by a finished
/// [`Context`] are handed out again unchanged; the regions that matter are
/// re-zeroed on demand.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Context {
        let buffer = self
            .buffers
            .lock()
            .expect("buffer pool lock never poisoned")
            .pop()
            .unwrap_or_else(|| vec![0; BUFFER_SIZE]);

        Context {
            pool: self.clone(),
            buffer: Some(buffer),
            header: None,
            in_len: 0,
            cursor: 0,
            out_len: 0,
            replied: false,
        }
    }

    fn release(&self, buffer: Vec<u8>) {
        self.buffers
            .lock()
            .expect("buffer pool lock never poisoned")
            .push(buffer);
    }
}

/// The per-request handle over one pooled buffer. Owned exclusively by the
/// worker handling the request; dropping it returns the buffer to the pool.
#[derive(Debug)]
pub(crate) struct Context {
    pool: Arc<BufferPool>,
    buffer: Option<Vec<u8>>,
    header: Option<fuse_in_header>,
    in_len: usize,
    cursor: usize,
    out_len: usize,
    replied: bool,
}

impl Context {
    fn buf(&self) -> &[u8] {
        self.buffer.as_ref().expect("buffer present until drop")
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut().expect("buffer present until drop")
    }

    /// the whole buffer, for the device read
    pub(crate) fn read_buf(&mut self) -> &mut [u8] {
        self.buf_mut()
    }

    /// Frame the request that a device read just deposited. One read returns
    /// exactly one message, so `read_len` must cover the fixed header and
    /// match the length the header declares.
    pub(crate) fn set_len(&mut self, read_len: usize) -> Result<(), ProtocolError> {
        if read_len < FUSE_IN_HEADER_SIZE {
            return Err(ProtocolError::ShortRead {
                declared: FUSE_IN_HEADER_SIZE as u32,
                read: read_len,
            });
        }

        let header: fuse_in_header = get_bincode_config()
            .deserialize(&self.buf()[..FUSE_IN_HEADER_SIZE])
            .expect("fuse_in_header always fits a checked read");

        if header.len as usize != read_len {
            return Err(ProtocolError::ShortRead {
                declared: header.len,
                read: read_len,
            });
        }

        let in_len = header.len as usize;
        if in_len + FUSE_OUT_HEADER_SIZE > self.buf().len() {
            return Err(ProtocolError::Oversized { len: header.len });
        }

        self.header = Some(header);
        self.in_len = in_len;
        self.cursor = FUSE_IN_HEADER_SIZE;
        self.out_len = 0;
        self.replied = false;
        self.buf_mut()[in_len..in_len + FUSE_OUT_HEADER_SIZE].fill(0);

        Ok(())
    }

    pub(crate) fn in_header(&self) -> &fuse_in_header {
        self.header.as_ref().expect("set_len framed the request")
    }

    /// Decode one fixed-layout record off the input payload and advance the
    /// cursor past it.
    pub(crate) fn decode<T>(&mut self, what: &'static str) -> Result<T, ProtocolError>
    where
        T: DeserializeOwned,
    {
        let size = mem::size_of::<T>();
        if self.cursor + size > self.in_len {
            return Err(ProtocolError::Truncated { what });
        }

        let value = get_bincode_config()
            .deserialize(&self.buf()[self.cursor..self.in_len])
            .map_err(|_| ProtocolError::Truncated { what })?;
        self.cursor += size;

        Ok(value)
    }

    /// Consume one NUL-terminated name from the tail of the input payload.
    pub(crate) fn read_name(&mut self) -> Result<OsString, ProtocolError> {
        let data = &self.buf()[self.cursor..self.in_len];
        let index = get_first_null_position(data).ok_or(ProtocolError::MissingNull)?;
        let name = OsString::from_vec(data[..index].to_vec());
        self.cursor += index + 1;

        Ok(name)
    }

    /// Consume `N` consecutive NUL-terminated names.
    pub(crate) fn read_names<const N: usize>(&mut self) -> Result<[OsString; N], ProtocolError> {
        let mut names = [(); N].map(|_| OsString::new());
        for name in &mut names {
            *name = self.read_name()?;
        }

        Ok(names)
    }

    fn out_start(&self) -> usize {
        self.in_len + FUSE_OUT_HEADER_SIZE + self.out_len
    }

    /// room left for reply payload
    pub(crate) fn out_capacity(&self) -> usize {
        self.buf().len() - self.out_start()
    }

    /// Serialize one reply record into the output payload.
    pub(crate) fn append_out<T: Serialize>(&mut self, value: &T) {
        let start = self.out_start();
        let size = mem::size_of::<T>();
        let end = start + size;
        let mut window = &mut self.buf_mut()[start..end];
        get_bincode_config()
            .serialize_into(&mut window, value)
            .expect("reply record always fits the pooled buffer");
        self.out_len += size;
    }

    /// Copy raw reply bytes into the output payload.
    pub(crate) fn append_out_bytes(&mut self, data: &[u8]) {
        let start = self.out_start();
        let end = start + data.len();
        self.buf_mut()[start..end].copy_from_slice(data);
        self.out_len += data.len();
    }

    /// Hand out a zeroed window of the output payload of `size` bytes for a
    /// handler to fill, accounting all of it as reply payload until
    /// [`truncate_out`][Context::truncate_out] trims it.
    pub(crate) fn out_buf(&mut self, size: usize) -> &mut [u8] {
        let start = self.out_start();
        let end = start + size;
        self.out_len += size;
        let window = &mut self.buf_mut()[start..end];
        window.fill(0);
        window
    }

    /// Trim the reply payload down to `len` bytes.
    pub(crate) fn truncate_out(&mut self, len: usize) {
        debug_assert!(len <= self.out_len);
        self.out_len = len;
    }

    pub(crate) fn out_len(&self) -> usize {
        self.out_len
    }

    /// Write the reply header in place and yield the full reply frame. An
    /// errno reply discards any payload a handler may have staged. A second
    /// call for the same request is refused.
    pub(crate) fn finish(&mut self, errno: Option<Errno>) -> Result<&[u8], ProtocolError> {
        if self.replied {
            return Err(ProtocolError::ReplyAfterClose);
        }
        self.replied = true;

        if errno.is_some() {
            self.out_len = 0;
        }

        let out_header = fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + self.out_len) as u32,
            error: errno.map(c_int::from).unwrap_or(0),
            unique: self.in_header().unique,
        };

        let in_len = self.in_len;
        let out_len = self.out_len;
        let mut window = &mut self.buf_mut()[in_len..in_len + FUSE_OUT_HEADER_SIZE];
        get_bincode_config()
            .serialize_into(&mut window, &out_header)
            .expect("fuse_out_header always fits its region");

        Ok(&self.buf()[in_len..in_len + FUSE_OUT_HEADER_SIZE + out_len])
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{fuse_entry_out, FUSE_ENTRY_OUT_SIZE};

    fn frame(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> Vec<u8> {
        let len = (FUSE_IN_HEADER_SIZE + payload.len()) as u32;
        let mut data = get_bincode_config()
            .serialize(&(len, opcode, unique, nodeid, 0u32, 0u32, 0u32, 0u32))
            .expect("serialize header fields");
        data.extend_from_slice(payload);
        data
    }

    fn framed_context(pool: &Arc<BufferPool>, raw: &[u8]) -> Context {
        let mut ctx = pool.acquire();
        ctx.read_buf()[..raw.len()].copy_from_slice(raw);
        ctx.set_len(raw.len()).expect("well formed frame");
        ctx
    }

    #[test]
    fn rejects_short_reads() {
        let pool = BufferPool::new();
        let mut ctx = pool.acquire();

        assert_eq!(
            ctx.set_len(10),
            Err(ProtocolError::ShortRead {
                declared: FUSE_IN_HEADER_SIZE as u32,
                read: 10
            })
        );

        // header declares more bytes than the read returned
        let raw = frame(1, 1, 1, b"foo\0");
        let mut ctx = pool.acquire();
        ctx.read_buf()[..raw.len()].copy_from_slice(&raw);
        assert!(matches!(
            ctx.set_len(raw.len() - 2),
            Err(ProtocolError::ShortRead { .. })
        ));
    }

    #[test]
    fn parses_header_and_names() {
        let pool = BufferPool::new();
        let raw = frame(6, 9, 1, b"name\0link target\0");
        let mut ctx = framed_context(&pool, &raw);

        assert_eq!(ctx.in_header().opcode, 6);
        assert_eq!(ctx.in_header().unique, 9);
        assert_eq!(ctx.in_header().nodeid, 1);

        let [name, link] = ctx.read_names().expect("two names");
        assert_eq!(name, "name");
        assert_eq!(link, "link target");

        // tail exhausted
        assert_eq!(ctx.read_name(), Err(ProtocolError::MissingNull));
    }

    #[test]
    fn decode_advances_cursor_to_trailing_names() {
        let pool = BufferPool::new();
        let mut payload = get_bincode_config()
            .serialize(&(0o755u32, 0u32))
            .expect("serialize mkdir record");
        payload.extend_from_slice(b"subdir\0");

        let raw = frame(9, 4, 1, &payload);
        let mut ctx = framed_context(&pool, &raw);

        let mkdir_in: crate::abi::fuse_mkdir_in = ctx.decode("fuse_mkdir_in").expect("decode");
        assert_eq!(mkdir_in.mode, 0o755);
        assert_eq!(ctx.read_name().expect("name"), "subdir");
    }

    #[test]
    fn decode_truncated_record_fails() {
        let pool = BufferPool::new();
        let raw = frame(9, 4, 1, &[0u8; 4]);
        let mut ctx = framed_context(&pool, &raw);

        assert!(matches!(
            ctx.decode::<crate::abi::fuse_mkdir_in>("fuse_mkdir_in"),
            Err(ProtocolError::Truncated {
                what: "fuse_mkdir_in"
            })
        ));
    }

    #[test]
    fn reply_is_assembled_behind_the_input() {
        let pool = BufferPool::new();
        let raw = frame(1, 7, 1, b"foo\0");
        let mut ctx = framed_context(&pool, &raw);
        let _ = ctx.read_name().expect("name");

        ctx.append_out_bytes(b"reply payload");
        let reply = ctx.finish(None).expect("first reply").to_vec();

        assert_eq!(reply.len(), FUSE_OUT_HEADER_SIZE + 13);
        assert_eq!(&reply[..4], &(16u32 + 13).to_le_bytes());
        assert_eq!(&reply[4..8], &0i32.to_le_bytes());
        assert_eq!(&reply[8..16], &7u64.to_le_bytes());
        assert_eq!(&reply[16..], b"reply payload");

        // second reply for the same request is refused
        assert_eq!(ctx.finish(None), Err(ProtocolError::ReplyAfterClose));
    }

    #[test]
    fn errno_reply_discards_payload() {
        let pool = BufferPool::new();
        let raw = frame(10, 99, 1, b"bar\0");
        let mut ctx = framed_context(&pool, &raw);

        ctx.append_out_bytes(b"stale");
        let reply = ctx
            .finish(Some(Errno(libc::ENOENT)))
            .expect("errno reply")
            .to_vec();

        assert_eq!(reply.len(), FUSE_OUT_HEADER_SIZE);
        assert_eq!(&reply[..4], &16u32.to_le_bytes());
        assert_eq!(&reply[4..8], &(-libc::ENOENT).to_le_bytes());
        assert_eq!(&reply[8..16], &99u64.to_le_bytes());
    }

    #[test]
    fn typed_reply_record_lands_in_the_out_region() {
        let pool = BufferPool::new();
        let raw = frame(1, 7, 1, b"foo\0");
        let mut ctx = framed_context(&pool, &raw);

        let entry_out = fuse_entry_out {
            nodeid: 2,
            generation: 1,
            entry_valid: 1,
            attr_valid: 1,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: crate::abi::fuse_attr {
                ino: 2,
                size: 0,
                blocks: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                atimensec: 0,
                mtimensec: 0,
                ctimensec: 0,
                mode: libc::S_IFREG as u32 | 0o644,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                blksize: 4096,
                _padding: 0,
            },
        };
        ctx.append_out(&entry_out);
        assert_eq!(ctx.out_len(), FUSE_ENTRY_OUT_SIZE);

        let reply = ctx.finish(None).expect("reply").to_vec();
        assert_eq!(reply.len(), FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE);
        // nodeid right behind the out header
        assert_eq!(&reply[16..24], &2u64.to_le_bytes());
    }

    #[test]
    fn out_buf_window_is_zeroed_and_truncatable() {
        let pool = BufferPool::new();
        let raw = frame(15, 3, 2, &[0u8; 40]);
        let mut ctx = framed_context(&pool, &raw);

        let window = ctx.out_buf(32);
        assert_eq!(window.len(), 32);
        assert!(window.iter().all(|byte| *byte == 0));
        window[..5].copy_from_slice(b"hello");

        ctx.truncate_out(5);
        let reply = ctx.finish(None).expect("reply").to_vec();
        assert_eq!(&reply[16..], b"hello");
    }

    #[test]
    fn pool_reuses_released_buffers() {
        let pool = BufferPool::new();
        let raw = frame(1, 1, 1, b"a\0");

        {
            let mut ctx = framed_context(&pool, &raw);
            ctx.append_out_bytes(b"dirty");
            let _ = ctx.finish(None);
        }

        // buffer went back to the pool and is framed cleanly again
        let mut ctx = framed_context(&pool, &raw);
        assert_eq!(ctx.read_name().expect("name"), "a");
        let reply = ctx.finish(None).expect("reply").to_vec();
        assert_eq!(reply.len(), FUSE_OUT_HEADER_SIZE);

        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
        drop(ctx);
        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }
}
