//! The seam to the kernel bridge.
//!
//! Requests arrive as framed messages: one operation byte followed by a
//! little-endian payload. Responses lead with a 32-bit status code, zero on
//! success and the negative errno-style code of `FsError` otherwise. The
//! framing itself (length prefix, transport lifetime) belongs to the
//! `Transport` implementation; the dispatch loop below only sees whole
//! frames. No pointers or in-process state ever cross this boundary —
//! file handles travel as the starting-cluster identities the handle table
//! hands out.

use std::io::{self, Read, Write};

use num_enum::TryFromPrimitive;

use crate::consts::MAX_MSG_SIZE;
use crate::dev::BlockDev;
use crate::error::{FsError, FsResult};
use crate::fs::FatFs;
use crate::stat::FileAttr;

// ─── Operations ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    Getattr = 0,
    Statfs = 1,
    Open = 2,
    OpenDir = 3,
    Release = 4,
    ReleaseDir = 5,
    Read = 6,
    Write = 7,
    Create = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Truncate = 13,
    ReadDir = 14,
    SetTimes = 15,
    Access = 16,
    Flush = 17,
    Fsync = 18,
}

// ─── Wire codec ────────────────────────────────────────────────────────────────

/// Reader over a request payload. Every accessor returns `None` on a short
/// frame, which the dispatcher turns into `InvalidArgument`.
struct Wire<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Wire<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Option<i64> {
        self.u64().map(|v| v as i64)
    }

    /// Length-prefixed UTF-8 string.
    fn str(&mut self) -> Option<&'a str> {
        let len = self.take(2).map(|b| u16::from_le_bytes(b.try_into().expect("2 bytes")))?;
        let bytes = self.take(len as usize)?;
        std::str::from_utf8(bytes).ok()
    }

    fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()?;
        self.take(len as usize)
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub fn put_attr(out: &mut Vec<u8>, attr: &FileAttr) {
    put_u64(out, attr.ino);
    put_u32(out, attr.mode);
    put_u32(out, attr.nlink);
    put_u64(out, attr.size);
    put_u32(out, attr.blksize);
    put_u64(out, attr.blocks);
    put_u64(out, attr.atime as u64);
    put_u64(out, attr.mtime as u64);
}

/// Encoded size of one attribute record on the wire.
pub const ATTR_WIRE_SIZE: usize = 8 + 4 + 4 + 8 + 4 + 8 + 8 + 8;

// ─── Transport ─────────────────────────────────────────────────────────────────

/// Frame source and sink. The daemon speaks whatever the bridge framework
/// provides; tests speak over queues.
pub trait Transport {
    /// Receive one frame into `buf`. `Ok(None)` means the peer is done and
    /// the daemon should unmount.
    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<usize>>;

    /// Send one response frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Length-prefixed frames over a pair of byte streams; the default wiring
/// of the daemon binary, with the bridge framework on the other end.
pub struct StreamTransport<R, W> {
    input: R,
    output: W,
}

impl<R: Read, W: Write> StreamTransport<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: Read, W: Write> Transport for StreamTransport<R, W> {
    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
        let mut len = [0u8; 4];
        match self.input.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_MSG_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
        }
        buf.resize(len, 0);
        self.input.read_exact(buf)?;
        Ok(Some(len))
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.output.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.output.write_all(frame)?;
        self.output.flush()
    }
}

// ─── Dispatch ──────────────────────────────────────────────────────────────────

/// Service requests until the transport closes. Each frame is handled to
/// completion before the next is read; there is no interleaving.
pub fn serve<D: BlockDev, T: Transport>(fs: &mut FatFs<D>, transport: &mut T) -> io::Result<()> {
    let mut frame = Vec::new();
    loop {
        match transport.recv(&mut frame)? {
            None => return Ok(()),
            Some(0) => continue,
            Some(_) => {}
        }
        let response = dispatch(fs, &frame);
        transport.send(&response)?;
    }
}

fn dispatch<D: BlockDev>(fs: &mut FatFs<D>, frame: &[u8]) -> Vec<u8> {
    match handle(fs, frame) {
        Ok(payload) => {
            let mut out = Vec::with_capacity(4 + payload.len());
            put_u32(&mut out, 0);
            out.extend_from_slice(&payload);
            out
        }
        Err(e) => {
            log::debug!("request failed: {e}");
            let mut out = Vec::with_capacity(4);
            put_u32(&mut out, e.code() as u32);
            out
        }
    }
}

fn handle<D: BlockDev>(fs: &mut FatFs<D>, frame: &[u8]) -> FsResult<Vec<u8>> {
    let op = frame
        .first()
        .copied()
        .and_then(|b| Op::try_from_primitive(b).ok())
        .ok_or(FsError::InvalidArgument)?;
    let mut wire = Wire::new(&frame[1..]);
    let mut out = Vec::new();

    match op {
        Op::Getattr => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            let attr = fs.getattr(path)?;
            put_attr(&mut out, &attr);
        }
        Op::Statfs => {
            let stats = fs.statfs();
            put_u32(&mut out, stats.block_size);
            put_u32(&mut out, stats.fragment_size);
            put_u64(&mut out, stats.blocks);
            put_u64(&mut out, stats.blocks_free);
            put_u64(&mut out, stats.blocks_avail);
            put_u32(&mut out, stats.name_max);
        }
        Op::Open => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            put_u64(&mut out, fs.open(path)?);
        }
        Op::OpenDir => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            put_u64(&mut out, fs.opendir(path)?);
        }
        Op::Release => {
            let fh = wire.u64().ok_or(FsError::InvalidArgument)?;
            fs.release(fh)?;
        }
        Op::ReleaseDir => {
            let fh = wire.u64().ok_or(FsError::InvalidArgument)?;
            fs.releasedir(fh)?;
        }
        Op::Read => {
            let fh = wire.u64().ok_or(FsError::InvalidArgument)?;
            let offset = wire.u64().ok_or(FsError::InvalidArgument)?;
            let len = wire.u32().ok_or(FsError::InvalidArgument)?;
            let len = (len as usize).min(MAX_MSG_SIZE - 8);
            let mut data = vec![0u8; len];
            let n = fs.read(fh, offset, &mut data)?;
            put_u32(&mut out, n as u32);
            out.extend_from_slice(&data[..n]);
        }
        Op::Write => {
            let fh = wire.u64().ok_or(FsError::InvalidArgument)?;
            let offset = wire.u64().ok_or(FsError::InvalidArgument)?;
            let data = wire.bytes().ok_or(FsError::InvalidArgument)?;
            let n = fs.write(fh, offset, data)?;
            put_u32(&mut out, n as u32);
        }
        Op::Create => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            fs.mknod(path)?;
        }
        Op::Mkdir => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            fs.mkdir(path)?;
        }
        Op::Unlink => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            fs.unlink(path)?;
        }
        Op::Rmdir => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            fs.rmdir(path)?;
        }
        Op::Rename => {
            let old = wire.str().ok_or(FsError::InvalidArgument)?;
            let new = wire.str().ok_or(FsError::InvalidArgument)?;
            fs.rename(old, new)?;
        }
        Op::Truncate => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            let length = wire.u64().ok_or(FsError::InvalidArgument)?;
            fs.truncate(path, length)?;
        }
        Op::ReadDir => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            let offset = wire.u64().ok_or(FsError::InvalidArgument)?;
            let max = wire.u32().ok_or(FsError::InvalidArgument)?;

            let mut entries = Vec::new();
            let mut count = 0u32;
            fs.readdir(path, offset, &mut |name, attr, next| {
                if count >= max || entries.len() + name.len() + ATTR_WIRE_SIZE + 16 > MAX_MSG_SIZE {
                    return true; // full
                }
                put_u64(&mut entries, next);
                put_attr(&mut entries, attr);
                put_str(&mut entries, name);
                count += 1;
                false
            })?;
            put_u32(&mut out, count);
            out.extend_from_slice(&entries);
        }
        Op::SetTimes => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            let atime = wire.i64().ok_or(FsError::InvalidArgument)?;
            let mtime = wire.i64().ok_or(FsError::InvalidArgument)?;
            fs.set_times(path, atime, mtime)?;
        }
        Op::Access => {
            let path = wire.str().ok_or(FsError::InvalidArgument)?;
            let mode = wire.u32().ok_or(FsError::InvalidArgument)?;
            fs.access(path, mode & 0x2 != 0)?;
        }
        // both sync flavours drain the same write-through state.
        Op::Flush | Op::Fsync => fs.flush()?,
    }
    Ok(out)
}

// ─── Request builders ──────────────────────────────────────────────────────────
// Used by the test harness; a real bridge builds the same frames.

pub fn req_path(op: Op, path: &str) -> Vec<u8> {
    let mut frame = vec![op as u8];
    put_str(&mut frame, path);
    frame
}

pub fn req_release(op: Op, fh: u64) -> Vec<u8> {
    let mut frame = vec![op as u8];
    put_u64(&mut frame, fh);
    frame
}

pub fn req_read(fh: u64, offset: u64, len: u32) -> Vec<u8> {
    let mut frame = vec![Op::Read as u8];
    put_u64(&mut frame, fh);
    put_u64(&mut frame, offset);
    put_u32(&mut frame, len);
    frame
}

pub fn req_write(fh: u64, offset: u64, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![Op::Write as u8];
    put_u64(&mut frame, fh);
    put_u64(&mut frame, offset);
    put_u32(&mut frame, data.len() as u32);
    frame.extend_from_slice(data);
    frame
}

pub fn req_rename(old: &str, new: &str) -> Vec<u8> {
    let mut frame = vec![Op::Rename as u8];
    put_str(&mut frame, old);
    put_str(&mut frame, new);
    frame
}

pub fn req_truncate(path: &str, length: u64) -> Vec<u8> {
    let mut frame = vec![Op::Truncate as u8];
    put_str(&mut frame, path);
    put_u64(&mut frame, length);
    frame
}

pub fn req_readdir(path: &str, offset: u64, max: u32) -> Vec<u8> {
    let mut frame = vec![Op::ReadDir as u8];
    put_str(&mut frame, path);
    put_u64(&mut frame, offset);
    put_u32(&mut frame, max);
    frame
}

pub fn req_set_times(path: &str, atime: i64, mtime: i64) -> Vec<u8> {
    let mut frame = vec![Op::SetTimes as u8];
    put_str(&mut frame, path);
    put_u64(&mut frame, atime as u64);
    put_u64(&mut frame, mtime as u64);
    frame
}

pub fn req_access(path: &str, mode: u32) -> Vec<u8> {
    let mut frame = vec![Op::Access as u8];
    put_str(&mut frame, path);
    put_u32(&mut frame, mode);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_reader_handles_short_frames() {
        let mut w = Wire::new(&[1, 2]);
        assert!(w.u32().is_none());

        let mut w = Wire::new(&[3, 0, b'a', b'b']);
        assert!(w.str().is_none(), "declared length exceeds frame");

        let mut w = Wire::new(&[2, 0, b'h', b'i']);
        assert_eq!(w.str(), Some("hi"));
    }

    #[test]
    fn request_builders_roundtrip() {
        let frame = req_path(Op::Getattr, "/A.TXT");
        assert_eq!(frame[0], Op::Getattr as u8);
        let mut w = Wire::new(&frame[1..]);
        assert_eq!(w.str(), Some("/A.TXT"));

        let frame = req_write(7, 1024, b"abc");
        let mut w = Wire::new(&frame[1..]);
        assert_eq!(w.u64(), Some(7));
        assert_eq!(w.u64(), Some(1024));
        assert_eq!(w.bytes(), Some(&b"abc"[..]));

        let frame = req_rename("/X/F", "/Y/F");
        let mut w = Wire::new(&frame[1..]);
        assert_eq!(w.str(), Some("/X/F"));
        assert_eq!(w.str(), Some("/Y/F"));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(Op::try_from_primitive(0xFF).is_err());
    }

    #[test]
    fn stream_transport_frames() {
        let mut outgoing = Vec::new();
        {
            let input: &[u8] = &[];
            let mut t = StreamTransport::new(input, &mut outgoing);
            t.send(b"hello").unwrap();
        }
        assert_eq!(&outgoing[..4], &5u32.to_le_bytes());
        assert_eq!(&outgoing[4..], b"hello");

        let mut buf = Vec::new();
        let mut t = StreamTransport::new(&outgoing[..], Vec::new());
        assert_eq!(t.recv(&mut buf).unwrap(), Some(5));
        assert_eq!(buf, b"hello");
        assert_eq!(t.recv(&mut buf).unwrap(), None, "eof means clean shutdown");
    }
}
