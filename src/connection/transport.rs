//! Transport layer operations.
//!
//! Transports move bytes between a connection endpoint and a channel
//! buffer. The set is a closed enumeration: `Raw` speaks to a non-blocking
//! TCP socket, `Mem` is an in-process loopback used by embedded endpoints
//! and by the test harness. Both expose the same small contract:
//! `init / rcv_buf / snd_buf / shutw / close` plus the peek/drain pair the
//! PROXY protocol handshake requires.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::buffer::Buffer;

/// Outcome of one receive pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecvEvent {
    /// Bytes moved into the buffer.
    pub bytes: usize,
    /// A would-block was observed; the caller must poll.
    pub blocked: bool,
    /// The peer closed its sending side.
    pub eof: bool,
}

/// Outcome of one send pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendEvent {
    pub bytes: usize,
    pub blocked: bool,
}

pub enum Xprt {
    #[cfg(unix)]
    Raw(RawXprt),
    Mem(MemXprt),
}

impl Xprt {
    pub fn init(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(_) => Ok(()),
            Xprt::Mem(_) => Ok(()),
        }
    }

    /// Read as much as fits below `limit` into the buffer's input side.
    pub fn rcv_buf(&mut self, buf: &mut Buffer, limit: usize) -> io::Result<RecvEvent> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.rcv_buf(buf, limit),
            Xprt::Mem(mem) => mem.rcv_buf(buf, limit),
        }
    }

    /// Flush the buffer's output side to the peer.
    pub fn snd_buf(&mut self, buf: &mut Buffer) -> io::Result<SendEvent> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.snd_buf(buf),
            Xprt::Mem(mem) => mem.snd_buf(buf),
        }
    }

    /// Look at pending input without consuming it (PROXY header receive).
    pub fn peek(&mut self, dst: &mut [u8]) -> io::Result<RecvEvent> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.peek(dst),
            Xprt::Mem(mem) => mem.peek(dst),
        }
    }

    /// Consume exactly `n` previously peeked bytes.
    pub fn drain(&mut self, n: usize) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.drain(n),
            Xprt::Mem(mem) => mem.drain(n),
        }
    }

    /// Send bytes that bypass the channel buffer (handshake lines). May
    /// write short; the caller tracks its own offset.
    pub fn snd_raw(&mut self, src: &[u8]) -> io::Result<SendEvent> {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.snd_raw(src),
            Xprt::Mem(mem) => mem.snd_raw(src),
        }
    }

    /// Shut the sending side down. `clean` requests a graceful FIN.
    pub fn shutw(&mut self, clean: bool) {
        match self {
            #[cfg(unix)]
            Xprt::Raw(raw) => raw.shutw(clean),
            Xprt::Mem(mem) => mem.shutw(),
        }
    }

    pub fn close(&mut self) {
        match self {
            #[cfg(unix)]
            Xprt::Raw(_) => {}
            Xprt::Mem(mem) => mem.shutw(),
        }
    }
}

// ---- raw fd transport ----

#[cfg(unix)]
pub struct RawXprt {
    stream: std::net::TcpStream,
}

#[cfg(unix)]
impl RawXprt {
    /// Wrap an already-connected, non-blocking stream.
    pub fn new(stream: std::net::TcpStream) -> RawXprt {
        RawXprt { stream }
    }

    pub fn stream(&self) -> &std::net::TcpStream {
        &self.stream
    }

    fn rcv_buf(&mut self, buf: &mut Buffer, limit: usize) -> io::Result<RecvEvent> {
        let mut ev = RecvEvent::default();
        loop {
            let room = buf.space_contiguous_mut(limit);
            if room.is_empty() {
                break;
            }
            let want = room.len();
            match self.stream.read(room) {
                Ok(0) => {
                    ev.eof = true;
                    break;
                }
                Ok(n) => {
                    buf.commit_input(n);
                    ev.bytes += n;
                    if n < want {
                        // short read: the kernel buffer is drained, don't
                        // pay another syscall just to see EAGAIN
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ev.blocked = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ev)
    }

    fn snd_buf(&mut self, buf: &mut Buffer) -> io::Result<SendEvent> {
        let mut ev = SendEvent::default();
        while buf.output_len() > 0 {
            match self.stream.write(buf.output_contiguous()) {
                Ok(0) => {
                    ev.blocked = true;
                    break;
                }
                Ok(n) => {
                    buf.fast_delete(n);
                    ev.bytes += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ev.blocked = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ev)
    }

    fn peek(&mut self, dst: &mut [u8]) -> io::Result<RecvEvent> {
        match self.stream.peek(dst) {
            Ok(0) => Ok(RecvEvent {
                eof: true,
                ..Default::default()
            }),
            Ok(n) => Ok(RecvEvent {
                bytes: n,
                ..Default::default()
            }),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvEvent {
                blocked: true,
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    fn drain(&mut self, mut n: usize) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        while n > 0 {
            let take = n.min(scratch.len());
            match self.stream.read(&mut scratch[..take]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(r) => n -= r,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn snd_raw(&mut self, src: &[u8]) -> io::Result<SendEvent> {
        match self.stream.write(src) {
            Ok(n) => Ok(SendEvent {
                bytes: n,
                blocked: n < src.len(),
            }),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendEvent {
                bytes: 0,
                blocked: true,
            }),
            Err(e) => Err(e),
        }
    }

    fn shutw(&mut self, clean: bool) {
        if !clean {
            // let close() reset; nothing graceful to do
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }
}

// ---- in-memory transport ----

/// One direction of an in-memory duplex.
#[derive(Default)]
pub struct MemPipe {
    data: VecDeque<u8>,
    eof: bool,
}

pub struct MemXprt {
    rx: Rc<RefCell<MemPipe>>,
    tx: Rc<RefCell<MemPipe>>,
}

impl MemXprt {
    /// A connected pair of endpoints.
    pub fn pair() -> (MemXprt, MemXprt) {
        let a = Rc::new(RefCell::new(MemPipe::default()));
        let b = Rc::new(RefCell::new(MemPipe::default()));
        (
            MemXprt {
                rx: a.clone(),
                tx: b.clone(),
            },
            MemXprt { rx: b, tx: a },
        )
    }

    /// Write bytes from this endpoint toward its peer (test harness side).
    pub fn feed(&self, bytes: &[u8]) {
        self.tx.borrow_mut().data.extend(bytes);
    }

    /// Read everything the peer has sent to this endpoint (test harness
    /// side).
    pub fn take(&self) -> Vec<u8> {
        self.rx.borrow_mut().data.drain(..).collect()
    }

    pub fn peer_closed(&self) -> bool {
        self.rx.borrow().eof && self.rx.borrow().data.is_empty()
    }

    /// Close this endpoint's sending side (test harness side).
    pub fn close_write(&self) {
        self.tx.borrow_mut().eof = true;
    }

    fn rcv_buf(&mut self, buf: &mut Buffer, limit: usize) -> io::Result<RecvEvent> {
        let mut ev = RecvEvent::default();
        let mut pipe = self.rx.borrow_mut();
        loop {
            if pipe.data.is_empty() {
                if pipe.eof {
                    ev.eof = true;
                } else {
                    ev.blocked = true;
                }
                break;
            }
            let room = buf.space_contiguous_mut(limit);
            if room.is_empty() {
                break;
            }
            let n = room.len().min(pipe.data.len());
            for (dst, src) in room.iter_mut().zip(pipe.data.drain(..n)) {
                *dst = src;
            }
            buf.commit_input(n);
            ev.bytes += n;
        }
        Ok(ev)
    }

    fn snd_buf(&mut self, buf: &mut Buffer) -> io::Result<SendEvent> {
        let mut ev = SendEvent::default();
        let mut pipe = self.tx.borrow_mut();
        if pipe.eof {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        while buf.output_len() > 0 {
            let n = {
                let out = buf.output_contiguous();
                pipe.data.extend(out);
                out.len()
            };
            buf.fast_delete(n);
            ev.bytes += n;
        }
        Ok(ev)
    }

    fn peek(&mut self, dst: &mut [u8]) -> io::Result<RecvEvent> {
        let pipe = self.rx.borrow();
        if pipe.data.is_empty() {
            return Ok(RecvEvent {
                eof: pipe.eof,
                blocked: !pipe.eof,
                ..Default::default()
            });
        }
        let n = dst.len().min(pipe.data.len());
        for (i, b) in pipe.data.iter().take(n).enumerate() {
            dst[i] = *b;
        }
        Ok(RecvEvent {
            bytes: n,
            ..Default::default()
        })
    }

    fn drain(&mut self, n: usize) -> io::Result<()> {
        let mut pipe = self.rx.borrow_mut();
        if pipe.data.len() < n {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        pipe.data.drain(..n);
        Ok(())
    }

    fn snd_raw(&mut self, src: &[u8]) -> io::Result<SendEvent> {
        let mut pipe = self.tx.borrow_mut();
        if pipe.eof {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        pipe.data.extend(src);
        Ok(SendEvent {
            bytes: src.len(),
            blocked: false,
        })
    }

    fn shutw(&mut self) {
        self.tx.borrow_mut().eof = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_pair_moves_bytes_both_ways() {
        let (mut a, b) = MemXprt::pair();
        let mut buf = Buffer::with_capacity(64);
        assert!(buf.put_output(b"hello"));
        a.snd_buf(&mut buf).unwrap();
        assert_eq!(b.take(), b"hello".to_vec());

        b.feed(b"world");
        let mut rbuf = Buffer::with_capacity(64);
        let ev = Xprt::Mem(a).rcv_buf(&mut rbuf, usize::MAX).unwrap();
        assert_eq!(ev.bytes, 5);
        assert_eq!(rbuf.input_contiguous(), b"world");
    }

    #[test]
    fn mem_recv_sees_eof_after_shutw() {
        let (a, mut b) = MemXprt::pair();
        let mut out = Buffer::with_capacity(16);
        assert!(out.put_output(b"x"));
        Xprt::Mem(a).snd_buf(&mut out).unwrap();

        let mut buf = Buffer::with_capacity(16);
        let ev = b.rcv_buf(&mut buf, usize::MAX).unwrap();
        assert_eq!(ev.bytes, 1);
        assert!(!ev.eof);

        // now close the a->b direction through the b side's feeder view
        b.rx.borrow_mut().eof = true;
        let ev = b.rcv_buf(&mut buf, usize::MAX).unwrap();
        assert!(ev.eof);
    }

    #[test]
    fn peek_does_not_consume() {
        let (a, mut b) = MemXprt::pair();
        let mut out = Buffer::with_capacity(16);
        assert!(out.put_output(b"PROXY"));
        Xprt::Mem(a).snd_buf(&mut out).unwrap();

        let mut dst = [0u8; 8];
        let ev = b.peek(&mut dst).unwrap();
        assert_eq!(ev.bytes, 5);
        assert_eq!(&dst[..5], b"PROXY");
        b.drain(5).unwrap();
        let ev = b.peek(&mut dst).unwrap();
        assert_eq!(ev.bytes, 0);
        assert!(ev.blocked);
    }

    #[test]
    fn recv_respects_limit() {
        let (a, mut b) = MemXprt::pair();
        let mut out = Buffer::with_capacity(32);
        assert!(out.put_output(b"abcdefgh"));
        Xprt::Mem(a).snd_buf(&mut out).unwrap();

        let mut buf = Buffer::with_capacity(32);
        let ev = b.rcv_buf(&mut buf, 4).unwrap();
        assert_eq!(ev.bytes, 4);
        assert_eq!(buf.input_contiguous(), b"abcd");
    }
}
