//! Fixed-size ring buffer with a forward-only byte discipline.
//!
//! The ring holds one pending block per direction: bytes already committed
//! for sending ("output", at `[p-o, p)`) and bytes freshly received and not
//! yet scheduled ("input", at `[p, p+i)`). Both regions may wrap. All
//! rewriting operations require a contiguous input region, which callers
//! obtain with [`Buffer::reserve`] before editing; every mutating operation
//! reports the signed byte delta it applied so cached offsets can be
//! propagated.

/// Bytes to keep free for in-place header rewrites while a message is
/// being analysed.
pub const MAX_REWRITE: usize = 1024;

/// Sentinel for "forward everything until further notice".
pub const FORWARD_INFINITE: u64 = u64::MAX;

pub struct Buffer {
    data: Box<[u8]>,
    /// Index of the logical head: end of output, start of input.
    p: usize,
    /// Input bytes: received, not yet committed for sending.
    i: usize,
    /// Output bytes: committed and awaiting send.
    o: usize,
    /// Pending zero-copy advance: input bytes still to move to output as
    /// they arrive.
    to_forward: u64,
    /// Total bytes ever moved through the input side.
    total: u64,
}

impl Buffer {
    pub fn with_capacity(size: usize) -> Buffer {
        assert!(size > 0);
        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            p: 0,
            i: 0,
            o: 0,
            to_forward: 0,
            total: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn input_len(&self) -> usize {
        self.i
    }

    pub fn output_len(&self) -> usize {
        self.o
    }

    pub fn len(&self) -> usize {
        self.i + self.o
    }

    pub fn is_empty(&self) -> bool {
        self.i + self.o == 0
    }

    pub fn is_full(&self) -> bool {
        self.i + self.o == self.size()
    }

    /// Free room left in the ring.
    pub fn space(&self) -> usize {
        self.size() - self.i - self.o
    }

    pub fn to_forward(&self) -> u64 {
        self.to_forward
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn wrap(&self, idx: usize) -> usize {
        // callers never pass more than 2*size
        let size = self.size();
        if idx >= size {
            idx - size
        } else {
            idx
        }
    }

    /// True when the input region does not wrap around the end of the ring.
    pub fn input_is_contiguous(&self) -> bool {
        self.p + self.i <= self.size()
    }

    /// The first contiguous input slice (everything when not wrapped).
    pub fn input_contiguous(&self) -> &[u8] {
        let len = self.i.min(self.size() - self.p);
        &self.data[self.p..self.p + len]
    }

    pub fn input_contiguous_mut(&mut self) -> &mut [u8] {
        let len = self.i.min(self.size() - self.p);
        &mut self.data[self.p..self.p + len]
    }

    /// The first contiguous output slice, for transports to send from.
    pub fn output_contiguous(&self) -> &[u8] {
        let size = self.size();
        let start = self.wrap(self.p + size - self.o);
        let len = self.o.min(size - start);
        &self.data[start..start + len]
    }

    /// The first contiguous free slice, for transports to receive into.
    /// `limit` caps how far past the current input the region may extend
    /// (receive limits leave rewrite room while a message is analysed).
    pub fn space_contiguous_mut(&mut self, limit: usize) -> &mut [u8] {
        let size = self.size();
        let room = self.space().min(limit.saturating_sub(self.len()));
        let start = self.wrap(self.p + self.i);
        let len = room.min(size - start);
        &mut self.data[start..start + len]
    }

    /// Account for `n` bytes just written at the end of the input region.
    /// Consumes any pending forward so freshly received bytes move straight
    /// to the output side without a copy. Returns how many of the new bytes
    /// were auto-forwarded.
    pub fn commit_input(&mut self, n: usize) -> usize {
        self.i += n;
        debug_assert!(self.i + self.o <= self.size());
        self.total += n as u64;
        let fwd = (self.to_forward.min(self.i as u64)) as usize;
        if fwd > 0 {
            self.advance(fwd);
            if self.to_forward != FORWARD_INFINITE {
                self.to_forward -= fwd as u64;
            }
        }
        fwd
    }

    /// Move `n` input bytes to the output side (zero copy, pointer math).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.i);
        self.p = self.wrap(self.p + n);
        self.i -= n;
        self.o += n;
    }

    /// Schedule `n` bytes for forwarding: whatever input is present moves
    /// now, the remainder is consumed as it arrives.
    /// `FORWARD_INFINITE` latches permanently.
    pub fn forward(&mut self, n: u64) {
        if n == FORWARD_INFINITE {
            let imm = self.i;
            self.advance(imm);
            self.to_forward = FORWARD_INFINITE;
            return;
        }
        let imm = (n.min(self.i as u64)) as usize;
        self.advance(imm);
        if self.to_forward != FORWARD_INFINITE {
            self.to_forward = self.to_forward.saturating_add(n - imm as u64);
        }
    }

    /// Drop `n` committed output bytes from the head (after a send).
    pub fn fast_delete(&mut self, n: usize) {
        debug_assert!(n <= self.o);
        self.o -= n;
        if self.is_empty() {
            self.p = 0;
        }
    }

    /// Drop `n` bytes from the front of the input region (bytes looked at
    /// and discarded, e.g. empty leading lines before a request).
    pub fn cut_input_front(&mut self, n: usize) {
        debug_assert!(n <= self.i);
        self.p = self.wrap(self.p + n);
        self.i -= n;
    }

    /// Forget everything buffered. Counters survive.
    pub fn erase(&mut self) {
        self.p = 0;
        self.i = 0;
        self.o = 0;
        self.to_forward = 0;
    }

    /// Copy bytes into the input side. Returns how many fit.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() {
            let dst = self.space_contiguous_mut(usize::MAX);
            if dst.is_empty() {
                break;
            }
            let n = dst.len().min(src.len() - copied);
            dst[..n].copy_from_slice(&src[copied..copied + n]);
            self.i += n;
            self.total += n as u64;
            copied += n;
        }
        // settle any pending forward exactly once
        self.i -= copied;
        self.total -= copied as u64;
        self.commit_input(copied);
        copied
    }

    /// Inject bytes directly on the output side. Only legal while the input
    /// side is empty (synthesized responses replace, never interleave).
    /// Returns false when the message does not fit.
    pub fn put_output(&mut self, src: &[u8]) -> bool {
        debug_assert_eq!(self.i, 0);
        if src.len() > self.space() {
            return false;
        }
        let mut written = 0;
        while written < src.len() {
            let size = self.size();
            let start = self.p;
            let len = (src.len() - written).min(size - start);
            self.data[start..start + len].copy_from_slice(&src[written..written + len]);
            self.p = self.wrap(self.p + len);
            written += len;
        }
        self.o += src.len();
        true
    }

    /// Rotate the ring so the head sits at index 0 with the output region
    /// wrapped at the very end. O(size). Returns the signed distance the
    /// head moved, for callers holding absolute indices.
    pub fn slow_realign(&mut self) -> isize {
        let shift = self.p;
        if shift == 0 {
            return 0;
        }
        self.data.rotate_left(shift);
        self.p = 0;
        -(shift as isize)
    }

    /// Make sure at least `n` contiguous free bytes follow the input
    /// region, realigning if necessary. Returns false when the ring simply
    /// does not have the room.
    pub fn reserve(&mut self, n: usize) -> bool {
        if self.space() < n {
            return false;
        }
        if !self.input_is_contiguous() || self.size() - self.wrap(self.p + self.i) < n {
            self.slow_realign();
        }
        self.size() - (self.p + self.i) >= n
    }

    /// Replace input bytes `[from, to)` (offsets relative to the head) with
    /// `new`, shifting the input tail. Requires a contiguous input region
    /// with tail room; returns the signed length delta, or `None` when the
    /// edit cannot be applied without overflowing the ring.
    pub fn replace(&mut self, from: usize, to: usize, new: &[u8]) -> Option<isize> {
        debug_assert!(from <= to && to <= self.i);
        let delta = new.len() as isize - (to - from) as isize;
        if delta > 0 && self.space() < delta as usize {
            return None;
        }
        if !self.input_is_contiguous()
            || (self.p + self.i) as isize + delta > self.size() as isize
        {
            // caller should have called reserve() first
            return None;
        }
        let start = self.p + from;
        let end = self.p + to;
        let tail = self.p + self.i;
        // shift the tail, then lay the new bytes down
        self.data
            .copy_within(end..tail, (end as isize + delta) as usize);
        self.data[start..start + new.len()].copy_from_slice(new);
        self.i = (self.i as isize + delta) as usize;
        Some(delta)
    }

    /// Insert `text` followed by CRLF at input offset `pos`. Returns the
    /// inserted length, or `None` when there is no room.
    pub fn insert_line(&mut self, pos: usize, text: &[u8]) -> Option<isize> {
        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text);
        line.extend_from_slice(b"\r\n");
        self.replace(pos, pos, &line)
    }

    /// Read a byte at an input offset relative to the head.
    pub fn input_byte(&self, ofs: usize) -> u8 {
        debug_assert!(ofs < self.i);
        self.data[self.wrap(self.p + ofs)]
    }

    /// Copy the whole output region out (tests, applets).
    pub fn output_to_vec(&self) -> Vec<u8> {
        let size = self.size();
        let start = self.wrap(self.p + size - self.o);
        let mut v = Vec::with_capacity(self.o);
        let first = self.o.min(size - start);
        v.extend_from_slice(&self.data[start..start + first]);
        v.extend_from_slice(&self.data[..self.o - first]);
        v
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("p", &self.p)
            .field("i", &self.i)
            .field("o", &self.o)
            .field("to_forward", &self.to_forward)
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(size: usize, bytes: &[u8]) -> Buffer {
        let mut b = Buffer::with_capacity(size);
        assert_eq!(b.put_slice(bytes), bytes.len());
        b
    }

    #[test]
    fn put_then_read_input() {
        let b = filled(16, b"hello");
        assert_eq!(b.input_len(), 5);
        assert_eq!(b.input_contiguous(), b"hello");
    }

    #[test]
    fn advance_moves_input_to_output() {
        let mut b = filled(16, b"hello world");
        b.advance(5);
        assert_eq!(b.output_len(), 5);
        assert_eq!(b.input_len(), 6);
        assert_eq!(b.output_contiguous(), b"hello");
        assert_eq!(b.input_contiguous(), b" world");
    }

    #[test]
    fn forward_latches_pending_bytes() {
        let mut b = Buffer::with_capacity(16);
        b.put_slice(b"abc");
        b.forward(8);
        assert_eq!(b.output_len(), 3);
        assert_eq!(b.to_forward(), 5);
        b.put_slice(b"defgh");
        assert_eq!(b.output_len(), 8);
        assert_eq!(b.to_forward(), 0);
        assert_eq!(b.input_len(), 0);
    }

    #[test]
    fn infinite_forward_is_sticky() {
        let mut b = Buffer::with_capacity(8);
        b.forward(FORWARD_INFINITE);
        b.put_slice(b"xyz");
        assert_eq!(b.output_len(), 3);
        assert_eq!(b.to_forward(), FORWARD_INFINITE);
    }

    #[test]
    fn wrap_around_send_and_refill() {
        let mut b = Buffer::with_capacity(8);
        b.put_slice(b"abcdef");
        b.advance(6);
        b.fast_delete(6); // all sent; buffer empty, head resets
        assert_eq!(b.space(), 8);
        b.put_slice(b"12345678");
        assert!(b.is_full());
        assert_eq!(b.input_contiguous(), b"12345678");
    }

    #[test]
    fn wrapped_input_realigns() {
        let mut b = Buffer::with_capacity(8);
        b.put_slice(b"abcdef");
        b.advance(6);
        b.fast_delete(4); // two output bytes left, head at 6
        b.put_slice(b"wxyz"); // input wraps: [6..8) + [0..2)
        assert!(!b.input_is_contiguous());
        assert_eq!(b.input_contiguous(), b"wx");
        let d = b.slow_realign();
        assert_eq!(d, -6);
        assert!(b.input_is_contiguous());
        assert_eq!(b.input_contiguous(), b"wxyz");
        assert_eq!(b.output_contiguous(), b"ef");
    }

    #[test]
    fn replace_shrinks_and_grows() {
        let mut b = filled(32, b"GET /long/path HTTP/1.1\r\n");
        let d = b.replace(4, 14, b"/p").unwrap();
        assert_eq!(d, -8);
        assert_eq!(b.input_contiguous(), b"GET /p HTTP/1.1\r\n");
        let d = b.replace(4, 6, b"/much/longer").unwrap();
        assert_eq!(d, 10);
        assert_eq!(b.input_contiguous(), b"GET /much/longer HTTP/1.1\r\n");
    }

    #[test]
    fn replace_refuses_to_overflow() {
        let mut b = filled(8, b"abcdefgh");
        assert!(b.replace(0, 0, b"x").is_none());
        // same-length edits still work on a full ring
        assert_eq!(b.replace(0, 1, b"X"), Some(0));
        assert_eq!(b.input_contiguous(), b"Xbcdefgh");
    }

    #[test]
    fn insert_line_appends_crlf() {
        let mut b = filled(64, b"GET /\r\nHost: x\r\n\r\n");
        let d = b.insert_line(7, b"Via: relay").unwrap();
        assert_eq!(d, 12);
        assert_eq!(b.input_contiguous(), &b"GET /\r\nVia: relay\r\nHost: x\r\n\r\n"[..]);
    }

    #[test]
    fn reserve_realigns_for_tail_room() {
        let mut b = Buffer::with_capacity(16);
        b.put_slice(b"0123456789");
        b.advance(10);
        b.fast_delete(8);
        b.put_slice(b"ab"); // head at 10, input [10..12)
        assert!(b.reserve(6));
        assert!(b.input_is_contiguous());
        assert_eq!(b.input_contiguous(), b"ab");
        assert!(!b.reserve(15));
    }

    #[test]
    fn put_output_writes_committed_bytes() {
        let mut b = Buffer::with_capacity(16);
        assert!(b.put_output(b"HTTP/1.0 403\r\n"));
        assert_eq!(b.output_len(), 14);
        assert_eq!(b.output_to_vec(), b"HTTP/1.0 403\r\n".to_vec());
        assert!(!b.put_output(&[0u8; 3]));
    }

    #[test]
    fn cut_input_front_discards_leading_bytes() {
        let mut b = filled(16, b"\r\n\r\nGET");
        b.cut_input_front(4);
        assert_eq!(b.input_contiguous(), b"GET");
    }

    #[test]
    fn commit_input_reports_auto_forward() {
        let mut b = Buffer::with_capacity(16);
        b.forward(4);
        let dst = b.space_contiguous_mut(usize::MAX);
        dst[..6].copy_from_slice(b"abcdef");
        let fwd = b.commit_input(6);
        assert_eq!(fwd, 4);
        assert_eq!(b.output_len(), 4);
        assert_eq!(b.input_len(), 2);
    }

    #[test]
    fn recv_limit_leaves_rewrite_room() {
        let mut b = Buffer::with_capacity(32);
        b.put_slice(b"0123456789");
        let room = b.space_contiguous_mut(16).len();
        assert_eq!(room, 6);
    }
}
