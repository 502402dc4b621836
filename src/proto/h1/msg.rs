//! HTTP message state: parser position, start-line spans and body framing
//! flags. All offsets are relative to the owning buffer's head, so draining
//! output never invalidates them; buffer rewrites report deltas which are
//! folded in with [`HttpMsg::shift_after`].

use bitflags::bitflags;

/// Parser states. Order matters: everything before `Body` means the head
/// is still being parsed, everything from `Done` on is terminal for the
/// head+body pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgState {
    // request line
    RqBefore,
    RqBeforeCr,
    RqMeth,
    RqMethSp,
    RqUri,
    RqUriSp,
    RqVer,
    RqLineEnd,
    // status line
    RpBefore,
    RpBeforeCr,
    RpVer,
    RpVerSp,
    RpCode,
    RpCodeSp,
    RpReason,
    RpLineEnd,
    // header block, shared by both sides
    HdrFirst,
    HdrName,
    HdrL1Sp,
    HdrL1Lf,
    HdrL1Lws,
    HdrVal,
    HdrL2Lf,
    HdrL2Lws,
    LastLf,
    // body
    Body,
    Sent100,
    ChunkSize,
    Data,
    ChunkCrlf,
    Trailers,
    // terminal
    Done,
    Closing,
    Closed,
    Tunnel,
    Error,
}

impl MsgState {
    /// Still reading the start line or headers.
    pub fn in_head(self) -> bool {
        self <= MsgState::LastLf
    }

    /// The whole message (head and body) has been seen.
    pub fn finished(self) -> bool {
        self >= MsgState::Done && self != MsgState::Error
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Message advertised HTTP/1.1 or above.
        const VER_11   = 0x01;
        /// A valid Content-Length governs the body.
        const CNT_LEN  = 0x02;
        /// Transfer-Encoding ends with chunked.
        const TE_CHNK  = 0x04;
        /// The transfer length is known (one of the two above, or zero).
        const XFER_LEN = 0x08;
    }
}

/// A byte range relative to the buffer head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub ofs: usize,
    pub len: usize,
}

impl Span {
    pub fn new(ofs: usize, len: usize) -> Span {
        Span { ofs, len }
    }

    pub fn end(&self) -> usize {
        self.ofs + self.len
    }

    pub fn slice<'a>(&self, input: &'a [u8]) -> &'a [u8] {
        &input[self.ofs..self.ofs + self.len]
    }
}

/// Parsed start-line positions.
#[derive(Debug, Clone, Copy)]
pub enum StartLine {
    None,
    /// method, uri, version
    Rq { m: Span, u: Span, v: Span },
    /// version, code, reason
    St { v: Span, c: Span, r: Span },
}

impl StartLine {
    pub fn rq(&self) -> (Span, Span, Span) {
        match *self {
            StartLine::Rq { m, u, v } => (m, u, v),
            _ => panic!("not a request line"),
        }
    }

    pub fn st(&self) -> (Span, Span, Span) {
        match *self {
            StartLine::St { v, c, r } => (v, c, r),
            _ => panic!("not a status line"),
        }
    }
}

pub struct HttpMsg {
    pub msg_state: MsgState,
    pub flags: MsgFlags,
    /// Start of the current line while parsing headers; 0 once the head
    /// is complete.
    pub sol: usize,
    /// End of the current line (offset of its CR, or LF when bare).
    pub eol: usize,
    /// Offset of the empty line terminating the headers.
    pub eoh: usize,
    /// First body byte (start of value historically, hence the name).
    pub sov: usize,
    /// First byte not yet visited by the parser.
    pub next: usize,
    pub sl: StartLine,
    /// Current chunk: bytes of payload not yet forwarded.
    pub chunk_len: u64,
    /// Total body length when known (sum of chunk sizes so far).
    pub body_len: u64,
    /// Offset of the byte that made parsing fail.
    pub err_pos: Option<usize>,
}

impl HttpMsg {
    /// A message about to parse a request.
    pub fn new_request() -> HttpMsg {
        HttpMsg::new(MsgState::RqBefore)
    }

    /// A message about to parse a response.
    pub fn new_response() -> HttpMsg {
        HttpMsg::new(MsgState::RpBefore)
    }

    fn new(state: MsgState) -> HttpMsg {
        HttpMsg {
            msg_state: state,
            flags: MsgFlags::empty(),
            sol: 0,
            eol: 0,
            eoh: 0,
            sov: 0,
            next: 0,
            sl: StartLine::None,
            chunk_len: 0,
            body_len: 0,
            err_pos: None,
        }
    }

    pub fn reinit(&mut self, state: MsgState) {
        *self = HttpMsg::new(state);
    }

    /// Fold a buffer-rewrite delta into every offset at or past `at`.
    pub fn shift_after(&mut self, at: usize, delta: isize) {
        fn adj(v: &mut usize, at: usize, delta: isize) {
            if *v >= at {
                *v = (*v as isize + delta) as usize;
            }
        }
        adj(&mut self.sol, at, delta);
        adj(&mut self.eol, at, delta);
        adj(&mut self.eoh, at, delta);
        adj(&mut self.sov, at, delta);
        adj(&mut self.next, at, delta);
        match self.sl {
            StartLine::None => {}
            StartLine::Rq {
                ref mut m,
                ref mut u,
                ref mut v,
            } => {
                adj(&mut m.ofs, at, delta);
                adj(&mut u.ofs, at, delta);
                adj(&mut v.ofs, at, delta);
            }
            StartLine::St {
                ref mut v,
                ref mut c,
                ref mut r,
            } => {
                adj(&mut v.ofs, at, delta);
                adj(&mut c.ofs, at, delta);
                adj(&mut r.ofs, at, delta);
            }
        }
    }

    /// The head is fully indexed and usable.
    pub fn head_complete(&self) -> bool {
        self.msg_state >= MsgState::Body && self.msg_state != MsgState::Error
    }

    pub fn is_error(&self) -> bool {
        self.msg_state == MsgState::Error
    }

    pub(crate) fn set_error(&mut self, at: usize) {
        self.msg_state = MsgState::Error;
        if self.err_pos.is_none() {
            self.err_pos = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_classifies_phases() {
        assert!(MsgState::RqMeth.in_head());
        assert!(MsgState::LastLf.in_head());
        assert!(!MsgState::Body.in_head());
        assert!(MsgState::Done.finished());
        assert!(MsgState::Tunnel.finished());
        assert!(!MsgState::Error.finished());
        assert!(!MsgState::ChunkSize.finished());
    }

    #[test]
    fn shift_after_only_moves_later_offsets() {
        let mut msg = HttpMsg::new_request();
        msg.sl = StartLine::Rq {
            m: Span::new(0, 3),
            u: Span::new(4, 5),
            v: Span::new(10, 8),
        };
        msg.eoh = 20;
        msg.sov = 22;
        msg.next = 22;
        msg.shift_after(10, 4);
        let (m, u, v) = msg.sl.rq();
        assert_eq!(m.ofs, 0);
        assert_eq!(u.ofs, 4);
        assert_eq!(v.ofs, 14);
        assert_eq!(msg.eoh, 24);
        assert_eq!(msg.sov, 26);
    }
}
