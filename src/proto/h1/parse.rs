//! Incremental HTTP/1.x head parser.
//!
//! One call makes one observable step: it consumes what it can from the
//! buffer's contiguous input, updates `(msg_state, next)` and returns. Short
//! input is never an error; the next call resumes at the exact byte where
//! the previous one stopped, whatever the split. The parser only ever
//! mutates buffer bytes to fold LWS continuations into spaces, and only
//! ever moves the buffer head to discard empty lines ahead of a message
//! (and that, solely while the output side is empty).

use crate::buffer::Buffer;
use crate::proto::h1::headers::HdrIdx;
use crate::proto::h1::msg::{HttpMsg, MsgState, Span, StartLine};

#[inline]
fn is_token(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-'
        | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

#[inline]
fn is_spht(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[inline]
fn is_crlf(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

#[inline]
fn is_ver_char(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'/')
}

/// Drive the head parser as far as the available bytes allow.
///
/// On return the message is in one of three situations: `head_complete()`
/// (start line and headers indexed, `next`/`sov` at the first body byte),
/// `is_error()` (with `err_pos` set), or still in a head state waiting for
/// more bytes.
///
/// `accept_invalid` keeps parsing on a non-ASCII URI byte, recording the
/// first offending position in `err_pos` instead of failing.
pub fn parse_message(buf: &mut Buffer, msg: &mut HttpMsg, idx: &mut HdrIdx) {
    parse_message_opts(buf, msg, idx, false)
}

pub fn parse_message_opts(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HdrIdx,
    accept_invalid: bool,
) {
    if !msg.msg_state.in_head() {
        return;
    }

    // Discard empty lines ahead of a message. The physical delete only
    // happens when a start byte shows up, and only when nothing is
    // scheduled for sending (moving the head would shift those bytes).
    loop {
        match msg.msg_state {
            MsgState::RqBefore | MsgState::RpBefore => {
                if msg.next >= buf.input_len() {
                    return;
                }
                let b = buf.input_byte(msg.next);
                if b == b'\r' {
                    msg.next += 1;
                    msg.msg_state = match msg.msg_state {
                        MsgState::RqBefore => MsgState::RqBeforeCr,
                        _ => MsgState::RpBeforeCr,
                    };
                } else if b == b'\n' {
                    msg.next += 1;
                } else {
                    let ok = match msg.msg_state {
                        MsgState::RqBefore => is_token(b),
                        _ => is_ver_char(b),
                    };
                    if !ok {
                        msg.set_error(msg.next);
                        return;
                    }
                    if msg.next > 0 {
                        if buf.output_len() > 0 {
                            // blocked: deleting would shift scheduled bytes
                            return;
                        }
                        buf.cut_input_front(msg.next);
                        msg.next = 0;
                    }
                    msg.sol = 0;
                    idx.reset();
                    if msg.msg_state == MsgState::RqBefore {
                        msg.sl = StartLine::Rq {
                            m: Span::default(),
                            u: Span::default(),
                            v: Span::default(),
                        };
                        msg.msg_state = MsgState::RqMeth;
                    } else {
                        msg.sl = StartLine::St {
                            v: Span::default(),
                            c: Span::default(),
                            r: Span::default(),
                        };
                        msg.msg_state = MsgState::RpVer;
                    }
                    break;
                }
            }
            MsgState::RqBeforeCr | MsgState::RpBeforeCr => {
                if msg.next >= buf.input_len() {
                    return;
                }
                if buf.input_byte(msg.next) != b'\n' {
                    msg.set_error(msg.next);
                    return;
                }
                msg.next += 1;
                msg.msg_state = match msg.msg_state {
                    MsgState::RqBeforeCr => MsgState::RqBefore,
                    _ => MsgState::RpBefore,
                };
            }
            _ => break,
        }
    }

    let mut state = msg.msg_state;
    let mut ptr = msg.next;
    let input = buf.input_contiguous_mut();

    macro_rules! need {
        () => {
            match input.get(ptr) {
                Some(&b) => b,
                None => {
                    msg.msg_state = state;
                    msg.next = ptr;
                    return;
                }
            }
        };
    }

    macro_rules! fail {
        () => {{
            msg.next = ptr;
            msg.set_error(ptr);
            return;
        }};
    }

    loop {
        match state {
            // ---- request line ----
            MsgState::RqMeth => {
                let b = need!();
                if is_token(b) {
                    ptr += 1;
                } else if let StartLine::Rq {
                    ref mut m,
                    ref mut u,
                    ref mut v,
                } = msg.sl
                {
                    *m = Span::new(msg.sol, ptr - msg.sol);
                    if is_spht(b) {
                        ptr += 1;
                        state = MsgState::RqMethSp;
                    } else if is_crlf(b) {
                        // bare method, let the analyser decide what it is
                        *u = Span::new(ptr, 0);
                        *v = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RqLineEnd;
                    } else {
                        fail!();
                    }
                }
            }
            MsgState::RqMethSp => {
                let b = need!();
                if is_spht(b) {
                    ptr += 1;
                } else if let StartLine::Rq {
                    ref mut u,
                    ref mut v,
                    ..
                } = msg.sl
                {
                    if is_crlf(b) {
                        *u = Span::new(ptr, 0);
                        *v = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RqLineEnd;
                    } else {
                        u.ofs = ptr;
                        state = MsgState::RqUri;
                    }
                }
            }
            MsgState::RqUri => {
                let b = need!();
                if (33..=126).contains(&b) {
                    ptr += 1;
                } else if b >= 128 {
                    if accept_invalid {
                        if msg.err_pos.is_none() {
                            msg.err_pos = Some(ptr);
                        }
                        ptr += 1;
                    } else {
                        fail!();
                    }
                } else if let StartLine::Rq {
                    ref mut u,
                    ref mut v,
                    ..
                } = msg.sl
                {
                    if is_spht(b) {
                        u.len = ptr - u.ofs;
                        ptr += 1;
                        state = MsgState::RqUriSp;
                    } else if is_crlf(b) {
                        // HTTP/0.9 request: line ends after the URI
                        u.len = ptr - u.ofs;
                        *v = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RqLineEnd;
                    } else {
                        fail!();
                    }
                }
            }
            MsgState::RqUriSp => {
                let b = need!();
                if is_spht(b) {
                    ptr += 1;
                } else if let StartLine::Rq { ref mut v, .. } = msg.sl {
                    if is_crlf(b) {
                        *v = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RqLineEnd;
                    } else {
                        v.ofs = ptr;
                        state = MsgState::RqVer;
                    }
                }
            }
            MsgState::RqVer => {
                let b = need!();
                if is_ver_char(b) {
                    ptr += 1;
                } else if is_crlf(b) {
                    if let StartLine::Rq { ref mut v, .. } = msg.sl {
                        v.len = ptr - v.ofs;
                    }
                    msg.eol = ptr;
                    if b == b'\r' {
                        ptr += 1;
                    }
                    state = MsgState::RqLineEnd;
                } else {
                    fail!();
                }
            }
            MsgState::RqLineEnd => {
                let b = need!();
                if b != b'\n' {
                    fail!();
                }
                ptr += 1;
                let (_, _, v) = msg.sl.rq();
                if v.len == 0 {
                    // HTTP/0.9: no headers follow, the head ends here
                    msg.eoh = msg.eol;
                    msg.sov = ptr;
                    msg.next = ptr;
                    msg.sol = 0;
                    msg.msg_state = MsgState::Body;
                    return;
                }
                idx.set_start(ptr);
                msg.sol = ptr;
                state = MsgState::HdrFirst;
            }

            // ---- status line ----
            MsgState::RpVer => {
                let b = need!();
                if is_ver_char(b) {
                    ptr += 1;
                } else if is_spht(b) {
                    if let StartLine::St { ref mut v, .. } = msg.sl {
                        *v = Span::new(msg.sol, ptr - msg.sol);
                    }
                    ptr += 1;
                    state = MsgState::RpVerSp;
                } else {
                    fail!();
                }
            }
            MsgState::RpVerSp => {
                let b = need!();
                if is_spht(b) {
                    ptr += 1;
                } else if !is_crlf(b) {
                    if let StartLine::St { ref mut c, .. } = msg.sl {
                        c.ofs = ptr;
                    }
                    state = MsgState::RpCode;
                } else {
                    // a version with no status code is not a response
                    fail!();
                }
            }
            MsgState::RpCode => {
                let b = need!();
                if !is_spht(b) && !is_crlf(b) {
                    ptr += 1;
                } else if let StartLine::St {
                    ref mut c,
                    ref mut r,
                    ..
                } = msg.sl
                {
                    c.len = ptr - c.ofs;
                    if is_spht(b) {
                        ptr += 1;
                        state = MsgState::RpCodeSp;
                    } else {
                        // reason-less status line, accepted
                        *r = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RpLineEnd;
                    }
                }
            }
            MsgState::RpCodeSp => {
                let b = need!();
                if is_spht(b) {
                    ptr += 1;
                } else if let StartLine::St { ref mut r, .. } = msg.sl {
                    if is_crlf(b) {
                        *r = Span::new(ptr, 0);
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::RpLineEnd;
                    } else {
                        r.ofs = ptr;
                        state = MsgState::RpReason;
                    }
                }
            }
            MsgState::RpReason => {
                let b = need!();
                if !is_crlf(b) {
                    ptr += 1;
                } else {
                    if let StartLine::St { ref mut r, .. } = msg.sl {
                        r.len = ptr - r.ofs;
                    }
                    msg.eol = ptr;
                    if b == b'\r' {
                        ptr += 1;
                    }
                    state = MsgState::RpLineEnd;
                }
            }
            MsgState::RpLineEnd => {
                let b = need!();
                if b != b'\n' {
                    fail!();
                }
                ptr += 1;
                idx.set_start(ptr);
                msg.sol = ptr;
                state = MsgState::HdrFirst;
            }

            // ---- header block ----
            MsgState::HdrFirst => {
                let b = need!();
                if !is_crlf(b) {
                    msg.sol = ptr;
                    state = MsgState::HdrName;
                } else {
                    msg.sol = ptr;
                    msg.eol = ptr;
                    if b == b'\r' {
                        ptr += 1;
                    }
                    state = MsgState::LastLf;
                }
            }
            MsgState::HdrName => {
                let b = need!();
                if b == b':' {
                    ptr += 1;
                    state = MsgState::HdrL1Sp;
                } else if is_token(b) {
                    ptr += 1;
                } else {
                    fail!();
                }
            }
            MsgState::HdrL1Sp => {
                let b = need!();
                if is_spht(b) {
                    ptr += 1;
                } else if is_crlf(b) {
                    msg.eol = ptr;
                    if b == b'\r' {
                        ptr += 1;
                    }
                    state = MsgState::HdrL1Lf;
                } else {
                    msg.sov = ptr;
                    state = MsgState::HdrVal;
                }
            }
            MsgState::HdrL1Lf => {
                let b = need!();
                if b != b'\n' {
                    fail!();
                }
                ptr += 1;
                state = MsgState::HdrL1Lws;
            }
            MsgState::HdrL1Lws => {
                let b = need!();
                if is_spht(b) {
                    // folded continuation before any value byte: erase the
                    // line break so the value stays one token
                    for k in msg.eol..ptr {
                        input[k] = b' ';
                    }
                    state = MsgState::HdrL1Sp;
                } else {
                    // empty-value header line
                    if !idx.add(msg.eol - msg.sol, input[msg.eol] == b'\r') {
                        fail!();
                    }
                    msg.sol = ptr;
                    if is_crlf(b) {
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::LastLf;
                    } else {
                        state = MsgState::HdrName;
                    }
                }
            }
            MsgState::HdrVal => {
                let b = need!();
                if !is_crlf(b) {
                    ptr += 1;
                } else {
                    msg.eol = ptr;
                    if b == b'\r' {
                        ptr += 1;
                    }
                    state = MsgState::HdrL2Lf;
                }
            }
            MsgState::HdrL2Lf => {
                let b = need!();
                if b != b'\n' {
                    fail!();
                }
                ptr += 1;
                state = MsgState::HdrL2Lws;
            }
            MsgState::HdrL2Lws => {
                let b = need!();
                if is_spht(b) {
                    // folded continuation: flatten the break into spaces
                    for k in msg.eol..ptr {
                        input[k] = b' ';
                    }
                    state = MsgState::HdrVal;
                } else {
                    if !idx.add(msg.eol - msg.sol, input[msg.eol] == b'\r') {
                        fail!();
                    }
                    msg.sol = ptr;
                    if is_crlf(b) {
                        msg.eol = ptr;
                        if b == b'\r' {
                            ptr += 1;
                        }
                        state = MsgState::LastLf;
                    } else {
                        state = MsgState::HdrName;
                    }
                }
            }
            MsgState::LastLf => {
                let b = need!();
                if b != b'\n' {
                    fail!();
                }
                ptr += 1;
                msg.eoh = msg.sol;
                msg.sov = ptr;
                msg.next = ptr;
                msg.sol = 0;
                msg.msg_state = MsgState::Body;
                return;
            }

            _ => unreachable!("parse_message entered in state {:?}", state),
        }
    }
}
