//! Zero-copy body forwarding.
//!
//! Both directions drive the same chunk loop `CHUNK_SIZE → DATA →
//! CHUNK_CRLF → … → TRAILERS → DONE`, scheduling each fully-framed
//! segment with `channel.forward()` so payload bytes move without a copy.
//! A compressing response takes the slow path: payload is consumed into
//! the compressor and re-emitted as fresh chunk frames ahead of the
//! remaining input.

use tracing::trace;

use crate::analyser::Analysers;
use crate::buffer::FORWARD_INFINITE;
use crate::channel::{Channel, ChnFlags};
use crate::compress::CompState;
use crate::proto::h1::chunked;
use crate::proto::h1::msg::{HttpMsg, MsgFlags, MsgState, StartLine};
use crate::session::{ErrCause, FinState, Session};

/// Result of one forwarding pass.
enum Step {
    Blocked,
    Done,
    /// Framing went wrong at the producer side.
    BadFrame,
    /// The producer quit mid-message.
    Aborted,
}

/// Drop the head-phase offsets once the head has been scheduled; from
/// here on the parser-visible world starts at the buffer head.
fn schedule_head(chn: &mut Channel, msg: &mut HttpMsg) {
    let head = msg.sov;
    chn.forward(head as u64);
    msg.sol = 0;
    msg.eol = 0;
    msg.eoh = 0;
    msg.sov = 0;
    msg.next = 0;
    msg.sl = StartLine::None;
    if msg.flags.contains(MsgFlags::TE_CHNK) {
        msg.msg_state = MsgState::ChunkSize;
    } else {
        msg.chunk_len = msg.body_len;
        msg.msg_state = MsgState::Data;
    }
}

fn forward_step(chn: &mut Channel, msg: &mut HttpMsg, comp: &mut Option<CompState>) -> Step {
    if !msg.flags.contains(MsgFlags::XFER_LEN) {
        // close-delimited: relay until the producer closes
        chn.forward(FORWARD_INFINITE);
        if chn.flags.contains(ChnFlags::SHUTR) {
            msg.msg_state = MsgState::Done;
            return Step::Done;
        }
        return Step::Blocked;
    }

    if msg.msg_state == MsgState::Body {
        schedule_head(chn, msg);
    }

    loop {
        // pending compressed frames that did not fit earlier
        if let Some(st) = comp.as_mut() {
            if !flush_carry(chn, st) {
                return Step::Blocked;
            }
        }

        match msg.msg_state {
            MsgState::Data => {
                let moved = match comp.as_mut() {
                    Some(st) => consume_payload(chn, msg, st),
                    None => {
                        let take = msg.chunk_len.min(chn.buf.input_len() as u64);
                        if take > 0 {
                            chn.forward(take);
                            msg.chunk_len -= take;
                        }
                        take > 0
                    }
                };
                if msg.chunk_len == 0 {
                    msg.msg_state = if msg.flags.contains(MsgFlags::TE_CHNK) {
                        MsgState::ChunkCrlf
                    } else {
                        MsgState::Done
                    };
                    continue;
                }
                if !moved {
                    if chn.flags.contains(ChnFlags::SHUTW) {
                        return Step::BadFrame;
                    }
                    if chn.flags.contains(ChnFlags::SHUTR) {
                        return Step::Aborted;
                    }
                    return Step::Blocked;
                }
            }
            MsgState::ChunkSize => {
                if !chn.buf.input_is_contiguous() {
                    chn.buf.slow_realign();
                }
                match chunked::parse_chunk_size(chn.buf.input_contiguous()) {
                    Ok(Some((consumed, size))) => {
                        trace!("chunk of {} bytes", size);
                        match comp {
                            Some(_) => chn.buf.cut_input_front(consumed),
                            None => chn.forward(consumed as u64),
                        }
                        msg.chunk_len = size;
                        msg.body_len += size;
                        msg.msg_state = if size == 0 {
                            MsgState::Trailers
                        } else {
                            MsgState::Data
                        };
                    }
                    Ok(None) => {
                        if chn.flags.contains(ChnFlags::SHUTR) {
                            // a chunked message cut right after the headers
                            // falls through as an empty close-delimited body
                            if msg.body_len == 0 && chn.buf.input_len() == 0 {
                                msg.msg_state = MsgState::Done;
                                return Step::Done;
                            }
                            return Step::Aborted;
                        }
                        if chn.is_full() {
                            return Step::BadFrame;
                        }
                        return Step::Blocked;
                    }
                    Err(_) => return Step::BadFrame,
                }
            }
            MsgState::ChunkCrlf => {
                if !chn.buf.input_is_contiguous() {
                    chn.buf.slow_realign();
                }
                match chunked::skip_chunk_crlf(chn.buf.input_contiguous()) {
                    Ok(Some(n)) => {
                        match comp {
                            Some(_) => chn.buf.cut_input_front(n),
                            None => chn.forward(n as u64),
                        }
                        msg.msg_state = MsgState::ChunkSize;
                    }
                    Ok(None) => {
                        if chn.flags.contains(ChnFlags::SHUTR) {
                            return Step::Aborted;
                        }
                        return Step::Blocked;
                    }
                    Err(_) => return Step::BadFrame,
                }
            }
            MsgState::Trailers => {
                if !chn.buf.input_is_contiguous() {
                    chn.buf.slow_realign();
                }
                match chunked::parse_trailers(chn.buf.input_contiguous()) {
                    Ok(Some(n)) => {
                        match comp {
                            Some(_) => chn.buf.cut_input_front(n),
                            None => chn.forward(n as u64),
                        }
                        msg.msg_state = MsgState::Done;
                        continue;
                    }
                    Ok(None) => {
                        if chn.flags.contains(ChnFlags::SHUTR) {
                            return Step::Aborted;
                        }
                        if chn.is_full() {
                            return Step::BadFrame;
                        }
                        return Step::Blocked;
                    }
                    Err(_) => return Step::BadFrame,
                }
            }
            MsgState::Done => {
                if let Some(st) = comp.as_mut() {
                    if !st.finished() {
                        let tail = st.take(true);
                        st.carry_frames(&tail, true);
                        if !flush_carry(chn, st) {
                            return Step::Blocked;
                        }
                    } else if !flush_carry(chn, st) {
                        return Step::Blocked;
                    }
                }
                return Step::Done;
            }
            _ => return Step::Done,
        }
    }
}

/// Pull payload into the compressor and re-emit it as chunk frames.
/// Returns true when any input byte was consumed.
fn consume_payload(chn: &mut Channel, msg: &mut HttpMsg, st: &mut CompState) -> bool {
    let mut moved = false;
    while msg.chunk_len > 0 && chn.buf.input_len() > 0 {
        let n = {
            let seg = chn.buf.input_contiguous();
            let n = (msg.chunk_len.min(seg.len() as u64)) as usize;
            st.add(&seg[..n]);
            n
        };
        chn.buf.cut_input_front(n);
        msg.chunk_len -= n as u64;
        moved = true;
    }
    if moved {
        let out = st.take(false);
        st.carry_frames(&out, false);
        // injected by the caller's next flush
    }
    moved
}

/// Inject carried frames ahead of the remaining input. False when the
/// ring has no room yet.
fn flush_carry(chn: &mut Channel, st: &mut CompState) -> bool {
    if st.carry.is_empty() {
        return true;
    }
    if !chn.buf.reserve(st.carry.len()) {
        return false;
    }
    if chn.buf.replace(0, 0, &st.carry).is_none() {
        return false;
    }
    let n = st.carry.len();
    chn.buf.advance(n);
    st.carry.clear();
    true
}

pub fn http_request_forward_body(s: &mut Session) -> bool {
    let state = s.txn.req.msg_state;
    if state < MsgState::Body {
        return false;
    }
    if state >= MsgState::Done {
        s.req.analysers.remove(Analysers::REQ_HTTP_XFER_BODY);
        return true;
    }
    let step = {
        let Session {
            ref mut req,
            ref mut txn,
            ..
        } = *s;
        forward_step(req, &mut txn.req, &mut None)
    };
    match step {
        Step::Done => {
            // in keep-alive and server-close the channel must stay open so
            // the response can complete; sync decides what happens next
            s.req.analysers.remove(Analysers::REQ_HTTP_XFER_BODY);
            true
        }
        Step::Blocked => false,
        Step::BadFrame => {
            s.txn.req.msg_state = MsgState::Error;
            s.set_term_flags(ErrCause::PrxCond, FinState::D);
            // the server may still answer (e.g. 413); only the request
            // side stops
            s.req.analysers = Analysers::empty();
            s.req.shutr_now();
            s.req.shutw_now();
            false
        }
        Step::Aborted => {
            s.txn.req.msg_state = MsgState::Error;
            s.set_term_flags(ErrCause::CliCl, FinState::D);
            s.silent_close();
            false
        }
    }
}

pub fn http_response_forward_body(s: &mut Session) -> bool {
    let state = s.txn.rsp.msg_state;
    if state < MsgState::Body {
        return false;
    }
    if state >= MsgState::Done {
        s.rep.analysers.remove(Analysers::RES_HTTP_XFER_BODY);
        return true;
    }
    let step = {
        let Session {
            ref mut rep,
            ref mut txn,
            ref mut comp,
            ..
        } = *s;
        forward_step(rep, &mut txn.rsp, comp)
    };
    match step {
        Step::Done => {
            if let Some(st) = s.comp.take() {
                let fe = &s.fe.fe_counters;
                fe.comp_in.set(fe.comp_in.get() + st.consumed);
                fe.comp_out.set(fe.comp_out.get() + st.produced);
            }
            s.rep.analysers.remove(Analysers::RES_HTTP_XFER_BODY);
            true
        }
        Step::Blocked => false,
        Step::BadFrame => {
            s.txn.rsp.msg_state = MsgState::Error;
            s.set_term_flags(ErrCause::SrvCl, FinState::D);
            s.silent_close();
            false
        }
        Step::Aborted => {
            s.txn.rsp.msg_state = MsgState::Error;
            s.set_term_flags(ErrCause::SrvCl, FinState::D);
            s.silent_close();
            false
        }
    }
}
