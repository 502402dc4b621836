//! Response-side HTTP analysers: wait for the server's head, capture
//! persistence material, shape the response for the client.

use tracing::{debug, trace};

use crate::analyser::mode::{
    adjust_res_mode, parse_connection_tokens, set_connection_header, want_res_header,
};
use crate::analyser::Analysers;
use crate::channel::ChnFlags;
use crate::compress::CompState;
use crate::proto::h1::headers;
use crate::proto::h1::msg::{MsgFlags, MsgState};
use crate::proto::h1::parse_message;
use crate::proto::txn::TxnFlags;
use crate::session::{ErrCause, FinState, Session};
use crate::status::ErrStatus;

/// Parse the response head, classifying early failures toward the server.
pub fn http_wait_for_response(s: &mut Session) -> bool {
    loop {
        {
            let Session {
                ref mut rep,
                ref mut txn,
                ..
            } = *s;
            if txn.rsp.msg_state.in_head()
                && !rep.buf.input_is_contiguous()
                && rep.buf.output_len() == 0
            {
                rep.buf.slow_realign();
            }
            parse_message(&mut rep.buf, &mut txn.rsp, &mut txn.hdr_idx);
        }

        if s.txn.rsp.is_error() {
            return server_fault(s, 502, ErrCause::PrxCond, ErrStatus::BadGateway502);
        }
        if !s.txn.rsp.head_complete() {
            if s.rep.is_full() {
                return server_fault(s, 502, ErrCause::PrxCond, ErrStatus::BadGateway502);
            }
            if s.rep.flags.contains(ChnFlags::READ_ERROR) {
                return server_fault(s, 502, ErrCause::SrvCl, ErrStatus::BadGateway502);
            }
            if s.rep.flags.contains(ChnFlags::READ_TIMEOUT) {
                return server_fault(s, 504, ErrCause::SrvTo, ErrStatus::GatewayTimeout504);
            }
            if s.rep.flags.contains(ChnFlags::SHUTR) {
                return server_fault(s, 502, ErrCause::SrvCl, ErrStatus::BadGateway502);
            }
            return false;
        }

        // status code
        let status: u16 = {
            let input = s.rep.buf.input_contiguous();
            let (v, c, _) = s.txn.rsp.sl.st();
            let ver = v.slice(input);
            if ver.starts_with(b"HTTP/1.") && ver >= &b"HTTP/1.1"[..] {
                s.txn.rsp.flags.insert(MsgFlags::VER_11);
            }
            match std::str::from_utf8(c.slice(input)).ok().and_then(|t| t.parse().ok()) {
                Some(code) => code,
                None => {
                    return server_fault(s, 502, ErrCause::PrxCond, ErrStatus::BadGateway502);
                }
            }
        };

        if (100..200).contains(&status) {
            // interim response: hand it to the client verbatim and parse
            // the next head
            trace!("forwarding interim response {}", status);
            let sov = s.txn.rsp.sov as u64;
            s.rep.forward(sov);
            s.txn.rsp.reinit(MsgState::RpBefore);
            continue;
        }

        s.txn.status = status;
        break;
    }

    if response_transfer_length(s).is_err() {
        return server_fault(s, 502, ErrCause::PrxCond, ErrStatus::BadGateway502);
    }

    // connection mode, response side: the server may force our hand
    let tokens = {
        let input = s.rep.buf.input_contiguous();
        parse_connection_tokens(input, &s.txn.hdr_idx)
    };
    s.txn.mode = adjust_res_mode(s.txn.mode, s.txn.rsp.flags, tokens);
    trace!("response head complete: {} mode={:?}", s.txn.status, s.txn.mode);

    s.rep.analysers.remove(Analysers::RES_WAIT_HTTP);
    true
}

fn server_fault(s: &mut Session, status: u16, cause: ErrCause, reply: ErrStatus) -> bool {
    debug!("response failure: {} ({:?})", status, cause);
    s.be
        .be_counters
        .failed_resp
        .set(s.be.be_counters.failed_resp.get() + 1);
    s.set_term_flags(cause, FinState::H);
    s.reply_and_close(status, reply.message());
    false
}

/// RFC 2616 transfer-length for responses. HEAD/1xx/204/304 have no
/// body; chunked (when last) wins; then Content-Length; otherwise the
/// response is delimited by the connection closing.
fn response_transfer_length(s: &mut Session) -> Result<(), ()> {
    let bodyless = matches!(s.txn.status, 204 | 304)
        || s.txn.meth == Some(http::Method::HEAD);
    let Session {
        ref mut rep,
        ref mut txn,
        ..
    } = *s;
    let input = rep.buf.input_contiguous();
    let msg = &mut txn.rsp;
    let idx = &txn.hdr_idx;

    if bodyless {
        msg.body_len = 0;
        msg.flags.insert(MsgFlags::XFER_LEN);
        return Ok(());
    }

    let mut saw_te = false;
    let mut chunked_last = false;
    let mut from = None;
    while let Some(ctx) = headers::find_header(b"transfer-encoding", input, idx, from) {
        for token in ctx.value(input).split(|&b| b == b',') {
            let token = trim(token);
            if token.is_empty() {
                continue;
            }
            saw_te = true;
            chunked_last = token.eq_ignore_ascii_case(b"chunked");
        }
        from = Some(ctx.resume(idx));
    }
    if saw_te {
        if chunked_last {
            msg.flags.insert(MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
        }
        // multiple codings with chunked not last: length is unknowable,
        // fall back to close-delimited (no XFER_LEN)
        return Ok(());
    }

    let mut len: Option<u64> = None;
    let mut from = None;
    while let Some(ctx) = headers::find_header(b"content-length", input, idx, from) {
        for token in ctx.value(input).split(|&b| b == b',') {
            let token = trim(token);
            if token.is_empty() {
                continue;
            }
            let v: u64 = std::str::from_utf8(token)
                .ok()
                .and_then(|t| t.parse().ok())
                .ok_or(())?;
            match len {
                Some(prev) if prev != v => return Err(()),
                _ => len = Some(v),
            }
        }
        from = Some(ctx.resume(idx));
    }
    if let Some(v) = len {
        msg.body_len = v;
        msg.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
    }
    // neither chunked nor length: close-delimited
    Ok(())
}

fn trim(token: &[u8]) -> &[u8] {
    let mut a = 0;
    let mut b = token.len();
    while a < b && (token[a] == b' ' || token[a] == b'\t') {
        a += 1;
    }
    while b > a && (token[b - 1] == b' ' || token[b - 1] == b'\t') {
        b -= 1;
    }
    &token[a..b]
}

/// Persistence capture: remember the server's cookie for this session.
pub fn process_store_rules(s: &mut Session) -> bool {
    {
        let input = s.rep.buf.input_contiguous();
        if let Some(ctx) = headers::find_header(b"set-cookie", input, &s.txn.hdr_idx, None) {
            s.txn.srv_cookie = Some(String::from_utf8_lossy(ctx.value(input)).into_owned());
        }
    }
    s.rep.analysers.remove(Analysers::RES_STORE_RULES);
    true
}

/// Backend response processing: compression eligibility and the
/// client-facing Connection header.
pub fn http_process_res(s: &mut Session) -> bool {
    maybe_start_compression(s);

    // the response's Connection header is a fresh rewrite, forget the
    // request-side bookkeeping
    s.txn
        .flags
        .remove(TxnFlags::CON_KAL_SET | TxnFlags::CON_CLO_SET);
    let want = want_res_header(s.txn.mode);
    {
        let Session {
            ref mut rep,
            ref mut txn,
            ..
        } = *s;
        if !set_connection_header(want, &mut rep.buf, &mut txn.hdr_idx, &mut txn.rsp, &mut txn.flags)
        {
            s.set_term_flags(ErrCause::Internal, FinState::H);
            s.reply_and_close(500, ErrStatus::ServerError500.message());
            return false;
        }
    }

    s.rep.analysers.remove(Analysers::RES_HTTP_PROCESS_BE);
    true
}

/// All the compression gates, then the header surgery: strip
/// Content-Length, ensure chunked, announce the coding.
fn maybe_start_compression(s: &mut Session) {
    let algo = match s.comp_candidate {
        Some(algo) => algo,
        None => return,
    };
    if s.txn.status != 200 {
        return;
    }
    let flags = s.txn.rsp.flags;
    if !flags.contains(MsgFlags::XFER_LEN) {
        return;
    }
    let has_body = flags.contains(MsgFlags::TE_CHNK) || s.txn.rsp.body_len > 0;
    if !has_body {
        return;
    }

    {
        let input = s.rep.buf.input_contiguous();
        let idx = &s.txn.hdr_idx;
        if headers::find_header(b"content-encoding", input, idx, None).is_some() {
            return;
        }
        if let Some(ctx) = headers::find_header(b"content-type", input, idx, None) {
            if ctx.value(input).starts_with(b"multipart") {
                return;
            }
            if let Some(ref cfg) = s.be.comp.as_ref().or(s.fe.comp.as_ref()) {
                if !cfg.types.is_empty() {
                    let value = ctx.value(input);
                    if !cfg.types.iter().any(|t| value.starts_with(t.as_bytes())) {
                        return;
                    }
                }
            }
        }
        if let Some(ctx) = headers::find_header(b"cache-control", input, idx, None) {
            let value = ctx.value(input).to_ascii_lowercase();
            if value
                .windows(b"no-transform".len())
                .any(|w| w == b"no-transform")
            {
                return;
            }
        }
    }

    trace!("compressing response with {}", algo.token());
    let Session {
        ref mut rep,
        ref mut txn,
        ..
    } = *s;

    // strip every Content-Length
    let mut from = None;
    loop {
        let input = rep.buf.input_contiguous().to_vec();
        let ctx = match headers::find_header(b"content-length", &input, &txn.hdr_idx, from) {
            Some(ctx) => ctx,
            None => break,
        };
        let (_, resume) = headers::remove_header(&ctx, &mut rep.buf, &mut txn.hdr_idx, &mut txn.rsp);
        from = Some(resume);
    }

    if !txn.rsp.flags.contains(MsgFlags::TE_CHNK) {
        if headers::append_header(
            b"Transfer-Encoding: chunked",
            &mut rep.buf,
            &mut txn.hdr_idx,
            &mut txn.rsp,
        )
        .is_none()
        {
            return;
        }
    }
    if algo != crate::compress::CompAlgo::Identity {
        let mut line = b"Content-Encoding: ".to_vec();
        line.extend_from_slice(algo.token().as_bytes());
        if headers::append_header(&line, &mut rep.buf, &mut txn.hdr_idx, &mut txn.rsp).is_none() {
            return;
        }
    }

    // the body analyser now re-frames through the compressor; the
    // original framing kind is still described by CNT_LEN/TE_CHNK
    s.comp = Some(CompState::new(algo));
}
