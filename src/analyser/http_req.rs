//! Request-side HTTP analysers: wait for a complete head, run policy,
//! pick a backend, tarpit when told to.

use http::Method;
use tracing::{debug, trace};

use crate::analyser::mode::{
    adjust_req_mode, parse_connection_tokens, resolve_mode, set_connection_header,
    want_req_header,
};
use crate::analyser::rules::{self, Verdict};
use crate::analyser::Analysers;
use crate::channel::ChnFlags;
use crate::clock::Tick;
use crate::proto::h1::headers;
use crate::proto::h1::msg::{MsgFlags, MsgState};
use crate::proto::h1::parse_message_opts;
use crate::proto::txn::{ConnMode, TxnFlags};
use crate::proxy::{ip_in_prefix, PxOptions};
use crate::session::{ErrCause, FinState, SessFlags, Session};
use crate::status::ErrStatus;

/// Parse the request head; classify early failures; once complete, fix the
/// message up (HTTP/0.9 upgrade, transfer length, connection tokens) and
/// hand over to the processing stages.
pub fn http_wait_for_request(s: &mut Session) -> bool {
    let now = s.now;
    let accept_invalid = s.fe.options.contains(PxOptions::ACCEPT_INVALID);

    {
        let Session {
            ref mut req,
            ref mut txn,
            ..
        } = *s;
        if txn.req.msg_state.in_head()
            && !req.buf.input_is_contiguous()
            && req.buf.output_len() == 0
        {
            req.buf.slow_realign();
        }
        parse_message_opts(&mut req.buf, &mut txn.req, &mut txn.hdr_idx, accept_invalid);
    }

    if s.txn.req.is_error() {
        return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
    }

    if !s.txn.req.head_complete() {
        if s.req.is_full() {
            // head larger than the buffer can ever hold
            return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
        }
        if s.req.flags.contains(ChnFlags::READ_ERROR) {
            // client is gone; nobody left to answer
            s.txn.status = 400;
            s.fe
                .fe_counters
                .http_err
                .set(s.fe.fe_counters.http_err.get() + 1);
            s.set_term_flags(ErrCause::CliCl, FinState::R);
            s.silent_close();
            return false;
        }
        if s.req.flags.contains(ChnFlags::READ_TIMEOUT)
            || s.req.flags.contains(ChnFlags::ANA_TIMEOUT)
        {
            return client_fault(s, 408, ErrCause::CliTo, Some(ErrStatus::RequestTimeout408));
        }
        if s.req.flags.contains(ChnFlags::SHUTR) {
            return client_fault(s, 400, ErrCause::CliCl, Some(ErrStatus::BadRequest400));
        }
        if !s.req.analyse_exp.is_set() {
            s.req.analyse_exp = Tick::expire_in(now, s.fe.timeouts.http_request);
        }
        return false;
    }

    // HTTP/0.9: synthesize the version and re-parse so every consumer
    // sees a well-formed 1.0 request
    {
        let (_, u, v) = s.txn.req.sl.rq();
        if v.len == 0 {
            if u.len == 0 {
                return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
            }
            let Session {
                ref mut req,
                ref mut txn,
                ..
            } = *s;
            let at = txn.req.eol;
            if req.buf.replace(at, at, b" HTTP/1.0").is_none() {
                return server_fault_500(s);
            }
            txn.req.reinit(MsgState::RqBefore);
            txn.hdr_idx.reset();
            parse_message_opts(&mut req.buf, &mut txn.req, &mut txn.hdr_idx, accept_invalid);
            if !txn.req.head_complete() {
                return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
            }
        }
    }

    // start-line captures
    {
        let input = s.req.buf.input_contiguous();
        let (m, u, v) = s.txn.req.sl.rq();
        s.txn.meth = Method::from_bytes(m.slice(input)).ok();
        s.txn.uri = Some(String::from_utf8_lossy(u.slice(input)).into_owned());
        let ver = v.slice(input);
        if ver.starts_with(b"HTTP/1.") && ver >= &b"HTTP/1.1"[..] {
            s.txn.req.flags.insert(MsgFlags::VER_11);
        }
    }
    if s.txn.meth.is_none() {
        return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
    }

    s.fe
        .fe_counters
        .http_req
        .set(s.fe.fe_counters.http_req.get() + 1);

    // monitor-uri short-circuits everything
    let is_monitor =
        s.fe.monitor_uri.is_some() && s.txn.uri.as_deref() == s.fe.monitor_uri.as_deref();
    if is_monitor {
        trace!("monitor request");
        s.flags.insert(SessFlags::MONITOR);
        s.reply_and_close(200, ErrStatus::Ok200.message());
        return false;
    }

    // transfer length: chunked wins, else Content-Length, else no body
    match request_transfer_length(s) {
        Ok(()) => {}
        Err(()) => {
            return client_fault(s, 400, ErrCause::PrxCond, Some(ErrStatus::BadRequest400));
        }
    }

    // parse the Connection tokens once and settle the initial mode
    if !s.txn.flags.contains(TxnFlags::HDR_CONN_PRS) {
        let tokens = {
            let input = s.req.buf.input_contiguous();
            parse_connection_tokens(input, &s.txn.hdr_idx)
        };
        s.txn.flags.insert(tokens);
    }
    let cfg_mode = resolve_mode(s.fe.conn_mode, s.be.conn_mode);
    s.txn.mode = adjust_req_mode(cfg_mode, s.txn.req.flags, s.txn.flags);
    trace!(
        "request head complete: {:?} {:?} mode={:?}",
        s.txn.meth,
        s.txn.uri,
        s.txn.mode
    );

    // capture Accept-Encoding before the head moves on, compression
    // eligibility is decided when the response shows up
    if s.fe.options.contains(PxOptions::COMPRESSION)
        || s.be.options.contains(PxOptions::COMPRESSION)
    {
        let cfg = s.be.comp.as_ref().or(s.fe.comp.as_ref()).cloned();
        if let Some(cfg) = cfg {
            let input = s.req.buf.input_contiguous();
            if let Some(ctx) =
                headers::find_header(b"accept-encoding", input, &s.txn.hdr_idx, None)
            {
                s.comp_candidate = crate::compress::select_algo(ctx.value(input), &cfg);
            }
        }
    }

    s.req.analyse_exp = Tick::ETERNITY;
    s.req.flags.remove(ChnFlags::ANA_TIMEOUT);
    s.req.analysers.remove(Analysers::REQ_WAIT_HTTP);
    true
}

/// Classify a client-caused failure: count it, answer it, kill the session.
fn client_fault(
    s: &mut Session,
    status: u16,
    cause: ErrCause,
    reply: Option<ErrStatus>,
) -> bool {
    s.fe
        .fe_counters
        .http_err
        .set(s.fe.fe_counters.http_err.get() + 1);
    s.fe
        .fe_counters
        .failed_req
        .set(s.fe.fe_counters.failed_req.get() + 1);
    if let Some(ref stk) = s.stkctr[0] {
        stk.http_err_cnt.set(stk.http_err_cnt.get() + 1);
    }
    s.set_term_flags(cause, FinState::R);
    match reply {
        Some(msg) => s.reply_and_close(status, msg.message()),
        None => {
            s.txn.status = status;
            s.silent_close();
        }
    }
    false
}

fn server_fault_500(s: &mut Session) -> bool {
    s.set_term_flags(ErrCause::Internal, FinState::R);
    s.reply_and_close(500, ErrStatus::ServerError500.message());
    false
}

/// Decide how the request body ends. Duplicate, disagreeing
/// Content-Length values are an error; a Transfer-Encoding list where
/// chunked is not last is an error on the request side.
fn request_transfer_length(s: &mut Session) -> Result<(), ()> {
    let Session {
        ref mut req,
        ref mut txn,
        ..
    } = *s;
    let input = req.buf.input_contiguous();
    let msg = &mut txn.req;
    let idx = &txn.hdr_idx;

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
        if !chunked_last {
            return Err(());
        }
        msg.flags.insert(MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
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
    } else {
        msg.body_len = 0;
        msg.flags.insert(MsgFlags::XFER_LEN);
    }
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

pub fn http_process_req_fe(s: &mut Session) -> bool {
    let px = s.fe.clone();
    let verdict = rules::apply_http_req_rules(s, &px.http_req_rules);
    if !settle_verdict(s, verdict, true) {
        return false;
    }
    s.req.analysers.remove(Analysers::REQ_HTTP_PROCESS_FE);
    true
}

/// Choose the backend, rewire the analyser list for its stages.
pub fn process_switching_rules(s: &mut Session) -> bool {
    if !s.flags.contains(SessFlags::BE_ASSIGNED) {
        let src = s.client_addr();
        let meth = s.txn.meth.clone();
        let uri = s.txn.uri.clone();
        let mut target = None;
        for rule in &s.fe.switch_rules {
            if rule.cond.eval(src, meth.as_ref(), uri.as_deref()) {
                target = Some(rule.backend.clone());
                break;
            }
        }
        if target.is_none() {
            target = s.fe.default_backend.clone();
        }
        if let Some(be) = target {
            debug!("switching to backend {}", be.name);
            s.be = be;
        }
        s.flags.insert(SessFlags::BE_ASSIGNED);
        s.be
            .be_counters
            .cum_sess
            .set(s.be.be_counters.cum_sess.get() + 1);
    }

    if crate::proxy::PxMode::Http == s.be.mode {
        if !std::rc::Rc::ptr_eq(&s.fe, &s.be) && !s.be.tcp_req_rules.is_empty() {
            s.req.analysers.insert(Analysers::REQ_INSPECT_BE);
        }
        s.req.analysers.insert(Analysers::REQ_HTTP_PROCESS_BE);
    } else {
        s.req.auto_connect();
        s.req.forward(crate::buffer::FORWARD_INFINITE);
    }

    // the backend may harden the connection mode
    if s.txn.flags.contains(TxnFlags::HDR_CONN_PRS) {
        let cfg_mode = resolve_mode(s.fe.conn_mode, s.be.conn_mode);
        s.txn.mode = adjust_req_mode(cfg_mode, s.txn.req.flags, s.txn.flags);
    }

    s.req.analysers.remove(Analysers::REQ_SWITCHING_RULES);
    true
}

pub fn http_process_req_be(s: &mut Session) -> bool {
    if !std::rc::Rc::ptr_eq(&s.fe, &s.be) {
        let px = s.be.clone();
        let verdict = rules::apply_http_req_rules(s, &px.http_req_rules);
        if !settle_verdict(s, verdict, false) {
            return false;
        }
    }

    // rewrite the Connection header the server will see
    let pretend = s.be.options.contains(PxOptions::PRETEND_KAL);
    let want = want_req_header(s.txn.mode, pretend);
    {
        let Session {
            ref mut req,
            ref mut txn,
            ..
        } = *s;
        if !set_connection_header(want, &mut req.buf, &mut txn.hdr_idx, &mut txn.req, &mut txn.flags)
        {
            return server_fault_500(s);
        }
    }

    if !append_forwarded_headers(s) {
        return server_fault_500(s);
    }

    s.req.auto_connect();
    s.req.analysers.insert(Analysers::REQ_HTTP_XFER_BODY);
    s.req.analysers.remove(Analysers::REQ_HTTP_PROCESS_BE);
    true
}

/// X-Forwarded-For / X-Original-To, honoring `except` subnets and custom
/// names; the backend's configuration overrides the frontend's.
fn append_forwarded_headers(s: &mut Session) -> bool {
    let fwd = s.fe.options.contains(PxOptions::FWDFOR) || s.be.options.contains(PxOptions::FWDFOR);
    let orig =
        s.fe.options.contains(PxOptions::ORIGINALTO) || s.be.options.contains(PxOptions::ORIGINALTO);

    if fwd {
        if let Some(addr) = s.client_addr() {
            let except = s.be.except_fwd.or(s.fe.except_fwd);
            let skip = except
                .map(|(net, bits)| ip_in_prefix(addr.ip(), net, bits))
                .unwrap_or(false);
            if !skip {
                let name = s
                    .be
                    .fwdfor_hdr
                    .clone()
                    .or_else(|| s.fe.fwdfor_hdr.clone())
                    .unwrap_or_else(|| "X-Forwarded-For".to_owned());
                if !rules::add_req_header(s, &name, &addr.ip().to_string()) {
                    return false;
                }
            }
        }
    }
    if orig {
        if let Some(addr) = s.frontend_addr() {
            let except = s.be.except_orgto.or(s.fe.except_orgto);
            let skip = except
                .map(|(net, bits)| ip_in_prefix(addr.ip(), net, bits))
                .unwrap_or(false);
            if !skip {
                let name = s
                    .be
                    .orgto_hdr
                    .clone()
                    .or_else(|| s.fe.orgto_hdr.clone())
                    .unwrap_or_else(|| "X-Original-To".to_owned());
                if !rules::add_req_header(s, &name, &addr.ip().to_string()) {
                    return false;
                }
            }
        }
    }
    true
}

fn bump_denied(s: &Session, frontend: bool) {
    let counters = if frontend {
        &s.fe.fe_counters
    } else {
        &s.be.be_counters
    };
    counters.denied_req.set(counters.denied_req.get() + 1);
}

/// Turn a rule verdict into the session outcome. Returns true to continue
/// the pipeline.
fn settle_verdict(s: &mut Session, verdict: Verdict, frontend: bool) -> bool {
    match verdict {
        Verdict::Allow => true,
        Verdict::Deny => {
            bump_denied(s, frontend);
            s.set_term_flags(ErrCause::PrxCond, FinState::R);
            s.reply_and_close(403, ErrStatus::Forbidden403.message());
            false
        }
        Verdict::Tarpit => {
            bump_denied(s, frontend);
            s.flags.insert(SessFlags::TARPITTED);
            let tarpit = s.be.timeouts.tarpit;
            s.req.analysers = Analysers::REQ_HTTP_TARPIT;
            s.req.analyse_exp = match tarpit {
                Some(ms) => Tick::at(s.now + ms),
                // no timeout configured: run to expiration immediately
                None => Tick::at(s.now),
            };
            s.req.flags.insert(ChnFlags::DONT_READ);
            s.req.dont_connect();
            false
        }
        Verdict::Auth { realm, proxy } => {
            s.set_term_flags(ErrCause::PrxCond, FinState::R);
            let challenge = crate::status::auth_challenge(&realm, proxy);
            s.reply_and_close(if proxy { 407 } else { 401 }, &challenge);
            false
        }
        Verdict::Redirect(rule) => {
            apply_redirect(s, &rule);
            false
        }
        Verdict::RewriteFailed => {
            server_fault_500(s);
            false
        }
    }
}

/// Answer a redirect. When the mode allows keep-alive and the request's
/// length is known, the socket stays usable for the next request.
fn apply_redirect(s: &mut Session, rule: &crate::proxy::Redirect) {
    let location = rules::redirect_location(&rule.kind, s.txn.uri.as_deref());
    let keep_alive = s.txn.mode == ConnMode::KeepAlive
        && s.txn.req.flags.contains(MsgFlags::XFER_LEN)
        && !s.txn.req.flags.contains(MsgFlags::TE_CHNK);

    if keep_alive {
        // the whole request must be buffered so it can be dropped
        let total = s.txn.req.sov as u64 + s.txn.req.body_len;
        if (s.req.buf.input_len() as u64) >= total {
            trace!("redirect, keeping the connection alive");
            s.txn.status = rule.code;
            let msg = crate::status::redirect(
                rule.code,
                &location,
                rule.set_cookie.as_deref(),
                true,
            );
            s.req.buf.cut_input_front(total as usize);
            if !s.rep.buf.put_output(&msg) {
                s.set_term_flags(ErrCause::Internal, FinState::R);
                s.reply_and_close(500, ErrStatus::ServerError500.message());
                return;
            }
            s.rep.refresh_wex(s.now);
            crate::analyser::sync::restart_transaction(s);
            return;
        }
    }

    s.set_term_flags(ErrCause::PrxCond, FinState::R);
    s.txn.status = rule.code;
    let msg = crate::status::redirect(rule.code, &location, rule.set_cookie.as_deref(), false);
    s.reply_and_close(rule.code, &msg);
}

/// Hold a tarpitted request until its deadline, then answer 500.
pub fn http_process_tarpit(s: &mut Session) -> bool {
    if !s.req.flags.contains(ChnFlags::ANA_TIMEOUT) && !s.req.analyse_exp.is_expired(s.now) {
        // swallow whatever the client keeps sending
        let drop = s.req.buf.input_len();
        if drop > 0 {
            s.req.buf.cut_input_front(drop);
        }
        return false;
    }
    trace!("tarpit expired, answering 500");
    s.set_term_flags(ErrCause::PrxCond, FinState::T);
    s.reply_and_close(500, ErrStatus::ServerError500.message());
    false
}

/// Optional stage: hold the request until enough of the body arrived for
/// content inspection or url_param balancing.
pub fn http_wait_for_request_body(s: &mut Session) -> bool {
    let msg = &s.txn.req;
    if msg.flags.contains(MsgFlags::CNT_LEN) {
        let want = (msg.sov as u64 + msg.body_len).min(s.req.buf.size() as u64);
        if (s.req.buf.input_len() as u64) < want
            && !s
                .req
                .flags
                .intersects(ChnFlags::SHUTR | ChnFlags::READ_ERROR | ChnFlags::ANA_TIMEOUT)
            && !s.req.is_full()
        {
            return false;
        }
    }
    s.req.analysers.remove(Analysers::REQ_HTTP_BODY);
    true
}
