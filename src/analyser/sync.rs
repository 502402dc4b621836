//! Request/response state reconciliation.
//!
//! `http_sync_req_state` and `http_sync_res_state` iterate to a fixed
//! point and are the only code allowed to move a message out of `Done`.
//! The legal terminal couples: both tunnel (the session degenerates into
//! a byte relay), both closed (the session dies), or done/closed under
//! keep-alive or server-close (the transaction recycles in place).

use tracing::trace;

use crate::analyser::Analysers;
use crate::buffer::FORWARD_INFINITE;
use crate::channel::ChnFlags;
use crate::clock::Tick;
use crate::interface::{Endpoint, SiState, StreamInterface};
use crate::proto::h1::msg::MsgState;
use crate::proto::txn::ConnMode;
use crate::proxy::PxMode;
use crate::session::{SessFlags, Session};

/// One reconciliation step on the request message. Returns true when the
/// state moved.
pub fn http_sync_req_state(s: &mut Session) -> bool {
    let old = s.txn.req.msg_state;
    match old {
        MsgState::Done => match s.txn.mode {
            ConnMode::Tunnel => {
                s.txn.req.msg_state = MsgState::Tunnel;
            }
            ConnMode::Close | ConnMode::ServerClose => {
                // the server has everything; half-close toward it
                s.req.shutw_now();
                s.txn.req.msg_state = MsgState::Closing;
            }
            ConnMode::KeepAlive => {
                // hold the channel open for the next request
                s.req.dont_close();
            }
        },
        MsgState::Closing => {
            if s.req.flags.contains(ChnFlags::SHUTW) {
                s.txn.req.msg_state = MsgState::Closed;
            }
        }
        _ => {}
    }
    old != s.txn.req.msg_state
}

/// Same for the response message.
pub fn http_sync_res_state(s: &mut Session) -> bool {
    let old = s.txn.rsp.msg_state;
    match old {
        MsgState::Done => match s.txn.mode {
            ConnMode::Tunnel => {
                s.txn.rsp.msg_state = MsgState::Tunnel;
            }
            ConnMode::Close => {
                s.rep.shutw_now();
                s.txn.rsp.msg_state = MsgState::Closing;
            }
            ConnMode::KeepAlive | ConnMode::ServerClose => {
                // the client connection survives the server's close
                s.rep.dont_close();
            }
        },
        MsgState::Closing => {
            if s.rep.flags.contains(ChnFlags::SHUTW) {
                s.txn.rsp.msg_state = MsgState::Closed;
            }
        }
        _ => {}
    }
    old != s.txn.rsp.msg_state
}

/// Run both reconcilers to a fixed point, then settle the terminal
/// couple if one was reached.
pub fn http_resync_states(s: &mut Session) {
    loop {
        let a = http_sync_req_state(s);
        let b = http_sync_res_state(s);
        if !a && !b {
            break;
        }
    }

    let rq = s.txn.req.msg_state;
    let rs = s.txn.rsp.msg_state;

    if rq == MsgState::Tunnel || rs == MsgState::Tunnel {
        trace!("both sides switch to tunnel");
        s.txn.req.msg_state = MsgState::Tunnel;
        s.txn.rsp.msg_state = MsgState::Tunnel;
        s.req.analysers = Analysers::empty();
        s.rep.analysers = Analysers::empty();
        s.req.auto_close();
        s.rep.auto_close();
        s.req.forward(FORWARD_INFINITE);
        s.rep.forward(FORWARD_INFINITE);
        return;
    }

    if rq == MsgState::Closed && rs == MsgState::Closed {
        s.req.auto_close();
        s.rep.auto_close();
        return;
    }

    let recycle = match s.txn.mode {
        ConnMode::KeepAlive => rq == MsgState::Done && rs == MsgState::Done,
        ConnMode::ServerClose => {
            (rq == MsgState::Closed || rq == MsgState::Done) && rs == MsgState::Done
        }
        _ => false,
    };
    if recycle {
        end_txn_clean_session(s);
    }
}

/// Keep-alive / server-close cleanup: drop or keep the server side, then
/// recycle the transaction for the next request on the same client
/// connection.
fn end_txn_clean_session(s: &mut Session) {
    trace!("transaction complete, recycling session");

    let keep_server = s.txn.mode == ConnMode::KeepAlive
        && !s.rep.flags.contains(ChnFlags::SHUTR)
        && s.si[1].state == SiState::Est;
    if !keep_server {
        if let Endpoint::Conn(ref mut c) = s.si[1].endpoint {
            // dropping the stream closes the fd, which also deregisters it
            c.xprt_close();
        }
        if s.flags.contains(SessFlags::SRV_COUNTED) {
            if let Some(ref srv) = s.srv {
                srv.cur_sess.set(srv.cur_sess.get().saturating_sub(1));
            }
            s.flags.remove(SessFlags::SRV_COUNTED);
        }
        s.si[1] = StreamInterface::new(SiState::Ini);
    }

    // request channel: the write side pointed at the finished server
    // exchange, the read side keeps whatever the client pipelined
    s.req.flags.remove(
        ChnFlags::SHUTW
            | ChnFlags::SHUTW_NOW
            | ChnFlags::WRITE_ERROR
            | ChnFlags::WRITE_TIMEOUT
            | ChnFlags::WRITE_PARTIAL
            | ChnFlags::AUTO_CONNECT
            | ChnFlags::AUTO_CLOSE
            | ChnFlags::EXPECT_MORE
            | ChnFlags::DONT_READ
            | ChnFlags::ANA_TIMEOUT,
    );
    s.req.wex = Tick::ETERNITY;

    // response channel: wipe the producer side and trim anything unread,
    // it must not leak into the next response
    let stale = s.rep.buf.input_len();
    if stale > 0 {
        s.rep.buf.cut_input_front(stale);
    }
    s.rep.flags.remove(
        ChnFlags::SHUTR
            | ChnFlags::SHUTR_NOW
            | ChnFlags::READ_ERROR
            | ChnFlags::READ_TIMEOUT
            | ChnFlags::READ_PARTIAL
            | ChnFlags::READ_ATTACHED
            | ChnFlags::AUTO_CLOSE
            | ChnFlags::ANA_TIMEOUT,
    );
    s.rep.rex = Tick::ETERNITY;

    s.txn.reset();
    restart_transaction(s);
}

/// Re-arm the analyser pipelines for a fresh transaction on the same
/// session (used by the keep-alive cleanup and by kept-alive redirects).
pub fn restart_transaction(s: &mut Session) {
    s.be = s.fe.clone();
    s.flags.remove(
        SessFlags::BE_ASSIGNED | SessFlags::ASSIGNED | SessFlags::REDISP | SessFlags::TARPITTED,
    );
    if !s.flags.contains(SessFlags::SRV_COUNTED) {
        s.srv = None;
    }
    s.comp = None;
    s.comp_candidate = None;

    s.req.analyse_exp = Tick::ETERNITY;
    s.req.analysers = Analysers::empty();
    if s.fe.mode == PxMode::Http {
        if !s.fe.tcp_req_rules.is_empty() {
            s.req.analysers.insert(Analysers::REQ_INSPECT_FE);
        }
        s.req.analysers.insert(
            Analysers::REQ_WAIT_HTTP
                | Analysers::REQ_HTTP_PROCESS_FE
                | Analysers::REQ_SWITCHING_RULES,
        );
    }
    s.rep.analysers = Analysers::empty();
    if s.si[1].state == SiState::Est && s.fe.mode == PxMode::Http {
        // reused server connection: response analysers arm right away
        s.rep.analysers.insert(
            Analysers::RES_WAIT_HTTP
                | Analysers::RES_STORE_RULES
                | Analysers::RES_HTTP_PROCESS_BE
                | Analysers::RES_HTTP_XFER_BODY,
        );
    }
    let now = s.now;
    s.req.refresh_rex(now);
    if !s.req.is_empty() {
        // a pipelined request is already waiting
        s.req.flags.insert(ChnFlags::READ_PARTIAL);
    }
}
