//! TCP content inspection.
//!
//! Runs the frontend's (then backend's) tcp-request rules against the
//! request channel, and the backend's tcp-response rules against the
//! response channel. A reject erases the channel and kills the session
//! with no response at all; that is the point of rejecting at this level.

use tracing::trace;

use crate::analyser::Analysers;
use crate::channel::ChnFlags;
use crate::clock::Tick;
use crate::proxy::TcpRule;
use crate::session::{ErrCause, FinState, Session};

pub fn tcp_inspect_request_fe(s: &mut Session) -> bool {
    let px = s.fe.clone();
    inspect_request(s, &px.tcp_req_rules, px.timeouts.inspect_delay, Analysers::REQ_INSPECT_FE)
}

pub fn tcp_inspect_request_be(s: &mut Session) -> bool {
    let px = s.be.clone();
    inspect_request(s, &px.tcp_req_rules, px.timeouts.inspect_delay, Analysers::REQ_INSPECT_BE)
}

fn inspect_request(
    s: &mut Session,
    rules: &[TcpRule],
    delay: Option<crate::clock::Ms>,
    bit: Analysers,
) -> bool {
    // an inspect delay may hold the request while rules wait for data;
    // a timeout, a shutdown or a full buffer ends the wait
    if delay.is_some()
        && !s.req.flags.intersects(
            ChnFlags::ANA_TIMEOUT | ChnFlags::SHUTR | ChnFlags::READ_ERROR,
        )
        && !s.req.is_full()
        && s.req.is_empty()
    {
        if !s.req.analyse_exp.is_set() {
            s.req.analyse_exp = Tick::expire_in(s.now, delay);
        }
        return false;
    }

    let src = s.client_addr();
    for rule in rules {
        let hit = rule
            .cond
            .as_ref()
            .map(|c| c.eval(src, None, None))
            .unwrap_or(true);
        if !hit {
            continue;
        }
        if rule.accept {
            break;
        }
        trace!("tcp-request rule rejected connection");
        s.fe
            .fe_counters
            .denied_req
            .set(s.fe.fe_counters.denied_req.get() + 1);
        s.set_term_flags(ErrCause::PrxCond, FinState::R);
        s.silent_close();
        return false;
    }

    s.req.analyse_exp = Tick::ETERNITY;
    s.req.flags.remove(ChnFlags::ANA_TIMEOUT);
    s.req.analysers.remove(bit);
    true
}

pub fn tcp_inspect_response(s: &mut Session) -> bool {
    let px = s.be.clone();
    let src = s.client_addr();
    for rule in &px.tcp_rsp_rules {
        let hit = rule
            .cond
            .as_ref()
            .map(|c| c.eval(src, None, None))
            .unwrap_or(true);
        if !hit {
            continue;
        }
        if rule.accept {
            break;
        }
        trace!("tcp-response rule rejected server response");
        s.set_term_flags(ErrCause::PrxCond, FinState::D);
        s.silent_close();
        return false;
    }
    s.rep.analysers.remove(Analysers::RES_INSPECT);
    true
}
