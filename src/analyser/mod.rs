//! The analyser pipeline.
//!
//! Each channel carries an ordered bitset of stream stages. On every
//! wakeup the session engine walks the set from lowest bit to highest;
//! an analyser either completes (clears its bit, next one runs in the
//! same pass) or blocks (the walk stops and resumes on the next event).
//! An analyser that fails erases the channel, synthesizes a response and
//! clears both bitsets; the session then follows its normal close path.

pub mod body;
pub mod http_req;
pub mod http_res;
pub mod mode;
pub mod rules;
pub mod sync;
pub mod tcp;

use bitflags::bitflags;

use crate::session::Session;

bitflags! {
    /// Analyser bits, in execution order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Analysers: u32 {
        // request channel
        const REQ_INSPECT_FE      = 0x0000_0001;
        const REQ_WAIT_HTTP       = 0x0000_0002;
        const REQ_HTTP_PROCESS_FE = 0x0000_0004;
        const REQ_SWITCHING_RULES = 0x0000_0008;
        const REQ_INSPECT_BE      = 0x0000_0010;
        const REQ_HTTP_PROCESS_BE = 0x0000_0020;
        const REQ_HTTP_TARPIT     = 0x0000_0040;
        const REQ_HTTP_BODY       = 0x0000_0080;
        const REQ_HTTP_XFER_BODY  = 0x0000_0100;
        // response channel
        const RES_INSPECT         = 0x0001_0000;
        const RES_WAIT_HTTP       = 0x0002_0000;
        const RES_STORE_RULES     = 0x0004_0000;
        const RES_HTTP_PROCESS_BE = 0x0008_0000;
        const RES_HTTP_XFER_BODY  = 0x0010_0000;
    }
}

/// Walk the request channel's analysers until one blocks or the set is
/// exhausted. Re-walks when an analyser rewired the set (switching rules
/// and tarpit do).
pub fn run_request_analysers(s: &mut Session) {
    let mut max_loops = 8;
    loop {
        let before = s.req.analysers;
        if before.is_empty() || max_loops == 0 {
            return;
        }
        max_loops -= 1;

        macro_rules! stage {
            ($bit:expr, $f:expr) => {
                if s.req.analysers.contains($bit) {
                    if !$f {
                        return;
                    }
                }
            };
        }

        stage!(Analysers::REQ_INSPECT_FE, tcp::tcp_inspect_request_fe(s));
        stage!(Analysers::REQ_WAIT_HTTP, http_req::http_wait_for_request(s));
        stage!(
            Analysers::REQ_HTTP_PROCESS_FE,
            http_req::http_process_req_fe(s)
        );
        stage!(
            Analysers::REQ_SWITCHING_RULES,
            http_req::process_switching_rules(s)
        );
        stage!(Analysers::REQ_INSPECT_BE, tcp::tcp_inspect_request_be(s));
        stage!(
            Analysers::REQ_HTTP_PROCESS_BE,
            http_req::http_process_req_be(s)
        );
        stage!(Analysers::REQ_HTTP_TARPIT, http_req::http_process_tarpit(s));
        stage!(
            Analysers::REQ_HTTP_BODY,
            http_req::http_wait_for_request_body(s)
        );
        stage!(
            Analysers::REQ_HTTP_XFER_BODY,
            body::http_request_forward_body(s)
        );

        if s.req.analysers == before {
            return;
        }
    }
}

/// Same walk for the response channel.
pub fn run_response_analysers(s: &mut Session) {
    let mut max_loops = 8;
    loop {
        let before = s.rep.analysers;
        if before.is_empty() || max_loops == 0 {
            return;
        }
        max_loops -= 1;

        macro_rules! stage {
            ($bit:expr, $f:expr) => {
                if s.rep.analysers.contains($bit) {
                    if !$f {
                        return;
                    }
                }
            };
        }

        stage!(Analysers::RES_INSPECT, tcp::tcp_inspect_response(s));
        stage!(Analysers::RES_WAIT_HTTP, http_res::http_wait_for_response(s));
        stage!(Analysers::RES_STORE_RULES, http_res::process_store_rules(s));
        stage!(
            Analysers::RES_HTTP_PROCESS_BE,
            http_res::http_process_res(s)
        );
        stage!(
            Analysers::RES_HTTP_XFER_BODY,
            body::http_response_forward_body(s)
        );

        if s.rep.analysers == before {
            return;
        }
    }
}
