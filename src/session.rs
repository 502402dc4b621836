//! The session: one client, two stream interfaces, two channels, one HTTP
//! transaction, and the wakeup engine that drives them.
//!
//! A wakeup runs a fixed sequence: snap polling flags and finish pending
//! handshakes, translate deadlines and readiness into channel flags, pull
//! bytes in (request side first), walk the analyser pipelines until they
//! block, reconcile the two HTTP message states, push bytes out, update
//! both interfaces and finally reconcile polling. Every suspension leaves
//! the whole state in the session; nothing lives on the stack between
//! wakeups.

use std::rc::Rc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::analyser::{self, Analysers};
use crate::applet::AppletStatus;
use crate::buffer::FORWARD_INFINITE;
use crate::channel::{Channel, ChnFlags};
use crate::clock::{Ms, Tick};
use crate::connection::proxy_proto;
use crate::connection::{ConnFlags, Connection, Ctrl, Poller, Target, Xprt};
use crate::interface::{
    si_chk_snd, si_conn_recv, si_conn_send, si_read0, si_retnclose, si_shutr, si_shutw, si_update,
    Endpoint, SiErr, SiFlags, SiState, StreamInterface,
};
use crate::proto::txn::Transaction;
use crate::proxy::{Listener, Proxy, PxMode, Server, ServerAddr, StickEntry};
use crate::status::ErrStatus;

/// Default per-direction buffer size.
pub const BUFSIZE: usize = 8192;

/// Stick-table counter slots per session.
pub const MAX_SESS_STKCTR: usize = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessFlags: u32 {
        /// A server has been assigned for this transaction.
        const ASSIGNED    = 0x0001;
        /// The backend has been bound (switching rules ran).
        const BE_ASSIGNED = 0x0002;
        /// This is a monitor request; do not account errors.
        const MONITOR     = 0x0004;
        /// The session was redispatched to another server.
        const REDISP      = 0x0008;
        /// The request is being tarpitted.
        const TARPITTED   = 0x0010;
        /// The assigned server's connection count was incremented.
        const SRV_COUNTED = 0x0020;
    }
}

/// First failure cause, for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCause {
    None,
    /// The client closed early.
    CliCl,
    /// The client side timed out.
    CliTo,
    /// The server closed early.
    SrvCl,
    /// The server side timed out.
    SrvTo,
    /// A proxy rule denied or aborted the session.
    PrxCond,
    /// Lack of resources (no server, no memory).
    Resource,
    Internal,
}

/// Session phase when the failure struck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinState {
    None,
    /// Waiting for a complete request.
    R,
    /// Waiting for the connection to establish.
    C,
    /// Waiting for response headers.
    H,
    /// Transferring data.
    D,
    /// Transfer finished, lingering on last ACKs.
    L,
    /// Waiting in the server queue.
    Q,
    /// Tarpitted.
    T,
}

/// What a wakeup reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Still alive; wake again at the returned deadline.
    Running(Tick),
    /// Fully closed; release the session.
    Closed,
}

pub struct Session {
    pub fe: Rc<Proxy>,
    pub be: Rc<Proxy>,
    pub listener: Option<Rc<Listener>>,
    pub flags: SessFlags,
    pub err_cause: ErrCause,
    pub fin_state: FinState,
    /// `si[0]` faces the client, `si[1]` faces the server or applet.
    pub si: [StreamInterface; 2],
    /// Client-to-server channel.
    pub req: Channel,
    /// Server-to-client channel.
    pub rep: Channel,
    pub txn: Transaction,
    pub srv: Option<Rc<Server>>,
    pub stkctr: [Option<Rc<StickEntry>>; MAX_SESS_STKCTR],
    pub comp: Option<crate::compress::CompState>,
    /// Algorithm negotiated from the request, pending response checks.
    pub comp_candidate: Option<crate::compress::CompAlgo>,
    pub unique_id: Option<String>,
    pub now: Ms,
    /// Latched once the session fully closed and was accounted for.
    done: bool,
}

impl Session {
    /// Frontend accept: bind a fresh client connection to a new session.
    pub fn accept(
        fe: Rc<Proxy>,
        listener: Option<Rc<Listener>>,
        mut conn: Connection,
        now: Ms,
    ) -> Session {
        fe.fe_counters.cum_conn.set(fe.fe_counters.cum_conn.get() + 1);
        fe.fe_counters.cum_sess.set(fe.fe_counters.cum_sess.get() + 1);
        if let Some(ref l) = listener {
            l.cur_conn.set(l.cur_conn.get() + 1);
        }

        conn.flags.insert(ConnFlags::CONNECTED | ConnFlags::WAKE_DATA);
        conn.data_want_recv();
        if listener.as_ref().map(|l| l.accept_proxy).unwrap_or(false) {
            conn.flags.insert(ConnFlags::ACCEPT_PROXY);
            conn.sock_want_recv();
        }

        let mut si0 = StreamInterface::new(SiState::Est);
        si0.endpoint = Endpoint::Conn(conn);
        let si1 = StreamInterface::new(SiState::Ini);

        let mut req = Channel::new(BUFSIZE);
        let mut rep = Channel::new(BUFSIZE);
        req.rto = fe.timeouts.client;
        rep.wto = fe.timeouts.client;
        req.refresh_rex(now);

        match fe.mode {
            PxMode::Http => {
                if !fe.tcp_req_rules.is_empty() {
                    req.analysers.insert(Analysers::REQ_INSPECT_FE);
                }
                req.analysers.insert(
                    Analysers::REQ_WAIT_HTTP
                        | Analysers::REQ_HTTP_PROCESS_FE
                        | Analysers::REQ_SWITCHING_RULES,
                );
            }
            PxMode::Tcp => {
                if !fe.tcp_req_rules.is_empty() {
                    req.analysers.insert(Analysers::REQ_INSPECT_FE);
                }
                req.analysers.insert(Analysers::REQ_SWITCHING_RULES);
                req.auto_connect();
                req.forward(FORWARD_INFINITE);
            }
        }

        let be = fe.clone();
        Session {
            fe,
            be,
            listener,
            flags: SessFlags::empty(),
            err_cause: ErrCause::None,
            fin_state: FinState::None,
            si: [si0, si1],
            req,
            rep,
            txn: Transaction::new(),
            srv: None,
            stkctr: [None, None, None],
            comp: None,
            comp_candidate: None,
            unique_id: None,
            now,
            done: false,
        }
    }

    pub fn client_addr(&self) -> Option<std::net::SocketAddr> {
        self.si[0].conn().and_then(|c| c.addr_from)
    }

    pub fn frontend_addr(&self) -> Option<std::net::SocketAddr> {
        self.si[0].conn().and_then(|c| c.addr_to)
    }

    /// Record the first failure; later ones never overwrite it.
    pub fn set_term_flags(&mut self, cause: ErrCause, fin: FinState) {
        if self.err_cause == ErrCause::None {
            self.err_cause = cause;
            self.fin_state = fin;
        }
    }

    /// Abort everything and schedule a synthesized response to the client.
    pub(crate) fn reply_and_close(&mut self, status: u16, msg: &[u8]) {
        trace!("reply_and_close status={}", status);
        self.txn.status = status;
        let now = self.now;
        si_retnclose(&mut self.req, &mut self.rep, now, msg);
    }

    /// Abort everything without a response (the client is gone or hostile).
    pub(crate) fn silent_close(&mut self) {
        self.req.analysers = Analysers::empty();
        self.rep.analysers = Analysers::empty();
        self.req.erase();
        self.rep.erase();
        self.req.flags.insert(ChnFlags::SHUTR_NOW | ChnFlags::SHUTW_NOW);
        self.rep.flags.insert(ChnFlags::SHUTR_NOW | ChnFlags::SHUTW_NOW);
    }

    // ---- wakeup engine ----

    pub fn process(&mut self, now: Ms, poller: &mut dyn Poller) -> SessionStatus {
        if self.done {
            return SessionStatus::Closed;
        }
        self.now = now;

        self.conn_entry(0, poller);
        self.conn_entry(1, poller);

        self.req.check_timeouts(now);
        self.rep.check_timeouts(now);
        for si in self.si.iter_mut() {
            if si.exp.is_expired(now) {
                si.flags.insert(SiFlags::EXP);
            }
        }
        self.apply_channel_timeouts();

        // read before write so a pipelined request cannot be starved by
        // its own response
        self.recv_phase();
        self.report_conn_errors();

        let mut loops = 10u32;
        loop {
            if loops == 0 {
                break;
            }
            loops -= 1;
            let before = self.resync_token();

            self.backend_step(poller);
            self.flow_step();
            analyser::run_request_analysers(self);
            self.applet_step();
            analyser::run_response_analysers(self);
            if self.fe.mode == PxMode::Http {
                analyser::sync::http_resync_states(self);
            }
            self.flow_step();

            if self.resync_token() == before {
                break;
            }
        }

        self.send_phase();
        self.flow_step();
        self.close_disconnected(poller);

        {
            let Session {
                ref mut si,
                ref mut req,
                ref mut rep,
                ..
            } = *self;
            let [si0, si1] = si;
            si_update(si0, req, rep);
            si_update(si1, rep, req);
        }
        for si in self.si.iter_mut() {
            if let Endpoint::Conn(ref mut c) = si.endpoint {
                c.cond_update_polling(poller);
            }
        }

        if self.si[0].state == SiState::Clo && self.si[1].state == SiState::Clo {
            self.finalize();
            self.done = true;
            return SessionStatus::Closed;
        }

        let mut expire = self.req.expiry().first(self.rep.expiry());
        expire = expire.first(self.si[0].exp).first(self.si[1].exp);
        SessionStatus::Running(expire)
    }

    /// Per-wakeup snapshot to detect when the resync loop went quiet.
    fn resync_token(&self) -> (ChnFlags, ChnFlags, SiState, SiState, Analysers, Analysers) {
        (
            self.req.flags,
            self.rep.flags,
            self.si[0].state,
            self.si[1].state,
            self.req.analysers,
            self.rep.analysers,
        )
    }

    fn conn_entry(&mut self, side: usize, poller: &mut dyn Poller) {
        let si = &mut self.si[side];
        let conn = match si.endpoint {
            Endpoint::Conn(ref mut c) => c,
            _ => return,
        };
        conn.refresh_polling_flags(poller);

        // pending L4 connect?
        #[cfg(unix)]
        if conn.flags.contains(ConnFlags::WAIT_L4_CONN) {
            if let Some(Xprt::Raw(ref raw)) = conn.xprt {
                match crate::connection::tcp::connect_probe(raw.stream()) {
                    Ok(true) => {
                        conn.flags.remove(ConnFlags::WAIT_L4_CONN);
                        conn.flags.insert(ConnFlags::CONNECTED);
                        conn.sock_stop_send();
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!("connect probe failed: {}", err);
                        conn.set_error();
                    }
                }
            }
        }

        // handshakes, in wire order: PROXY line in, PROXY line out
        if conn.flags.contains(ConnFlags::ACCEPT_PROXY) && !conn.has_error() {
            proxy_proto::recv_proxy(conn);
        }
        if conn.flags.contains(ConnFlags::SI_SEND_PROXY)
            && conn.flags.contains(ConnFlags::CONNECTED)
            && !conn.has_error()
        {
            let mut ofs = si.send_proxy_ofs.unwrap_or(0);
            let st = proxy_proto::send_proxy(conn, &mut ofs);
            si.send_proxy_ofs = Some(ofs);
            if st == proxy_proto::HsStatus::Done {
                si.send_proxy_ofs = None;
            }
        }
    }

    /// Turn expired channel deadlines into half-closes; the analysers see
    /// the timeout flags and translate them into user-visible errors.
    fn apply_channel_timeouts(&mut self) {
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [si0, si1] = si;
        if req.flags.contains(ChnFlags::READ_TIMEOUT) && !req.flags.contains(ChnFlags::SHUTR) {
            si_shutr(si0, req, rep);
        }
        if req.flags.contains(ChnFlags::WRITE_TIMEOUT) && !req.flags.contains(ChnFlags::SHUTW) {
            si_shutw(si1, rep, req);
        }
        if rep.flags.contains(ChnFlags::READ_TIMEOUT) && !rep.flags.contains(ChnFlags::SHUTR) {
            si_shutr(si1, rep, req);
        }
        if rep.flags.contains(ChnFlags::WRITE_TIMEOUT) && !rep.flags.contains(ChnFlags::SHUTW) {
            si_shutw(si0, req, rep);
        }
    }

    fn recv_phase(&mut self) {
        let now = self.now;
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [si0, si1] = si;
        let hs0 = si0
            .conn()
            .map(|c| c.flags.polling_driven_by_sock())
            .unwrap_or(false);
        if si0.state == SiState::Est && !hs0 {
            let rpt = si_conn_recv(si0, req, now);
            if rpt.read0 {
                si_read0(si0, req, rep);
            }
        }
        let hs1 = si1
            .conn()
            .map(|c| c.flags.polling_driven_by_sock())
            .unwrap_or(false);
        if si1.state == SiState::Est && !hs1 {
            let rpt = si_conn_recv(si1, rep, now);
            if rpt.read0 {
                si_read0(si1, rep, req);
            }
        }
    }

    fn send_phase(&mut self) {
        let now = self.now;
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [si0, si1] = si;
        let hs1 = si1
            .conn()
            .map(|c| c.flags.polling_driven_by_sock())
            .unwrap_or(false);
        if si1.state == SiState::Est && !hs1 {
            si_conn_send(si1, req, now);
        }
        let hs0 = si0
            .conn()
            .map(|c| c.flags.polling_driven_by_sock())
            .unwrap_or(false);
        if si0.state == SiState::Est && !hs0 {
            si_conn_send(si0, rep, now);
        }
    }

    fn report_conn_errors(&mut self) {
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [si0, si1] = si;
        if si0.conn().map(|c| c.has_error()).unwrap_or(false)
            && !si0.flags.contains(SiFlags::ERR)
        {
            si0.report_error();
            req.flags.insert(ChnFlags::READ_ERROR);
            rep.flags.insert(ChnFlags::WRITE_ERROR);
            if si0.state == SiState::Est {
                si_shutr(si0, req, rep);
                si_shutw(si0, req, rep);
                si0.state = SiState::Dis;
            }
        }
        if si1.conn().map(|c| c.has_error()).unwrap_or(false)
            && !si1.flags.contains(SiFlags::ERR)
        {
            si1.report_error();
            rep.flags.insert(ChnFlags::READ_ERROR);
            req.flags.insert(ChnFlags::WRITE_ERROR);
            if si1.state == SiState::Est {
                si_shutr(si1, rep, req);
                si_shutw(si1, rep, req);
                si1.state = SiState::Dis;
            }
        }
    }

    /// Half-close choreography between the channels and their endpoints.
    fn flow_step(&mut self) {
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [si0, si1] = si;

        // request channel: finish a pending write shutdown once drained
        if req.flags.contains(ChnFlags::SHUTW_NOW)
            && !req.flags.contains(ChnFlags::SHUTW)
            && req.buf.output_len() == 0
        {
            si_shutw(si1, rep, req);
        }
        if req.flags.contains(ChnFlags::SHUTR)
            && req.flags.contains(ChnFlags::AUTO_CLOSE)
            && !req
                .flags
                .intersects(ChnFlags::SHUTW | ChnFlags::SHUTW_NOW)
        {
            req.shutw_now();
            if req.buf.output_len() == 0 {
                si_shutw(si1, rep, req);
            }
        }
        if req.flags.contains(ChnFlags::SHUTR_NOW) && !req.flags.contains(ChnFlags::SHUTR) {
            si_shutr(si0, req, rep);
        }

        // response channel, mirrored
        if rep.flags.contains(ChnFlags::SHUTW_NOW)
            && !rep.flags.contains(ChnFlags::SHUTW)
            && rep.buf.output_len() == 0
        {
            si_shutw(si0, req, rep);
        }
        if rep.flags.contains(ChnFlags::SHUTR)
            && rep.flags.contains(ChnFlags::AUTO_CLOSE)
            && !rep
                .flags
                .intersects(ChnFlags::SHUTW | ChnFlags::SHUTW_NOW)
        {
            rep.shutw_now();
            if rep.buf.output_len() == 0 {
                si_shutw(si0, req, rep);
            }
        }
        if rep.flags.contains(ChnFlags::SHUTR_NOW) && !rep.flags.contains(ChnFlags::SHUTR) {
            si_shutr(si1, rep, req);
        }

        // a closed client with an unstarted server side ends the session
        if si0.state >= SiState::Dis && si1.state == SiState::Ini {
            si1.state = SiState::Clo;
        }
        // both directions dead with no endpoint work left
        if req.flags.contains(ChnFlags::SHUTW)
            && rep.flags.contains(ChnFlags::SHUTW)
            && si1.state < SiState::Est
            && si1.state != SiState::Ini
        {
            si1.state = SiState::Clo;
        }
    }

    // ---- server-side state machine ----

    fn backend_step(&mut self, poller: &mut dyn Poller) {
        let _ = poller;
        if self.si[1].state == SiState::Ini {
            let wants_connect = self.req.flags.contains(ChnFlags::AUTO_CONNECT)
                && (self.req.buf.output_len() > 0
                    || self.req.buf.to_forward() > 0
                    || !self.req.is_empty()
                    || self.req.flags.contains(ChnFlags::SHUTR));
            if !wants_connect {
                return;
            }
            self.si[1].state = SiState::Req;
            self.si[1].conn_retries = self.be.retries;
        }

        match self.si[1].state {
            SiState::Req => self.assign_server(),
            SiState::Que => self.queue_step(),
            SiState::Tar => {
                if self.si[1].flags.contains(SiFlags::EXP) {
                    self.si[1].flags.remove(SiFlags::EXP);
                    self.si[1].exp = Tick::ETERNITY;
                    self.si[1].state = if self.flags.contains(SessFlags::ASSIGNED) {
                        SiState::Ass
                    } else {
                        SiState::Req
                    };
                    self.backend_step(poller);
                }
            }
            SiState::Ass => self.start_connect(),
            SiState::Con => self.connect_step(),
            SiState::Cer => self.retry_step(),
            _ => {}
        }
    }

    fn assign_server(&mut self) {
        if self.be.applet.is_some() {
            let factory = self.be.applet.clone().unwrap();
            self.si[1].endpoint = Endpoint::Applet(factory());
            self.si[1].state = SiState::Est;
            self.establish();
            return;
        }
        let srv = match self.be.pick_server() {
            Some(srv) => srv,
            None => {
                debug!("no server available in backend {}", self.be.name);
                self.si[1].err_type = SiErr::ConnRes;
                self.si[1].state = SiState::Clo;
                self.set_term_flags(ErrCause::SrvCl, FinState::C);
                self.be.be_counters.failed_conns.set(
                    self.be.be_counters.failed_conns.get() + 1,
                );
                self.reply_and_close(503, ErrStatus::Unavailable503.message());
                return;
            }
        };
        if srv.is_full() {
            trace!("server {} full, queueing", srv.name);
            srv.queued.set(srv.queued.get() + 1);
            self.srv = Some(srv);
            self.si[1].state = SiState::Que;
            self.si[1].exp = Tick::expire_in(self.now, self.be.timeouts.queue);
            return;
        }
        self.srv = Some(srv);
        self.flags.insert(SessFlags::ASSIGNED);
        self.si[1].state = SiState::Ass;
        self.start_connect();
    }

    fn queue_step(&mut self) {
        let srv = self.srv.clone().expect("queued without a server");
        if !srv.is_full() && srv.usable() {
            srv.queued.set(srv.queued.get().saturating_sub(1));
            self.flags.insert(SessFlags::ASSIGNED);
            self.si[1].state = SiState::Ass;
            self.start_connect();
            return;
        }
        if self.si[1].flags.contains(SiFlags::EXP) {
            // queued too long: cool down, then retry (or give up)
            self.si[1].flags.remove(SiFlags::EXP);
            srv.queued.set(srv.queued.get().saturating_sub(1));
            self.srv = None;
            if self.si[1].conn_retries == 0 {
                self.si[1].err_type = SiErr::QueueTo;
                self.si[1].state = SiState::Clo;
                self.set_term_flags(ErrCause::SrvTo, FinState::Q);
                self.reply_and_close(503, ErrStatus::Unavailable503.message());
                return;
            }
            self.si[1].conn_retries -= 1;
            self.si[1].state = SiState::Tar;
            self.si[1].exp = Tick::at(self.now + 1000);
        }
    }

    fn start_connect(&mut self) {
        let srv = match self.srv.clone() {
            Some(srv) => srv,
            None => {
                self.si[1].state = SiState::Req;
                return;
            }
        };
        let mut conn = Connection::new(Target::Server(srv.clone()));
        match srv.addr {
            ServerAddr::Mem(ref gw) => {
                conn.prepare(Some(Ctrl::Mem), Xprt::Mem(gw.connect()), None);
                conn.flags.insert(ConnFlags::CONNECTED);
            }
            #[cfg(unix)]
            ServerAddr::Tcp(addr) => {
                use std::os::unix::io::AsRawFd;
                let nodelay = self.be.options.contains(crate::proxy::PxOptions::TCP_NODELAY)
                    || self.be.mode == PxMode::Http;
                match crate::connection::tcp::connect_server(addr, None, nodelay) {
                    Ok((stream, established)) => {
                        let fd = crate::connection::Fd(stream.as_raw_fd());
                        conn.prepare(
                            Some(if addr.is_ipv4() { Ctrl::Tcp4 } else { Ctrl::Tcp6 }),
                            Xprt::Raw(crate::connection::transport::RawXprt::new(stream)),
                            Some(fd),
                        );
                        if established {
                            conn.flags.insert(ConnFlags::CONNECTED);
                        } else {
                            conn.flags.insert(ConnFlags::WAIT_L4_CONN);
                            conn.sock_want_send();
                        }
                    }
                    Err(err) => {
                        debug!("connect to {} failed: {}", srv.name, err);
                        srv.failed_conns.set(srv.failed_conns.get() + 1);
                        self.si[1].err_type = SiErr::ConnErr;
                        self.si[1].state = SiState::Cer;
                        return;
                    }
                }
            }
            #[cfg(not(unix))]
            ServerAddr::Tcp(_) => {
                self.si[1].err_type = SiErr::ConnErr;
                self.si[1].state = SiState::Cer;
                return;
            }
        }
        conn.flags.insert(ConnFlags::WAKE_DATA);
        if srv.send_proxy {
            conn.flags.insert(ConnFlags::SI_SEND_PROXY);
            conn.addr_from = self.client_addr();
            conn.addr_to = self.frontend_addr();
            self.si[1].send_proxy_ofs = Some(0);
        }
        srv.cur_sess.set(srv.cur_sess.get() + 1);
        srv.cum_sess.set(srv.cum_sess.get() + 1);
        self.flags.insert(SessFlags::SRV_COUNTED);

        self.si[1].endpoint = Endpoint::Conn(conn);
        self.si[1].state = SiState::Con;
        self.si[1].exp = Tick::expire_in(self.now, self.be.timeouts.connect);
        trace!("connecting to server {}", srv.name);
        self.connect_step();
    }

    fn connect_step(&mut self) {
        let established = self.si[1]
            .conn()
            .map(|c| c.is_established() && !c.has_error())
            .unwrap_or(false);
        if established {
            self.establish();
            return;
        }
        let errored = self.si[1].conn().map(|c| c.has_error()).unwrap_or(true);
        if errored {
            self.si[1].err_type = SiErr::ConnErr;
            self.si[1].state = SiState::Cer;
            self.retry_step();
            return;
        }
        if self.si[1].flags.contains(SiFlags::EXP) {
            self.si[1].flags.remove(SiFlags::EXP);
            self.si[1].err_type = SiErr::ConnTo;
            self.si[1].state = SiState::Cer;
            self.retry_step();
        }
    }

    fn retry_step(&mut self) {
        self.release_srv_conn();
        if self.si[1].conn_retries == 0 {
            let cause = match self.si[1].err_type {
                SiErr::ConnTo => ErrCause::SrvTo,
                _ => ErrCause::SrvCl,
            };
            self.si[1].state = SiState::Clo;
            self.set_term_flags(cause, FinState::C);
            self.be
                .be_counters
                .failed_conns
                .set(self.be.be_counters.failed_conns.get() + 1);
            self.reply_and_close(503, ErrStatus::Unavailable503.message());
            return;
        }
        self.si[1].conn_retries -= 1;
        self.be
            .be_counters
            .retries
            .set(self.be.be_counters.retries.get() + 1);
        // one-second turn-around before the next attempt; the last retry
        // may be redispatched to another server
        if self.si[1].conn_retries == 0 {
            self.flags.remove(SessFlags::ASSIGNED);
            self.flags.insert(SessFlags::REDISP);
            self.srv = None;
        }
        self.si[1].state = SiState::Tar;
        self.si[1].exp = Tick::at(self.now + 1000);
    }

    fn release_srv_conn(&mut self) {
        if let Endpoint::Conn(ref mut c) = self.si[1].endpoint {
            c.xprt_close();
        }
        self.si[1].endpoint = Endpoint::None;
        if self.flags.contains(SessFlags::SRV_COUNTED) {
            if let Some(ref srv) = self.srv {
                srv.cur_sess.set(srv.cur_sess.get().saturating_sub(1));
            }
            self.flags.remove(SessFlags::SRV_COUNTED);
        }
    }

    /// The server side is up: arm the response pipeline.
    fn establish(&mut self) {
        trace!("session established on backend {}", self.be.name);
        self.si[1].exp = Tick::ETERNITY;
        self.si[1].flags.remove(SiFlags::EXP);
        self.rep.flags.insert(ChnFlags::READ_ATTACHED);

        self.rep.rto = self.be.timeouts.server;
        self.req.wto = self.be.timeouts.server;
        self.rep.wto = self.fe.timeouts.client;
        self.rep.refresh_rex(self.now);

        match self.be.mode {
            PxMode::Http if self.txn.rsp.msg_state != crate::proto::h1::MsgState::Tunnel => {
                if !self.be.tcp_rsp_rules.is_empty() {
                    self.rep.analysers.insert(Analysers::RES_INSPECT);
                }
                self.rep.analysers.insert(
                    Analysers::RES_WAIT_HTTP
                        | Analysers::RES_STORE_RULES
                        | Analysers::RES_HTTP_PROCESS_BE
                        | Analysers::RES_HTTP_XFER_BODY,
                );
            }
            PxMode::Http => {
                // the transaction already degenerated into a tunnel
                self.rep.auto_close();
                self.req.auto_close();
                self.rep.forward(FORWARD_INFINITE);
            }
            PxMode::Tcp => {
                if !self.be.tcp_rsp_rules.is_empty() {
                    self.rep.analysers.insert(Analysers::RES_INSPECT);
                }
                self.rep.auto_close();
                self.req.auto_close();
                self.rep.forward(FORWARD_INFINITE);
            }
        }

        let Session {
            ref mut si,
            ref mut req,
            ..
        } = *self;
        let [_, si1] = si;
        si_chk_snd(si1, req);
    }

    fn applet_step(&mut self) {
        let now = self.now;
        let Session {
            ref mut si,
            ref mut req,
            ref mut rep,
            ..
        } = *self;
        let [_, si1] = si;
        if si1.state != SiState::Est {
            return;
        }
        if let Endpoint::Applet(ref mut app) = si1.endpoint {
            let before = rep.buf.total();
            let status = app.run(req, rep, now);
            if rep.buf.total() > before {
                rep.flags.insert(ChnFlags::READ_PARTIAL);
                rep.refresh_rex(now);
            }
            if status == AppletStatus::Done {
                // behave like a server that closed after responding
                rep.shutr_now();
            }
        }
    }

    fn close_disconnected(&mut self, poller: &mut dyn Poller) {
        for side in 0..2 {
            let si = &mut self.si[side];
            if si.state != SiState::Dis {
                continue;
            }
            if let Endpoint::Conn(ref mut c) = si.endpoint {
                c.full_close(poller);
            }
            if side == 1 && self.flags.contains(SessFlags::SRV_COUNTED) {
                if let Some(ref srv) = self.srv {
                    srv.cur_sess.set(srv.cur_sess.get().saturating_sub(1));
                }
                self.flags.remove(SessFlags::SRV_COUNTED);
            }
            si.prev_state = SiState::Dis;
            si.state = SiState::Clo;
            si.exp = Tick::ETERNITY;
        }
    }

    fn finalize(&mut self) {
        if self.flags.contains(SessFlags::SRV_COUNTED) {
            if let Some(ref srv) = self.srv {
                srv.cur_sess.set(srv.cur_sess.get().saturating_sub(1));
            }
            self.flags.remove(SessFlags::SRV_COUNTED);
        }
        if let Some(ref l) = self.listener {
            l.cur_conn.set(l.cur_conn.get().saturating_sub(1));
        }
        // infer a cause when nothing recorded one explicitly
        if self.err_cause == ErrCause::None {
            if self.req.flags.contains(ChnFlags::READ_TIMEOUT)
                || self.rep.flags.contains(ChnFlags::WRITE_TIMEOUT)
            {
                self.err_cause = ErrCause::CliTo;
                self.fin_state = FinState::D;
            } else if self.rep.flags.contains(ChnFlags::READ_TIMEOUT)
                || self.req.flags.contains(ChnFlags::WRITE_TIMEOUT)
            {
                self.err_cause = ErrCause::SrvTo;
                self.fin_state = FinState::D;
            }
        }
        debug!(
            "session closed err={:?} fin={:?} status={}",
            self.err_cause, self.fin_state, self.txn.status
        );
    }
}
