//! Frontend/backend model: proxies, listeners, servers, rules and the
//! counters sessions account against.
//!
//! Configuration parsing is not this crate's business; these types are the
//! already-parsed form a session consumes. Counters use `Cell`: the engine
//! is single-threaded and sessions touch them only from their own
//! callbacks.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use bitflags::bitflags;
use http::Method;

use crate::clock::Ms;
use crate::connection::transport::MemXprt;

/// Working mode of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PxMode {
    Tcp,
    Http,
}

/// Configured HTTP connection handling (`option http-*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpPxMode {
    /// No option: pass the connection through untouched.
    Tunnel,
    KeepAlive,
    ServerClose,
    /// Add `Connection: close` both ways but let the ends close.
    HttpClose,
    /// Actively close both sides once the response is done.
    ForceClose,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PxOptions: u32 {
        /// Append X-Forwarded-For on requests.
        const FWDFOR          = 0x0001;
        /// Append X-Original-To on requests.
        const ORIGINALTO      = 0x0002;
        /// Tolerate non-ASCII bytes in request URIs.
        const ACCEPT_INVALID  = 0x0004;
        /// Pretend keep-alive toward the server despite a close mode.
        const PRETEND_KAL     = 0x0008;
        /// Disable Nagle toward both sides.
        const TCP_NODELAY     = 0x0010;
        /// Compress eligible responses.
        const COMPRESSION     = 0x0020;
    }
}

/// Per-proxy timeouts; `None` disables the deadline.
#[derive(Debug, Default, Clone)]
pub struct Timeouts {
    pub client: Option<Ms>,
    pub server: Option<Ms>,
    pub connect: Option<Ms>,
    pub http_request: Option<Ms>,
    pub queue: Option<Ms>,
    pub tarpit: Option<Ms>,
    pub inspect_delay: Option<Ms>,
}

/// A condition attached to a rule. Closed set: the ACL surface the core
/// evaluates itself.
#[derive(Debug, Clone)]
pub enum Cond {
    Always,
    SrcIs(IpAddr),
    /// Address/prefix-length match on the client source.
    SrcIn(IpAddr, u8),
    PathBeg(String),
    MethodIs(Method),
    Not(Box<Cond>),
}

impl Cond {
    pub fn eval(&self, src: Option<SocketAddr>, meth: Option<&Method>, path: Option<&str>) -> bool {
        match self {
            Cond::Always => true,
            Cond::SrcIs(ip) => src.map(|a| a.ip() == *ip).unwrap_or(false),
            Cond::SrcIn(net, bits) => src
                .map(|a| ip_in_prefix(a.ip(), *net, *bits))
                .unwrap_or(false),
            Cond::PathBeg(p) => path.map(|u| u.starts_with(p.as_str())).unwrap_or(false),
            Cond::MethodIs(m) => meth.map(|x| x == m).unwrap_or(false),
            Cond::Not(inner) => !inner.eval(src, meth, path),
        }
    }
}

pub fn ip_in_prefix(ip: IpAddr, net: IpAddr, bits: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let bits = u32::from(bits.min(32));
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let bits = u32::from(bits.min(128));
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

/// What an HTTP rule does once its condition holds.
#[derive(Debug, Clone)]
pub enum RuleAct {
    Allow,
    Deny,
    Tarpit,
    /// 401 (or 407 when `proxy`) with an authenticate challenge.
    Auth { realm: String, proxy: bool },
    Redirect(Redirect),
    AddHdr { name: String, value: String },
    SetHdr { name: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub code: u16,
    pub set_cookie: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RedirectKind {
    /// Replace the whole location.
    Location(String),
    /// Prepend to the request path.
    Prefix(String),
}

#[derive(Debug, Clone)]
pub struct HttpRule {
    pub cond: Option<Cond>,
    pub action: RuleAct,
}

/// TCP content rules run by the inspect analysers.
#[derive(Debug, Clone)]
pub struct TcpRule {
    pub cond: Option<Cond>,
    pub accept: bool,
}

/// `use_backend` selection.
#[derive(Clone)]
pub struct SwitchRule {
    pub cond: Cond,
    pub backend: Rc<Proxy>,
}

/// Counters a frontend or backend accumulates.
#[derive(Debug, Default)]
pub struct PxCounters {
    pub cum_conn: Cell<u64>,
    pub cum_sess: Cell<u64>,
    pub http_req: Cell<u64>,
    pub http_err: Cell<u64>,
    pub denied_req: Cell<u64>,
    pub failed_req: Cell<u64>,
    pub failed_resp: Cell<u64>,
    pub failed_conns: Cell<u64>,
    pub retries: Cell<u64>,
    pub comp_in: Cell<u64>,
    pub comp_out: Cell<u64>,
}

/// A stick-table entry a session references through its counter slots.
#[derive(Debug, Default)]
pub struct StickEntry {
    pub conn_cnt: Cell<u64>,
    pub conn_cur: Cell<u64>,
    pub http_req_cnt: Cell<u64>,
    pub http_err_cnt: Cell<u64>,
}

/// Server administrative state, driven by the stats applet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Ready,
    Disabled,
    Stopped,
}

/// Where connecting to a server actually goes: a real TCP address, or an
/// in-process gateway handing out loopback transports (applets, tests).
#[derive(Clone)]
pub enum ServerAddr {
    Tcp(SocketAddr),
    Mem(Rc<MemGateway>),
}

/// Accept queue for in-process "connections": each connect pushes the
/// harness-side endpoint here.
#[derive(Default)]
pub struct MemGateway {
    accepted: RefCell<Vec<MemXprt>>,
}

impl MemGateway {
    pub fn new() -> Rc<MemGateway> {
        Rc::new(MemGateway::default())
    }

    pub fn connect(&self) -> MemXprt {
        let (ours, theirs) = MemXprt::pair();
        self.accepted.borrow_mut().push(ours);
        theirs
    }

    /// Pop the oldest accepted endpoint (test harness side).
    pub fn accept(&self) -> Option<MemXprt> {
        let mut q = self.accepted.borrow_mut();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0))
        }
    }

    pub fn pending(&self) -> usize {
        self.accepted.borrow().len()
    }
}

pub struct Server {
    pub name: String,
    pub addr: ServerAddr,
    pub maxconn: Option<u32>,
    pub send_proxy: bool,
    pub cur_sess: Cell<u32>,
    pub queued: Cell<u32>,
    pub admin: Cell<AdminState>,
    pub cum_sess: Cell<u64>,
    pub failed_conns: Cell<u64>,
}

impl Server {
    pub fn new(name: &str, addr: ServerAddr) -> Rc<Server> {
        Rc::new(Server {
            name: name.to_owned(),
            addr,
            maxconn: None,
            send_proxy: false,
            cur_sess: Cell::new(0),
            queued: Cell::new(0),
            admin: Cell::new(AdminState::Ready),
            cum_sess: Cell::new(0),
            failed_conns: Cell::new(0),
        })
    }

    /// The server cannot take another connection right now.
    pub fn is_full(&self) -> bool {
        match self.maxconn {
            Some(max) => self.cur_sess.get() >= max,
            None => false,
        }
    }

    pub fn usable(&self) -> bool {
        self.admin.get() == AdminState::Ready
    }
}

/// A bound frontend socket.
pub struct Listener {
    pub name: String,
    pub bind_addr: Option<SocketAddr>,
    /// Expect a PROXY protocol line from whoever connects.
    pub accept_proxy: bool,
    pub maxconn: Option<u32>,
    pub cur_conn: Cell<u32>,
}

impl Listener {
    pub fn new(name: &str) -> Rc<Listener> {
        Rc::new(Listener {
            name: name.to_owned(),
            bind_addr: None,
            accept_proxy: false,
            maxconn: None,
            cur_conn: Cell::new(0),
        })
    }
}

/// Compression settings on a proxy.
#[derive(Debug, Default, Clone)]
pub struct CompCfg {
    pub algos: Vec<crate::compress::CompAlgo>,
    /// Content types eligible for compression; empty means all.
    pub types: Vec<String>,
}

pub struct Proxy {
    pub name: String,
    pub mode: PxMode,
    pub conn_mode: HttpPxMode,
    pub options: PxOptions,
    pub timeouts: Timeouts,
    pub retries: u32,

    /// Forwarded-header shaping.
    pub fwdfor_hdr: Option<String>,
    pub orgto_hdr: Option<String>,
    pub except_fwd: Option<(IpAddr, u8)>,
    pub except_orgto: Option<(IpAddr, u8)>,

    pub monitor_uri: Option<String>,

    pub tcp_req_rules: Vec<TcpRule>,
    pub tcp_rsp_rules: Vec<TcpRule>,
    pub http_req_rules: Vec<HttpRule>,
    pub switch_rules: Vec<SwitchRule>,
    pub default_backend: Option<Rc<Proxy>>,

    pub servers: Vec<Rc<Server>>,
    rr_pos: Cell<usize>,

    pub comp: Option<CompCfg>,

    /// Embedded endpoint served by the process instead of a server.
    pub applet: Option<Rc<dyn Fn() -> Box<dyn crate::applet::Applet>>>,

    pub fe_counters: PxCounters,
    pub be_counters: PxCounters,
}

impl Proxy {
    pub fn new(name: &str, mode: PxMode) -> Proxy {
        Proxy {
            name: name.to_owned(),
            mode,
            conn_mode: HttpPxMode::Tunnel,
            options: PxOptions::empty(),
            timeouts: Timeouts::default(),
            retries: 3,
            fwdfor_hdr: None,
            orgto_hdr: None,
            except_fwd: None,
            except_orgto: None,
            monitor_uri: None,
            tcp_req_rules: Vec::new(),
            tcp_rsp_rules: Vec::new(),
            http_req_rules: Vec::new(),
            switch_rules: Vec::new(),
            default_backend: None,
            servers: Vec::new(),
            rr_pos: Cell::new(0),
            comp: None,
            applet: None,
            fe_counters: PxCounters::default(),
            be_counters: PxCounters::default(),
        }
    }

    /// Round-robin over usable servers. `None` when every server is out.
    pub fn pick_server(&self) -> Option<Rc<Server>> {
        if self.servers.is_empty() {
            return None;
        }
        let n = self.servers.len();
        for i in 0..n {
            let pos = (self.rr_pos.get() + i) % n;
            let srv = &self.servers[pos];
            if srv.usable() {
                self.rr_pos.set((pos + 1) % n);
                return Some(srv.clone());
            }
        }
        None
    }
}
