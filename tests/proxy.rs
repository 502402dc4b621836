//! End-to-end session scenarios over the in-memory transport: the
//! engine drives real sessions between a scripted client and a scripted
//! backend, no sockets involved.

use std::rc::Rc;

use relay::analyser::mode::{adjust_req_mode, parse_connection_tokens, resolve_mode};
use relay::applet::StatsApplet;
use relay::connection::transport::MemXprt;
use relay::connection::{Connection, NullPoller, Target, Xprt};
use relay::proxy::{
    Cond, HttpPxMode, HttpRule, Listener, MemGateway, Proxy, PxMode, Redirect, RedirectKind,
    RuleAct, Server, ServerAddr,
};
use relay::session::{ErrCause, FinState, Session, SessionStatus};

struct Harness {
    sess: Session,
    client: MemXprt,
    gw: Rc<MemGateway>,
    backend: Option<MemXprt>,
    now: u64,
    last: SessionStatus,
}

impl Harness {
    fn build(
        cfg_fe: impl FnOnce(&mut Proxy),
        cfg_be: impl FnOnce(&mut Proxy),
    ) -> Harness {
        Harness::build_with_listener(cfg_fe, cfg_be, None, None)
    }

    fn build_with_listener(
        cfg_fe: impl FnOnce(&mut Proxy),
        cfg_be: impl FnOnce(&mut Proxy),
        listener: Option<Rc<Listener>>,
        client_addr: Option<std::net::SocketAddr>,
    ) -> Harness {
        let gw = MemGateway::new();
        let mut be = Proxy::new("app", PxMode::Http);
        be.servers = vec![Server::new("a1", ServerAddr::Mem(gw.clone()))];
        be.timeouts.connect = Some(2000);
        be.timeouts.server = Some(10_000);
        cfg_be(&mut be);
        let be = Rc::new(be);

        let mut fe = Proxy::new("www", PxMode::Http);
        fe.timeouts.client = Some(10_000);
        fe.timeouts.http_request = Some(5_000);
        fe.default_backend = Some(be);
        cfg_fe(&mut fe);
        let fe = Rc::new(fe);

        let (session_end, client) = MemXprt::pair();
        let mut conn = Connection::new(Target::Proxy(fe.clone()));
        conn.prepare(None, Xprt::Mem(session_end), None);
        if let Some(addr) = client_addr {
            conn.set_addr_from(addr);
        }

        let sess = Session::accept(fe, listener, conn, 0);
        Harness {
            sess,
            client,
            gw,
            backend: None,
            now: 0,
            last: SessionStatus::Running(relay::clock::Tick::ETERNITY),
        }
    }

    /// Run the engine until it settles (a handful of wakeups).
    fn pump(&mut self) {
        let mut poller = NullPoller;
        for _ in 0..6 {
            self.last = self.sess.process(self.now, &mut poller);
        }
        if self.backend.is_none() {
            self.backend = self.gw.accept();
            if self.backend.is_some() {
                // deliver whatever was already queued toward the server
                for _ in 0..3 {
                    self.last = self.sess.process(self.now, &mut poller);
                }
            }
        }
    }

    fn client_send(&mut self, bytes: &[u8]) {
        self.client.feed(bytes);
        self.pump();
    }

    fn client_recv(&mut self) -> Vec<u8> {
        self.pump();
        self.client.take()
    }

    fn backend_recv(&mut self) -> Vec<u8> {
        self.pump();
        self.backend.as_ref().map(|b| b.take()).unwrap_or_default()
    }

    fn backend_send(&mut self, bytes: &[u8]) {
        self.backend.as_ref().expect("backend connected").feed(bytes);
        self.pump();
    }

    fn backend_close(&mut self) {
        self.backend.as_ref().expect("backend connected").close_write();
        self.pump();
    }

    /// Forget the current backend connection; the next accept pulls a
    /// fresh one from the gateway.
    fn backend_drop(&mut self) {
        self.backend = None;
        self.pump();
    }

    fn advance(&mut self, ms: u64) {
        self.now += ms;
        self.pump();
    }

    fn closed(&self) -> bool {
        self.last == SessionStatus::Closed
    }
}

fn text(v: Vec<u8>) -> String {
    String::from_utf8_lossy(&v).into_owned()
}

// Scenario 1: a 1.0 request relays verbatim, the response comes back and
// the session dies with the connections.
#[test]
fn http10_single_exchange() {
    let mut h = Harness::build(|_| {}, |_| {});
    h.client_send(b"GET / HTTP/1.0\r\n\r\n");

    let seen = h.backend_recv();
    assert_eq!(text(seen), "GET / HTTP/1.0\r\n\r\n");

    h.backend_send(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
    h.backend_close();
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.0 200 OK"), "got: {}", rsp);

    h.client.close_write();
    h.pump();
    assert!(h.closed());
    assert_eq!(h.sess.err_cause, ErrCause::None);
}

// Scenario 2: server-close mode: one client socket, two backend
// connections, two responses.
#[test]
fn server_close_reuses_client_socket() {
    let mut h = Harness::build(
        |fe| fe.conn_mode = HttpPxMode::KeepAlive,
        |be| be.conn_mode = HttpPxMode::ServerClose,
    );

    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let req1 = text(h.backend_recv());
    assert!(req1.starts_with("GET / HTTP/1.1"), "got: {}", req1);
    // server-close announces itself toward the server
    assert!(req1.to_ascii_lowercase().contains("connection: close"));

    h.backend_send(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    h.backend_close();
    let rsp1 = text(h.client_recv());
    assert!(rsp1.starts_with("HTTP/1.1 200 OK"), "got: {}", rsp1);
    assert!(rsp1.to_ascii_lowercase().contains("connection: keep-alive"));
    assert!(rsp1.ends_with("ok"));

    // second request on the same client socket reaches a second backend
    // connection
    h.backend_drop();
    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(h.backend.is_some(), "expected a fresh backend connection");
    let req2 = text(h.backend_recv());
    assert!(req2.starts_with("GET / HTTP/1.1"), "got: {}", req2);

    h.backend_send(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    h.backend_close();
    let rsp2 = text(h.client_recv());
    assert!(rsp2.starts_with("HTTP/1.1 200 OK"), "got: {}", rsp2);
    assert!(!h.closed(), "client socket must remain usable");
}

// Scenario 3: a chunked request body crosses untouched.
#[test]
fn chunked_request_forwards_byte_for_byte() {
    let mut h = Harness::build(|_| {}, |_| {});
    let raw: &[u8] = b"POST /u HTTP/1.1\r\nHost:x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    h.client_send(raw);
    let seen = h.backend_recv();
    assert_eq!(text(seen), String::from_utf8_lossy(raw));
}

// Scenario 4: tarpit holds the request for the configured delay, then
// answers 500 and flags the session.
#[test]
fn tarpit_times_out_to_500() {
    let addr: std::net::SocketAddr = "10.0.0.1:40000".parse().unwrap();
    let mut h = Harness::build_with_listener(
        |fe| {
            fe.timeouts.tarpit = Some(3000);
            fe.http_req_rules = vec![HttpRule {
                cond: Some(Cond::SrcIs("10.0.0.1".parse().unwrap())),
                action: RuleAct::Tarpit,
            }];
        },
        |_| {},
        None,
        Some(addr),
    );

    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(h.client_recv().is_empty(), "tarpit must stay silent");
    assert!(h.backend.is_none(), "tarpit must not consume a server");

    h.advance(3001);
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.0 500"), "got: {}", rsp);
    assert_eq!(h.sess.err_cause, ErrCause::PrxCond);
    assert_eq!(h.sess.fin_state, FinState::T);
}

// Scenario 5: a matched redirect answers in keep-alive and leaves the
// socket ready for the next request.
#[test]
fn redirect_keeps_the_connection() {
    let mut h = Harness::build(
        |fe| {
            fe.conn_mode = HttpPxMode::KeepAlive;
            fe.http_req_rules = vec![HttpRule {
                cond: None,
                action: RuleAct::Redirect(Redirect {
                    kind: RedirectKind::Prefix("https://x".into()),
                    code: 301,
                    set_cookie: None,
                }),
            }];
        },
        |be| be.conn_mode = HttpPxMode::KeepAlive,
    );

    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.1 301 Moved Permanently"), "got: {}", rsp);
    assert!(rsp.contains("Location: https://x/"));
    assert!(rsp.contains("Connection: keep-alive"));

    // same socket, immediately ready
    h.client_send(b"GET /two HTTP/1.1\r\nHost: x\r\n\r\n");
    let rsp2 = text(h.client_recv());
    assert!(rsp2.contains("Location: https://x/two"), "got: {}", rsp2);
    assert!(!h.closed());
}

// Scenario 6: chunked not last in Transfer-Encoding: length unknowable,
// transfer falls back to close-delimited and the client is told to close.
#[test]
fn unknown_transfer_length_forces_close() {
    let mut h = Harness::build(
        |fe| fe.conn_mode = HttpPxMode::KeepAlive,
        |be| be.conn_mode = HttpPxMode::KeepAlive,
    );

    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let _ = h.backend_recv();
    h.backend_send(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked, gzip\r\n\r\npayload-until-close");
    h.backend_close();

    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.1 200 OK"), "got: {}", rsp);
    assert!(rsp.to_ascii_lowercase().contains("connection: close"));
    assert!(rsp.ends_with("payload-until-close"));
}

// PROXY protocol ingress: the line is consumed before HTTP and the
// original addresses are installed on the connection.
#[test]
fn proxy_line_ingress() {
    let listener = Rc::new(Listener {
        name: "l1".into(),
        bind_addr: None,
        accept_proxy: true,
        maxconn: None,
        cur_conn: std::cell::Cell::new(0),
    });
    let mut h = Harness::build_with_listener(|_| {}, |_| {}, Some(listener), None);

    h.client_send(b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\nGET / HTTP/1.0\r\n\r\n");
    let seen = text(h.backend_recv());
    assert_eq!(seen, "GET / HTTP/1.0\r\n\r\n");
    assert_eq!(
        h.sess.client_addr(),
        Some("1.2.3.4:1111".parse().unwrap())
    );
    assert_eq!(
        h.sess.frontend_addr(),
        Some("5.6.7.8:2222".parse().unwrap())
    );
}

// The stats applet: a POST form flips a server and answers 303 with the
// outcome code.
#[test]
fn stats_applet_post_roundtrip() {
    let gw = MemGateway::new();
    let mut target = Proxy::new("app", PxMode::Http);
    target.servers = vec![
        Server::new("s1", ServerAddr::Mem(gw.clone())),
        Server::new("s2", ServerAddr::Mem(gw)),
    ];
    let target = Rc::new(target);

    let mut h = {
        let target2 = target.clone();
        Harness::build(
            |_| {},
            move |be| {
                let backends = vec![target2];
                be.applet = Some(Rc::new(move || {
                    Box::new(StatsApplet::new("/stats", true, backends.clone()))
                        as Box<dyn relay::applet::Applet>
                }));
            },
        )
    };

    h.client_send(
        b"POST /stats HTTP/1.1\r\nHost: x\r\nContent-Length: 25\r\n\r\nb=app&action=disable&s=s2",
    );
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.1 303 See Other"), "got: {}", rsp);
    assert!(rsp.contains("Location: /stats;st=DONE"), "got: {}", rsp);
    assert_eq!(
        target.servers[1].admin.get(),
        relay::proxy::AdminState::Disabled
    );
}

// 408: an incomplete request head runs into the request timeout.
#[test]
fn slow_request_gets_408() {
    let mut h = Harness::build(|_| {}, |_| {});
    h.client_send(b"GET / HTT");
    assert!(h.client_recv().is_empty());
    h.advance(5001);
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.0 408"), "got: {}", rsp);
    assert_eq!(h.sess.err_cause, ErrCause::CliTo);
    assert_eq!(h.sess.fin_state, FinState::R);
}

// Deny rule: straight 403 and a denied counter.
#[test]
fn deny_rule_answers_403() {
    let mut h = Harness::build(
        |fe| {
            fe.http_req_rules = vec![HttpRule {
                cond: Some(Cond::PathBeg("/admin".into())),
                action: RuleAct::Deny,
            }];
        },
        |_| {},
    );
    h.client_send(b"GET /admin/panel HTTP/1.1\r\nHost: x\r\n\r\n");
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.0 403"), "got: {}", rsp);
    assert_eq!(h.sess.fe.fe_counters.denied_req.get(), 1);
    assert_eq!(h.sess.err_cause, ErrCause::PrxCond);
}

// No server at all: 503 without touching the network.
#[test]
fn no_server_yields_503() {
    let mut h = Harness::build(|_| {}, |be| be.servers.clear());
    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let rsp = text(h.client_recv());
    assert!(rsp.starts_with("HTTP/1.0 503"), "got: {}", rsp);
    assert_eq!(h.sess.fin_state, FinState::C);
}

// X-Forwarded-For: appended with the client address.
#[test]
fn forwarded_for_is_appended() {
    let addr: std::net::SocketAddr = "192.168.1.9:1234".parse().unwrap();
    let mut h = Harness::build_with_listener(
        |fe| fe.options |= relay::proxy::PxOptions::FWDFOR,
        |_| {},
        None,
        Some(addr),
    );
    h.client_send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let seen = text(h.backend_recv());
    assert!(
        seen.contains("X-Forwarded-For: 192.168.1.9"),
        "got: {}",
        seen
    );
}

// The negotiation matrix, driven end to end through the pure helpers.
#[test]
fn negotiation_matrix_spot_checks() {
    use relay::proto::h1::{HdrIdx, HttpMsg, MsgFlags};
    use relay::proto::txn::ConnMode;

    // 1.0 client, no tokens, keep-alive config: the proxy must close
    let mut buf = relay::buffer::Buffer::with_capacity(512);
    buf.put_slice(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    let mut msg = HttpMsg::new_request();
    let mut idx = HdrIdx::new();
    relay::proto::h1::parse_message(&mut buf, &mut msg, &mut idx);
    let tokens = parse_connection_tokens(buf.input_contiguous(), &idx);
    let cfg = resolve_mode(HttpPxMode::KeepAlive, HttpPxMode::KeepAlive);
    assert_eq!(adjust_req_mode(cfg, MsgFlags::XFER_LEN, tokens), ConnMode::Close);

    // 1.0 + keep-alive token stays alive
    let mut buf = relay::buffer::Buffer::with_capacity(512);
    buf.put_slice(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    let mut msg = HttpMsg::new_request();
    let mut idx = HdrIdx::new();
    relay::proto::h1::parse_message(&mut buf, &mut msg, &mut idx);
    let tokens = parse_connection_tokens(buf.input_contiguous(), &idx);
    assert_eq!(
        adjust_req_mode(cfg, MsgFlags::XFER_LEN, tokens),
        ConnMode::KeepAlive
    );
}
