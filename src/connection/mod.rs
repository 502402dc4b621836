//! Connection layer: one file descriptor, a control protocol, a transport,
//! and the polling-intent bookkeeping that binds them to the poller.
//!
//! The flag word packs three layers of read/write intent (`CURR` = what the
//! poller currently polls, `SOCK` = what the handshake layer wants, `DATA` =
//! what the data layer wants) plus `WAIT` bits recording an observed
//! would-block. The bits are laid out so that one shift+xor+mask detects any
//! disagreement between a layer and the polled state; callers only ever see
//! the typed predicates.

pub mod proxy_proto;
pub mod tcp;
pub mod transport;

use std::net::SocketAddr;
use std::rc::Rc;

use bitflags::bitflags;

use crate::proxy::{Listener, Proxy, Server};

pub use self::transport::Xprt;

/// A poller-registered file descriptor. Embedded endpoints have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

/// What the reconciler talks to. The real implementation wraps the process
/// poller; tests record calls, embedded endpoints use [`NullPoller`].
pub trait Poller {
    fn want_recv(&mut self, fd: Fd);
    fn stop_recv(&mut self, fd: Fd);
    /// A would-block was observed: switch from speculative I/O to polled.
    fn poll_recv(&mut self, fd: Fd);
    fn want_send(&mut self, fd: Fd);
    fn stop_send(&mut self, fd: Fd);
    fn poll_send(&mut self, fd: Fd);
    fn stop_both(&mut self, fd: Fd);
    fn is_set(&self, fd: Fd, dir: Dir) -> bool;
}

/// Poller that ignores everything; used for purely in-memory endpoints.
pub struct NullPoller;

impl Poller for NullPoller {
    fn want_recv(&mut self, _: Fd) {}
    fn stop_recv(&mut self, _: Fd) {}
    fn poll_recv(&mut self, _: Fd) {}
    fn want_send(&mut self, _: Fd) {}
    fn stop_send(&mut self, _: Fd) {}
    fn poll_send(&mut self, _: Fd) {}
    fn stop_both(&mut self, _: Fd) {}
    fn is_set(&self, _: Fd, _: Dir) -> bool {
        false
    }
}

bitflags! {
    /// Connection flag word.
    ///
    /// Do not move the low eight bits: the polling-change detectors depend
    /// on `CURR = DATA << 4 = SOCK << 2` and `WAIT = DATA << 6 = SOCK << 4`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        const DATA_RD_ENA   = 0x0000_0001;
        const DATA_WR_ENA   = 0x0000_0002;
        const SOCK_RD_ENA   = 0x0000_0004;
        const SOCK_WR_ENA   = 0x0000_0008;
        const CURR_RD_ENA   = 0x0000_0010;
        const CURR_WR_ENA   = 0x0000_0020;
        const WAIT_RD       = 0x0000_0040;
        const WAIT_WR       = 0x0000_0080;

        /// Half-close bookkeeping, per layer and per side.
        const SOCK_RD_SH    = 0x0000_0100;
        const SOCK_WR_SH    = 0x0000_0200;
        const DATA_RD_SH    = 0x0000_0400;
        const DATA_WR_SH    = 0x0000_0800;

        /// A fatal error was reported; polling fully stops.
        const ERROR         = 0x0000_1000;
        /// The L4 connection is established.
        const CONNECTED     = 0x0000_2000;
        /// Waiting for connect() to conclude.
        const WAIT_L4_CONN  = 0x0000_4000;
        /// Wake the data layer on transport activity.
        const WAKE_DATA     = 0x0000_8000;

        const ADDR_FROM_SET = 0x0001_0000;
        const ADDR_TO_SET   = 0x0002_0000;

        /// Send a PROXY protocol line before handing over to data.
        const SI_SEND_PROXY = 0x0004_0000;
        /// Expect a PROXY protocol line before the first data byte.
        const ACCEPT_PROXY  = 0x0008_0000;
        /// Keep the transport alive after close so late readers (logs) can
        /// still query it.
        const XPRT_TRACKED  = 0x0010_0000;

        /// Data layer stop reasons, cleared on handler entry.
        const WAIT_DATA     = 0x0020_0000;
        const WAIT_ROOM     = 0x0040_0000;
    }
}

impl ConnFlags {
    const DATA_INTEREST: u32 = Self::DATA_RD_ENA.bits()
        | Self::DATA_WR_ENA.bits()
        | Self::CURR_RD_ENA.bits()
        | Self::CURR_WR_ENA.bits()
        | Self::WAIT_RD.bits()
        | Self::WAIT_WR.bits();

    const SOCK_INTEREST: u32 = Self::SOCK_RD_ENA.bits()
        | Self::SOCK_WR_ENA.bits()
        | Self::CURR_RD_ENA.bits()
        | Self::CURR_WR_ENA.bits()
        | Self::WAIT_RD.bits()
        | Self::WAIT_WR.bits();

    const CURR: u32 = Self::CURR_RD_ENA.bits() | Self::CURR_WR_ENA.bits();
    const CHANGE: u32 = Self::CURR | Self::WAIT_RD.bits() | Self::WAIT_WR.bits();

    /// True when the data layer's intent disagrees with the polled state,
    /// when a would-block must be honored, or when an error was reported.
    pub fn data_polling_changes(self) -> bool {
        let f = self.bits() & Self::DATA_INTEREST;
        let t = (f & (f << 6)) | ((f ^ (f << 4)) & Self::CURR);
        (t & Self::CHANGE) != 0 || self.contains(ConnFlags::ERROR)
    }

    /// Same test against the handshake layer's intent.
    pub fn sock_polling_changes(self) -> bool {
        let f = self.bits() & Self::SOCK_INTEREST;
        let t = (f & (f << 4)) | ((f ^ (f << 2)) & Self::CURR);
        (t & Self::CHANGE) != 0 || self.contains(ConnFlags::ERROR)
    }

    /// A handshake is in progress: the sock layer drives polling.
    pub fn polling_driven_by_sock(self) -> bool {
        self.intersects(
            ConnFlags::SI_SEND_PROXY | ConnFlags::ACCEPT_PROXY | ConnFlags::WAIT_L4_CONN,
        )
    }
}

/// Connection-level error codes, mostly from handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnErr {
    None,
    PrxEmpty,
    PrxAbort,
    PrxTimeout,
    PrxTruncated,
    PrxNotHdr,
    PrxBadHdr,
    PrxBadProto,
    SslEmpty,
    SslAbort,
    SslTimeout,
    SslHandshake,
}

impl ConnErr {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ConnErr::None => "success",
            ConnErr::PrxEmpty => "connection closed while waiting for PROXY protocol header",
            ConnErr::PrxAbort => "connection error while waiting for PROXY protocol header",
            ConnErr::PrxTimeout => "timeout while waiting for PROXY protocol header",
            ConnErr::PrxTruncated => "truncated PROXY protocol header received",
            ConnErr::PrxNotHdr => "received something which does not look like a PROXY protocol header",
            ConnErr::PrxBadHdr => "received an invalid PROXY protocol header",
            ConnErr::PrxBadProto => "received an unhandled protocol in the PROXY protocol header",
            ConnErr::SslEmpty => "connection closed during TLS handshake",
            ConnErr::SslAbort => "connection error during TLS handshake",
            ConnErr::SslTimeout => "timeout during TLS handshake",
            ConnErr::SslHandshake => "TLS handshake failure",
        }
    }
}

/// What sits at the far end of a connection.
#[derive(Clone)]
pub enum Target {
    None,
    Listener(Rc<Listener>),
    Server(Rc<Server>),
    Proxy(Rc<Proxy>),
    Applet(&'static str),
    Task,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::None => f.write_str("None"),
            Target::Listener(_) => f.write_str("Listener"),
            Target::Server(s) => write!(f, "Server({})", s.name),
            Target::Proxy(p) => write!(f, "Proxy({})", p.name),
            Target::Applet(name) => write!(f, "Applet({})", name),
            Target::Task => f.write_str("Task"),
        }
    }
}

/// Which control protocol owns the fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctrl {
    Tcp4,
    Tcp6,
    /// In-process loopback; no fd, no poller involvement.
    Mem,
}

pub struct Connection {
    pub flags: ConnFlags,
    pub fd: Option<Fd>,
    pub xprt: Option<Xprt>,
    pub ctrl: Option<Ctrl>,
    pub target: Target,
    pub addr_from: Option<SocketAddr>,
    pub addr_to: Option<SocketAddr>,
    pub err_code: ConnErr,
}

impl Connection {
    pub fn new(target: Target) -> Connection {
        Connection {
            flags: ConnFlags::empty(),
            fd: None,
            xprt: None,
            ctrl: None,
            target,
            addr_from: None,
            addr_to: None,
            err_code: ConnErr::None,
        }
    }

    /// Prepare a connection with its control and transport layers.
    pub fn prepare(&mut self, ctrl: Option<Ctrl>, xprt: Xprt, fd: Option<Fd>) {
        self.ctrl = ctrl;
        self.fd = fd;
        self.xprt = Some(xprt);
    }

    fn ctrl_ready(&self) -> bool {
        self.ctrl.is_some() && self.fd.is_some()
    }

    pub fn is_established(&self) -> bool {
        self.flags.contains(ConnFlags::CONNECTED)
    }

    pub fn has_error(&self) -> bool {
        self.flags.contains(ConnFlags::ERROR)
    }

    pub fn set_error(&mut self) {
        self.flags.insert(ConnFlags::ERROR);
    }

    pub fn set_addr_from(&mut self, addr: SocketAddr) {
        self.addr_from = Some(addr);
        self.flags.insert(ConnFlags::ADDR_FROM_SET);
    }

    pub fn set_addr_to(&mut self, addr: SocketAddr) {
        self.addr_to = Some(addr);
        self.flags.insert(ConnFlags::ADDR_TO_SET);
    }

    // ---- transport lifecycle ----

    /// Initialize the transport layer, if any. An error here is fatal to
    /// the connection.
    pub fn xprt_init(&mut self) -> std::io::Result<()> {
        if let Some(ref mut xprt) = self.xprt {
            xprt.init()?;
        }
        Ok(())
    }

    /// Close and release the transport. Idempotent; a no-op while the
    /// transport is tracked for late log readers.
    pub fn xprt_close(&mut self) {
        if self.flags.contains(ConnFlags::XPRT_TRACKED) {
            return;
        }
        if let Some(mut xprt) = self.xprt.take() {
            xprt.close();
        }
    }

    /// Close the transport and delete the fd in one step.
    pub fn full_close(&mut self, poller: &mut dyn Poller) {
        if self.flags.contains(ConnFlags::XPRT_TRACKED) {
            return;
        }
        if let Some(mut xprt) = self.xprt.take() {
            xprt.close();
        }
        if let Some(fd) = self.fd.take() {
            poller.stop_both(fd);
        }
        self.flags.remove(ConnFlags::CURR_RD_ENA | ConnFlags::CURR_WR_ENA);
    }

    // ---- event primitives, data layer ----

    pub fn data_want_recv(&mut self) {
        self.flags.insert(ConnFlags::DATA_RD_ENA);
    }

    pub fn data_stop_recv(&mut self) {
        self.flags.remove(ConnFlags::DATA_RD_ENA);
    }

    pub fn data_poll_recv(&mut self) {
        self.flags.insert(ConnFlags::WAIT_RD | ConnFlags::DATA_RD_ENA);
    }

    pub fn data_want_send(&mut self) {
        self.flags.insert(ConnFlags::DATA_WR_ENA);
    }

    pub fn data_stop_send(&mut self) {
        self.flags.remove(ConnFlags::DATA_WR_ENA);
    }

    pub fn data_poll_send(&mut self) {
        self.flags.insert(ConnFlags::WAIT_WR | ConnFlags::DATA_WR_ENA);
    }

    pub fn data_stop_both(&mut self) {
        self.flags
            .remove(ConnFlags::DATA_RD_ENA | ConnFlags::DATA_WR_ENA);
    }

    // ---- event primitives, sock (handshake) layer ----

    pub fn sock_want_recv(&mut self) {
        self.flags.insert(ConnFlags::SOCK_RD_ENA);
    }

    pub fn sock_stop_recv(&mut self) {
        self.flags.remove(ConnFlags::SOCK_RD_ENA);
    }

    pub fn sock_poll_recv(&mut self) {
        self.flags.insert(ConnFlags::WAIT_RD | ConnFlags::SOCK_RD_ENA);
    }

    pub fn sock_want_send(&mut self) {
        self.flags.insert(ConnFlags::SOCK_WR_ENA);
    }

    pub fn sock_stop_send(&mut self) {
        self.flags.remove(ConnFlags::SOCK_WR_ENA);
    }

    pub fn sock_poll_send(&mut self) {
        self.flags.insert(ConnFlags::WAIT_WR | ConnFlags::SOCK_WR_ENA);
    }

    pub fn sock_stop_both(&mut self) {
        self.flags
            .remove(ConnFlags::SOCK_RD_ENA | ConnFlags::SOCK_WR_ENA);
    }

    // ---- half-close bookkeeping ----

    /// The socket saw read0.
    pub fn sock_read0(&mut self) {
        self.flags.insert(ConnFlags::SOCK_RD_SH);
        self.sock_stop_recv();
    }

    /// The data layer consumed the read0.
    pub fn data_read0(&mut self) {
        self.flags.insert(ConnFlags::DATA_RD_SH);
        self.data_stop_recv();
    }

    /// The socket's write side was shut.
    pub fn sock_shutw(&mut self) {
        self.flags.insert(ConnFlags::SOCK_WR_SH);
        self.sock_stop_send();
    }

    /// The data layer asked for a write shutdown.
    pub fn data_shutw(&mut self) {
        self.flags.insert(ConnFlags::DATA_WR_SH);
        self.data_stop_send();
    }

    /// A read0 was seen by the socket but not yet consumed by data.
    pub fn data_read0_pending(&self) -> bool {
        self.flags & (ConnFlags::DATA_RD_SH | ConnFlags::SOCK_RD_SH) == ConnFlags::SOCK_RD_SH
    }

    /// Data asked for shutw but the socket has not performed it yet.
    pub fn sock_shutw_pending(&self) -> bool {
        self.flags & (ConnFlags::DATA_WR_SH | ConnFlags::SOCK_WR_SH) == ConnFlags::DATA_WR_SH
    }

    // ---- polling reconciliation ----

    /// Snap the `CURR_*` bits to the poller's actual view of the fd and
    /// clear the per-wakeup stop reasons. Call on handler entry.
    pub fn refresh_polling_flags(&mut self, poller: &dyn Poller) {
        self.flags.remove(
            ConnFlags::WAIT_RD | ConnFlags::WAIT_WR | ConnFlags::WAIT_DATA | ConnFlags::WAIT_ROOM,
        );
        if let (Some(fd), true) = (self.fd, self.ctrl_ready()) {
            self.flags
                .remove(ConnFlags::CURR_RD_ENA | ConnFlags::CURR_WR_ENA);
            if poller.is_set(fd, Dir::Read) {
                self.flags.insert(ConnFlags::CURR_RD_ENA);
            }
            if poller.is_set(fd, Dir::Write) {
                self.flags.insert(ConnFlags::CURR_WR_ENA);
            }
        }
    }

    /// Reconcile polling whenever intent or readiness may have changed.
    /// On error, polling is disabled in both directions.
    pub fn cond_update_polling(&mut self, poller: &mut dyn Poller) {
        if self.has_error() {
            self.stop_polling(poller);
        } else if !self.flags.polling_driven_by_sock() {
            if self.flags.data_polling_changes() {
                self.update_data_polling(poller);
            }
        } else if self.flags.sock_polling_changes() {
            self.update_sock_polling(poller);
        }
    }

    pub fn stop_polling(&mut self, poller: &mut dyn Poller) {
        self.flags.remove(
            ConnFlags::CURR_RD_ENA
                | ConnFlags::CURR_WR_ENA
                | ConnFlags::SOCK_RD_ENA
                | ConnFlags::SOCK_WR_ENA
                | ConnFlags::DATA_RD_ENA
                | ConnFlags::DATA_WR_ENA,
        );
        if let Some(fd) = self.fd {
            poller.stop_both(fd);
        }
    }

    fn update_dir(
        flags: &mut ConnFlags,
        poller: &mut dyn Poller,
        fd: Fd,
        ena: ConnFlags,
        curr: ConnFlags,
        wait: ConnFlags,
        dir: Dir,
    ) {
        let f = *flags;
        if f.contains(ena) && f.contains(wait) {
            match dir {
                Dir::Read => poller.poll_recv(fd),
                Dir::Write => poller.poll_send(fd),
            }
            flags.insert(curr);
            flags.remove(wait);
        } else if f.contains(ena) && !f.contains(curr) {
            match dir {
                Dir::Read => poller.want_recv(fd),
                Dir::Write => poller.want_send(fd),
            }
            flags.insert(curr);
        } else if !f.contains(ena) && f.contains(curr) {
            match dir {
                Dir::Read => poller.stop_recv(fd),
                Dir::Write => poller.stop_send(fd),
            }
            flags.remove(curr);
        }
    }

    pub fn update_data_polling(&mut self, poller: &mut dyn Poller) {
        if !self.ctrl_ready() {
            return;
        }
        let fd = self.fd.unwrap();
        Self::update_dir(
            &mut self.flags,
            poller,
            fd,
            ConnFlags::DATA_RD_ENA,
            ConnFlags::CURR_RD_ENA,
            ConnFlags::WAIT_RD,
            Dir::Read,
        );
        Self::update_dir(
            &mut self.flags,
            poller,
            fd,
            ConnFlags::DATA_WR_ENA,
            ConnFlags::CURR_WR_ENA,
            ConnFlags::WAIT_WR,
            Dir::Write,
        );
    }

    pub fn update_sock_polling(&mut self, poller: &mut dyn Poller) {
        if !self.ctrl_ready() {
            return;
        }
        let fd = self.fd.unwrap();
        Self::update_dir(
            &mut self.flags,
            poller,
            fd,
            ConnFlags::SOCK_RD_ENA,
            ConnFlags::CURR_RD_ENA,
            ConnFlags::WAIT_RD,
            Dir::Read,
        );
        Self::update_dir(
            &mut self.flags,
            poller,
            fd,
            ConnFlags::SOCK_WR_ENA,
            ConnFlags::CURR_WR_ENA,
            ConnFlags::WAIT_WR,
            Dir::Write,
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("flags", &self.flags)
            .field("fd", &self.fd)
            .field("ctrl", &self.ctrl)
            .field("target", &self.target)
            .field("err_code", &self.err_code)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // reference model: a change is needed when the effective layer's
    // enable bits differ from CURR, when a WAIT bit is set together with
    // its enable bit, or when an error was reported.
    fn naive_changes(f: ConnFlags, sock_layer: bool) -> bool {
        let (rd_ena, wr_ena) = if sock_layer {
            (ConnFlags::SOCK_RD_ENA, ConnFlags::SOCK_WR_ENA)
        } else {
            (ConnFlags::DATA_RD_ENA, ConnFlags::DATA_WR_ENA)
        };
        let rd = f.contains(rd_ena);
        let wr = f.contains(wr_ena);
        let curr_rd = f.contains(ConnFlags::CURR_RD_ENA);
        let curr_wr = f.contains(ConnFlags::CURR_WR_ENA);
        let wait_rd = f.contains(ConnFlags::WAIT_RD);
        let wait_wr = f.contains(ConnFlags::WAIT_WR);
        (rd != curr_rd)
            || (wr != curr_wr)
            || (wait_rd && rd)
            || (wait_wr && wr)
            || f.contains(ConnFlags::ERROR)
    }

    #[test]
    fn polling_change_detection_matches_reference() {
        // every combination of the eight intent bits, with and without ERROR
        for bits in 0u32..=0xff {
            for err in [0u32, ConnFlags::ERROR.bits()] {
                let f = ConnFlags::from_bits_truncate(bits | err);
                assert_eq!(
                    f.data_polling_changes(),
                    naive_changes(f, false),
                    "data mismatch for {:?}",
                    f
                );
                assert_eq!(
                    f.sock_polling_changes(),
                    naive_changes(f, true),
                    "sock mismatch for {:?}",
                    f
                );
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        rd: bool,
        wr: bool,
        calls: Vec<&'static str>,
    }

    impl Poller for Recorder {
        fn want_recv(&mut self, _: Fd) {
            self.rd = true;
            self.calls.push("want_recv");
        }
        fn stop_recv(&mut self, _: Fd) {
            self.rd = false;
            self.calls.push("stop_recv");
        }
        fn poll_recv(&mut self, _: Fd) {
            self.rd = true;
            self.calls.push("poll_recv");
        }
        fn want_send(&mut self, _: Fd) {
            self.wr = true;
            self.calls.push("want_send");
        }
        fn stop_send(&mut self, _: Fd) {
            self.wr = false;
            self.calls.push("stop_send");
        }
        fn poll_send(&mut self, _: Fd) {
            self.wr = true;
            self.calls.push("poll_send");
        }
        fn stop_both(&mut self, _: Fd) {
            self.rd = false;
            self.wr = false;
            self.calls.push("stop_both");
        }
        fn is_set(&self, _: Fd, dir: Dir) -> bool {
            match dir {
                Dir::Read => self.rd,
                Dir::Write => self.wr,
            }
        }
    }

    fn conn_with_fd() -> Connection {
        let mut c = Connection::new(Target::None);
        c.ctrl = Some(Ctrl::Tcp4);
        c.fd = Some(Fd(7));
        c
    }

    #[test]
    fn reconciler_subscribes_on_data_intent() {
        let mut c = conn_with_fd();
        let mut p = Recorder::default();
        c.data_want_recv();
        c.cond_update_polling(&mut p);
        assert!(c.flags.contains(ConnFlags::CURR_RD_ENA));
        assert_eq!(p.calls, vec!["want_recv"]);
        // already reconciled: no further calls
        c.cond_update_polling(&mut p);
        assert_eq!(p.calls, vec!["want_recv"]);
    }

    #[test]
    fn reconciler_honours_would_block() {
        let mut c = conn_with_fd();
        let mut p = Recorder::default();
        c.data_poll_send();
        c.cond_update_polling(&mut p);
        assert_eq!(p.calls, vec!["poll_send"]);
        assert!(!c.flags.contains(ConnFlags::WAIT_WR));
        assert!(c.flags.contains(ConnFlags::CURR_WR_ENA));
    }

    #[test]
    fn error_stops_both_directions() {
        let mut c = conn_with_fd();
        let mut p = Recorder::default();
        c.data_want_recv();
        c.data_want_send();
        c.cond_update_polling(&mut p);
        c.set_error();
        c.cond_update_polling(&mut p);
        assert_eq!(*p.calls.last().unwrap(), "stop_both");
        assert!(!c.flags.intersects(
            ConnFlags::DATA_RD_ENA | ConnFlags::CURR_RD_ENA | ConnFlags::CURR_WR_ENA
        ));
    }

    #[test]
    fn handshake_gives_polling_to_sock_layer() {
        let mut c = conn_with_fd();
        let mut p = Recorder::default();
        c.flags.insert(ConnFlags::ACCEPT_PROXY);
        c.data_want_send();
        c.sock_want_recv();
        c.cond_update_polling(&mut p);
        // only the sock layer's read interest is honored mid-handshake
        assert_eq!(p.calls, vec!["want_recv"]);
        assert!(c.flags.contains(ConnFlags::CURR_RD_ENA));
        assert!(!c.flags.contains(ConnFlags::CURR_WR_ENA));
    }

    #[test]
    fn read0_transitions_are_detected() {
        let mut c = conn_with_fd();
        assert!(!c.data_read0_pending());
        c.sock_read0();
        assert!(c.data_read0_pending());
        c.data_read0();
        assert!(!c.data_read0_pending());

        c.data_shutw();
        assert!(c.sock_shutw_pending());
        c.sock_shutw();
        assert!(!c.sock_shutw_pending());
    }

    #[test]
    fn refresh_snaps_curr_from_poller() {
        let mut c = conn_with_fd();
        let mut p = Recorder::default();
        p.rd = true;
        c.flags.insert(ConnFlags::CURR_WR_ENA | ConnFlags::WAIT_RD);
        c.refresh_polling_flags(&mut p);
        assert!(c.flags.contains(ConnFlags::CURR_RD_ENA));
        assert!(!c.flags.contains(ConnFlags::CURR_WR_ENA));
        assert!(!c.flags.contains(ConnFlags::WAIT_RD));
    }
}
