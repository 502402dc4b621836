//! Stream interface: the endpoint of a channel pair.
//!
//! A stream interface either fronts a connection (bytes move through a
//! transport) or embeds an applet (bytes move in process). Either way it
//! owns the endpoint state machine `INI → … → EST → DIS → CLO` and the
//! half-close choreography between its two channels: `ib` is the channel
//! it produces into, `ob` the channel it consumes from.

use bitflags::bitflags;

use crate::applet::Applet;
use crate::channel::{Channel, ChnFlags};
use crate::clock::{Ms, Tick};
use crate::connection::Connection;

/// Endpoint states. Ordering is part of the contract: `>= Est` means
/// traffic may flow, `< Est` means the endpoint is still being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiState {
    /// Not started yet (server side at session birth).
    Ini,
    /// Want a connection: a server must be picked.
    Req,
    /// Server chosen but saturated; waiting in its queue.
    Que,
    /// Cooldown before retrying (turn-around after a failure or a queue
    /// expiration).
    Tar,
    /// Server assigned, connect not issued yet.
    Ass,
    /// connect() in progress.
    Con,
    /// connect() failed, retries remain.
    Cer,
    /// Connection established, traffic flows.
    Est,
    /// One side finished, tearing down.
    Dis,
    /// Fully closed.
    Clo,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SiFlags: u32 {
        /// An error was reported at this endpoint.
        const ERR       = 0x0001;
        /// The endpoint's own expiration fired.
        const EXP       = 0x0002;
        /// Close abruptly, do not linger on pending data.
        const NOLINGER  = 0x0004;
        /// Half-open is forbidden: a read shutdown forces the write side.
        const NOHALF    = 0x0008;
        /// Read and write timeouts are independent.
        const INDEP_STR = 0x0010;
        /// The source address must be retrieved before logging.
        const SRC_ADDR  = 0x0020;
        /// Do not wake the session up on activity (applet internals).
        const DONT_WAKE = 0x0040;
        /// Blocked: no room in the input channel.
        const WAIT_ROOM = 0x0080;
        /// Blocked: nothing to consume in the output channel.
        const WAIT_DATA = 0x0100;
    }
}

/// Where an endpoint error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiErr {
    None,
    /// Waited too long in the server queue.
    QueueTo,
    /// Aborted while queued.
    QueueAbrt,
    /// connect() timed out.
    ConnTo,
    /// connect() failed.
    ConnErr,
    /// Aborted while connecting.
    ConnAbrt,
    /// No resource (no server, no memory).
    ConnRes,
    /// Anything else.
    ConnOther,
    Internal,
}

pub enum Endpoint {
    None,
    Conn(Connection),
    Applet(Box<dyn Applet>),
}

pub struct StreamInterface {
    pub state: SiState,
    pub prev_state: SiState,
    pub flags: SiFlags,
    pub err_type: SiErr,
    pub endpoint: Endpoint,
    /// Endpoint-level expiration (connect and queue timeouts).
    pub exp: Tick,
    pub conn_retries: u32,
    /// Offset into the PROXY line already sent, when one is owed.
    pub send_proxy_ofs: Option<usize>,
}

impl StreamInterface {
    pub fn new(state: SiState) -> StreamInterface {
        StreamInterface {
            state,
            prev_state: state,
            flags: SiFlags::empty(),
            err_type: SiErr::None,
            endpoint: Endpoint::None,
            exp: Tick::ETERNITY,
            conn_retries: 0,
            send_proxy_ofs: None,
        }
    }

    pub fn conn(&self) -> Option<&Connection> {
        match self.endpoint {
            Endpoint::Conn(ref c) => Some(c),
            _ => None,
        }
    }

    pub fn conn_mut(&mut self) -> Option<&mut Connection> {
        match self.endpoint {
            Endpoint::Conn(ref mut c) => Some(c),
            _ => None,
        }
    }

    pub fn is_applet(&self) -> bool {
        matches!(self.endpoint, Endpoint::Applet(_))
    }

    pub fn report_error(&mut self) {
        self.flags.insert(SiFlags::ERR);
        if self.err_type == SiErr::None {
            self.err_type = SiErr::ConnOther;
        }
    }
}

/// Propagate a read shutdown seen on this endpoint into its channels.
pub fn si_shutr(si: &mut StreamInterface, ib: &mut Channel, ob: &mut Channel) {
    ib.flags.remove(ChnFlags::SHUTR_NOW);
    if ib.flags.contains(ChnFlags::SHUTR) {
        return;
    }
    ib.flags.insert(ChnFlags::SHUTR);
    ib.rex = Tick::ETERNITY;
    si.flags.remove(SiFlags::WAIT_ROOM);

    if si.state != SiState::Est && si.state != SiState::Con {
        return;
    }
    if let Endpoint::Conn(ref mut c) = si.endpoint {
        c.data_read0();
    }
    if ob.flags.contains(ChnFlags::SHUTW) {
        si.state = SiState::Dis;
        si.exp = Tick::ETERNITY;
    } else if si.flags.contains(SiFlags::NOHALF) {
        si_shutw(si, ib, ob);
    } else if let Endpoint::Conn(ref mut c) = si.endpoint {
        c.data_stop_recv();
    }
}

/// Shut this endpoint's write side once its output channel is done.
pub fn si_shutw(si: &mut StreamInterface, ib: &mut Channel, ob: &mut Channel) {
    ob.flags.remove(ChnFlags::SHUTW_NOW);
    if ob.flags.contains(ChnFlags::SHUTW) {
        return;
    }
    ob.flags.insert(ChnFlags::SHUTW);
    ob.wex = Tick::ETERNITY;
    si.flags.remove(SiFlags::WAIT_DATA);

    match si.state {
        SiState::Est => {
            // Shut before closing, otherwise short messages may never
            // leave the system. Lingering is skipped on error or when the
            // read side is already done with this endpoint.
            let linger = !si.flags.intersects(SiFlags::ERR | SiFlags::NOLINGER)
                && !ib.flags.intersects(ChnFlags::SHUTR | ChnFlags::DONT_READ);
            if let Endpoint::Conn(ref mut c) = si.endpoint {
                c.data_shutw();
                if let Some(ref mut x) = c.xprt {
                    x.shutw(linger);
                }
            }
            if linger {
                return; // keep reading until the peer's read0
            }
            si.state = SiState::Dis;
        }
        SiState::Con | SiState::Cer | SiState::Que | SiState::Tar => {
            // unestablished endpoint: nothing to linger on
            si.state = SiState::Dis;
        }
        _ => {}
    }
    si.flags.remove(SiFlags::NOLINGER);
    ib.flags.remove(ChnFlags::SHUTR_NOW);
    ib.flags.insert(ChnFlags::SHUTR);
    ib.rex = Tick::ETERNITY;
    si.exp = Tick::ETERNITY;
}

/// The peer closed its sending side: consume the read0.
pub fn si_read0(si: &mut StreamInterface, ib: &mut Channel, ob: &mut Channel) {
    if let Endpoint::Conn(ref mut c) = si.endpoint {
        c.sock_read0();
    }
    si_shutr(si, ib, ob);
}

/// Notify this endpoint that room appeared in its input channel.
pub fn si_chk_rcv(si: &mut StreamInterface, ib: &mut Channel) {
    if ib.flags.contains(ChnFlags::SHUTR) {
        return;
    }
    if ib.is_full() || ib.flags.contains(ChnFlags::DONT_READ) {
        si.flags.insert(SiFlags::WAIT_ROOM);
        if let Endpoint::Conn(ref mut c) = si.endpoint {
            c.data_stop_recv();
        }
    } else {
        si.flags.remove(SiFlags::WAIT_ROOM);
        if let Endpoint::Conn(ref mut c) = si.endpoint {
            c.data_want_recv();
        }
    }
}

/// Notify this endpoint that data showed up in its output channel.
pub fn si_chk_snd(si: &mut StreamInterface, ob: &mut Channel) {
    if ob.flags.contains(ChnFlags::SHUTW) {
        return;
    }
    if ob.buf.output_len() == 0 {
        si.flags.insert(SiFlags::WAIT_DATA);
        if let Endpoint::Conn(ref mut c) = si.endpoint {
            c.data_stop_send();
        }
    } else {
        si.flags.remove(SiFlags::WAIT_DATA);
        if let Endpoint::Conn(ref mut c) = si.endpoint {
            c.data_want_send();
        }
    }
}

/// Refresh the data layer's polling intent from the channel states. Run
/// once per wakeup for each side after the analysers.
pub fn si_update(si: &mut StreamInterface, ib: &mut Channel, ob: &mut Channel) {
    if si.state != SiState::Est {
        return;
    }
    si_chk_rcv(si, ib);
    si_chk_snd(si, ob);
}

/// Outcome of one I/O pass against the endpoint's transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoReport {
    pub read0: bool,
    pub error: bool,
}

/// Pull bytes from the connection into the input channel.
pub fn si_conn_recv(si: &mut StreamInterface, ib: &mut Channel, now: Ms) -> IoReport {
    let mut report = IoReport::default();
    if ib.flags.intersects(ChnFlags::SHUTR) {
        return report;
    }
    if ib.flags.contains(ChnFlags::DONT_READ) {
        if let Endpoint::Conn(ref mut c) = si.endpoint {
            c.data_stop_recv();
        }
        return report;
    }
    let limit = ib.recv_limit();
    let conn = match si.endpoint {
        Endpoint::Conn(ref mut c) => c,
        _ => return report,
    };
    if conn.has_error() {
        report.error = true;
        return report;
    }
    if ib.buf.len() >= limit {
        si.flags.insert(SiFlags::WAIT_ROOM);
        conn.data_stop_recv();
        return report;
    }
    let xprt = match conn.xprt {
        Some(ref mut x) => x,
        None => return report,
    };
    match xprt.rcv_buf(&mut ib.buf, limit) {
        Ok(ev) => {
            if ev.bytes > 0 {
                ib.flags.insert(ChnFlags::READ_PARTIAL);
                ib.refresh_rex(now);
            }
            if ev.blocked {
                conn.data_poll_recv();
            }
            if ev.eof {
                report.read0 = true;
            }
            if ib.buf.len() >= limit {
                si.flags.insert(SiFlags::WAIT_ROOM);
                conn.data_stop_recv();
            }
        }
        Err(err) => {
            tracing::debug!("recv error on {:?}: {}", conn.target, err);
            conn.set_error();
            report.error = true;
        }
    }
    report
}

/// Push the output channel's committed bytes into the connection.
pub fn si_conn_send(si: &mut StreamInterface, ob: &mut Channel, now: Ms) -> IoReport {
    let mut report = IoReport::default();
    if ob.flags.contains(ChnFlags::SHUTW) {
        return report;
    }
    let conn = match si.endpoint {
        Endpoint::Conn(ref mut c) => c,
        _ => return report,
    };
    if conn.has_error() {
        report.error = true;
        return report;
    }
    if ob.buf.output_len() == 0 {
        return report;
    }
    let xprt = match conn.xprt {
        Some(ref mut x) => x,
        None => return report,
    };
    match xprt.snd_buf(&mut ob.buf) {
        Ok(ev) => {
            if ev.bytes > 0 {
                ob.flags.insert(ChnFlags::WRITE_PARTIAL);
                ob.refresh_wex(now);
            }
            if ev.blocked && ob.buf.output_len() > 0 {
                conn.data_poll_send();
            }
        }
        Err(err) => {
            tracing::debug!("send error on {:?}: {}", conn.target, err);
            conn.set_error();
            report.error = true;
        }
    }
    report
}

/// Abort the request side and schedule a synthesized message toward the
/// client, then let the session run its normal close path. `ib`/`ob` are
/// the client interface's channels (request and response).
pub fn si_retnclose(ib: &mut Channel, ob: &mut Channel, now: Ms, msg: &[u8]) {
    ib.flags.insert(ChnFlags::AUTO_CLOSE | ChnFlags::SHUTR_NOW | ChnFlags::SHUTW_NOW);
    ib.erase();
    ib.analysers = crate::analyser::Analysers::empty();

    ob.analysers = crate::analyser::Analysers::empty();
    ob.erase();
    ob.flags.insert(ChnFlags::AUTO_CLOSE);
    ob.shutr_now();
    if !msg.is_empty() && !ob.buf.put_output(msg) {
        tracing::debug!("synthesized message truncated, buffer too small");
    }
    ob.refresh_wex(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::{MemXprt, Xprt};
    use crate::connection::{Connection, Target};

    fn conn_si(state: SiState) -> (StreamInterface, MemXprt) {
        let (mine, theirs) = MemXprt::pair();
        let mut conn = Connection::new(Target::None);
        conn.prepare(None, Xprt::Mem(mine), None);
        let mut si = StreamInterface::new(state);
        si.endpoint = Endpoint::Conn(conn);
        (si, theirs)
    }

    #[test]
    fn recv_moves_bytes_and_reports_read0() {
        let (mut si, peer) = conn_si(SiState::Est);
        let mut ib = Channel::new(256);
        peer.feed(b"hello");
        let rep = si_conn_recv(&mut si, &mut ib, 5);
        assert_eq!(ib.buf.input_len(), 5);
        assert!(ib.flags.contains(ChnFlags::READ_PARTIAL));
        assert!(!rep.read0);

        // peer closes: next pass reports read0
        peer.close_write();
        let rep = si_conn_recv(&mut si, &mut ib, 6);
        assert!(rep.read0);
    }

    #[test]
    fn read0_with_shut_output_disables_endpoint() {
        let (mut si, _peer) = conn_si(SiState::Est);
        let mut ib = Channel::new(64);
        let mut ob = Channel::new(64);
        ob.flags.insert(ChnFlags::SHUTW);
        si_read0(&mut si, &mut ib, &mut ob);
        assert!(ib.flags.contains(ChnFlags::SHUTR));
        assert_eq!(si.state, SiState::Dis);
    }

    #[test]
    fn nohalf_forwards_read0_to_write_side() {
        let (mut si, _peer) = conn_si(SiState::Est);
        si.flags.insert(SiFlags::NOHALF);
        let mut ib = Channel::new(64);
        let mut ob = Channel::new(64);
        si_read0(&mut si, &mut ib, &mut ob);
        assert!(ib.flags.contains(ChnFlags::SHUTR));
        assert!(ob.flags.contains(ChnFlags::SHUTW));
        assert_eq!(si.state, SiState::Dis);
    }

    #[test]
    fn shutw_in_est_lingers_until_read0() {
        let (mut si, _peer) = conn_si(SiState::Est);
        let mut ib = Channel::new(64);
        let mut ob = Channel::new(64);
        si_shutw(&mut si, &mut ib, &mut ob);
        assert!(ob.flags.contains(ChnFlags::SHUTW));
        // lingering: still established, read side still open
        assert_eq!(si.state, SiState::Est);
        assert!(!ib.flags.contains(ChnFlags::SHUTR));
    }

    #[test]
    fn shutw_while_connecting_tears_down() {
        let (mut si, _peer) = conn_si(SiState::Con);
        let mut ib = Channel::new(64);
        let mut ob = Channel::new(64);
        si_shutw(&mut si, &mut ib, &mut ob);
        assert_eq!(si.state, SiState::Dis);
        assert!(ib.flags.contains(ChnFlags::SHUTR));
    }

    #[test]
    fn update_translates_channel_state_to_conn_intent() {
        use crate::connection::ConnFlags;
        let (mut si, peer) = conn_si(SiState::Est);
        let mut ib = Channel::new(64);
        let mut ob = Channel::new(64);
        si_update(&mut si, &mut ib, &mut ob);
        let flags = si.conn().unwrap().flags;
        assert!(flags.contains(ConnFlags::DATA_RD_ENA));
        assert!(!flags.contains(ConnFlags::DATA_WR_ENA));
        assert!(si.flags.contains(SiFlags::WAIT_DATA));

        ob.buf.put_slice(b"x");
        ob.buf.advance(1);
        si_update(&mut si, &mut ib, &mut ob);
        assert!(si.conn().unwrap().flags.contains(ConnFlags::DATA_WR_ENA));
        let _ = peer;
    }
}
