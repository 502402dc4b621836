//! Directional byte pipe of a session.
//!
//! A channel pairs a ring buffer with flow flags, read/write deadlines and
//! the ordered set of analysers still to run on it. Channels never perform
//! I/O themselves; the stream interface attached at each end does.

use bitflags::bitflags;

use crate::analyser::Analysers;
use crate::buffer::{Buffer, FORWARD_INFINITE, MAX_REWRITE};
use crate::clock::{Ms, Tick};

bitflags! {
    /// Channel flags, combined into one word so state tests stay cheap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChnFlags: u32 {
        /// Producer side reported an error.
        const READ_ERROR    = 0x0000_0001;
        /// The read deadline fired.
        const READ_TIMEOUT  = 0x0000_0002;
        /// Try to read at once without waiting for a poll cycle.
        const READ_DONTWAIT = 0x0000_0004;
        /// Never arm the read deadline.
        const READ_NOEXP    = 0x0000_0008;
        /// Producer side definitely closed (read0 seen and consumed).
        const SHUTR         = 0x0000_0010;
        /// Close the producer side as soon as possible.
        const SHUTR_NOW     = 0x0000_0020;
        /// Consumer side definitely closed.
        const SHUTW         = 0x0000_0040;
        /// Close the consumer side once all pending data are flushed.
        const SHUTW_NOW     = 0x0000_0080;
        /// Consumer side reported an error.
        const WRITE_ERROR   = 0x0000_0100;
        /// The write deadline fired.
        const WRITE_TIMEOUT = 0x0000_0200;
        /// More data expected shortly; sender may corked small writes.
        const EXPECT_MORE   = 0x0000_0400;
        /// Establish the server connection as soon as data show up.
        const AUTO_CONNECT  = 0x0000_0800;
        /// Propagate SHUTR to the other side automatically.
        const AUTO_CLOSE    = 0x0000_1000;
        /// Never wait for more room or data, flush everything now.
        const NEVER_WAIT    = 0x0000_2000;
        /// Send without waiting to merge with later data.
        const SEND_DONTWAIT = 0x0000_4000;
        /// Producer looks like a fast streamer (sustained large reads).
        const STREAMER      = 0x0000_8000;
        /// Fast streamer confirmed (full reads back to back).
        const STREAMER_FAST = 0x0001_0000;
        /// A new producer was attached this wakeup.
        const READ_ATTACHED = 0x0002_0000;
        /// At least one byte was read during this wakeup.
        const READ_PARTIAL  = 0x0004_0000;
        /// At least one byte was written during this wakeup.
        const WRITE_PARTIAL = 0x0008_0000;
        /// Analyser asked to stop reading (tarpit, inspect delays).
        const DONT_READ     = 0x0010_0000;
        /// The analyser deadline fired.
        const ANA_TIMEOUT   = 0x0020_0000;
    }
}

impl ChnFlags {
    /// Events forcing another analyser pass.
    pub fn activity(self) -> bool {
        self.intersects(
            ChnFlags::READ_ATTACHED
                | ChnFlags::READ_PARTIAL
                | ChnFlags::READ_TIMEOUT
                | ChnFlags::ANA_TIMEOUT
                | ChnFlags::READ_ERROR
                | ChnFlags::SHUTR,
        )
    }
}

pub struct Channel {
    pub buf: Buffer,
    pub flags: ChnFlags,
    /// Ordered bitset of stream stages left to run on this direction.
    pub analysers: Analysers,
    /// Deadline of the analyser currently blocking the pipeline.
    pub analyse_exp: Tick,
    /// Absolute read/write expirations.
    pub rex: Tick,
    pub wex: Tick,
    /// Configured read/write timeouts.
    pub rto: Option<Ms>,
    pub wto: Option<Ms>,
}

impl Channel {
    pub fn new(size: usize) -> Channel {
        Channel {
            buf: Buffer::with_capacity(size),
            flags: ChnFlags::empty(),
            analysers: Analysers::empty(),
            analyse_exp: Tick::ETERNITY,
            rex: Tick::ETERNITY,
            wex: Tick::ETERNITY,
            rto: None,
            wto: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Full against the receive limit: while analysers are still holding
    /// the message, room is kept aside for in-place rewrites.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.recv_limit()
    }

    /// How many bytes this channel may hold right now.
    pub fn recv_limit(&self) -> usize {
        let size = self.buf.size();
        if self.analysers.is_empty() || self.buf.to_forward() == FORWARD_INFINITE {
            size
        } else {
            size.saturating_sub(MAX_REWRITE).max(1)
        }
    }

    /// Schedule `n` bytes for zero-copy forwarding.
    pub fn forward(&mut self, n: u64) {
        self.buf.forward(n);
    }

    /// Total bytes ever moved through this channel.
    pub fn total(&self) -> u64 {
        self.buf.total()
    }

    pub fn shutr_now(&mut self) {
        self.flags.insert(ChnFlags::SHUTR_NOW);
    }

    pub fn shutw_now(&mut self) {
        self.flags.insert(ChnFlags::SHUTW_NOW);
    }

    pub fn auto_connect(&mut self) {
        self.flags.insert(ChnFlags::AUTO_CONNECT);
    }

    pub fn dont_connect(&mut self) {
        self.flags.remove(ChnFlags::AUTO_CONNECT);
    }

    pub fn auto_close(&mut self) {
        self.flags.insert(ChnFlags::AUTO_CLOSE);
    }

    pub fn dont_close(&mut self) {
        self.flags.remove(ChnFlags::AUTO_CLOSE);
    }

    /// Wipe buffered data (error paths before a synthetic response).
    pub fn erase(&mut self) {
        self.buf.erase();
    }

    /// Re-arm the read deadline after read activity.
    pub fn refresh_rex(&mut self, now: Ms) {
        if self.flags.contains(ChnFlags::READ_NOEXP) {
            self.rex = Tick::ETERNITY;
        } else {
            self.rex = Tick::expire_in(now, self.rto);
        }
    }

    /// Re-arm the write deadline after write activity.
    pub fn refresh_wex(&mut self, now: Ms) {
        self.wex = Tick::expire_in(now, self.wto);
    }

    /// The channel's next deadline: the earliest of the read expiration,
    /// write expiration and analyser deadline.
    pub fn expiry(&self) -> Tick {
        let mut exp = self.analyse_exp;
        if !self.flags.contains(ChnFlags::SHUTR) {
            exp = exp.first(self.rex);
        }
        if !self.flags.contains(ChnFlags::SHUTW) {
            exp = exp.first(self.wex);
        }
        exp
    }

    /// Translate expired deadlines into event flags. Returns true when a
    /// timeout fired during this call.
    pub fn check_timeouts(&mut self, now: Ms) -> bool {
        let mut fired = false;
        if !self.flags.intersects(ChnFlags::SHUTR | ChnFlags::READ_TIMEOUT)
            && self.rex.is_expired(now)
        {
            self.flags.insert(ChnFlags::READ_TIMEOUT);
            self.rex = Tick::ETERNITY;
            fired = true;
        }
        if !self.flags.intersects(ChnFlags::SHUTW | ChnFlags::WRITE_TIMEOUT)
            && self.wex.is_expired(now)
        {
            self.flags.insert(ChnFlags::WRITE_TIMEOUT);
            self.wex = Tick::ETERNITY;
            fired = true;
        }
        if !self.flags.contains(ChnFlags::ANA_TIMEOUT) && self.analyse_exp.is_expired(now) {
            self.flags.insert(ChnFlags::ANA_TIMEOUT);
            fired = true;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_respects_rewrite_reserve() {
        let mut chn = Channel::new(2048);
        chn.analysers = Analysers::REQ_WAIT_HTTP;
        assert_eq!(chn.recv_limit(), 1024);
        chn.analysers = Analysers::empty();
        assert_eq!(chn.recv_limit(), 2048);
    }

    #[test]
    fn expiry_is_earliest_deadline() {
        let mut chn = Channel::new(64);
        chn.rex = Tick::at(300);
        chn.wex = Tick::at(200);
        chn.analyse_exp = Tick::at(250);
        assert_eq!(chn.expiry(), Tick::at(200));
        chn.flags.insert(ChnFlags::SHUTW);
        assert_eq!(chn.expiry(), Tick::at(250));
    }

    #[test]
    fn timeouts_latch_flags() {
        let mut chn = Channel::new(64);
        chn.rto = Some(100);
        chn.refresh_rex(0);
        assert!(!chn.check_timeouts(99));
        assert!(chn.check_timeouts(100));
        assert!(chn.flags.contains(ChnFlags::READ_TIMEOUT));
        // a second pass does not re-fire
        assert!(!chn.check_timeouts(500));
    }

    #[test]
    fn read_noexp_disables_read_deadline() {
        let mut chn = Channel::new(64);
        chn.rto = Some(100);
        chn.flags.insert(ChnFlags::READ_NOEXP);
        chn.refresh_rex(0);
        assert_eq!(chn.rex, Tick::ETERNITY);
    }
}
