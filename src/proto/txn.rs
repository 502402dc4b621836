//! HTTP transaction: one request/response exchange.
//!
//! A session may run several transactions back to back under keep-alive or
//! server-close; `reset` recycles the whole HTTP state while the session
//! keeps its counters and connections.

use bitflags::bitflags;
use http::Method;

use crate::proto::h1::{HdrIdx, HttpMsg};

/// Negotiated connection behavior for the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// Pass bytes both ways until both sides close; no further HTTP
    /// interpretation. The default before negotiation runs.
    Tunnel,
    KeepAlive,
    ServerClose,
    Close,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxnFlags: u32 {
        /// Connection header tokens were parsed into the HDR_CONN_* bits.
        const HDR_CONN_PRS = 0x0001;
        /// A `keep-alive` token was present.
        const HDR_CONN_KAL = 0x0002;
        /// A `close` token was present.
        const HDR_CONN_CLO = 0x0004;
        /// An `upgrade` token was present.
        const HDR_CONN_UPG = 0x0008;
        /// The outgoing header currently says keep-alive.
        const CON_KAL_SET  = 0x0010;
        /// The outgoing header currently says close.
        const CON_CLO_SET  = 0x0020;
        /// The request carried an Authorization the rules accepted.
        const AUTH_OK      = 0x0040;
        /// The response may be cached (very coarse, policy only).
        const CACHEABLE    = 0x0080;
        /// The server-facing side pretends keep-alive despite a close mode.
        const PRETEND_KAL  = 0x0100;
    }
}

pub struct Transaction {
    pub req: HttpMsg,
    pub rsp: HttpMsg,
    /// Shared header index: carries the request's headers until the
    /// response head is parsed, then the response's.
    pub hdr_idx: HdrIdx,
    pub meth: Option<Method>,
    pub status: u16,
    pub flags: TxnFlags,
    pub mode: ConnMode,
    /// Captured request line for logs and error reports.
    pub uri: Option<String>,
    pub cli_cookie: Option<String>,
    pub srv_cookie: Option<String>,
    pub sessid: Option<String>,
}

impl Transaction {
    /// `http_init_txn`: everything at its parse-ready zero state.
    pub fn new() -> Transaction {
        Transaction {
            req: HttpMsg::new_request(),
            rsp: HttpMsg::new_response(),
            hdr_idx: HdrIdx::new(),
            meth: None,
            status: 0,
            flags: TxnFlags::empty(),
            mode: ConnMode::Tunnel,
            uri: None,
            cli_cookie: None,
            srv_cookie: None,
            sessid: None,
        }
    }

    /// `http_end_txn`: release everything captured.
    pub fn end(&mut self) {
        self.uri = None;
        self.cli_cookie = None;
        self.srv_cookie = None;
        self.sessid = None;
    }

    /// `http_end_txn` + `http_init_txn`: recycle for the next request on
    /// the same session.
    pub fn reset(&mut self) {
        self.end();
        self.req.reinit(crate::proto::h1::MsgState::RqBefore);
        self.rsp.reinit(crate::proto::h1::MsgState::RpBefore);
        self.hdr_idx.reset();
        self.meth = None;
        self.status = 0;
        self.flags = TxnFlags::empty();
        self.mode = ConnMode::Tunnel;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::MsgState;

    #[test]
    fn reset_recycles_http_state() {
        let mut txn = Transaction::new();
        txn.status = 200;
        txn.meth = Some(Method::GET);
        txn.uri = Some("/x".into());
        txn.flags.insert(TxnFlags::HDR_CONN_PRS | TxnFlags::CON_KAL_SET);
        txn.mode = ConnMode::KeepAlive;
        txn.req.reinit(MsgState::Done);

        txn.reset();
        assert_eq!(txn.status, 0);
        assert!(txn.meth.is_none());
        assert!(txn.uri.is_none());
        assert!(txn.flags.is_empty());
        assert_eq!(txn.mode, ConnMode::Tunnel);
        assert_eq!(txn.req.msg_state, MsgState::RqBefore);
        assert_eq!(txn.rsp.msg_state, MsgState::RpBefore);
    }
}
