//! Connection-mode negotiation.
//!
//! The transaction mode is the meeting point of four inputs: the HTTP
//! version, the client's Connection/Proxy-Connection tokens, and the
//! frontend and backend `option http-*` settings. Tokens are parsed once
//! into `HDR_CONN_*` flags; rewrites are guarded by `CON_{KAL,CLO}_SET`
//! so a header is never re-parsed or re-written twice.

use crate::buffer::Buffer;
use crate::proto::h1::headers::{self, HdrIdx};
use crate::proto::h1::msg::{HttpMsg, MsgFlags};
use crate::proto::txn::{ConnMode, TxnFlags};
use crate::proxy::HttpPxMode;

/// Resolve the configured mode pair: the most restrictive side wins.
pub fn resolve_mode(fe: HttpPxMode, be: HttpPxMode) -> ConnMode {
    fn rank(m: HttpPxMode) -> u8 {
        match m {
            HttpPxMode::Tunnel => 0,
            HttpPxMode::KeepAlive => 1,
            HttpPxMode::ServerClose => 2,
            HttpPxMode::HttpClose => 3,
            HttpPxMode::ForceClose => 4,
        }
    }
    match rank(fe).max(rank(be)) {
        0 => ConnMode::Tunnel,
        1 => ConnMode::KeepAlive,
        2 => ConnMode::ServerClose,
        _ => ConnMode::Close,
    }
}

/// Parse every Connection and Proxy-Connection header once, returning the
/// token flags (with `HDR_CONN_PRS` latched).
pub fn parse_connection_tokens(input: &[u8], idx: &HdrIdx) -> TxnFlags {
    let mut flags = TxnFlags::HDR_CONN_PRS;
    for name in [&b"connection"[..], &b"proxy-connection"[..]] {
        let mut from = None;
        while let Some(ctx) = headers::find_header(name, input, idx, from) {
            for token in ctx.value(input).split(|&b| b == b',') {
                let token = trim(token);
                if token.eq_ignore_ascii_case(b"close") {
                    flags.insert(TxnFlags::HDR_CONN_CLO);
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    flags.insert(TxnFlags::HDR_CONN_KAL);
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    flags.insert(TxnFlags::HDR_CONN_UPG);
                }
            }
            from = Some(ctx.resume(idx));
        }
    }
    flags
}

fn trim(token: &[u8]) -> &[u8] {
    let mut a = 0;
    let mut b = token.len();
    while a < b && (token[a] == b' ' || token[a] == b'\t') {
        a += 1;
    }
    while b > a && (token[b - 1] == b' ' || token[b - 1] == b'\t') {
        b -= 1;
    }
    &token[a..b]
}

/// Fold the client's request into the configured mode: an explicit close,
/// or a 1.0 request without an explicit keep-alive, cannot be kept alive.
pub fn adjust_req_mode(mode: ConnMode, msg_flags: MsgFlags, tokens: TxnFlags) -> ConnMode {
    match mode {
        ConnMode::KeepAlive | ConnMode::ServerClose => {
            let clo = tokens.contains(TxnFlags::HDR_CONN_CLO)
                || (!msg_flags.contains(MsgFlags::VER_11)
                    && !tokens.contains(TxnFlags::HDR_CONN_KAL));
            if clo {
                ConnMode::Close
            } else {
                mode
            }
        }
        other => other,
    }
}

/// Fold the server's response in: a close from the server downgrades
/// keep-alive to server-close, and an unknown transfer length forces a
/// hard close (the only end-of-message signal left is the FIN).
pub fn adjust_res_mode(mode: ConnMode, msg_flags: MsgFlags, tokens: TxnFlags) -> ConnMode {
    if !msg_flags.contains(MsgFlags::XFER_LEN) {
        return ConnMode::Close;
    }
    if mode == ConnMode::KeepAlive {
        let srv_close = tokens.contains(TxnFlags::HDR_CONN_CLO)
            || (!msg_flags.contains(MsgFlags::VER_11)
                && !tokens.contains(TxnFlags::HDR_CONN_KAL));
        if srv_close {
            return ConnMode::ServerClose;
        }
    }
    mode
}

/// What the rewritten header must say on a given side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantHdr {
    KeepAlive,
    Close,
    /// Tunnel: leave the message untouched.
    Leave,
}

/// The header wanted on the server-facing request.
pub fn want_req_header(mode: ConnMode, pretend_keepalive: bool) -> WantHdr {
    match mode {
        ConnMode::Tunnel => WantHdr::Leave,
        ConnMode::KeepAlive => WantHdr::KeepAlive,
        ConnMode::ServerClose | ConnMode::Close => {
            // fake keep-alive only ever applies to the server-facing side
            if pretend_keepalive {
                WantHdr::KeepAlive
            } else {
                WantHdr::Close
            }
        }
    }
}

/// The header wanted on the client-facing response.
pub fn want_res_header(mode: ConnMode) -> WantHdr {
    match mode {
        ConnMode::Tunnel => WantHdr::Leave,
        ConnMode::KeepAlive | ConnMode::ServerClose => WantHdr::KeepAlive,
        ConnMode::Close => WantHdr::Close,
    }
}

/// Rewrite the message's Connection header to say exactly `want`: all
/// Connection/Proxy-Connection occurrences are removed, then a single
/// canonical header is appended. Bookkeeping flags make re-entry free.
/// Returns false when the buffer has no room for the rewrite.
pub fn set_connection_header(
    want: WantHdr,
    buf: &mut Buffer,
    idx: &mut HdrIdx,
    msg: &mut HttpMsg,
    txn_flags: &mut TxnFlags,
) -> bool {
    let (target, set_flag) = match want {
        WantHdr::Leave => return true,
        WantHdr::KeepAlive => (&b"Connection: keep-alive"[..], TxnFlags::CON_KAL_SET),
        WantHdr::Close => (&b"Connection: close"[..], TxnFlags::CON_CLO_SET),
    };
    if txn_flags.contains(set_flag) {
        return true;
    }

    for name in [&b"connection"[..], &b"proxy-connection"[..]] {
        let mut from = None;
        loop {
            let input = buf.input_contiguous().to_vec();
            let ctx = match headers::find_header(name, &input, idx, from) {
                Some(ctx) => ctx,
                None => break,
            };
            let (_, resume) = headers::remove_header(&ctx, buf, idx, msg);
            from = Some(resume);
        }
    }
    if headers::append_header(target, buf, idx, msg).is_none() {
        return false;
    }
    txn_flags.remove(TxnFlags::CON_KAL_SET | TxnFlags::CON_CLO_SET);
    txn_flags.insert(set_flag);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::parse::parse_message;

    #[test]
    fn most_restrictive_side_wins() {
        use HttpPxMode::*;
        assert_eq!(resolve_mode(Tunnel, Tunnel), ConnMode::Tunnel);
        assert_eq!(resolve_mode(KeepAlive, Tunnel), ConnMode::KeepAlive);
        assert_eq!(resolve_mode(KeepAlive, ServerClose), ConnMode::ServerClose);
        assert_eq!(resolve_mode(ServerClose, KeepAlive), ConnMode::ServerClose);
        assert_eq!(resolve_mode(HttpClose, KeepAlive), ConnMode::Close);
        assert_eq!(resolve_mode(Tunnel, ForceClose), ConnMode::Close);
    }

    fn msg_flags(ver11: bool) -> MsgFlags {
        if ver11 {
            MsgFlags::VER_11 | MsgFlags::XFER_LEN
        } else {
            MsgFlags::XFER_LEN
        }
    }

    #[test]
    fn negotiation_matrix() {
        // (ver11, close token, keep-alive token, configured) -> expected
        let cases = [
            (true, false, false, ConnMode::KeepAlive, ConnMode::KeepAlive),
            (true, true, false, ConnMode::KeepAlive, ConnMode::Close),
            (true, false, true, ConnMode::KeepAlive, ConnMode::KeepAlive),
            (true, true, true, ConnMode::KeepAlive, ConnMode::Close),
            (false, false, false, ConnMode::KeepAlive, ConnMode::Close),
            (false, false, true, ConnMode::KeepAlive, ConnMode::KeepAlive),
            (false, true, true, ConnMode::KeepAlive, ConnMode::Close),
            (true, false, false, ConnMode::ServerClose, ConnMode::ServerClose),
            (false, false, false, ConnMode::ServerClose, ConnMode::Close),
            (false, false, true, ConnMode::ServerClose, ConnMode::ServerClose),
            (true, true, false, ConnMode::ServerClose, ConnMode::Close),
            (true, false, false, ConnMode::Close, ConnMode::Close),
            (true, false, true, ConnMode::Close, ConnMode::Close),
            (true, false, false, ConnMode::Tunnel, ConnMode::Tunnel),
            (false, true, false, ConnMode::Tunnel, ConnMode::Tunnel),
        ];
        for (ver11, clo, kal, cfg, expected) in cases {
            let mut tokens = TxnFlags::HDR_CONN_PRS;
            if clo {
                tokens.insert(TxnFlags::HDR_CONN_CLO);
            }
            if kal {
                tokens.insert(TxnFlags::HDR_CONN_KAL);
            }
            assert_eq!(
                adjust_req_mode(cfg, msg_flags(ver11), tokens),
                expected,
                "ver11={} clo={} kal={} cfg={:?}",
                ver11,
                clo,
                kal,
                cfg
            );
        }
    }

    #[test]
    fn unknown_transfer_length_forces_close() {
        let tokens = TxnFlags::HDR_CONN_PRS | TxnFlags::HDR_CONN_KAL;
        assert_eq!(
            adjust_res_mode(ConnMode::KeepAlive, MsgFlags::VER_11, tokens),
            ConnMode::Close
        );
    }

    #[test]
    fn server_close_token_downgrades_keepalive() {
        let tokens = TxnFlags::HDR_CONN_PRS | TxnFlags::HDR_CONN_CLO;
        assert_eq!(
            adjust_res_mode(
                ConnMode::KeepAlive,
                MsgFlags::VER_11 | MsgFlags::XFER_LEN,
                tokens
            ),
            ConnMode::ServerClose
        );
        // but server-close stays server-close
        assert_eq!(
            adjust_res_mode(
                ConnMode::ServerClose,
                MsgFlags::VER_11 | MsgFlags::XFER_LEN,
                tokens
            ),
            ConnMode::ServerClose
        );
    }

    fn parsed(raw: &[u8]) -> (Buffer, HttpMsg, HdrIdx) {
        let mut buf = Buffer::with_capacity(1024);
        buf.put_slice(raw);
        let mut msg = HttpMsg::new_request();
        let mut idx = HdrIdx::new();
        parse_message(&mut buf, &mut msg, &mut idx);
        assert!(msg.head_complete());
        (buf, msg, idx)
    }

    #[test]
    fn tokens_parse_across_headers() {
        let (buf, _msg, idx) = parsed(
            b"GET / HTTP/1.0\r\nConnection: Keep-Alive, Upgrade\r\nProxy-Connection: close\r\n\r\n",
        );
        let flags = parse_connection_tokens(buf.input_contiguous(), &idx);
        assert!(flags.contains(TxnFlags::HDR_CONN_PRS));
        assert!(flags.contains(TxnFlags::HDR_CONN_KAL));
        assert!(flags.contains(TxnFlags::HDR_CONN_UPG));
        assert!(flags.contains(TxnFlags::HDR_CONN_CLO));
    }

    #[test]
    fn rewrite_leaves_exactly_one_token() {
        let (mut buf, mut msg, mut idx) = parsed(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\n\r\n",
        );
        let mut flags = TxnFlags::empty();
        assert!(set_connection_header(
            WantHdr::Close,
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags
        ));
        assert!(flags.contains(TxnFlags::CON_CLO_SET));
        let input = buf.input_contiguous().to_vec();
        let hit = headers::find_header(b"connection", &input, &idx, None).expect("one header");
        assert_eq!(hit.value(&input), b"close");
        assert!(headers::find_header(b"connection", &input, &idx, Some(hit.resume(&idx))).is_none());
        assert!(headers::find_header(b"proxy-connection", &input, &idx, None).is_none());

        // bookkeeping short-circuits the second call
        let before = buf.input_contiguous().to_vec();
        assert!(set_connection_header(
            WantHdr::Close,
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags
        ));
        assert_eq!(buf.input_contiguous(), &before[..]);
    }

    #[test]
    fn fake_keepalive_applies_to_server_side_only() {
        assert_eq!(want_req_header(ConnMode::Close, true), WantHdr::KeepAlive);
        assert_eq!(want_req_header(ConnMode::Close, false), WantHdr::Close);
        // the client-facing side never sees the pretence
        assert_eq!(want_res_header(ConnMode::Close), WantHdr::Close);
        assert_eq!(want_res_header(ConnMode::ServerClose), WantHdr::KeepAlive);
    }
}
