//! PROXY protocol v1: a single textual preamble disclosing the original
//! client addresses.
//!
//! Receive uses peek-then-consume: the whole line is validated from a
//! `MSG_PEEK` view, then exactly the line length is drained. Send emits the
//! line in one write; the caller guarantees it goes out before any data
//! byte. Either way the line never wraps and never mixes with payload.

use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::connection::{ConnErr, ConnFlags, Connection};

/// Longest possible v1 line, CRLF included.
pub const MAX_LINE: usize = 107;

/// Result of validating a peeked byte window.
#[derive(Debug, PartialEq)]
pub enum Parsed {
    /// A full line was validated; consume exactly `len` bytes.
    Done {
        len: usize,
        addrs: Option<(SocketAddr, SocketAddr)>,
    },
    /// The line is not complete yet; peek again once more data arrive.
    Incomplete,
    Failed(ConnErr),
}

/// Progress of the connection-level handshake driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsStatus {
    Done,
    Wait,
    Failed,
}

fn token(buf: &[u8], at: usize, tok: &[u8]) -> Option<bool> {
    let avail = buf.len().saturating_sub(at);
    let n = avail.min(tok.len());
    if buf[at..at + n] != tok[..n] {
        return Some(false);
    }
    if n < tok.len() {
        return None; // prefix matches but more bytes needed
    }
    Some(true)
}

fn parse_port(buf: &[u8], at: &mut usize) -> Result<u16, ConnErr> {
    let start = *at;
    let mut val: u32 = 0;
    while *at < buf.len() && buf[*at].is_ascii_digit() {
        val = val * 10 + u32::from(buf[*at] - b'0');
        if val > 65535 {
            return Err(ConnErr::PrxBadHdr);
        }
        *at += 1;
    }
    if *at == start {
        return Err(ConnErr::PrxBadHdr);
    }
    Ok(val as u16)
}

fn parse_ip<T: std::str::FromStr>(buf: &[u8], at: &mut usize) -> Result<T, ConnErr> {
    let start = *at;
    while *at < buf.len() && buf[*at] != b' ' && buf[*at] != b'\r' {
        *at += 1;
    }
    std::str::from_utf8(&buf[start..*at])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ConnErr::PrxBadHdr)
}

fn expect(buf: &[u8], at: &mut usize, b: u8) -> Result<(), ConnErr> {
    if buf.get(*at) != Some(&b) {
        return Err(ConnErr::PrxBadHdr);
    }
    *at += 1;
    Ok(())
}

/// Validate a peeked window against the v1 grammar.
pub fn parse_line(buf: &[u8]) -> Parsed {
    match token(buf, 0, b"PROXY ") {
        Some(false) => return Parsed::Failed(ConnErr::PrxNotHdr),
        None => return Parsed::Incomplete,
        Some(true) => {}
    }

    // a complete line always ends in CRLF within the size cap
    let eol = buf
        .windows(2)
        .take(MAX_LINE - 1)
        .position(|w| w == b"\r\n");
    let eol = match eol {
        Some(pos) => pos,
        None if buf.len() >= MAX_LINE => return Parsed::Failed(ConnErr::PrxBadHdr),
        None => return Parsed::Incomplete,
    };
    let line = &buf[..eol];
    let len = eol + 2;

    let mut at = 6;
    let v4 = match token(line, at, b"TCP4 ") {
        Some(true) => true,
        Some(false) => match token(line, at, b"TCP6 ") {
            Some(true) => false,
            Some(false) => {
                return match token(line, at, b"UNKNOWN") {
                    // UNKNOWN may be followed by anything up to CRLF
                    Some(true) => Parsed::Done { len, addrs: None },
                    _ => Parsed::Failed(ConnErr::PrxBadProto),
                };
            }
            None => return Parsed::Failed(ConnErr::PrxBadProto),
        },
        None => return Parsed::Failed(ConnErr::PrxBadProto),
    };
    at += 5;

    let res = if v4 {
        parse_v4(line, &mut at)
    } else {
        parse_v6(line, &mut at)
    };
    match res {
        Ok((src, dst)) if at == line.len() => Parsed::Done {
            len,
            addrs: Some((src, dst)),
        },
        Ok(_) => Parsed::Failed(ConnErr::PrxBadHdr),
        Err(code) => Parsed::Failed(code),
    }
}

fn parse_v4(line: &[u8], at: &mut usize) -> Result<(SocketAddr, SocketAddr), ConnErr> {
    let src: std::net::Ipv4Addr = parse_ip(line, at)?;
    expect(line, at, b' ')?;
    let dst: std::net::Ipv4Addr = parse_ip(line, at)?;
    expect(line, at, b' ')?;
    let sport = parse_port(line, at)?;
    expect(line, at, b' ')?;
    let dport = parse_port(line, at)?;
    Ok((
        SocketAddr::new(src.into(), sport),
        SocketAddr::new(dst.into(), dport),
    ))
}

fn parse_v6(line: &[u8], at: &mut usize) -> Result<(SocketAddr, SocketAddr), ConnErr> {
    let src: std::net::Ipv6Addr = parse_ip(line, at)?;
    expect(line, at, b' ')?;
    let dst: std::net::Ipv6Addr = parse_ip(line, at)?;
    expect(line, at, b' ')?;
    let sport = parse_port(line, at)?;
    expect(line, at, b' ')?;
    let dport = parse_port(line, at)?;
    Ok((
        SocketAddr::new(src.into(), sport),
        SocketAddr::new(dst.into(), dport),
    ))
}

/// Build the egress line for a connection. Mismatched or missing families
/// degrade to `UNKNOWN`, as the protocol requires.
pub fn make_line(src: Option<SocketAddr>, dst: Option<SocketAddr>) -> String {
    let mut out = String::with_capacity(MAX_LINE);
    match (src, dst) {
        (Some(SocketAddr::V4(s)), Some(SocketAddr::V4(d))) => {
            let _ = write!(
                out,
                "PROXY TCP4 {} {} {} {}\r\n",
                s.ip(),
                d.ip(),
                s.port(),
                d.port()
            );
        }
        (Some(SocketAddr::V6(s)), Some(SocketAddr::V6(d))) => {
            let _ = write!(
                out,
                "PROXY TCP6 {} {} {} {}\r\n",
                s.ip(),
                d.ip(),
                s.port(),
                d.port()
            );
        }
        _ => out.push_str("PROXY UNKNOWN\r\n"),
    }
    out
}

/// Drive the ingress handshake on a connection expecting a PROXY line.
/// On success the peer addresses are installed and `ACCEPT_PROXY` clears;
/// on failure both directions stop and the error code is recorded.
pub fn recv_proxy(conn: &mut Connection) -> HsStatus {
    if conn.flags.contains(ConnFlags::SOCK_RD_SH) {
        return fail(conn, ConnErr::PrxAbort);
    }

    let mut window = [0u8; MAX_LINE];
    let ev = {
        let xprt = match conn.xprt.as_mut() {
            Some(x) => x,
            None => return fail(conn, ConnErr::PrxAbort),
        };
        match xprt.peek(&mut window) {
            Ok(ev) => ev,
            Err(_) => return fail(conn, ConnErr::PrxAbort),
        }
    };

    if ev.blocked {
        conn.sock_poll_recv();
        return HsStatus::Wait;
    }
    if ev.bytes == 0 && ev.eof {
        return fail(conn, ConnErr::PrxEmpty);
    }

    match parse_line(&window[..ev.bytes]) {
        Parsed::Done { len, addrs } => {
            if conn
                .xprt
                .as_mut()
                .map(|x| x.drain(len).is_err())
                .unwrap_or(true)
            {
                return fail(conn, ConnErr::PrxAbort);
            }
            if let Some((from, to)) = addrs {
                conn.set_addr_from(from);
                conn.set_addr_to(to);
            }
            conn.flags.remove(ConnFlags::ACCEPT_PROXY);
            conn.sock_stop_recv();
            HsStatus::Done
        }
        Parsed::Incomplete => {
            if ev.eof {
                return fail(conn, ConnErr::PrxTruncated);
            }
            conn.sock_poll_recv();
            HsStatus::Wait
        }
        Parsed::Failed(code) => fail(conn, code),
    }
}

/// Drive the egress handshake: send the whole line, resuming at `ofs`
/// after a short write.
pub fn send_proxy(conn: &mut Connection, ofs: &mut usize) -> HsStatus {
    let line = make_line(conn.addr_from, conn.addr_to);
    let bytes = line.as_bytes();
    debug_assert!(*ofs <= bytes.len());

    let xprt = match conn.xprt.as_mut() {
        Some(x) => x,
        None => return fail(conn, ConnErr::PrxAbort),
    };
    match xprt.snd_raw(&bytes[*ofs..]) {
        Ok(ev) => {
            *ofs += ev.bytes;
            if *ofs == bytes.len() {
                conn.flags.remove(ConnFlags::SI_SEND_PROXY);
                conn.sock_stop_send();
                HsStatus::Done
            } else {
                conn.sock_poll_send();
                HsStatus::Wait
            }
        }
        Err(_) => fail(conn, ConnErr::PrxAbort),
    }
}

fn fail(conn: &mut Connection, code: ConnErr) -> HsStatus {
    conn.sock_stop_both();
    conn.set_error();
    conn.err_code = code;
    conn.flags
        .remove(ConnFlags::ACCEPT_PROXY | ConnFlags::SI_SEND_PROXY);
    HsStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(parsed: Parsed) -> (usize, SocketAddr, SocketAddr) {
        match parsed {
            Parsed::Done {
                len,
                addrs: Some((f, t)),
            } => (len, f, t),
            other => panic!("expected Done with addrs, got {:?}", other),
        }
    }

    #[test]
    fn tcp4_line_parses_and_consumes_exactly() {
        let line = b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\nGET /";
        let (len, from, to) = addrs(parse_line(line));
        assert_eq!(len, 38);
        assert_eq!(from, "1.2.3.4:1111".parse().unwrap());
        assert_eq!(to, "5.6.7.8:2222".parse().unwrap());
    }

    #[test]
    fn tcp6_line_parses() {
        let (len, from, to) = addrs(parse_line(b"PROXY TCP6 ::1 ::2 65535 1\r\n"));
        assert_eq!(len, 28);
        assert_eq!(from, "[::1]:65535".parse().unwrap());
        assert_eq!(to, "[::2]:1".parse().unwrap());
    }

    #[test]
    fn bad_port_is_rejected() {
        assert_eq!(
            parse_line(b"PROXY TCP4 1.2.3.4 5.6.7.8 111a 222\r\n"),
            Parsed::Failed(ConnErr::PrxBadHdr)
        );
    }

    #[test]
    fn port_overflow_is_rejected() {
        assert_eq!(
            parse_line(b"PROXY TCP4 1.2.3.4 5.6.7.8 65536 1\r\n"),
            Parsed::Failed(ConnErr::PrxBadHdr)
        );
    }

    #[test]
    fn unknown_family_is_accepted_without_addrs() {
        match parse_line(b"PROXY UNKNOWN\r\n") {
            Parsed::Done { len: 15, addrs: None } => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse_line(b"PROXY UNKNOWN ignored junk\r\n") {
            Parsed::Done { addrs: None, .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_not_a_header() {
        assert_eq!(
            parse_line(b"GET / HTTP/1.0\r\n"),
            Parsed::Failed(ConnErr::PrxNotHdr)
        );
    }

    #[test]
    fn unknown_protocol_token() {
        assert_eq!(
            parse_line(b"PROXY UDP4 1.2.3.4 5.6.7.8 1 2\r\n"),
            Parsed::Failed(ConnErr::PrxBadProto)
        );
    }

    #[test]
    fn short_windows_ask_for_more() {
        assert_eq!(parse_line(b"PRO"), Parsed::Incomplete);
        assert_eq!(parse_line(b"PROXY TCP4 1.2.3.4"), Parsed::Incomplete);
    }

    #[test]
    fn oversized_line_fails() {
        let mut line = b"PROXY TCP4 ".to_vec();
        line.extend(std::iter::repeat(b'1').take(MAX_LINE));
        assert_eq!(parse_line(&line), Parsed::Failed(ConnErr::PrxBadHdr));
    }

    #[test]
    fn make_line_formats_families() {
        assert_eq!(
            make_line(
                Some("1.2.3.4:1111".parse().unwrap()),
                Some("5.6.7.8:2222".parse().unwrap())
            ),
            "PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\n"
        );
        assert_eq!(
            make_line(
                Some("[::1]:65535".parse().unwrap()),
                Some("[::2]:1".parse().unwrap())
            ),
            "PROXY TCP6 ::1 ::2 65535 1\r\n"
        );
        assert_eq!(make_line(None, None), "PROXY UNKNOWN\r\n");
        // mixed families degrade to UNKNOWN
        assert_eq!(
            make_line(
                Some("1.2.3.4:1".parse().unwrap()),
                Some("[::2]:1".parse().unwrap())
            ),
            "PROXY UNKNOWN\r\n"
        );
    }
}
