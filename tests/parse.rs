//! Parser invariants: incremental feeding, realignment, index sanity,
//! the chunked-framing law, and a differential check against httparse.

use relay::buffer::Buffer;
use relay::proto::h1::chunked::{self, LAST_CHUNK};
use relay::proto::h1::headers::{find_header, HdrIdx};
use relay::proto::h1::{parse_message, HttpMsg, MsgState};

const REQ: &[u8] = b"POST /submit?x=1&y=2 HTTP/1.1\r\n\
Host: upstream.example\r\n\
User-Agent: relay-test/1.0\r\n\
Accept: */*\r\n\
Content-Length: 12\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello world!";

const RSP: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: upstream\r\n\
Content-Length: 5\r\n\
\r\n\
abcde";

fn parse_one_shot(raw: &[u8], response: bool) -> (Buffer, HttpMsg, HdrIdx) {
    let mut buf = Buffer::with_capacity(4096);
    assert_eq!(buf.put_slice(raw), raw.len());
    let mut msg = if response {
        HttpMsg::new_response()
    } else {
        HttpMsg::new_request()
    };
    let mut idx = HdrIdx::new();
    parse_message(&mut buf, &mut msg, &mut idx);
    (buf, msg, idx)
}

fn assert_same_outcome(a: &(Buffer, HttpMsg, HdrIdx), b: &(Buffer, HttpMsg, HdrIdx)) {
    assert_eq!(a.1.msg_state, b.1.msg_state);
    assert_eq!(a.1.eoh, b.1.eoh);
    assert_eq!(a.1.sov, b.1.sov);
    assert_eq!(a.1.next, b.1.next);
    assert_eq!(a.2.used(), b.2.used());
    assert_eq!(a.0.input_contiguous(), b.0.input_contiguous());
}

/// Property 1: any partition of the byte stream yields the same final
/// state as one call. Exhaustive over every two-way split, plus a
/// three-way sweep.
#[test]
fn chunked_feeding_is_invariant() {
    for raw in [REQ, RSP] {
        let response = raw.starts_with(b"HTTP/");
        let reference = parse_one_shot(raw, response);
        assert_eq!(reference.1.msg_state, MsgState::Body);

        for cut in 0..raw.len() {
            let mut buf = Buffer::with_capacity(4096);
            let mut msg = if response {
                HttpMsg::new_response()
            } else {
                HttpMsg::new_request()
            };
            let mut idx = HdrIdx::new();
            buf.put_slice(&raw[..cut]);
            parse_message(&mut buf, &mut msg, &mut idx);
            buf.put_slice(&raw[cut..]);
            parse_message(&mut buf, &mut msg, &mut idx);
            assert_same_outcome(&(buf, msg, idx), &reference);
        }
    }
}

#[test]
fn three_way_splits_are_invariant() {
    let raw = REQ;
    let reference = parse_one_shot(raw, false);
    for first in (0..raw.len()).step_by(7) {
        for second in (first..raw.len()).step_by(11) {
            let mut buf = Buffer::with_capacity(4096);
            let mut msg = HttpMsg::new_request();
            let mut idx = HdrIdx::new();
            for part in [&raw[..first], &raw[first..second], &raw[second..]] {
                buf.put_slice(part);
                parse_message(&mut buf, &mut msg, &mut idx);
            }
            assert_same_outcome(&(buf, msg, idx), &reference);
        }
    }
}

/// Property 2: a realignment between two parse steps changes nothing the
/// parser can observe.
#[test]
fn realignment_mid_parse_is_transparent() {
    let raw = REQ;
    let reference = parse_one_shot(raw, false);

    // push the ring's head to offset 200 of 256 with one output byte
    // still pending, so a long input wraps around the end
    let mut buf = Buffer::with_capacity(256);
    buf.put_slice(&[b'x'; 200]);
    buf.advance(200);
    buf.fast_delete(199);

    let mut msg = HttpMsg::new_request();
    let mut idx = HdrIdx::new();
    let cut = 40;
    buf.put_slice(&raw[..cut]);
    parse_message(&mut buf, &mut msg, &mut idx);

    let delta = buf.slow_realign();
    assert!(delta != 0);
    // offsets are head-relative: nothing for the caller to fix

    buf.put_slice(&raw[cut..]);
    parse_message(&mut buf, &mut msg, &mut idx);

    assert_eq!(msg.msg_state, MsgState::Body);
    assert_eq!(msg.eoh, reference.1.eoh);
    assert_eq!(msg.sov, reference.1.sov);
    assert_eq!(idx.used(), reference.2.used());
    assert_eq!(buf.input_contiguous(), reference.0.input_contiguous());
}

/// Property 3: a complete head leaves a consistent geometry and a sane
/// header index.
#[test]
fn done_invariants_hold() {
    let (buf, msg, idx) = parse_one_shot(REQ, false);
    assert_eq!(msg.msg_state, MsgState::Body);
    assert!(msg.eoh + 2 <= msg.sov, "eoh + CRLF must fit before sov");
    assert!(idx.check(), "header chain must be bounded and acyclic");
    let input = buf.input_contiguous();
    assert_eq!(&input[msg.eoh..msg.eoh + 2], b"\r\n");
    assert_eq!(&input[msg.sov..], b"hello world!");
}

/// Chunked law: encode then decode returns the original bytes; an empty
/// body is exactly the terminator.
#[test]
fn chunked_roundtrip_law() {
    let payloads: [&[u8]; 4] = [
        b"",
        b"a",
        b"the quick brown fox",
        &[0xAAu8; 5000],
    ];
    for payload in payloads {
        // encode in segments of varying size
        let mut encoded = Vec::new();
        let mut rest = payload;
        let mut seg = 1;
        while !rest.is_empty() {
            let n = seg.min(rest.len());
            chunked::emit_chunk_size(&mut encoded, n as u64);
            encoded.extend_from_slice(&rest[..n]);
            encoded.extend_from_slice(b"\r\n");
            rest = &rest[n..];
            seg = seg * 3 + 1;
        }
        encoded.extend_from_slice(LAST_CHUNK);
        if payload.is_empty() {
            assert_eq!(encoded, LAST_CHUNK);
        }

        // decode with the framing parsers
        let mut decoded = Vec::new();
        let mut at = 0;
        loop {
            let (consumed, size) = chunked::parse_chunk_size(&encoded[at..])
                .expect("valid frame")
                .expect("complete frame");
            at += consumed;
            if size == 0 {
                break;
            }
            decoded.extend_from_slice(&encoded[at..at + size as usize]);
            at += size as usize;
            let n = chunked::skip_chunk_crlf(&encoded[at..])
                .expect("valid crlf")
                .expect("complete crlf");
            at += n;
        }
        // final empty trailer block
        let n = chunked::parse_trailers(&encoded[at..])
            .expect("valid trailers")
            .expect("complete trailers");
        at += n;
        assert_eq!(at, encoded.len());
        assert_eq!(decoded, payload);
    }
}

/// Differential check against httparse on well-formed requests.
#[test]
fn agrees_with_httparse() {
    let cases: [&[u8]; 4] = [
        REQ,
        b"GET / HTTP/1.0\r\n\r\n",
        b"DELETE /thing HTTP/1.1\r\nHost: h\r\nX-Empty:\r\n\r\n",
        b"OPTIONS * HTTP/1.1\r\nHost: h\r\nAccept: a, b\r\n\r\n",
    ];
    for raw in cases {
        let (buf, msg, idx) = parse_one_shot(raw, false);
        assert_eq!(msg.msg_state, MsgState::Body, "ours failed on {:?}", raw);
        let input = buf.input_contiguous();
        let (m, u, v) = msg.sl.rq();

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(raw).expect("httparse accepts");
        let head_len = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => panic!("httparse partial on {:?}", raw),
        };

        assert_eq!(m.slice(input), req.method.unwrap().as_bytes());
        assert_eq!(u.slice(input), req.path.unwrap().as_bytes());
        let minor = req.version.unwrap();
        assert_eq!(v.slice(input), format!("HTTP/1.{}", minor).as_bytes());
        assert_eq!(msg.sov, head_len);
        assert_eq!(idx.used(), req.headers.len());
        for h in req.headers.iter() {
            let hit = find_header(h.name.as_bytes(), input, &idx, None)
                .unwrap_or_else(|| panic!("header {} not indexed", h.name));
            assert_eq!(hit.value(input), h.value);
        }
    }
}
