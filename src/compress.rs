//! Response body compression.
//!
//! The algorithm table carries `identity`, `deflate` and `gzip`; the two
//! real codecs sit behind the `compression` feature, `identity` is a
//! plain pass-through. A session owns one `CompState` for the response
//! being compressed; the body-forwarding analyser feeds it deframed
//! payload bytes and re-frames its output as chunks.

use crate::proxy::CompCfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompAlgo {
    Identity,
    #[cfg(feature = "compression")]
    Deflate,
    #[cfg(feature = "compression")]
    Gzip,
}

impl CompAlgo {
    /// Token as it appears in Accept-Encoding / Content-Encoding.
    pub fn token(&self) -> &'static str {
        match *self {
            CompAlgo::Identity => "identity",
            #[cfg(feature = "compression")]
            CompAlgo::Deflate => "deflate",
            #[cfg(feature = "compression")]
            CompAlgo::Gzip => "gzip",
        }
    }

    pub fn parse(token: &[u8]) -> Option<CompAlgo> {
        if token.eq_ignore_ascii_case(b"identity") {
            return Some(CompAlgo::Identity);
        }
        #[cfg(feature = "compression")]
        {
            if token.eq_ignore_ascii_case(b"deflate") {
                return Some(CompAlgo::Deflate);
            }
            if token.eq_ignore_ascii_case(b"gzip") {
                return Some(CompAlgo::Gzip);
            }
        }
        None
    }
}

enum Inner {
    Identity(Vec<u8>),
    #[cfg(feature = "compression")]
    Deflate(flate2::write::DeflateEncoder<Vec<u8>>),
    #[cfg(feature = "compression")]
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
}

/// Per-session compression context.
pub struct CompState {
    inner: Option<Inner>,
    pub algo: CompAlgo,
    pub consumed: u64,
    pub produced: u64,
    /// Framed output waiting for room in the channel ring.
    pub carry: Vec<u8>,
}

impl CompState {
    pub fn new(algo: CompAlgo) -> CompState {
        let inner = match algo {
            CompAlgo::Identity => Inner::Identity(Vec::new()),
            #[cfg(feature = "compression")]
            CompAlgo::Deflate => Inner::Deflate(flate2::write::DeflateEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
            #[cfg(feature = "compression")]
            CompAlgo::Gzip => Inner::Gzip(flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
        };
        CompState {
            inner: Some(inner),
            algo,
            consumed: 0,
            produced: 0,
            carry: Vec::new(),
        }
    }

    /// Wrap produced bytes as a chunk frame into the carry queue; with
    /// `last` the terminating `0\r\n\r\n` follows.
    pub fn carry_frames(&mut self, payload: &[u8], last: bool) {
        if !payload.is_empty() {
            crate::proto::h1::chunked::emit_chunk_size(&mut self.carry, payload.len() as u64);
            self.carry.extend_from_slice(payload);
            self.carry.extend_from_slice(b"\r\n");
        }
        if last {
            self.carry
                .extend_from_slice(crate::proto::h1::chunked::LAST_CHUNK);
        }
    }

    /// Feed payload bytes (already stripped of any chunk framing).
    pub fn add(&mut self, data: &[u8]) {
        use std::io::Write;
        self.consumed += data.len() as u64;
        match self.inner.as_mut().expect("compressor already finished") {
            Inner::Identity(buf) => buf.extend_from_slice(data),
            #[cfg(feature = "compression")]
            Inner::Deflate(enc) => {
                let _ = enc.write_all(data);
            }
            #[cfg(feature = "compression")]
            Inner::Gzip(enc) => {
                let _ = enc.write_all(data);
            }
        }
    }

    /// Drain whatever output is ready. With `finish` the stream is closed
    /// and the trailing bytes (gzip footer etc.) come out too; the state
    /// must not be fed afterwards.
    pub fn take(&mut self, finish: bool) -> Vec<u8> {
        use std::io::Write;
        let out = if finish {
            match self.inner.take().expect("compressor already finished") {
                Inner::Identity(buf) => buf,
                #[cfg(feature = "compression")]
                Inner::Deflate(enc) => enc.finish().unwrap_or_default(),
                #[cfg(feature = "compression")]
                Inner::Gzip(enc) => enc.finish().unwrap_or_default(),
            }
        } else {
            match self.inner.as_mut().expect("compressor already finished") {
                Inner::Identity(buf) => std::mem::take(buf),
                #[cfg(feature = "compression")]
                Inner::Deflate(enc) => {
                    let _ = enc.flush();
                    std::mem::take(enc.get_mut())
                }
                #[cfg(feature = "compression")]
                Inner::Gzip(enc) => {
                    let _ = enc.flush();
                    std::mem::take(enc.get_mut())
                }
            }
        };
        self.produced += out.len() as u64;
        out
    }

    pub fn finished(&self) -> bool {
        self.inner.is_none()
    }
}

/// Pick the algorithm for a request's Accept-Encoding value against the
/// proxy's configured list. First configured algorithm the client accepts
/// wins; a `q=0` explicitly refuses a coding.
pub fn select_algo(accept_encoding: &[u8], cfg: &CompCfg) -> Option<CompAlgo> {
    let mut accepted: Vec<CompAlgo> = Vec::new();
    for part in accept_encoding.split(|&b| b == b',') {
        let mut pieces = part.split(|&b| b == b';');
        let token = trim(pieces.next().unwrap_or(b""));
        let mut q_zero = false;
        for param in pieces {
            let param = trim(param);
            if let Some(q) = param.strip_prefix(b"q=") {
                q_zero = !q.is_empty() && q.iter().all(|&b| b == b'0' || b == b'.');
            }
        }
        if q_zero {
            continue;
        }
        if let Some(algo) = CompAlgo::parse(token) {
            accepted.push(algo);
        } else if token == b"*" {
            // wildcard accepts anything we offer
            return cfg.algos.first().copied();
        }
    }
    cfg.algos.iter().find(|a| accepted.contains(a)).copied()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_through() {
        let mut st = CompState::new(CompAlgo::Identity);
        st.add(b"hello ");
        st.add(b"world");
        assert_eq!(st.take(false), b"hello world".to_vec());
        st.add(b"!");
        assert_eq!(st.take(true), b"!".to_vec());
        assert!(st.finished());
        assert_eq!(st.consumed, 12);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn gzip_roundtrips() {
        use std::io::Read;
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let mut st = CompState::new(CompAlgo::Gzip);
        st.add(&payload);
        let mut out = st.take(false);
        out.extend(st.take(true));
        assert!(out.len() < payload.len());

        let mut dec = flate2::read::GzDecoder::new(&out[..]);
        let mut back = Vec::new();
        dec.read_to_end(&mut back).expect("valid gzip stream");
        assert_eq!(back, payload);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn selection_prefers_configured_order() {
        let cfg = CompCfg {
            algos: vec![CompAlgo::Gzip, CompAlgo::Deflate],
            types: Vec::new(),
        };
        assert_eq!(
            select_algo(b"deflate, gzip", &cfg),
            Some(CompAlgo::Gzip)
        );
        assert_eq!(select_algo(b"deflate", &cfg), Some(CompAlgo::Deflate));
        assert_eq!(select_algo(b"br", &cfg), None);
        assert_eq!(select_algo(b"*", &cfg), Some(CompAlgo::Gzip));
        assert_eq!(select_algo(b"gzip;q=0", &cfg), None);
        assert_eq!(select_algo(b"gzip;q=0.8", &cfg), Some(CompAlgo::Gzip));
    }

    #[test]
    fn identity_is_always_known() {
        assert_eq!(CompAlgo::parse(b"identity"), Some(CompAlgo::Identity));
        assert_eq!(CompAlgo::parse(b"unknown"), None);
    }
}
