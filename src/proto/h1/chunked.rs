//! Chunked transfer-encoding framing.
//!
//! Small restartable helpers over a contiguous byte view: parse a chunk
//! size line, skip the CRLF between a chunk's payload and the next size
//! line, consume a trailer block, and emit size lines for re-framed
//! bodies. Each parser returns `Ok(None)` when it needs more bytes, so a
//! caller resumes simply by calling again with a longer view.

use crate::error::{Error, Parse, Result};

/// Largest accepted chunk: sizes above 2^31-1 are always an attack or a
/// corrupted stream.
pub const MAX_CHUNK: u64 = 0x7fff_ffff;

/// Parse `1*HEXDIG *WSP [";" extensions] CRLF`.
/// Returns the consumed length and the chunk size.
pub fn parse_chunk_size(input: &[u8]) -> Result<Option<(usize, u64)>> {
    let mut at = 0;
    let mut size: u64 = 0;
    let mut digits = 0;

    loop {
        let b = match input.get(at) {
            Some(&b) => b,
            None => return Ok(None),
        };
        match b {
            b'0'..=b'9' => size = (size << 4) | u64::from(b - b'0'),
            b'a'..=b'f' => size = (size << 4) | u64::from(b - b'a' + 10),
            b'A'..=b'F' => size = (size << 4) | u64::from(b - b'A' + 10),
            _ => break,
        }
        if size > MAX_CHUNK {
            return Err(Error::new_parse(Parse::ChunkSize));
        }
        digits += 1;
        at += 1;
    }
    if digits == 0 {
        return Err(Error::new_parse(Parse::ChunkSize));
    }

    // optional linear whitespace after the size
    while let Some(&b) = input.get(at) {
        if b == b' ' || b == b'\t' {
            at += 1;
        } else {
            break;
        }
    }

    // optional extensions, ignored but policed for stray LF
    if input.get(at) == Some(&b';') {
        at += 1;
        loop {
            match input.get(at) {
                None => return Ok(None),
                Some(&b'\r') => break,
                Some(&b'\n') => return Err(Error::new_parse(Parse::ChunkSize)),
                Some(_) => at += 1,
            }
        }
    }

    match (input.get(at), input.get(at + 1)) {
        (Some(&b'\r'), Some(&b'\n')) => Ok(Some((at + 2, size))),
        (Some(&b'\r'), None) => Ok(None),
        (None, _) => Ok(None),
        _ => Err(Error::new_parse(Parse::ChunkSize)),
    }
}

/// Skip the CRLF separating a chunk's payload from the next size line.
pub fn skip_chunk_crlf(input: &[u8]) -> Result<Option<usize>> {
    match (input.get(0), input.get(1)) {
        (Some(&b'\r'), Some(&b'\n')) => Ok(Some(2)),
        (Some(&b'\r'), None) => Ok(None),
        (None, _) => Ok(None),
        _ => Err(Error::new_parse(Parse::ChunkSize)),
    }
}

/// Consume the trailer block following the last chunk. Returns the total
/// length including the terminating empty line. A line made of a bare CR
/// followed by anything but LF is an error.
pub fn parse_trailers(input: &[u8]) -> Result<Option<usize>> {
    let mut at = 0;
    loop {
        let start = at;
        let mut saw_cr = false;
        loop {
            match input.get(at) {
                None => return Ok(None),
                Some(&b'\r') => {
                    if saw_cr {
                        return Err(Error::new_parse(Parse::Header));
                    }
                    saw_cr = true;
                    at += 1;
                }
                Some(&b'\n') => {
                    at += 1;
                    break;
                }
                Some(_) if saw_cr => return Err(Error::new_parse(Parse::Header)),
                Some(_) => at += 1,
            }
        }
        let line_len = at - start - 1 - if saw_cr { 1 } else { 0 };
        if line_len == 0 {
            // empty line ends the trailers
            return Ok(Some(at));
        }
    }
}

/// Append a padded size line for a re-framed chunk. Sizes are emitted on
/// six hex digits so a previously reserved slot can be patched in place.
pub fn emit_chunk_size(out: &mut Vec<u8>, size: u64) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    debug_assert!(size <= 0xff_ffff);
    let mut shift = 20i32;
    while shift >= 0 {
        out.push(HEX[((size >> shift) & 0xf) as usize]);
        shift -= 4;
    }
    out.extend_from_slice(b"\r\n");
}

/// The terminator for an empty or finished chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
