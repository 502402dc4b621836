//! Positional header index.
//!
//! Headers are never copied out of the channel buffer: a transaction keeps
//! one array of `{len, cr, next}` cells forming a linked list over the
//! header lines, cell 0 being the sentinel. Lookups walk the list
//! accumulating line offsets; edits splice bytes in the buffer, fix the
//! touched cell and report the delta so the caller can fix the message
//! offsets.

use crate::buffer::Buffer;
use crate::proto::h1::msg::HttpMsg;

/// Upper bound on indexed header lines per message.
pub const MAX_HDR: usize = 101;

#[derive(Debug, Clone, Copy, Default)]
struct HdrCell {
    /// Line length, CR/LF excluded.
    len: u32,
    /// The line was terminated by CRLF rather than a bare LF.
    cr: bool,
    /// Next cell in the chain, 0 terminates.
    next: u16,
}

pub struct HdrIdx {
    cells: Vec<HdrCell>,
    /// Last cell of the chain; 0 while empty.
    tail: u16,
    used: usize,
    /// Offset (relative to the buffer head) of the first header line.
    start: usize,
}

impl HdrIdx {
    pub fn new() -> HdrIdx {
        let mut cells = Vec::with_capacity(MAX_HDR + 1);
        cells.push(HdrCell::default());
        HdrIdx {
            cells,
            tail: 0,
            used: 0,
            start: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cells.clear();
        self.cells.push(HdrCell::default());
        self.tail = 0;
        self.used = 0;
        self.start = 0;
    }

    pub fn set_start(&mut self, ofs: usize) {
        self.start = ofs;
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Append a header line at the tail. False when the index is full.
    pub fn add(&mut self, len: usize, cr: bool) -> bool {
        if self.cells.len() > MAX_HDR {
            return false;
        }
        let id = self.cells.len() as u16;
        self.cells.push(HdrCell {
            len: len as u32,
            cr,
            next: 0,
        });
        self.cells[self.tail as usize].next = id;
        self.tail = id;
        self.used += 1;
        true
    }

    pub fn first(&self) -> u16 {
        self.cells[0].next
    }

    pub fn next_of(&self, cell: u16) -> u16 {
        self.cells[cell as usize].next
    }

    fn line(&self, cell: u16) -> (usize, bool) {
        let c = &self.cells[cell as usize];
        (c.len as usize, c.cr)
    }

    /// Bytes a line occupies in the buffer, terminator included.
    fn advance(&self, cell: u16) -> usize {
        let (len, cr) = self.line(cell);
        len + if cr { 2 } else { 1 }
    }

    fn delete_after(&mut self, prev: u16) {
        let victim = self.cells[prev as usize].next;
        debug_assert!(victim != 0);
        self.cells[prev as usize].next = self.cells[victim as usize].next;
        if self.tail == victim {
            self.tail = prev;
        }
        self.used -= 1;
    }

    fn grow(&mut self, cell: u16, delta: isize) {
        let c = &mut self.cells[cell as usize];
        c.len = (c.len as isize + delta) as u32;
    }

    /// Structural sanity: the chain visits exactly `used` cells, each in
    /// bounds, and never cycles.
    pub fn check(&self) -> bool {
        let mut seen = 0;
        let mut cur = self.first();
        while cur != 0 {
            if cur as usize >= self.cells.len() || seen > self.used {
                return false;
            }
            seen += 1;
            cur = self.next_of(cur);
        }
        seen == self.used
    }
}

impl Default for HdrIdx {
    fn default() -> Self {
        HdrIdx::new()
    }
}

/// Where a header was found; enough to edit it and to resume scanning.
#[derive(Debug, Clone, Copy)]
pub struct HdrCtx {
    pub prev: u16,
    pub cell: u16,
    /// Offset of the line start, relative to the buffer head.
    pub ofs: usize,
    pub len: usize,
    pub cr: bool,
    pub val_ofs: usize,
    pub val_len: usize,
}

impl HdrCtx {
    /// Continuation token to find the next occurrence.
    pub fn resume(&self, idx: &HdrIdx) -> (u16, usize) {
        (self.cell, self.ofs + idx.advance(self.cell))
    }

    pub fn value<'a>(&self, input: &'a [u8]) -> &'a [u8] {
        &input[self.val_ofs..self.val_ofs + self.val_len]
    }
}

/// Find the next header named `name` (case-insensitive). `from` is either
/// `None` for a fresh scan or the continuation token of a previous hit.
pub fn find_header(
    name: &[u8],
    input: &[u8],
    idx: &HdrIdx,
    from: Option<(u16, usize)>,
) -> Option<HdrCtx> {
    let (mut prev, mut ofs) = from.unwrap_or((0, idx.start));
    let mut cell = idx.next_of(prev);
    while cell != 0 {
        let (len, cr) = idx.line(cell);
        let line = &input[ofs..ofs + len];
        if line.len() > name.len()
            && line[name.len()] == b':'
            && line[..name.len()].eq_ignore_ascii_case(name)
        {
            let mut v = name.len() + 1;
            while v < len && (line[v] == b' ' || line[v] == b'\t') {
                v += 1;
            }
            let mut vend = len;
            while vend > v && (line[vend - 1] == b' ' || line[vend - 1] == b'\t') {
                vend -= 1;
            }
            return Some(HdrCtx {
                prev,
                cell,
                ofs,
                len,
                cr,
                val_ofs: ofs + v,
                val_len: vend - v,
            });
        }
        ofs += idx.advance(cell);
        prev = cell;
        cell = idx.next_of(cell);
    }
    None
}

/// Delete the found header line. Returns the buffer delta plus the token
/// to keep scanning for further occurrences.
pub fn remove_header(
    ctx: &HdrCtx,
    buf: &mut Buffer,
    idx: &mut HdrIdx,
    msg: &mut HttpMsg,
) -> (isize, (u16, usize)) {
    let span = ctx.len + if ctx.cr { 2 } else { 1 };
    let delta = buf
        .replace(ctx.ofs, ctx.ofs + span, b"")
        .expect("removal never grows the buffer");
    idx.delete_after(ctx.prev);
    msg.shift_after(ctx.ofs + 1, delta);
    (delta, (ctx.prev, ctx.ofs))
}

/// Append a full `Name: value` line right before the end of headers.
/// Returns the buffer delta, or `None` when the ring has no room.
pub fn append_header(
    line: &[u8],
    buf: &mut Buffer,
    idx: &mut HdrIdx,
    msg: &mut HttpMsg,
) -> Option<isize> {
    let at = msg.eoh;
    let delta = buf.insert_line(at, line)?;
    if !idx.add(line.len(), true) {
        // roll the bytes back; the index is full
        buf.replace(at, (at as isize + delta) as usize, b"");
        return None;
    }
    msg.shift_after(at, delta);
    Some(delta)
}

/// Replace a found header's value in place. Returns the buffer delta, or
/// `None` when the ring has no room.
pub fn replace_value(
    ctx: &HdrCtx,
    new: &[u8],
    buf: &mut Buffer,
    idx: &mut HdrIdx,
    msg: &mut HttpMsg,
) -> Option<isize> {
    let delta = buf.replace(ctx.val_ofs, ctx.val_ofs + ctx.val_len, new)?;
    idx.grow(ctx.cell, delta);
    msg.shift_after(ctx.val_ofs + ctx.val_len, delta);
    Some(delta)
}
