//! Header index and in-place header operations.
//!
//! The index is a singly linked list of cells over the header lines of
//! a message, kept *in place* in the channel buffer. Cell 0 is a
//! sentinel describing the start line; traversing `next` from it visits
//! every live header line exactly once, in message order. A cell stores
//! the line length excluding its terminator and whether that terminator
//! was CRLF or bare LF, so concatenating the cells reproduces the exact
//! header block between [`HeaderIndex::first_pos`] and the message's
//! `eoh`.
//!
//! Lookups walk the list with a [`HeaderCursor`], which doubles as the
//! resume point for comma-separated value iteration and as the anchor
//! for removals, exactly one edit at a time: every buffer mutation that
//! changes a line length updates the owning cell and the message
//! end-of-head positions in the same operation.

use crate::buffer::Buffer;
use crate::error::{Error, Parse};
use crate::proto::h1::parse::is_spht;
use crate::proto::h1::Message;

/// Default maximum number of indexed header lines per message.
pub const DEFAULT_MAX_HEADERS: usize = 101;

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    /// Line length, terminator excluded.
    len: u32,
    /// 1 when the line ends in CRLF, 0 for bare LF.
    cr: u8,
    /// Next cell in message order, 0 terminates.
    next: u16,
}

/// Index of the header lines of one message.
#[derive(Debug)]
pub struct HeaderIndex {
    cells: Box<[Cell]>,
    tail: u16,
    used: u16,
    high: u16,
    free: Vec<u16>,
}

impl HeaderIndex {
    /// Creates an index able to describe `capacity` header lines.
    pub fn new(capacity: usize) -> HeaderIndex {
        HeaderIndex {
            cells: vec![Cell::default(); capacity + 1].into_boxed_slice(),
            tail: 0,
            used: 0,
            high: 1,
            free: Vec::new(),
        }
    }

    /// Forgets every cell, keeping the allocation.
    pub fn reset(&mut self) {
        for cell in self.cells.iter_mut() {
            *cell = Cell::default();
        }
        self.tail = 0;
        self.used = 0;
        self.high = 1;
        self.free.clear();
    }

    /// Records the start-line geometry in the sentinel cell.
    pub fn set_start(&mut self, len: usize, cr: bool) {
        self.cells[0].len = len as u32;
        self.cells[0].cr = cr as u8;
    }

    /// Offset of the first header byte, right after the start line.
    #[inline]
    pub fn first_pos(&self) -> usize {
        self.cells[0].len as usize + self.cells[0].cr as usize + 1
    }

    /// First header cell, 0 when the message has no headers.
    #[inline]
    pub fn first(&self) -> u16 {
        self.cells[0].next
    }

    /// Cell following `idx` in message order.
    #[inline]
    pub fn next(&self, idx: u16) -> u16 {
        self.cells[idx as usize].next
    }

    /// Line length of a cell, terminator excluded.
    #[inline]
    pub fn len_of(&self, idx: u16) -> usize {
        self.cells[idx as usize].len as usize
    }

    /// Whether the cell's line ends in CRLF.
    #[inline]
    pub fn cr_of(&self, idx: u16) -> bool {
        self.cells[idx as usize].cr != 0
    }

    /// Terminator length of a cell's line (1 or 2).
    #[inline]
    pub fn term_of(&self, idx: u16) -> usize {
        self.cells[idx as usize].cr as usize + 1
    }

    /// Number of live header cells.
    #[inline]
    pub fn used(&self) -> usize {
        self.used as usize
    }

    /// Maximum number of header lines this index can describe.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len() - 1
    }

    /// Appends a cell for a new line after the current tail.
    pub fn add(&mut self, len: usize, cr: bool) -> Result<u16, Error> {
        let new = match self.free.pop() {
            Some(n) => n,
            None => {
                if self.high as usize >= self.cells.len() {
                    return Err(Error::new_parse(Parse::TooManyHeaders));
                }
                let n = self.high;
                self.high += 1;
                n
            }
        };
        self.cells[new as usize] = Cell {
            len: len as u32,
            cr: cr as u8,
            next: 0,
        };
        self.cells[self.tail as usize].next = new;
        self.tail = new;
        self.used += 1;
        Ok(new)
    }

    /// Adjusts a cell's line length by a signed buffer delta.
    pub fn grow(&mut self, idx: u16, delta: isize) {
        let cell = &mut self.cells[idx as usize];
        cell.len = (cell.len as isize + delta) as u32;
    }

    /// Unlinks the cell following `prev`, zeroing it for reuse.
    pub fn remove_after(&mut self, prev: u16) {
        let cur = self.cells[prev as usize].next;
        debug_assert_ne!(cur, 0, "remove_after at list end");
        let next = self.cells[cur as usize].next;
        self.cells[prev as usize].next = next;
        if self.tail == cur {
            self.tail = prev;
        }
        self.cells[cur as usize] = Cell::default();
        self.free.push(cur);
        self.used -= 1;
    }

    fn pop_tail(&mut self, prev: u16) {
        self.remove_after(prev);
    }

    /// Iterates over `(cell, line_start, len, cr)` for every live line.
    pub fn lines(&self) -> Lines<'_> {
        Lines {
            idx: self,
            cur: self.first(),
            pos: self.first_pos(),
        }
    }

    fn prev_of(&self, target: u16) -> u16 {
        let mut prev = 0;
        let mut cur = self.first();
        while cur != 0 && cur != target {
            prev = cur;
            cur = self.next(cur);
        }
        prev
    }
}

/// Iterator over live header lines.
#[derive(Debug)]
pub struct Lines<'a> {
    idx: &'a HeaderIndex,
    cur: u16,
    pos: usize,
}

impl<'a> Iterator for Lines<'a> {
    /// `(cell index, line start offset, line length, ends-with-CR)`
    type Item = (u16, usize, usize, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == 0 {
            return None;
        }
        let cell = self.cur;
        let start = self.pos;
        let len = self.idx.len_of(cell);
        let cr = self.idx.cr_of(cell);
        self.pos = start + len + self.idx.term_of(cell);
        self.cur = self.idx.next(cell);
        Some((cell, start, len, cr))
    }
}

/// Walk state for header lookups and edits.
///
/// `line` is a message-relative offset; `del`, `val` are relative to
/// `line`, the way the index stores line-local geometry. A zero `idx`
/// means the cursor has not matched anything yet.
#[derive(Debug, Clone, Default)]
pub struct HeaderCursor {
    /// Cell of the current line, 0 before the first match.
    pub idx: u16,
    /// Cell preceding `idx` in message order.
    pub prev: u16,
    /// Message-relative offset of the current line start.
    pub line: usize,
    /// Line-relative offset of the `:` or of the comma preceding the
    /// current value; the anchor a removal starts from.
    pub del: usize,
    /// Line-relative offset of the current value.
    pub val: usize,
    /// Length of the current value, trailing whitespace excluded.
    pub vlen: usize,
    /// Trailing whitespace between the value and the next comma or the
    /// end of the line.
    pub tws: usize,
    reparse: bool,
}

impl HeaderCursor {
    /// A cursor positioned before the first header.
    pub fn new() -> HeaderCursor {
        HeaderCursor::default()
    }

    /// Copies the current value out of the buffer.
    pub fn value(&self, buf: &Buffer) -> Vec<u8> {
        let start = self.line + self.val;
        buf.copy_range(start, start + self.vlen)
    }

    fn step(&mut self, idx: &HeaderIndex) {
        self.line += idx.len_of(self.idx) + idx.term_of(self.idx);
        self.prev = self.idx;
        self.idx = idx.next(self.idx);
    }
}

fn eq_name(buf: &Buffer, pos: usize, name: &[u8]) -> bool {
    for (k, &n) in name.iter().enumerate() {
        if !buf.byte(pos + k).eq_ignore_ascii_case(&n) {
            return false;
        }
    }
    true
}

fn settle_value(buf: &Buffer, ctx: &mut HeaderCursor, start: usize, eol: usize, full: bool) {
    let mut end = eol;
    if !full {
        let mut p = start;
        while p < eol && buf.byte(p) != b',' {
            p += 1;
        }
        end = p;
    }
    let mut trimmed = end;
    while trimmed > start && is_spht(buf.byte(trimmed - 1)) {
        trimmed -= 1;
    }
    ctx.val = start - ctx.line;
    ctx.vlen = trimmed - start;
    ctx.tws = end - trimmed;
}

/// Finds the next occurrence of `name` starting from the cursor.
///
/// The lookup is case-insensitive on the name, stops at the first `:`,
/// skips optional whitespace, and iterates comma-separated values one
/// at a time unless `full` is set, in which case the whole field-value
/// is returned as a single value. Returns `false` when no further
/// occurrence exists.
pub fn find_header(
    name: &[u8],
    buf: &Buffer,
    idx: &HeaderIndex,
    ctx: &mut HeaderCursor,
    full: bool,
) -> bool {
    if ctx.idx != 0 {
        let eol = ctx.line + idx.len_of(ctx.idx);
        if ctx.reparse {
            // A removal left the cursor on the next value of this line.
            ctx.reparse = false;
            let at = ctx.line + ctx.val;
            if at < eol {
                settle_value(buf, ctx, at, eol, full);
                return true;
            }
        } else if !full {
            let p = ctx.line + ctx.val + ctx.vlen + ctx.tws;
            if p < eol && buf.byte(p) == b',' {
                ctx.del = p - ctx.line;
                let mut v = p + 1;
                while v < eol && is_spht(buf.byte(v)) {
                    v += 1;
                }
                settle_value(buf, ctx, v, eol, full);
                return true;
            }
        }
        ctx.step(idx);
    } else {
        ctx.prev = 0;
        ctx.idx = idx.first();
        ctx.line = idx.first_pos();
    }

    while ctx.idx != 0 {
        let len = idx.len_of(ctx.idx);
        let eol = ctx.line + len;
        if name.len() < len
            && buf.byte(ctx.line + name.len()) == b':'
            && eq_name(buf, ctx.line, name)
        {
            ctx.del = name.len();
            let mut v = ctx.line + name.len() + 1;
            while v < eol && is_spht(buf.byte(v)) {
                v += 1;
            }
            settle_value(buf, ctx, v, eol, full);
            return true;
        }
        ctx.step(idx);
    }
    false
}

/// Removes the value the cursor points at, keeping the comma list
/// valid. Removing the last value removes the whole header line. The
/// cursor stays valid for resuming the lookup.
pub fn remove_value(
    buf: &mut Buffer,
    idx: &mut HeaderIndex,
    msg: &mut Message,
    ctx: &mut HeaderCursor,
) {
    if ctx.idx == 0 {
        return;
    }
    let line = ctx.line;
    let len = idx.len_of(ctx.idx);
    let eol = line + len;
    let abs_val = line + ctx.val;

    if buf.byte(line + ctx.del) == b',' {
        // Not the first value: drop ", value" with its trailing space.
        let delta = buf
            .replace(line + ctx.del, abs_val + ctx.vlen + ctx.tws, b"")
            .expect("shrinking replace");
        idx.grow(ctx.idx, delta);
        msg.move_end(delta);
        ctx.val = ctx.del;
        ctx.vlen = 0;
        ctx.tws = 0;
        return;
    }

    let mut after = abs_val + ctx.vlen + ctx.tws;
    if after < eol && buf.byte(after) == b',' {
        // First value with siblings: drop up to the next value start.
        after += 1;
        while after < eol && is_spht(buf.byte(after)) {
            after += 1;
        }
        let delta = buf.replace(abs_val, after, b"").expect("shrinking replace");
        idx.grow(ctx.idx, delta);
        msg.move_end(delta);
        ctx.vlen = 0;
        ctx.tws = 0;
        ctx.reparse = true;
        return;
    }

    // Only value: the whole line goes away.
    let term = idx.term_of(ctx.idx);
    let delta = buf.replace(line, eol + term, b"").expect("shrinking replace");
    msg.move_end(delta);
    let prev = ctx.prev;
    idx.remove_after(prev);
    ctx.val = 0;
    ctx.vlen = 0;
    ctx.tws = 0;
    ctx.reparse = false;
    if prev == 0 {
        ctx.idx = 0;
        ctx.line = 0;
    } else {
        ctx.idx = prev;
        ctx.line = line - idx.len_of(prev) - idx.term_of(prev);
        ctx.prev = idx.prev_of(prev);
    }
}

/// Deletes every occurrence of a header by name. Returns how many
/// lines were removed.
pub fn del_header(buf: &mut Buffer, idx: &mut HeaderIndex, msg: &mut Message, name: &[u8]) -> usize {
    let mut ctx = HeaderCursor::new();
    let mut removed = 0;
    while find_header(name, buf, idx, &mut ctx, true) {
        remove_value(buf, idx, msg, &mut ctx);
        removed += 1;
    }
    removed
}

/// Appends a complete `name: value` line at the tail of the header
/// block, just before the empty line.
pub fn add_header(
    buf: &mut Buffer,
    idx: &mut HeaderIndex,
    msg: &mut Message,
    line: &[u8],
) -> Result<(), Error> {
    idx.add(line.len(), true)?;
    let mut bytes = Vec::with_capacity(line.len() + 2);
    bytes.extend_from_slice(line);
    bytes.extend_from_slice(b"\r\n");
    if let Err(e) = buf.insert(msg.eoh, &bytes) {
        let prev = idx.prev_of(idx.tail);
        idx.pop_tail(prev);
        return Err(e);
    }
    msg.move_end(bytes.len() as isize);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::MsgState;

    /// Builds a buffer + index from raw head bytes, CRLF lines only.
    fn build(head: &str) -> (Buffer, HeaderIndex, Message) {
        let mut buf = Buffer::with_capacity(1024);
        assert_eq!(buf.put(head.as_bytes()), head.len());
        let mut idx = HeaderIndex::new(16);
        let mut msg = Message::new(MsgState::Body);
        let mut lines = head.split("\r\n");
        let start = lines.next().unwrap();
        idx.set_start(start.len(), true);
        let mut pos = start.len() + 2;
        for line in lines {
            if line.is_empty() {
                break;
            }
            idx.add(line.len(), true).unwrap();
            pos += line.len() + 2;
        }
        msg.eoh = pos;
        msg.sov = pos + 2;
        msg.next = pos + 2;
        (buf, idx, msg)
    }

    fn head_of(buf: &Buffer, msg: &Message) -> String {
        String::from_utf8(buf.copy_range(0, msg.sov)).unwrap()
    }

    const HEAD: &str = "GET / HTTP/1.1\r\nHost: example\r\nAccept: text/html, text/plain\r\nConnection: close, keep-alive\r\n\r\n";

    #[test]
    fn cells_concatenate_to_header_block() {
        let (_, idx, msg) = build(HEAD);
        let sum: usize = idx
            .lines()
            .map(|(cell, _, len, _)| len + idx.term_of(cell))
            .sum();
        assert_eq!(idx.first_pos() + sum, msg.eoh);
        assert_eq!(idx.used(), 3);
    }

    #[test]
    fn find_is_case_insensitive() {
        let (buf, idx, _) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"hOsT", &buf, &idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"example");
        assert!(!find_header(b"hOsT", &buf, &idx, &mut ctx, false));
    }

    #[test]
    fn comma_list_iteration() {
        let (buf, idx, _) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"Accept", &buf, &idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"text/html");
        assert!(find_header(b"Accept", &buf, &idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"text/plain");
        assert!(!find_header(b"Accept", &buf, &idx, &mut ctx, false));
    }

    #[test]
    fn full_header_is_one_value() {
        let (buf, idx, _) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"Accept", &buf, &idx, &mut ctx, true));
        assert_eq!(ctx.value(&buf), b"text/html, text/plain");
        assert!(!find_header(b"Accept", &buf, &idx, &mut ctx, true));
    }

    #[test]
    fn remove_first_value_keeps_list_valid() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"Connection", &buf, &mut idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"close");
        remove_value(&mut buf, &mut idx, &mut msg, &mut ctx);
        assert!(head_of(&buf, &msg).contains("Connection: keep-alive\r\n"));
        // The cursor resumes on the surviving value.
        assert!(find_header(b"Connection", &buf, &idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"keep-alive");
    }

    #[test]
    fn remove_second_value_keeps_list_valid() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"Connection", &buf, &idx, &mut ctx, false));
        assert!(find_header(b"Connection", &buf, &idx, &mut ctx, false));
        assert_eq!(ctx.value(&buf), b"keep-alive");
        remove_value(&mut buf, &mut idx, &mut msg, &mut ctx);
        assert!(head_of(&buf, &msg).contains("Connection: close\r\n"));
        assert!(!find_header(b"Connection", &buf, &idx, &mut ctx, false));
    }

    #[test]
    fn remove_last_value_removes_line() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"Host", &buf, &idx, &mut ctx, false));
        remove_value(&mut buf, &mut idx, &mut msg, &mut ctx);
        assert_eq!(idx.used(), 2);
        assert!(!head_of(&buf, &msg).contains("Host"));
        // Lookup of the following header still works from the cursor.
        let mut ctx2 = HeaderCursor::new();
        assert!(find_header(b"Accept", &buf, &idx, &mut ctx2, true));
    }

    #[test]
    fn del_header_removes_all_occurrences() {
        let (mut buf, mut idx, mut msg) =
            build("GET / HTTP/1.1\r\nX-A: 1\r\nHost: h\r\nX-A: 2\r\n\r\n");
        assert_eq!(del_header(&mut buf, &mut idx, &mut msg, b"x-a"), 2);
        assert_eq!(idx.used(), 1);
        let mut ctx = HeaderCursor::new();
        assert!(!find_header(b"X-A", &buf, &idx, &mut ctx, true));
        assert!(find_header(b"Host", &buf, &idx, &mut HeaderCursor::new(), true));
    }

    #[test]
    fn add_then_find_roundtrip() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        let before = msg.eoh;
        add_header(&mut buf, &mut idx, &mut msg, b"X-Forwarded-For: 10.0.0.1").unwrap();
        assert_eq!(msg.eoh, before + 27);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"X-Forwarded-For", &buf, &idx, &mut ctx, true));
        assert_eq!(ctx.value(&buf), b"10.0.0.1");
        // Invariant: cells still concatenate to the exact block.
        let sum: usize = idx
            .lines()
            .map(|(cell, _, len, _)| len + idx.term_of(cell))
            .sum();
        assert_eq!(idx.first_pos() + sum, msg.eoh);
    }

    #[test]
    fn add_after_del_reuses_cells() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        del_header(&mut buf, &mut idx, &mut msg, b"accept");
        let used = idx.used();
        add_header(&mut buf, &mut idx, &mut msg, b"Via: janus").unwrap();
        assert_eq!(idx.used(), used + 1);
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"via", &buf, &idx, &mut ctx, true));
        assert_eq!(ctx.value(&buf), b"janus");
    }

    #[test]
    fn capacity_overflow_reports_parse_error() {
        let mut idx = HeaderIndex::new(2);
        idx.add(5, true).unwrap();
        idx.add(5, true).unwrap();
        let err = idx.add(5, true).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn interleaved_edits_keep_lookup_consistent() {
        let (mut buf, mut idx, mut msg) = build(HEAD);
        add_header(&mut buf, &mut idx, &mut msg, b"X-One: a").unwrap();
        del_header(&mut buf, &mut idx, &mut msg, b"Accept");
        add_header(&mut buf, &mut idx, &mut msg, b"X-Two: b").unwrap();
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"X-One", &buf, &idx, &mut ctx, true));
        assert_eq!(ctx.value(&buf), b"a");
        let mut ctx = HeaderCursor::new();
        assert!(find_header(b"X-Two", &buf, &idx, &mut ctx, true));
        assert_eq!(ctx.value(&buf), b"b");
        let sum: usize = idx
            .lines()
            .map(|(cell, _, len, _)| len + idx.term_of(cell))
            .sum();
        assert_eq!(idx.first_pos() + sum, msg.eoh);
    }
}
