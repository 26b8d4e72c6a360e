//! Body forwarding.
//!
//! Walks the body sub-states of a message and schedules validated
//! bytes for the opposite transport:
//!
//! - chunked: `Body -> (ChunkSize -> Data -> ChunkCrlf)* -> Trailers -> Done`
//! - content-length: `Body -> Data -> Done`
//! - close-delimited: `Body -> Data -> ...` (`Done` only on shutdown)
//!
//! The forwarder is resumable like the head parser: it advances
//! `msg.next` over validated bytes only, forwards that prefix at the
//! end of each pass, and rewinds the message positions accordingly.
//!
//! When a compression context is present on a response, every data
//! region is squeezed through the algorithm into a scratch buffer and
//! re-emitted in place as chunked frames; the input's own chunk
//! envelope is dropped while it is parsed.

use std::io::Write;

use tracing::trace;

use crate::buffer::Buffer;
use crate::channel::{ChanFlags, Channel};
use crate::compress::CompCtx;
use crate::error::{Error, Parse};
use crate::proto::h1::{Message, MsgFlags, MsgState};

/// Chunk sizes are bounded below 2^31 to stay clear of any signed
/// 32-bit arithmetic downstream.
const CHUNK_SIZE_LIMIT: u64 = 0x7fff_ffff;

/// Outcome of one framing token scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Token fully consumed; carries the bytes it spanned.
    Complete(usize),
    /// More input is needed to finish the token.
    Partial,
}

/// Parses a chunk-size line `1*HEX *WSP [';' extensions] CRLF` at
/// `msg.next`.
///
/// On success stores the size in `chunk_len`, accounts it into
/// `body_len`, advances `next` past the CRLF and transitions to `Data`
/// (size > 0) or `Trailers` (size 0).
pub fn parse_chunk_size(buf: &Buffer, msg: &mut Message) -> Result<Step, Error> {
    let start = msg.next;
    let end = buf.input();
    let mut p = start;
    let mut size: u64 = 0;
    let mut digits = 0;

    while p < end {
        let b = buf.byte(p);
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b + 10 - b'a',
            b'A'..=b'F' => b + 10 - b'A',
            _ => break,
        };
        size = size * 16 + d as u64;
        if size > CHUNK_SIZE_LIMIT {
            return Err(Error::new_parse(Parse::ChunkSize));
        }
        digits += 1;
        p += 1;
    }
    if p == end {
        return Ok(Step::Partial);
    }
    if digits == 0 {
        return Err(Error::new_parse(Parse::ChunkSize));
    }
    // optional spaces, then extensions up to the line end
    while p < end && (buf.byte(p) == b' ' || buf.byte(p) == b'\t') {
        p += 1;
    }
    if p < end && buf.byte(p) == b';' {
        while p < end && buf.byte(p) != b'\r' && buf.byte(p) != b'\n' {
            p += 1;
        }
    }
    if p == end {
        return Ok(Step::Partial);
    }
    match buf.byte(p) {
        b'\r' => {
            if p + 1 >= end {
                return Ok(Step::Partial);
            }
            if buf.byte(p + 1) != b'\n' {
                return Err(Error::new_parse(Parse::ChunkSize));
            }
            p += 2;
        }
        b'\n' => p += 1,
        _ => return Err(Error::new_parse(Parse::ChunkSize)),
    }

    msg.chunk_len = size;
    msg.body_len += size;
    msg.next = p;
    msg.state = if size > 0 {
        MsgState::Data
    } else {
        MsgState::Trailers
    };
    trace!(size, "chunk size parsed");
    Ok(Step::Complete(p - start))
}

/// Consumes the CRLF following chunk data and returns to `ChunkSize`.
pub fn skip_chunk_crlf(buf: &Buffer, msg: &mut Message) -> Result<Step, Error> {
    let start = msg.next;
    let end = buf.input();
    if start >= end {
        return Ok(Step::Partial);
    }
    let taken = match buf.byte(start) {
        b'\r' => {
            if start + 1 >= end {
                return Ok(Step::Partial);
            }
            if buf.byte(start + 1) != b'\n' {
                return Err(Error::new_parse(Parse::ChunkSize));
            }
            2
        }
        b'\n' => 1,
        _ => return Err(Error::new_parse(Parse::ChunkSize)),
    };
    msg.next = start + taken;
    msg.state = MsgState::ChunkSize;
    Ok(Step::Complete(taken))
}

/// Walks trailer lines until the empty line, scheduling them for
/// forwarding. Transitions to `Done` once the final empty line is
/// consumed.
pub fn forward_trailers(buf: &Buffer, msg: &mut Message) -> Result<Step, Error> {
    let end = buf.input();
    loop {
        let line = msg.next;
        let mut p = line;
        while p < end && buf.byte(p) != b'\n' {
            p += 1;
        }
        if p >= end {
            return Ok(Step::Partial);
        }
        let empty = p == line || (p == line + 1 && buf.byte(line) == b'\r');
        msg.next = p + 1;
        if empty {
            msg.state = MsgState::Done;
            return Ok(Step::Complete(msg.next - line));
        }
    }
}

fn chunk_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 10);
    write!(frame, "{:x}\r\n", data.len()).expect("vec write");
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Feeds a data region through the compressor and re-emits it in place
/// as a chunked frame. Returns false when the buffer has no room for
/// the swap yet.
fn squeeze_region(
    chn: &mut Channel,
    msg: &mut Message,
    comp: &mut CompCtx,
    avail: usize,
) -> Result<bool, Error> {
    let raw = chn.buf.copy_range(msg.next, msg.next + avail);
    let mut out = Vec::new();
    comp.compress(&raw, &mut out);
    let frame = if out.is_empty() {
        Vec::new()
    } else {
        chunk_frame(&out)
    };
    match chn.buf.replace(msg.next, msg.next + avail, &frame) {
        Ok(_) => {}
        Err(e) if e.is_buffer_full() => {
            chn.flags.insert(ChanFlags::WAKE_WRITE);
            return Ok(false);
        }
        Err(e) => return Err(e),
    }
    msg.next += frame.len();
    msg.chunk_len -= avail as u64;
    comp.add_in(avail);
    Ok(true)
}

/// Emits the compressor's tail: the remaining squeezed bytes, the last
/// chunk, and the final CRLF unless trailers follow.
fn squeeze_finish(
    buf: &mut Buffer,
    msg: &mut Message,
    comp: &mut CompCtx,
    trailers_follow: bool,
) -> Result<(), Error> {
    let mut out = Vec::new();
    comp.finish(&mut out);
    let mut tail = if out.is_empty() {
        Vec::new()
    } else {
        chunk_frame(&out)
    };
    tail.extend_from_slice(b"0\r\n");
    if !trailers_follow {
        tail.extend_from_slice(b"\r\n");
    }
    buf.insert(msg.next, &tail)?;
    msg.next += tail.len();
    Ok(())
}

/// Drops the just-parsed framing token so only re-framed output is
/// forwarded while compressing.
fn drop_envelope(buf: &mut Buffer, msg: &mut Message, span: usize) {
    buf.delete(msg.next - span, msg.next);
    msg.next -= span;
}

/// Drives one forwarding pass over a message body.
///
/// Returns `Ok(true)` once the message is `Done` (or tunnelled),
/// `Ok(false)` when the pass ran out of input or room. A protocol
/// error in the chunk envelope surfaces as `Err`; premature close of
/// the producing side surfaces as an incomplete-message error for the
/// caller's abort accounting.
pub fn forward_body(
    chn: &mut Channel,
    msg: &mut Message,
    mut comp: Option<&mut CompCtx>,
) -> Result<bool, Error> {
    let done = loop {
        match msg.state {
            MsgState::Body | MsgState::Sent100 => {
                msg.state = if msg.flags.contains(MsgFlags::TE_CHNK) {
                    MsgState::ChunkSize
                } else if msg.flags.contains(MsgFlags::XFER_LEN) && msg.chunk_len == 0 {
                    // no body at all
                    MsgState::Done
                } else {
                    MsgState::Data
                };
            }
            MsgState::ChunkSize => match parse_chunk_size(&chn.buf, msg)? {
                Step::Complete(span) => {
                    if comp.is_some() {
                        drop_envelope(&mut chn.buf, msg, span);
                    }
                    if msg.state == MsgState::Trailers {
                        if let Some(ref mut ctx) = comp {
                            squeeze_finish(&mut chn.buf, msg, ctx, true)?;
                        }
                    }
                }
                Step::Partial => {
                    if chn.flags.contains(ChanFlags::SHUTR) {
                        return Err(Error::new_incomplete());
                    }
                    break false;
                }
            },
            MsgState::Data => {
                let pending = (chn.buf.input() - msg.next) as u64;
                if msg.flags.contains(MsgFlags::XFER_LEN) {
                    let avail = std::cmp::min(msg.chunk_len, pending) as usize;
                    match comp {
                        Some(ref mut ctx) => {
                            if avail > 0 && !squeeze_region(chn, msg, ctx, avail)? {
                                break false;
                            }
                        }
                        None => {
                            msg.next += avail;
                            msg.chunk_len -= avail as u64;
                        }
                    }
                    if msg.chunk_len > 0 {
                        if chn.flags.contains(ChanFlags::SHUTR) && pending <= avail as u64 {
                            return Err(Error::new_incomplete());
                        }
                        break false;
                    }
                    if msg.flags.contains(MsgFlags::TE_CHNK) {
                        msg.state = MsgState::ChunkCrlf;
                    } else {
                        if let Some(ref mut ctx) = comp {
                            squeeze_finish(&mut chn.buf, msg, ctx, false)?;
                        }
                        msg.state = MsgState::Done;
                    }
                } else {
                    // close-delimited: everything received is body
                    let avail = pending as usize;
                    match comp {
                        Some(ref mut ctx) => {
                            msg.chunk_len = avail as u64;
                            if avail > 0 && !squeeze_region(chn, msg, ctx, avail)? {
                                break false;
                            }
                        }
                        None => msg.next += avail,
                    }
                    msg.body_len += avail as u64;
                    if chn.flags.contains(ChanFlags::SHUTR) {
                        if let Some(ref mut ctx) = comp {
                            squeeze_finish(&mut chn.buf, msg, ctx, false)?;
                        }
                        msg.state = MsgState::Done;
                    } else {
                        break false;
                    }
                }
            }
            MsgState::ChunkCrlf => match skip_chunk_crlf(&chn.buf, msg)? {
                Step::Complete(span) => {
                    if comp.is_some() {
                        drop_envelope(&mut chn.buf, msg, span);
                    }
                }
                Step::Partial => {
                    if chn.flags.contains(ChanFlags::SHUTR) {
                        return Err(Error::new_incomplete());
                    }
                    break false;
                }
            },
            MsgState::Trailers => match forward_trailers(&chn.buf, msg)? {
                Step::Complete(_) => {}
                Step::Partial => {
                    if chn.flags.contains(ChanFlags::SHUTR) {
                        return Err(Error::new_incomplete());
                    }
                    break false;
                }
            },
            MsgState::Done | MsgState::Closing | MsgState::Closed => break true,
            MsgState::Tunnel => {
                // blind passthrough
                msg.next = chn.buf.input();
                break true;
            }
            MsgState::Error => break true,
            state => unreachable!("forward_body in head state {:?}", state),
        }
    };

    // ship everything validated so far
    let n = msg.next;
    if n > 0 {
        chn.buf.forward(n);
        msg.rewind(n);
    }
    Ok(done && msg.state != MsgState::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::MsgState;

    fn msg_in(state: MsgState, flags: MsgFlags) -> Message {
        let mut msg = Message::new(state);
        msg.flags = flags;
        msg
    }

    fn chn_with(bytes: &[u8]) -> Channel {
        let mut chn = Channel::new(4096);
        assert_eq!(chn.recv(bytes), bytes.len());
        chn
    }

    #[test]
    fn chunk_size_accepts_hex_and_extensions() {
        for (raw, expect) in [
            (&b"1\r\nX"[..], 1u64),
            (&b"01\r\nX"[..], 1),
            (&b"a\r\nX"[..], 10),
            (&b"A\r\nX"[..], 10),
            (&b"Ff   \r\nX"[..], 255),
            (&b"1;ext name=value\r\nX"[..], 1),
            (&b"3   ; ext=123\r\nX"[..], 3),
            (&b"5\nX"[..], 5),
        ] {
            let chn = chn_with(raw);
            let mut msg = msg_in(MsgState::ChunkSize, MsgFlags::TE_CHNK);
            match parse_chunk_size(&chn.buf, &mut msg).unwrap() {
                Step::Complete(_) => {}
                Step::Partial => panic!("partial for {:?}", raw),
            }
            assert_eq!(msg.chunk_len, expect, "{:?}", raw);
            assert_eq!(msg.state, MsgState::Data);
        }
    }

    #[test]
    fn chunk_size_zero_goes_to_trailers() {
        let chn = chn_with(b"0\r\n");
        let mut msg = msg_in(MsgState::ChunkSize, MsgFlags::TE_CHNK);
        parse_chunk_size(&chn.buf, &mut msg).unwrap();
        assert_eq!(msg.state, MsgState::Trailers);
    }

    #[test]
    fn chunk_size_rejects_garbage_and_overflow() {
        for raw in [&b"X\r\n"[..], b"1X\r\n", b"-1\r\n", b"\r\n", b"80000000\r\n"] {
            let chn = chn_with(raw);
            let mut msg = msg_in(MsgState::ChunkSize, MsgFlags::TE_CHNK);
            assert!(parse_chunk_size(&chn.buf, &mut msg).is_err(), "{:?}", raw);
        }
        // largest acceptable value
        let chn = chn_with(b"7fffffff\r\n");
        let mut msg = msg_in(MsgState::ChunkSize, MsgFlags::TE_CHNK);
        parse_chunk_size(&chn.buf, &mut msg).unwrap();
        assert_eq!(msg.chunk_len, 0x7fff_ffff);
    }

    #[test]
    fn chunk_size_waits_for_full_line() {
        for raw in [&b"F"[..], b"F\r", b"1;no CRLF"] {
            let chn = chn_with(raw);
            let mut msg = msg_in(MsgState::ChunkSize, MsgFlags::TE_CHNK);
            assert_eq!(parse_chunk_size(&chn.buf, &mut msg).unwrap(), Step::Partial);
            assert_eq!(msg.next, 0, "{:?}", raw);
        }
    }

    #[test]
    fn content_length_body_forwards_exactly() {
        let mut chn = chn_with(b"abc");
        let mut msg = msg_in(MsgState::Body, MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        msg.chunk_len = 3;
        msg.body_len = 3;
        assert!(forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(msg.state, MsgState::Done);
        assert_eq!(&chn.buf.pull(64)[..], b"abc");
        assert_eq!(msg.body_len, 3);
    }

    #[test]
    fn content_length_split_arrival() {
        let mut chn = chn_with(b"ab");
        let mut msg = msg_in(MsgState::Body, MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        msg.chunk_len = 5;
        msg.body_len = 5;
        assert!(!forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(&chn.buf.pull(64)[..], b"ab");
        chn.recv(b"cde");
        assert!(forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(&chn.buf.pull(64)[..], b"cde");
        assert_eq!(msg.state, MsgState::Done);
    }

    #[test]
    fn chunked_body_forwards_envelope_verbatim() {
        let raw = b"5\r\nhello\r\n0\r\n\r\n";
        let mut chn = chn_with(raw);
        let mut msg = msg_in(MsgState::Body, MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
        assert!(forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(msg.state, MsgState::Done);
        assert_eq!(&chn.buf.pull(64)[..], &raw[..]);
        assert_eq!(msg.body_len, 5);
    }

    #[test]
    fn chunked_body_with_trailers() {
        let raw = b"3\r\nfoo\r\n3\r\nbar\r\n0\r\nExpires: never\r\n\r\n";
        let mut chn = chn_with(raw);
        let mut msg = msg_in(MsgState::Body, MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
        assert!(forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(msg.state, MsgState::Done);
        assert_eq!(&chn.buf.pull(128)[..], &raw[..]);
        assert_eq!(msg.body_len, 6);
    }

    #[test]
    fn chunked_resumable_at_every_byte() {
        let raw: &[u8] = b"4\r\nwiki\r\n6;x=y\r\npedia \r\nE\r\nin \r\nchunks.\r\n0\r\n\r\n";
        for cut in 0..raw.len() {
            let mut chn = Channel::new(4096);
            chn.recv(&raw[..cut]);
            let mut msg = msg_in(MsgState::Body, MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
            let mut out = Vec::new();
            assert!(!forward_body(&mut chn, &mut msg, None).unwrap() || cut == raw.len());
            out.extend_from_slice(&chn.buf.pull(4096));
            chn.recv(&raw[cut..]);
            assert!(forward_body(&mut chn, &mut msg, None).unwrap(), "cut {}", cut);
            out.extend_from_slice(&chn.buf.pull(4096));
            assert_eq!(out, raw, "cut {}", cut);
            assert_eq!(msg.body_len, 4 + 6 + 14, "cut {}", cut);
        }
    }

    #[test]
    fn eof_body_finishes_on_shutdown() {
        let mut chn = chn_with(b"stream until close");
        let mut msg = msg_in(MsgState::Body, MsgFlags::empty());
        assert!(!forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(&chn.buf.pull(64)[..], b"stream until close");
        chn.recv(b"!");
        chn.shutr();
        assert!(forward_body(&mut chn, &mut msg, None).unwrap());
        assert_eq!(msg.state, MsgState::Done);
        assert_eq!(msg.body_len, 19);
    }

    #[test]
    fn early_close_is_incomplete() {
        let mut chn = chn_with(b"ab");
        chn.shutr();
        let mut msg = msg_in(MsgState::Body, MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        msg.chunk_len = 5;
        let err = forward_body(&mut chn, &mut msg, None).unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[test]
    fn early_close_mid_chunk_envelope_is_incomplete() {
        let mut chn = chn_with(b"5\r\nhello\r\n");
        chn.shutr();
        let mut msg = msg_in(MsgState::Body, MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
        let err = forward_body(&mut chn, &mut msg, None).unwrap_err();
        assert!(err.is_incomplete_message());
    }
}
