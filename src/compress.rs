//! Response compression negotiation.
//!
//! The engine never implements a coding itself: algorithms are
//! registered through the [`Compressor`] seam and matched against the
//! request's `Accept-Encoding` by q-value. The response side then
//! checks eligibility, performs the header surgery (drop
//! `Content-Length`, advertise `Transfer-Encoding: chunked`, add
//! `Content-Encoding`), and hands an active [`CompCtx`] to the body
//! forwarder which re-frames squeezed data in place.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::Error;
use crate::proto::h1::hdr::{self, HeaderCursor, HeaderIndex};
use crate::proto::h1::{Message, MsgFlags};

/// A registered compression algorithm.
pub trait Compressor: fmt::Debug {
    /// The content-coding token advertised on the wire.
    fn token(&self) -> &str;
    /// Starts a new stream.
    fn begin(&self) -> Box<dyn CompressorCtx>;
}

/// One running compression stream.
pub trait CompressorCtx: fmt::Debug {
    /// Squeezes a data region; output may be buffered internally.
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>);
    /// Flushes whatever the stream still holds.
    fn finish(&mut self, out: &mut Vec<u8>);
}

/// The identity coding: a passthrough useful as a negotiation floor
/// and in tests.
#[derive(Debug)]
pub struct Identity;

impl Compressor for Identity {
    fn token(&self) -> &str {
        "identity"
    }

    fn begin(&self) -> Box<dyn CompressorCtx> {
        Box::new(IdentityCtx)
    }
}

#[derive(Debug)]
struct IdentityCtx;

impl CompressorCtx for IdentityCtx {
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(input);
    }

    fn finish(&mut self, _out: &mut Vec<u8>) {}
}

/// Active compression state of one response.
#[derive(Debug)]
pub struct CompCtx {
    inner: Box<dyn CompressorCtx>,
    token: String,
    /// Raw body bytes consumed.
    pub consumed: u64,
    /// Squeezed bytes produced.
    pub produced: u64,
}

impl CompCtx {
    fn new(algo: &dyn Compressor) -> CompCtx {
        CompCtx {
            inner: algo.begin(),
            token: algo.token().to_owned(),
            consumed: 0,
            produced: 0,
        }
    }

    /// The negotiated coding token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Squeezes one region.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let before = out.len();
        self.inner.compress(input, out);
        self.produced += (out.len() - before) as u64;
    }

    /// Ends the stream.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        let before = out.len();
        self.inner.finish(out);
        self.produced += (out.len() - before) as u64;
    }

    /// Accounts consumed input bytes.
    pub fn add_in(&mut self, n: usize) {
        self.consumed += n as u64;
    }
}

/// Per-proxy compression settings.
#[derive(Debug, Clone, Default)]
pub struct CompressionConfig {
    /// Registered algorithms, preference order.
    pub algos: Vec<Rc<dyn Compressor>>,
    /// Compressible content-type prefixes; empty accepts any type.
    pub types: Vec<Vec<u8>>,
    /// Strip `Accept-Encoding` so upstream servers do not compress.
    pub offload: bool,
}

/// Parses an `Accept-Encoding` element quality in thousandths.
fn parse_qvalue(v: &[u8]) -> u16 {
    let mut k = 0;
    while k + 2 < v.len() {
        if (v[k] == b'q' || v[k] == b'Q') && v[k + 1] == b'=' {
            break;
        }
        k += 1;
    }
    if k + 2 >= v.len() {
        return 1000;
    }
    let num = &v[k + 2..];
    let mut q: u32 = 0;
    let mut seen_dot = false;
    let mut decimals = 0;
    for &b in num {
        match b {
            b'0'..=b'9' if !seen_dot => q = q * 10 + (b - b'0') as u32,
            b'.' => seen_dot = true,
            b'0'..=b'9' if decimals < 3 => {
                q = q * 10 + (b - b'0') as u32;
                decimals += 1;
            }
            _ => break,
        }
    }
    while decimals < 3 {
        q *= 10;
        decimals += 1;
    }
    std::cmp::min(q, 1000) as u16
}

fn ua_disables_compression(buf: &Buffer, idx: &HeaderIndex) -> bool {
    let mut ctx = HeaderCursor::new();
    if !hdr::find_header(b"User-Agent", buf, idx, &mut ctx, true) {
        return false;
    }
    let ua = ctx.value(buf);
    if !ua.starts_with(b"Mozilla/4") {
        return false;
    }
    // Old Netscape lies about codings; real MSIE 6+ is known good.
    if let Some(pos) = ua.windows(5).position(|w| w == b"MSIE ") {
        if let Some(&digit) = ua.get(pos + 5) {
            return !(b'6'..=b'9').contains(&digit);
        }
    }
    true
}

/// Picks the algorithm the client accepts with the highest quality.
/// With `offload`, the `Accept-Encoding` header is consumed so the
/// origin only ever sees plain requests.
pub fn select_request_algorithm(
    buf: &mut Buffer,
    idx: &mut HeaderIndex,
    msg: &mut Message,
    cfg: &CompressionConfig,
) -> Option<Rc<dyn Compressor>> {
    if cfg.algos.is_empty() {
        return None;
    }
    if ua_disables_compression(buf, idx) {
        debug!("user-agent excluded from compression");
        return None;
    }

    let mut best: Option<(u16, Rc<dyn Compressor>)> = None;
    let mut ctx = HeaderCursor::new();
    while hdr::find_header(b"Accept-Encoding", buf, idx, &mut ctx, false) {
        let v = ctx.value(buf);
        let token_end = v
            .iter()
            .position(|&b| b == b';' || b == b' ' || b == b'\t')
            .unwrap_or(v.len());
        let token = &v[..token_end];
        let q = parse_qvalue(&v);
        if q == 0 {
            continue;
        }
        let candidate = if token == b"*" {
            Some(cfg.algos[0].clone())
        } else {
            cfg.algos
                .iter()
                .find(|a| a.token().as_bytes().eq_ignore_ascii_case(token))
                .cloned()
        };
        if let Some(algo) = candidate {
            let better = match best {
                Some((bq, _)) => q > bq,
                None => true,
            };
            if better {
                best = Some((q, algo));
            }
        }
    }

    if cfg.offload {
        hdr::del_header(buf, idx, msg, b"Accept-Encoding");
    }
    best.map(|(_, algo)| algo)
}

fn content_type_compressible(buf: &Buffer, idx: &HeaderIndex, cfg: &CompressionConfig) -> bool {
    if cfg.types.is_empty() {
        return true;
    }
    let mut ctx = HeaderCursor::new();
    if !hdr::find_header(b"Content-Type", buf, idx, &mut ctx, true) {
        return false;
    }
    let ct = ctx.value(buf);
    cfg.types.iter().any(|t| {
        ct.len() >= t.len() && ct[..t.len()].eq_ignore_ascii_case(t)
    })
}

fn has_no_transform(buf: &Buffer, idx: &HeaderIndex) -> bool {
    let mut ctx = HeaderCursor::new();
    while hdr::find_header(b"Cache-Control", buf, idx, &mut ctx, false) {
        if ctx.value(buf).eq_ignore_ascii_case(b"no-transform") {
            return true;
        }
    }
    false
}

/// Decides whether the response may be squeezed, and if so rewrites
/// its head and opens the stream.
///
/// Requires HTTP/1.1 on both sides, a 200 status, a body worth the
/// work, no prior `Content-Encoding`, no `no-transform`, an eligible
/// content type, and headroom in the global budget.
pub fn prepare_response(
    buf: &mut Buffer,
    idx: &mut HeaderIndex,
    rsp: &mut Message,
    req_flags: MsgFlags,
    status: u16,
    cfg: &CompressionConfig,
    algo: &Rc<dyn Compressor>,
    budget_ok: bool,
) -> Result<Option<CompCtx>, Error> {
    if !budget_ok
        || status != 200
        || !req_flags.contains(MsgFlags::VER_11)
        || !rsp.flags.contains(MsgFlags::VER_11)
    {
        return Ok(None);
    }
    // a body must exist: chunked, positive length, or close-delimited
    let has_body = rsp.flags.contains(MsgFlags::TE_CHNK)
        || (rsp.flags.contains(MsgFlags::CNT_LEN) && rsp.body_len > 0)
        || !rsp.flags.contains(MsgFlags::XFER_LEN);
    if !has_body {
        return Ok(None);
    }
    let mut ctx = HeaderCursor::new();
    if hdr::find_header(b"Content-Encoding", buf, idx, &mut ctx, true) {
        return Ok(None);
    }
    if has_no_transform(buf, idx) {
        return Ok(None);
    }
    if !content_type_compressible(buf, idx, cfg) {
        return Ok(None);
    }

    let comp = CompCtx::new(algo.as_ref());
    if rsp.flags.contains(MsgFlags::CNT_LEN) {
        hdr::del_header(buf, idx, rsp, b"Content-Length");
        hdr::add_header(buf, idx, rsp, b"Transfer-Encoding: chunked")?;
    } else if !rsp.flags.contains(MsgFlags::TE_CHNK) {
        // close-delimited input still leaves as proper chunks
        hdr::add_header(buf, idx, rsp, b"Transfer-Encoding: chunked")?;
    }
    if comp.token() != "identity" {
        let mut line = Vec::with_capacity(20 + comp.token().len());
        line.extend_from_slice(b"Content-Encoding: ");
        line.extend_from_slice(comp.token().as_bytes());
        hdr::add_header(buf, idx, rsp, &line)?;
    }
    trace!(token = comp.token(), "compression engaged");
    Ok(Some(comp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::parse::parse_message;
    use crate::proto::h1::MsgState;

    fn parsed(input: &[u8]) -> (Buffer, Message, HeaderIndex) {
        let mut buf = Buffer::with_capacity(4096);
        assert_eq!(buf.put(input), input.len());
        let state = if input.starts_with(b"HTTP") {
            MsgState::RpBefore
        } else {
            MsgState::RqBefore
        };
        let mut msg = Message::new(state);
        let mut idx = HeaderIndex::new(32);
        parse_message(&mut buf, &mut msg, &mut idx, false);
        assert_eq!(msg.state, MsgState::Body);
        (buf, msg, idx)
    }

    fn cfg() -> CompressionConfig {
        CompressionConfig {
            algos: vec![Rc::new(Identity)],
            types: Vec::new(),
            offload: false,
        }
    }

    #[test]
    fn qvalue_parsing() {
        assert_eq!(parse_qvalue(b"gzip"), 1000);
        assert_eq!(parse_qvalue(b"gzip;q=0.5"), 500);
        assert_eq!(parse_qvalue(b"gzip;q=0"), 0);
        assert_eq!(parse_qvalue(b"gzip;q=1"), 1000);
        assert_eq!(parse_qvalue(b"gzip; q=0.04"), 40);
    }

    #[test]
    fn negotiates_highest_quality() {
        let (mut buf, mut msg, mut idx) = parsed(
            b"GET / HTTP/1.1\r\nAccept-Encoding: identity;q=0.4, unknown;q=1\r\n\r\n",
        );
        let algo = select_request_algorithm(&mut buf, &mut idx, &mut msg, &cfg()).unwrap();
        assert_eq!(algo.token(), "identity");
    }

    #[test]
    fn rejects_q_zero() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"GET / HTTP/1.1\r\nAccept-Encoding: identity;q=0\r\n\r\n");
        assert!(select_request_algorithm(&mut buf, &mut idx, &mut msg, &cfg()).is_none());
    }

    #[test]
    fn old_mozilla_excluded_but_msie_allowed() {
        let (mut buf, mut msg, mut idx) = parsed(
            b"GET / HTTP/1.1\r\nAccept-Encoding: identity\r\nUser-Agent: Mozilla/4.7\r\n\r\n",
        );
        assert!(select_request_algorithm(&mut buf, &mut idx, &mut msg, &cfg()).is_none());
        let (mut buf, mut msg, mut idx) = parsed(
            b"GET / HTTP/1.1\r\nAccept-Encoding: identity\r\nUser-Agent: Mozilla/4.0 (compatible; MSIE 7.0)\r\n\r\n",
        );
        assert!(select_request_algorithm(&mut buf, &mut idx, &mut msg, &cfg()).is_some());
    }

    #[test]
    fn offload_strips_header() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"GET / HTTP/1.1\r\nAccept-Encoding: identity\r\nHost: h\r\n\r\n");
        let mut c = cfg();
        c.offload = true;
        assert!(select_request_algorithm(&mut buf, &mut idx, &mut msg, &c).is_some());
        let mut ctx = HeaderCursor::new();
        assert!(!hdr::find_header(b"Accept-Encoding", &buf, &idx, &mut ctx, true));
    }

    #[test]
    fn response_surgery_swaps_length_for_chunks() {
        let (mut buf, mut rsp, mut idx) =
            parsed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/html\r\n\r\n");
        rsp.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        rsp.body_len = 5;
        rsp.chunk_len = 5;
        let algo: Rc<dyn Compressor> = Rc::new(Identity);
        let comp = prepare_response(
            &mut buf,
            &mut idx,
            &mut rsp,
            MsgFlags::VER_11,
            200,
            &cfg(),
            &algo,
            true,
        )
        .unwrap();
        assert!(comp.is_some());
        let head = String::from_utf8(buf.copy_range(0, rsp.sov)).unwrap();
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        // identity never advertises a Content-Encoding
        assert!(!head.contains("Content-Encoding"));
    }

    #[test]
    fn response_refusals() {
        let algo: Rc<dyn Compressor> = Rc::new(Identity);
        // non-200
        let (mut buf, mut rsp, mut idx) =
            parsed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 5\r\n\r\n");
        rsp.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        rsp.body_len = 5;
        assert!(prepare_response(
            &mut buf, &mut idx, &mut rsp, MsgFlags::VER_11, 404, &cfg(), &algo, true
        )
        .unwrap()
        .is_none());
        // already encoded
        let (mut buf, mut rsp, mut idx) = parsed(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Encoding: br\r\n\r\n",
        );
        rsp.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        rsp.body_len = 5;
        assert!(prepare_response(
            &mut buf, &mut idx, &mut rsp, MsgFlags::VER_11, 200, &cfg(), &algo, true
        )
        .unwrap()
        .is_none());
        // no-transform
        let (mut buf, mut rsp, mut idx) = parsed(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: no-transform\r\n\r\n",
        );
        rsp.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        rsp.body_len = 5;
        assert!(prepare_response(
            &mut buf, &mut idx, &mut rsp, MsgFlags::VER_11, 200, &cfg(), &algo, true
        )
        .unwrap()
        .is_none());
        // HTTP/1.0 request side
        let (mut buf, mut rsp, mut idx) =
            parsed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        rsp.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        rsp.body_len = 5;
        assert!(prepare_response(
            &mut buf,
            &mut idx,
            &mut rsp,
            MsgFlags::empty(),
            200,
            &cfg(),
            &algo,
            true
        )
        .unwrap()
        .is_none());
    }
}
