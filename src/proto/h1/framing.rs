//! Transfer-length determination.
//!
//! Once a head is complete, the framing pass settles how the body is
//! delimited, following the precedence of RFC 7230 section 3.3.3:
//!
//! 1. Responses to HEAD and 1xx/204/304 responses never have a body.
//! 2. A 2xx response to CONNECT switches the connection to a tunnel;
//!    any Transfer-Encoding or Content-Length present is meaningless.
//! 3. A Transfer-Encoding ending in `chunked` wins over everything.
//!    `chunked` present but not final is a hard error on a request and
//!    read-until-close on a response.
//! 4. When both Transfer-Encoding and Content-Length are present, the
//!    Content-Length is stripped before the message is forwarded.
//! 5. A valid Content-Length delimits the body. Multiple values must
//!    agree; anything else is a hard error.
//! 6. Otherwise a request has no body.
//! 7. Otherwise a response body runs until the server closes.

use http::Method;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Parse};
use crate::proto::h1::hdr::{self, HeaderCursor, HeaderIndex};
use crate::proto::h1::{Message, MsgFlags};

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all.
    Empty,
    /// Chunked transfer coding.
    Chunked,
    /// Exactly this many bytes.
    Length(u64),
    /// Read until the peer closes (responses only).
    Eof,
    /// Both directions switch to blind forwarding.
    Tunnel,
}

/// Outcome of scanning the Transfer-Encoding headers.
enum TeScan {
    None,
    Chunked,
    /// `chunked` appeared somewhere other than as the final coding.
    ChunkedNotLast,
    /// Some other final coding; length is unknown.
    Other,
}

fn scan_transfer_encoding(buf: &Buffer, idx: &HeaderIndex) -> TeScan {
    let mut ctx = HeaderCursor::new();
    let mut saw_any = false;
    let mut saw_chunked = false;
    let mut last_is_chunked = false;
    while hdr::find_header(b"Transfer-Encoding", buf, idx, &mut ctx, false) {
        saw_any = true;
        let v = ctx.value(buf);
        last_is_chunked = v.eq_ignore_ascii_case(b"chunked");
        if last_is_chunked {
            saw_chunked = true;
        }
    }
    if !saw_any {
        TeScan::None
    } else if last_is_chunked {
        TeScan::Chunked
    } else if saw_chunked {
        TeScan::ChunkedNotLast
    } else {
        TeScan::Other
    }
}

/// Folds every Content-Length value; they must all be identical and
/// well formed, otherwise the message is unusable.
fn scan_content_length(buf: &Buffer, idx: &HeaderIndex) -> Result<Option<u64>, Error> {
    let mut ctx = HeaderCursor::new();
    let mut found: Option<u64> = None;
    while hdr::find_header(b"Content-Length", buf, idx, &mut ctx, false) {
        let v = ctx.value(buf);
        if v.is_empty() {
            return Err(Error::new_parse(Parse::ContentLength));
        }
        let mut n: u64 = 0;
        for &b in &v {
            if !b.is_ascii_digit() {
                return Err(Error::new_parse(Parse::ContentLength));
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as u64))
                .ok_or_else(|| Error::new_parse(Parse::ContentLength))?;
        }
        match found {
            Some(prev) if prev != n => {
                debug!(prev, n, "conflicting content-length values");
                return Err(Error::new_parse(Parse::ContentLength));
            }
            _ => found = Some(n),
        }
    }
    Ok(found)
}

/// Settles the request body mode. Errors map to 400 Bad Request.
pub fn analyze_request(
    buf: &mut Buffer,
    msg: &mut Message,
    idx: &mut HeaderIndex,
) -> Result<Framing, Error> {
    // Transfer-Encoding is an HTTP/1.1 construct, ignore it from 1.0.
    let te = if msg.flags.contains(MsgFlags::VER_11) {
        scan_transfer_encoding(buf, idx)
    } else {
        TeScan::None
    };

    match te {
        TeScan::Chunked => {
            msg.flags.insert(MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
        }
        TeScan::ChunkedNotLast | TeScan::Other => {
            // The body length cannot be determined reliably.
            return Err(Error::new_parse(Parse::TransferEncoding));
        }
        TeScan::None => {}
    }

    let cl = scan_content_length(buf, idx)?;
    if msg.flags.contains(MsgFlags::TE_CHNK) {
        if cl.is_some() {
            hdr::del_header(buf, idx, msg, b"Content-Length");
        }
        return Ok(Framing::Chunked);
    }
    if let Some(n) = cl {
        msg.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        msg.body_len = n;
        msg.chunk_len = n;
        return Ok(Framing::Length(n));
    }

    // A request without a declared body has none.
    msg.flags.insert(MsgFlags::XFER_LEN);
    msg.body_len = 0;
    msg.chunk_len = 0;
    Ok(Framing::Empty)
}

/// Settles the response body mode. Errors map to 502 Bad Gateway.
pub fn analyze_response(
    buf: &mut Buffer,
    msg: &mut Message,
    idx: &mut HeaderIndex,
    req_meth: &Method,
    status: u16,
) -> Result<Framing, Error> {
    if *req_meth == Method::HEAD
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        msg.flags.insert(MsgFlags::XFER_LEN);
        msg.body_len = 0;
        msg.chunk_len = 0;
        return Ok(Framing::Empty);
    }

    if *req_meth == Method::CONNECT && (200..300).contains(&status) {
        // Framing fields are meaningless from here on.
        return Ok(Framing::Tunnel);
    }

    let te = if msg.flags.contains(MsgFlags::VER_11) {
        scan_transfer_encoding(buf, idx)
    } else {
        TeScan::None
    };

    match te {
        TeScan::Chunked => {
            msg.flags.insert(MsgFlags::TE_CHNK | MsgFlags::XFER_LEN);
            if scan_content_length(buf, idx)?.is_some() {
                hdr::del_header(buf, idx, msg, b"Content-Length");
            }
            return Ok(Framing::Chunked);
        }
        TeScan::ChunkedNotLast | TeScan::Other => {
            // Length is unknown: deliver until the server closes.
            return Ok(Framing::Eof);
        }
        TeScan::None => {}
    }

    if let Some(n) = scan_content_length(buf, idx)? {
        msg.flags.insert(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN);
        msg.body_len = n;
        msg.chunk_len = n;
        return Ok(Framing::Length(n));
    }

    Ok(Framing::Eof)
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

    #[test]
    fn request_without_body() {
        let (mut buf, mut msg, mut idx) = parsed(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let framing = analyze_request(&mut buf, &mut msg, &mut idx).unwrap();
        assert_eq!(framing, Framing::Empty);
        assert!(msg.flags.contains(MsgFlags::XFER_LEN));
        assert_eq!(msg.body_len, 0);
    }

    #[test]
    fn request_with_content_length() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n");
        let framing = analyze_request(&mut buf, &mut msg, &mut idx).unwrap();
        assert_eq!(framing, Framing::Length(12));
        assert!(msg.flags.contains(MsgFlags::CNT_LEN | MsgFlags::XFER_LEN));
        assert_eq!(msg.body_len, 12);
        assert_eq!(msg.chunk_len, 12);
    }

    #[test]
    fn request_chunked() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let framing = analyze_request(&mut buf, &mut msg, &mut idx).unwrap();
        assert_eq!(framing, Framing::Chunked);
        assert!(msg.flags.contains(MsgFlags::TE_CHNK | MsgFlags::XFER_LEN));
    }

    #[test]
    fn request_chunked_not_final_is_bad() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked, gzip\r\n\r\n");
        assert!(analyze_request(&mut buf, &mut msg, &mut idx).is_err());
    }

    #[test]
    fn request_te_ignored_on_10() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n");
        let framing = analyze_request(&mut buf, &mut msg, &mut idx).unwrap();
        assert_eq!(framing, Framing::Length(5));
        assert!(!msg.flags.contains(MsgFlags::TE_CHNK));
    }

    #[test]
    fn conflicting_lengths_rejected() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n");
        assert!(analyze_request(&mut buf, &mut msg, &mut idx).is_err());
    }

    #[test]
    fn duplicate_equal_lengths_accepted() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nContent-Length: 4, 4\r\n\r\n");
        let framing = analyze_request(&mut buf, &mut msg, &mut idx).unwrap();
        assert_eq!(framing, Framing::Length(4));
    }

    #[test]
    fn invalid_length_rejected() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"POST / HTTP/1.1\r\nContent-Length: 4x\r\n\r\n");
        assert!(analyze_request(&mut buf, &mut msg, &mut idx).is_err());
    }

    #[test]
    fn te_wins_and_content_length_is_stripped() {
        let (mut buf, mut msg, mut idx) = parsed(
            b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let before = idx.used();
        let framing =
            analyze_response(&mut buf, &mut msg, &mut idx, &Method::GET, 200).unwrap();
        assert_eq!(framing, Framing::Chunked);
        assert_eq!(idx.used(), before - 1);
        let mut ctx = HeaderCursor::new();
        assert!(!hdr::find_header(b"Content-Length", &buf, &idx, &mut ctx, true));
    }

    #[test]
    fn response_head_and_status_without_body() {
        for (meth, status) in [
            (Method::HEAD, 200),
            (Method::GET, 101),
            (Method::GET, 204),
            (Method::GET, 304),
        ] {
            let (mut buf, mut msg, mut idx) =
                parsed(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n");
            let framing =
                analyze_response(&mut buf, &mut msg, &mut idx, &meth, status).unwrap();
            assert_eq!(framing, Framing::Empty, "{:?} {}", meth, status);
            assert_eq!(msg.chunk_len, 0);
            assert!(msg.flags.contains(MsgFlags::XFER_LEN));
        }
    }

    #[test]
    fn connect_2xx_tunnels_regardless_of_framing_headers() {
        let (mut buf, mut msg, mut idx) = parsed(
            b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let before = idx.used();
        let framing =
            analyze_response(&mut buf, &mut msg, &mut idx, &Method::CONNECT, 200).unwrap();
        assert_eq!(framing, Framing::Tunnel);
        // framing headers are left alone and meaningless
        assert_eq!(idx.used(), before);
        assert!(!msg.flags.contains(MsgFlags::TE_CHNK));
    }

    #[test]
    fn response_chunked_not_final_reads_to_close() {
        let (mut buf, mut msg, mut idx) =
            parsed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked, gzip\r\n\r\n");
        let framing =
            analyze_response(&mut buf, &mut msg, &mut idx, &Method::GET, 200).unwrap();
        assert_eq!(framing, Framing::Eof);
        assert!(!msg.flags.contains(MsgFlags::XFER_LEN));
    }

    #[test]
    fn response_without_length_reads_to_close() {
        let (mut buf, mut msg, mut idx) = parsed(b"HTTP/1.1 200 OK\r\n\r\n");
        let framing =
            analyze_response(&mut buf, &mut msg, &mut idx, &Method::GET, 200).unwrap();
        assert_eq!(framing, Framing::Eof);
        assert!(!msg.flags.contains(MsgFlags::XFER_LEN));
    }
}
