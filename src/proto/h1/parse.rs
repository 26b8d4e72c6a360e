//! Resumable HTTP/1.x message parser.
//!
//! One state machine consumes request and response heads byte by byte
//! over the channel's ring buffer. It can be preempted at any byte:
//! whenever input runs dry it commits `(state, next)` into the
//! [`Message`] and returns, and a later call resumes exactly there with
//! no semantic loss. Token boundaries are committed only once complete,
//! so a resumed parse never re-reads or half-updates anything else.
//!
//! Deviations from the RFC grammar are deliberate and documented:
//! bare LF is accepted wherever CRLF is, empty lines before a message
//! are silently stripped, and obs-fold continuations are rewritten in
//! place to spaces so downstream consumers always see one logical line.

use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{Error, Parse};
use crate::proto::h1::hdr::HeaderIndex;
use crate::proto::h1::{Message, MsgFlags, MsgState, StartLine};

const CC_SPHT: u8 = 0x01;
const CC_CRLF: u8 = 0x02;
const CC_TOKEN: u8 = 0x04;
const CC_VER: u8 = 0x08;
const CC_CTL: u8 = 0x10;
const CC_SEP: u8 = 0x20;

const fn is_sep_byte(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

const fn build_classes() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        let mut c = 0u8;
        if b == b' ' || b == b'\t' {
            c |= CC_SPHT;
        }
        if b == b'\r' || b == b'\n' {
            c |= CC_CRLF;
        }
        if i < 32 || i == 127 {
            c |= CC_CTL;
        }
        if is_sep_byte(b) {
            c |= CC_SEP;
        }
        // tchar = ALPHA / DIGIT / "!#$%&'*+-.^_`|~"
        if (b >= b'a' && b <= b'z')
            || (b >= b'A' && b <= b'Z')
            || (b >= b'0' && b <= b'9')
            || matches!(
                b,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            )
        {
            c |= CC_TOKEN;
        }
        // HTTP-version alphabet
        if (b >= b'a' && b <= b'z')
            || (b >= b'A' && b <= b'Z')
            || (b >= b'0' && b <= b'9')
            || b == b'.'
            || b == b'/'
        {
            c |= CC_VER;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CLASSES: [u8; 256] = build_classes();

/// SP or HT.
#[inline]
pub fn is_spht(b: u8) -> bool {
    CLASSES[b as usize] & CC_SPHT != 0
}

/// CR or LF.
#[inline]
pub fn is_crlf(b: u8) -> bool {
    CLASSES[b as usize] & CC_CRLF != 0
}

/// SP, HT, CR or LF.
#[inline]
pub fn is_lws(b: u8) -> bool {
    CLASSES[b as usize] & (CC_SPHT | CC_CRLF) != 0
}

/// RFC 7230 `tchar`.
#[inline]
pub fn is_token(b: u8) -> bool {
    CLASSES[b as usize] & CC_TOKEN != 0
}

/// HTTP version alphabet.
#[inline]
pub fn is_ver_token(b: u8) -> bool {
    CLASSES[b as usize] & CC_VER != 0
}

/// ASCII control byte.
#[inline]
pub fn is_ctl(b: u8) -> bool {
    CLASSES[b as usize] & CC_CTL != 0
}

/// RFC 2616 separator.
#[inline]
pub fn is_sep(b: u8) -> bool {
    CLASSES[b as usize] & CC_SEP != 0
}

/// True when a version slice advertises HTTP/1.1 or later.
fn version_is_11(buf: &Buffer, v: usize, v_l: usize) -> bool {
    // "HTTP/1." followed by anything but '0'.
    if v_l < 8 {
        return false;
    }
    const PREFIX: &[u8] = b"HTTP/1.";
    for (k, &p) in PREFIX.iter().enumerate() {
        if buf.byte(v + k) != p {
            return false;
        }
    }
    buf.byte(v + 7) != b'0'
}

/// Drives the head parser over the pending input.
///
/// Progress is recorded in `msg`; on protocol errors `msg.state`
/// becomes [`MsgState::Error`] with `err_pos` at the offending byte.
/// The caller maps that to 400 on a request and 502 on a response.
pub fn parse_message(
    buf: &mut Buffer,
    msg: &mut Message,
    idx: &mut HeaderIndex,
    accept_invalid: bool,
) {
    if msg.state.head_complete() || msg.state == MsgState::Error {
        return;
    }
    let mut state = msg.state;
    let mut next = msg.next;

    macro_rules! fail {
        () => {{
            if msg.err_pos.is_none() {
                msg.err_pos = Some(next);
            }
            msg.state = MsgState::Error;
            msg.next = next;
            return;
        }};
    }

    loop {
        if next >= buf.input() {
            break;
        }
        let b = buf.byte(next);
        match state {
            // ------------------------ request line -----------------------
            MsgState::RqBefore => {
                if is_token(b) {
                    if next > 0 {
                        // empty leading lines, silently stripped
                        buf.delete(0, next);
                        next = 0;
                    }
                    msg.sol = 0;
                    msg.start = StartLine::Request {
                        m_l: 0,
                        u: 0,
                        u_l: 0,
                        v: 0,
                        v_l: 0,
                    };
                    state = MsgState::RqMeth;
                    continue;
                }
                match b {
                    b'\r' => {
                        state = MsgState::RqBeforeCr;
                        next += 1;
                    }
                    b'\n' => {
                        state = MsgState::RqBefore;
                        next += 1;
                    }
                    _ => fail!(),
                }
            }
            MsgState::RqBeforeCr => {
                if b == b'\n' {
                    state = MsgState::RqBefore;
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::RqMeth => {
                if is_token(b) {
                    next += 1;
                } else if is_spht(b) {
                    if let StartLine::Request { ref mut m_l, .. } = msg.start {
                        *m_l = next;
                    }
                    state = MsgState::RqMethSp;
                    next += 1;
                } else if is_crlf(b) {
                    // HTTP/0.9 with no URI at all
                    if let StartLine::Request {
                        ref mut m_l,
                        ref mut u,
                        ref mut v,
                        ..
                    } = msg.start
                    {
                        *m_l = next;
                        *u = next;
                        *v = next;
                    }
                    msg.eol = next;
                    state = MsgState::RqLineEnd;
                } else {
                    fail!()
                }
            }
            MsgState::RqMethSp => {
                if is_spht(b) {
                    next += 1;
                } else if is_crlf(b) {
                    if let StartLine::Request {
                        ref mut u, ref mut v, ..
                    } = msg.start
                    {
                        *u = next;
                        *v = next;
                    }
                    msg.eol = next;
                    state = MsgState::RqLineEnd;
                } else {
                    if let StartLine::Request { ref mut u, .. } = msg.start {
                        *u = next;
                    }
                    state = MsgState::RqUri;
                }
            }
            MsgState::RqUri => {
                if (0x21..=0x7e).contains(&b) {
                    next += 1;
                } else if is_spht(b) {
                    if let StartLine::Request { u, ref mut u_l, .. } = msg.start {
                        *u_l = next - u;
                    }
                    state = MsgState::RqUriSp;
                    next += 1;
                } else if is_crlf(b) {
                    // degenerate HTTP/0.9 request line
                    if let StartLine::Request {
                        u,
                        ref mut u_l,
                        ref mut v,
                        ..
                    } = msg.start
                    {
                        *u_l = next - u;
                        *v = next;
                    }
                    msg.eol = next;
                    state = MsgState::RqLineEnd;
                } else if b >= 0x80 {
                    // tolerated, but flagged unless explicitly accepted
                    if !accept_invalid && msg.err_pos.is_none() {
                        msg.err_pos = Some(next);
                    }
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::RqUriSp => {
                if is_spht(b) {
                    next += 1;
                } else if is_crlf(b) {
                    if let StartLine::Request { ref mut v, .. } = msg.start {
                        *v = next;
                    }
                    msg.eol = next;
                    state = MsgState::RqLineEnd;
                } else {
                    if let StartLine::Request { ref mut v, .. } = msg.start {
                        *v = next;
                    }
                    state = MsgState::RqVer;
                }
            }
            MsgState::RqVer => {
                if is_ver_token(b) {
                    next += 1;
                } else if is_crlf(b) {
                    if let StartLine::Request { v, ref mut v_l, .. } = msg.start {
                        *v_l = next - v;
                        if version_is_11(buf, v, next - v) {
                            msg.flags.insert(MsgFlags::VER_11);
                        }
                    }
                    msg.eol = next;
                    state = MsgState::RqLineEnd;
                } else {
                    fail!()
                }
            }
            MsgState::RqLineEnd | MsgState::RpLineEnd => {
                if b == b'\r' {
                    if next != msg.eol {
                        fail!()
                    }
                    next += 1;
                } else if b == b'\n' {
                    let cr = next > msg.eol;
                    idx.set_start(msg.eol, cr);
                    next += 1;
                    // an HTTP/0.9 request line is the entire head
                    let v09 = matches!(msg.start, StartLine::Request { v_l: 0, .. });
                    if state == MsgState::RqLineEnd && v09 {
                        msg.eoh = msg.eol;
                        msg.sov = next;
                        msg.next = next;
                        msg.sol = 0;
                        msg.state = MsgState::Body;
                        return;
                    }
                    state = MsgState::HdrFirst;
                } else {
                    fail!()
                }
            }
            // ------------------------ status line ------------------------
            MsgState::RpBefore => {
                if is_ver_token(b) {
                    if next > 0 {
                        buf.delete(0, next);
                        next = 0;
                    }
                    msg.sol = 0;
                    msg.start = StartLine::Status {
                        v_l: 0,
                        c: 0,
                        c_l: 0,
                        r: 0,
                        r_l: 0,
                    };
                    state = MsgState::RpVer;
                    continue;
                }
                match b {
                    b'\r' => {
                        state = MsgState::RpBeforeCr;
                        next += 1;
                    }
                    b'\n' => {
                        state = MsgState::RpBefore;
                        next += 1;
                    }
                    _ => fail!(),
                }
            }
            MsgState::RpBeforeCr => {
                if b == b'\n' {
                    state = MsgState::RpBefore;
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::RpVer => {
                if is_ver_token(b) {
                    next += 1;
                } else if is_spht(b) {
                    if let StartLine::Status { ref mut v_l, .. } = msg.start {
                        *v_l = next;
                    }
                    if version_is_11(buf, 0, next) {
                        msg.flags.insert(MsgFlags::VER_11);
                    }
                    state = MsgState::RpVerSp;
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::RpVerSp => {
                if is_spht(b) {
                    next += 1;
                } else if !is_crlf(b) {
                    if let StartLine::Status { ref mut c, .. } = msg.start {
                        *c = next;
                    }
                    state = MsgState::RpCode;
                } else {
                    // status line with no code
                    fail!()
                }
            }
            MsgState::RpCode => {
                if !is_lws(b) {
                    next += 1;
                } else if is_spht(b) {
                    if let StartLine::Status { c, ref mut c_l, .. } = msg.start {
                        *c_l = next - c;
                    }
                    state = MsgState::RpCodeSp;
                    next += 1;
                } else {
                    // CRLF: empty reason is acceptable
                    if let StartLine::Status {
                        c,
                        ref mut c_l,
                        ref mut r,
                        ..
                    } = msg.start
                    {
                        *c_l = next - c;
                        *r = next;
                    }
                    msg.eol = next;
                    state = MsgState::RpLineEnd;
                }
            }
            MsgState::RpCodeSp => {
                if is_spht(b) {
                    next += 1;
                } else if !is_crlf(b) {
                    if let StartLine::Status { ref mut r, .. } = msg.start {
                        *r = next;
                    }
                    state = MsgState::RpReason;
                } else {
                    if let StartLine::Status { ref mut r, .. } = msg.start {
                        *r = next;
                    }
                    msg.eol = next;
                    state = MsgState::RpLineEnd;
                }
            }
            MsgState::RpReason => {
                if !is_crlf(b) {
                    next += 1;
                } else {
                    if let StartLine::Status { r, ref mut r_l, .. } = msg.start {
                        *r_l = next - r;
                    }
                    msg.eol = next;
                    state = MsgState::RpLineEnd;
                }
            }
            // ------------------------ header block -----------------------
            MsgState::HdrFirst => {
                msg.sol = next;
                if b == b'\r' {
                    msg.eoh = next;
                    state = MsgState::LastLf;
                    next += 1;
                } else if b == b'\n' {
                    msg.eoh = next;
                    state = MsgState::LastLf;
                } else if is_token(b) {
                    state = MsgState::HdrName;
                } else {
                    fail!()
                }
            }
            MsgState::HdrName => {
                if is_token(b) {
                    next += 1;
                } else if b == b':' {
                    state = MsgState::HdrL1Sp;
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::HdrL1Sp => {
                if is_spht(b) {
                    next += 1;
                } else if b == b'\r' {
                    msg.sov = next;
                    msg.eol = next;
                    state = MsgState::HdrL1Lf;
                    next += 1;
                } else if b == b'\n' {
                    msg.sov = next;
                    msg.eol = next;
                    state = MsgState::HdrL1Lf;
                } else {
                    msg.sov = next;
                    state = MsgState::HdrVal;
                }
            }
            MsgState::HdrL1Lf | MsgState::HdrL2Lf => {
                if b == b'\n' {
                    let lws = if state == MsgState::HdrL1Lf {
                        MsgState::HdrL1Lws
                    } else {
                        MsgState::HdrL2Lws
                    };
                    state = lws;
                    next += 1;
                } else {
                    fail!()
                }
            }
            MsgState::HdrL1Lws | MsgState::HdrL2Lws => {
                if is_spht(b) {
                    // obs-fold: erase the terminator and the fold byte
                    // in place so the line stays one logical value
                    buf.set_byte(msg.eol, b' ');
                    if msg.eol + 1 < next {
                        buf.set_byte(msg.eol + 1, b' ');
                    }
                    buf.set_byte(next, b' ');
                    state = MsgState::HdrVal;
                    next += 1;
                } else {
                    // line complete, register its cell
                    let cr = buf.byte(msg.eol) == b'\r';
                    if idx.add(msg.eol - msg.sol, cr).is_err() {
                        fail!()
                    }
                    state = MsgState::HdrFirst;
                }
            }
            MsgState::HdrVal => {
                if !is_crlf(b) {
                    next += 1;
                } else if b == b'\r' {
                    msg.eol = next;
                    state = MsgState::HdrL2Lf;
                    next += 1;
                } else {
                    msg.eol = next;
                    state = MsgState::HdrL2Lf;
                }
            }
            MsgState::LastLf => {
                if b == b'\n' {
                    next += 1;
                    msg.sov = next;
                    msg.next = next;
                    msg.eol = msg.eoh;
                    msg.sol = 0;
                    msg.state = MsgState::Body;
                    trace!(eoh = msg.eoh, headers = idx.used(), "head complete");
                    return;
                } else {
                    fail!()
                }
            }
            // Body and later states never re-enter the head parser.
            _ => unreachable!("parse_message in state {:?}", state),
        }
    }

    msg.state = state;
    msg.next = next;
}

/// Rewrites an HTTP/0.9 request line into HTTP/1.0 form and re-parses
/// it. Only GET is permitted in 0.9.
pub fn upgrade_v09_to_v10(
    buf: &mut Buffer,
    msg: &mut Message,
    idx: &mut HeaderIndex,
    accept_invalid: bool,
) -> Result<(), Error> {
    let (m_l, u_l) = match msg.start {
        StartLine::Request { m_l, u_l, v_l: 0, .. } => (m_l, u_l),
        _ => return Ok(()),
    };
    if u_l == 0 {
        return Err(Error::new_parse(Parse::Uri));
    }
    if m_l != 3 || buf.byte(0) != b'G' || buf.byte(1) != b'E' || buf.byte(2) != b'T' {
        return Err(Error::new_parse(Parse::Method));
    }
    // the old CRLF becomes the empty line closing the head
    buf.insert(msg.eoh, b" HTTP/1.0\r\n")?;
    msg.reset(MsgState::RqBefore);
    idx.reset();
    parse_message(buf, msg, idx, accept_invalid);
    if msg.state == MsgState::Error || !msg.state.head_complete() {
        return Err(Error::new_parse(Parse::Version));
    }
    Ok(())
}

/// Extracts the request method tag once the head is complete.
pub fn request_method(buf: &Buffer, msg: &Message) -> http::Method {
    match msg.start {
        StartLine::Request { m_l, .. } => {
            let raw = buf.copy_range(0, m_l);
            http::Method::from_bytes(&raw).unwrap_or(http::Method::GET)
        }
        _ => http::Method::GET,
    }
}

/// Extracts the status code once a response head is complete. Returns
/// 0 when the code is not a well-formed number.
pub fn response_status(buf: &Buffer, msg: &Message) -> u16 {
    match msg.start {
        StartLine::Status { c, c_l, .. } => {
            let mut code: u32 = 0;
            for k in 0..c_l {
                let b = buf.byte(c + k);
                if !b.is_ascii_digit() {
                    return 0;
                }
                code = code * 10 + (b - b'0') as u32;
                if code > 999 {
                    return 0;
                }
            }
            if c_l == 0 {
                0
            } else {
                code as u16
            }
        }
        _ => 0,
    }
}
