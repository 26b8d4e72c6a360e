//! Connection mode resolution and Connection header surgery.
//!
//! Each side of the proxy is configured with an HTTP connection mode;
//! the transaction combines both with what the messages themselves
//! allow into a single wanted mode, most restrictive wins. The header
//! mutations then make the wire agree with the decision: redundant
//! `Connection` tokens are dropped, missing ones are added, and when
//! the frontend talks old proxy dialect the `Proxy-Connection` header
//! is mutated instead.

use bitflags::bitflags;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::proto::h1::hdr::{self, HeaderCursor, HeaderIndex};
use crate::proto::h1::{Message, MsgFlags};

/// Per-proxy configured HTTP connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyConnMode {
    /// First transaction analysed, the rest passes through blindly.
    Tunnel,
    /// Keep both sides alive between transactions.
    KeepAlive,
    /// Close the server side after each transaction.
    ServerClose,
    /// Let the peers close by themselves, advertise close.
    PassiveClose,
    /// Actively close both sides after the transaction.
    ForceClose,
}

/// Wanted mode for the current transaction.
///
/// Ordering is restrictiveness: combining two wishes takes the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WantMode {
    /// Keep the connection alive on both sides.
    KeepAlive,
    /// Switch to blind passthrough after this transaction starts.
    Tunnel,
    /// Close the server side, keep the client side.
    ServerClose,
    /// Close both sides when the transaction ends.
    Close,
}

fn configured(mode: ProxyConnMode) -> WantMode {
    match mode {
        ProxyConnMode::Tunnel => WantMode::Tunnel,
        ProxyConnMode::KeepAlive => WantMode::KeepAlive,
        ProxyConnMode::ServerClose => WantMode::ServerClose,
        ProxyConnMode::PassiveClose | ProxyConnMode::ForceClose => WantMode::Close,
    }
}

bitflags! {
    /// Facts collected from the Connection (or Proxy-Connection)
    /// header of one message.
    pub struct ConnHdr: u8 {
        /// The header was parsed at least once.
        const PARSED = 0x01;
        /// A `close` token was present.
        const CLOSE = 0x02;
        /// A `keep-alive` token was present.
        const KEEP_ALIVE = 0x04;
        /// An `upgrade` token was present.
        const UPGRADE = 0x08;
    }
}

/// Scans a connection-class header and reports which tokens it holds.
pub fn parse_connection_header(buf: &Buffer, idx: &HeaderIndex, name: &[u8]) -> ConnHdr {
    let mut flags = ConnHdr::PARSED;
    let mut ctx = HeaderCursor::new();
    while hdr::find_header(name, buf, idx, &mut ctx, false) {
        let v = ctx.value(buf);
        if v.eq_ignore_ascii_case(b"close") {
            flags.insert(ConnHdr::CLOSE);
        } else if v.eq_ignore_ascii_case(b"keep-alive") {
            flags.insert(ConnHdr::KEEP_ALIVE);
        } else if v.eq_ignore_ascii_case(b"upgrade") {
            flags.insert(ConnHdr::UPGRADE);
        }
    }
    flags
}

/// Everything the mode decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct ModeInputs {
    /// Frontend configured mode.
    pub fe_mode: ProxyConnMode,
    /// Backend configured mode.
    pub be_mode: ProxyConnMode,
    /// The request advertised HTTP/1.1.
    pub ver_11: bool,
    /// A `close` token was seen on the governing connection header.
    pub conn_close: bool,
    /// A `keep-alive` token was seen on the governing connection header.
    pub conn_keep_alive: bool,
    /// The transfer length of the response is knowable in advance.
    pub xfer_len_known: bool,
    /// The frontend is being drained for reload or shutdown.
    pub fe_stopping: bool,
}

/// Resolves the wanted connection mode, most restrictive wins —
/// except that a side configured for tunnelling gets its tunnel
/// unless the other side actively forces a close.
pub fn want_mode(inputs: &ModeInputs) -> WantMode {
    let fe = configured(inputs.fe_mode);
    let be = configured(inputs.be_mode);
    if (fe == WantMode::Tunnel || be == WantMode::Tunnel)
        && fe != WantMode::Close
        && be != WantMode::Close
    {
        return WantMode::Tunnel;
    }
    let cfg = std::cmp::max(fe, be);
    if inputs.conn_close
        || !inputs.xfer_len_known
        || inputs.fe_stopping
        || (!inputs.ver_11 && !inputs.conn_keep_alive)
    {
        return WantMode::Close;
    }
    cfg
}

/// Makes a message's connection-class header agree with the wanted
/// mode.
///
/// Redundant tokens are removed: `keep-alive` is implicit in 1.1 and
/// unwanted at server-close or stricter (unless fake keep-alive is
/// on), `close` is implicit in 1.0. A missing `close` is added on 1.1
/// messages heading for closure, a `keep-alive` only on 1.0 messages
/// kept alive.
pub fn adjust_connection(
    buf: &mut Buffer,
    idx: &mut HeaderIndex,
    msg: &mut Message,
    want: WantMode,
    fake_ka: bool,
    name: &[u8],
) -> Result<(), Error> {
    let ver_11 = msg.flags.contains(MsgFlags::VER_11);
    let mut has_close = false;
    let mut has_ka = false;

    let mut ctx = HeaderCursor::new();
    while hdr::find_header(name, buf, idx, &mut ctx, false) {
        let v = ctx.value(buf);
        if v.eq_ignore_ascii_case(b"keep-alive") {
            let redundant = ver_11 || (want >= WantMode::ServerClose && !fake_ka);
            if redundant {
                hdr::remove_value(buf, idx, msg, &mut ctx);
            } else {
                has_ka = true;
            }
        } else if v.eq_ignore_ascii_case(b"close") {
            if !ver_11 {
                hdr::remove_value(buf, idx, msg, &mut ctx);
            } else {
                has_close = true;
            }
        }
    }

    if want == WantMode::Close && ver_11 && !has_close {
        let mut line = Vec::with_capacity(name.len() + 7);
        line.extend_from_slice(name);
        line.extend_from_slice(b": close");
        hdr::add_header(buf, idx, msg, &line)?;
    }
    if want == WantMode::KeepAlive && !ver_11 && !has_ka {
        let mut line = Vec::with_capacity(name.len() + 12);
        line.extend_from_slice(name);
        line.extend_from_slice(b": keep-alive");
        hdr::add_header(buf, idx, msg, &line)?;
    }
    Ok(())
}
