//! Persistence cookie handling.
//!
//! The client's `Cookie` header is scanned attribute by attribute for
//! the backend's configured cookie; its value designates a server and
//! optionally carries two base64 30-bit dates (`last use`, `first
//! use`) that bound idleness and total life. The server's
//! `Set-Cookie` is mutated on the way back according to the
//! persistence mode.
//!
//! The capture policy is deliberate: only the *first* cookie matching
//! the configured name is captured and acted upon.

use tracing::{debug, trace};

use crate::b64;
use crate::buffer::Buffer;
use crate::error::Error;
use crate::proto::h1::hdr::{self, HeaderCursor};
use crate::proto::h1::txn::{ClientCookie, ServerCookie, Transaction};
use crate::proxy::Server;

/// Clock-skew tolerance on cookie dates, one day.
const DATE_SKEW: u32 = 86_400;

/// How the backend persists sessions to servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieMode {
    /// Observe only; the server manages its own cookie.
    Passive,
    /// The engine inserts its own cookie on responses.
    Insert,
    /// The server cookie is prefixed with the server key.
    Prefix,
    /// The server cookie value is replaced by the server key.
    Rewrite,
}

/// Backend persistence-cookie configuration.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    /// Cookie name to look for.
    pub name: Vec<u8>,
    /// Persistence mode.
    pub mode: CookieMode,
    /// Hide the cookie from servers (only meaningful with Insert).
    pub indirect: bool,
    /// Optional domain attribute on inserted cookies.
    pub domain: Option<Vec<u8>>,
    /// Max idle seconds between uses, 0 disables.
    pub maxidle: u32,
    /// Max total life seconds, 0 disables.
    pub maxlife: u32,
}

impl CookieConfig {
    /// A passive configuration watching `name`.
    pub fn passive(name: &[u8]) -> CookieConfig {
        CookieConfig {
            name: name.to_vec(),
            mode: CookieMode::Passive,
            indirect: false,
            domain: None,
            maxidle: 0,
            maxlife: 0,
        }
    }

    fn uses_dates(&self) -> bool {
        self.maxidle > 0 || self.maxlife > 0
    }
}

fn elapsed(from: u32, now: u32) -> i64 {
    now as i64 - from as i64
}

fn dates_make_expired(cfg: &CookieConfig, first: u32, last: u32, now: u32) -> bool {
    if cfg.maxidle > 0 && last != 0 {
        let age = elapsed(last, now);
        if age > (cfg.maxidle + DATE_SKEW) as i64 || age < -(DATE_SKEW as i64) {
            return true;
        }
    }
    if cfg.maxlife > 0 && first != 0 {
        let age = elapsed(first, now);
        if age > (cfg.maxlife + DATE_SKEW) as i64 || age < -(DATE_SKEW as i64) {
            return true;
        }
    }
    false
}

/// One `name=value` attribute inside a Cookie line, absolute offsets.
struct Attr {
    start: usize,
    name_end: usize,
    val_start: usize,
    end: usize,
}

fn next_attr(buf: &Buffer, mut p: usize, end: usize) -> Option<Attr> {
    while p < end && (buf.byte(p) == b';' || buf.byte(p) == b' ' || buf.byte(p) == b'\t') {
        p += 1;
    }
    if p >= end {
        return None;
    }
    let start = p;
    let mut eq = None;
    while p < end && buf.byte(p) != b';' {
        if eq.is_none() && buf.byte(p) == b'=' {
            eq = Some(p);
        }
        p += 1;
    }
    let attr_end = p;
    let name_end = eq.unwrap_or(attr_end);
    let val_start = eq.map(|e| e + 1).unwrap_or(attr_end);
    Some(Attr {
        start,
        name_end,
        val_start,
        end: attr_end,
    })
}

fn name_matches(buf: &Buffer, attr: &Attr, name: &[u8]) -> bool {
    if attr.name_end - attr.start != name.len() {
        return false;
    }
    for (k, &n) in name.iter().enumerate() {
        if buf.byte(attr.start + k) != n {
            return false;
        }
    }
    true
}

/// Scans the request's Cookie headers for the persistence cookie and
/// steers the session.
///
/// Returns the index of the designated server when the cookie is
/// valid. In insert+indirect mode the cookie is removed so servers
/// never see it; in prefix mode the server-key prefix is stripped in
/// place.
pub fn manage_client_cookies(
    buf: &mut Buffer,
    txn: &mut Transaction,
    cfg: &CookieConfig,
    servers: &[Server],
    now: u32,
) -> Option<usize> {
    let mut steered = None;
    let mut ctx = HeaderCursor::new();
    while hdr::find_header(b"Cookie", buf, &txn.hdr_idx, &mut ctx, true) {
        let line = ctx.line;
        let mut p = line + ctx.val;
        let mut vend = line + ctx.val + ctx.vlen;
        while let Some(attr) = next_attr(buf, p, vend) {
            p = attr.end;
            if !name_matches(buf, &attr, &cfg.name) || txn.cli_cookie.is_some() {
                continue;
            }
            // first matching cookie only
            txn.cli_cookie = Some(buf.copy_range(attr.start, attr.end));

            let raw = buf.copy_range(attr.val_start, attr.end);
            let mut srv_key: &[u8] = &raw;
            let mut last_date = 0u32;
            let mut first_date = 0u32;
            let mut prefix_len = 0usize;

            if cfg.mode == CookieMode::Prefix {
                if let Some(tilde) = raw.iter().position(|&b| b == b'~') {
                    srv_key = &raw[..tilde];
                    prefix_len = tilde + 1;
                } else {
                    srv_key = &[];
                }
            } else if cfg.uses_dates() {
                let mut fields = raw.split(|&b| b == b'|');
                srv_key = fields.next().unwrap_or(&[]);
                if let Some(f) = fields.next() {
                    last_date = b64::decode_30bit(f).unwrap_or(0);
                }
                if let Some(f) = fields.next() {
                    first_date = b64::decode_30bit(f).unwrap_or(0);
                }
            }
            txn.cookie_last_date = last_date;
            txn.cookie_first_date = first_date;

            let found = servers
                .iter()
                .position(|s| s.cookie.as_deref() == Some(srv_key) && !srv_key.is_empty());
            txn.ck_state = match found {
                _ if cfg.uses_dates() && dates_make_expired(cfg, first_date, last_date, now) => {
                    ClientCookie::Expired
                }
                Some(k) if servers[k].up => ClientCookie::Valid,
                Some(_) => ClientCookie::Down,
                None => ClientCookie::Invalid,
            };
            trace!(state = ?txn.ck_state, "client persistence cookie");
            if txn.ck_state == ClientCookie::Valid {
                steered = found;
            }

            // strip the routing prefix so the server sees its value
            if prefix_len > 0 {
                let delta = buf
                    .replace(attr.val_start, attr.val_start + prefix_len, b"")
                    .expect("shrinking replace");
                txn.hdr_idx.grow(ctx.idx, delta);
                txn.req.move_end(delta);
                p = (p as isize + delta) as usize;
                vend = (vend as isize + delta) as usize;
            } else if cfg.mode == CookieMode::Insert && cfg.indirect {
                // hide our cookie from the server entirely
                let whole_line = attr.start == line + ctx.val && attr.end >= vend;
                if whole_line {
                    hdr::remove_value(buf, &mut txn.hdr_idx, &mut txn.req, &mut ctx);
                    break;
                }
                let mut from = attr.start;
                let mut to = attr.end;
                if to < vend {
                    // eat the separator and following space
                    to += 1;
                    while to < vend && buf.byte(to) == b' ' {
                        to += 1;
                    }
                } else {
                    // last attribute, eat the preceding separator
                    while from > line + ctx.val && buf.byte(from - 1) == b' ' {
                        from -= 1;
                    }
                    if from > line + ctx.val && buf.byte(from - 1) == b';' {
                        from -= 1;
                    }
                }
                let delta = buf.replace(from, to, b"").expect("shrinking replace");
                txn.hdr_idx.grow(ctx.idx, delta);
                txn.req.move_end(delta);
                p = from;
                vend = (vend as isize + delta) as usize;
            }
        }
    }
    steered
}

fn build_insert_line(cfg: &CookieConfig, srv_key: &[u8], txn: &Transaction, now: u32) -> Vec<u8> {
    let mut line = Vec::with_capacity(64);
    line.extend_from_slice(b"Set-Cookie: ");
    line.extend_from_slice(&cfg.name);
    line.push(b'=');
    line.extend_from_slice(srv_key);
    if cfg.uses_dates() {
        line.push(b'|');
        line.extend_from_slice(&b64::encode_30bit(now));
        line.push(b'|');
        let first = if txn.cookie_first_date != 0 {
            txn.cookie_first_date
        } else {
            now
        };
        line.extend_from_slice(&b64::encode_30bit(first));
    }
    line.extend_from_slice(b"; path=/");
    if let Some(ref d) = cfg.domain {
        line.extend_from_slice(b"; domain=");
        line.extend_from_slice(d);
    }
    line
}

/// Mutates the response's Set-Cookie headers per the persistence mode
/// and inserts the engine's own cookie when configured.
pub fn manage_server_cookies(
    buf: &mut Buffer,
    txn: &mut Transaction,
    cfg: &CookieConfig,
    srv_key: Option<&[u8]>,
    now: u32,
) -> Result<(), Error> {
    for hdr_name in [&b"Set-Cookie"[..], &b"Set-Cookie2"[..]] {
        let mut ctx = HeaderCursor::new();
        while hdr::find_header(hdr_name, buf, &txn.hdr_idx, &mut ctx, true) {
            let line = ctx.line;
            let vstart = line + ctx.val;
            let vend = vstart + ctx.vlen;
            let attr = match next_attr(buf, vstart, vend) {
                Some(a) => a,
                None => continue,
            };
            if txn.srv_cookie.is_none() {
                txn.srv_cookie = Some(buf.copy_range(attr.start, attr.end));
            }
            if !name_matches(buf, &attr, &cfg.name) {
                continue;
            }
            txn.sck_state = ServerCookie::Found;
            match cfg.mode {
                CookieMode::Passive => {}
                CookieMode::Insert => {
                    if cfg.indirect {
                        // ours replaces it entirely
                        hdr::remove_value(buf, &mut txn.hdr_idx, &mut txn.rsp, &mut ctx);
                        txn.sck_state = ServerCookie::Deleted;
                    }
                }
                CookieMode::Prefix => {
                    if let Some(key) = srv_key {
                        let mut pre = Vec::with_capacity(key.len() + 1);
                        pre.extend_from_slice(key);
                        pre.push(b'~');
                        let delta = buf.replace(attr.val_start, attr.val_start, &pre)?;
                        txn.hdr_idx.grow(ctx.idx, delta);
                        txn.rsp.move_end(delta);
                        txn.sck_state = ServerCookie::Replaced;
                    }
                }
                CookieMode::Rewrite => {
                    if let Some(key) = srv_key {
                        let delta = buf.replace(attr.val_start, attr.end, key)?;
                        txn.hdr_idx.grow(ctx.idx, delta);
                        txn.rsp.move_end(delta);
                        txn.sck_state = ServerCookie::Replaced;
                    }
                }
            }
        }
    }

    if cfg.mode == CookieMode::Insert {
        if let Some(key) = srv_key {
            let line = build_insert_line(cfg, key, txn, now);
            hdr::add_header(buf, &mut txn.hdr_idx, &mut txn.rsp, &line)?;
            txn.sck_state = if txn.sck_state == ServerCookie::Found
                || txn.sck_state == ServerCookie::Deleted
            {
                ServerCookie::Updated
            } else {
                ServerCookie::Inserted
            };
            debug!(state = ?txn.sck_state, "persistence cookie emitted");
        }
    }
    Ok(())
}
