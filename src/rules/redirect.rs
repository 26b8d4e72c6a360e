//! Redirect rule execution.
//!
//! A redirect rule builds a complete, byte-exact response: the status
//! preamble up to `Location: `, the computed location, optional cookie
//! lines, and a closing `Connection: close` — the transaction never
//! reaches a server.

use std::rc::Rc;

use crate::rules::{build_format, FormatString, SampleCtx};
use crate::status::redirect_preamble;

/// How the Location value is derived.
#[derive(Debug, Clone)]
pub enum RedirectKind {
    /// A fixed (or formatted) location.
    Location(FormatString),
    /// The original URI glued after this prefix.
    Prefix(Vec<u8>),
    /// Scheme swap: `scheme://<Host header><original uri>`.
    Scheme(Vec<u8>),
}

/// A compiled redirect rule.
#[derive(Debug, Clone)]
pub struct RedirectRule {
    /// Response status, one of 301, 302, 303, 307, 308.
    pub code: u16,
    /// Location derivation.
    pub kind: RedirectKind,
    /// Drop the query string from the reused URI.
    pub drop_query: bool,
    /// Ensure the reused path ends with a slash.
    pub append_slash: bool,
    /// Emit this Set-Cookie value alongside the redirect.
    pub set_cookie: Option<Vec<u8>>,
    /// Expire this cookie name alongside the redirect.
    pub clear_cookie: Option<Vec<u8>>,
}

impl RedirectRule {
    /// A prefix redirect with the given code.
    pub fn prefix(code: u16, prefix: &[u8]) -> Rc<RedirectRule> {
        Rc::new(RedirectRule {
            code,
            kind: RedirectKind::Prefix(prefix.to_vec()),
            drop_query: false,
            append_slash: false,
            set_cookie: None,
            clear_cookie: None,
        })
    }

    /// A fixed-location redirect with the given code.
    pub fn location(code: u16, location: FormatString) -> Rc<RedirectRule> {
        Rc::new(RedirectRule {
            code,
            kind: RedirectKind::Location(location),
            drop_query: false,
            append_slash: false,
            set_cookie: None,
            clear_cookie: None,
        })
    }

    /// Builds the full response bytes for this rule.
    pub fn build(&self, smp: &SampleCtx<'_>) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(redirect_preamble(self.code));

        match self.kind {
            RedirectKind::Location(ref fmt) => {
                out.extend_from_slice(&build_format(fmt, smp));
            }
            RedirectKind::Prefix(ref prefix) => {
                if prefix != b"/" {
                    out.extend_from_slice(prefix);
                }
                out.extend_from_slice(&self.reused_uri(smp));
            }
            RedirectKind::Scheme(ref scheme) => {
                out.extend_from_slice(scheme);
                out.extend_from_slice(b"://");
                if let Some(host) = smp.header(b"Host") {
                    out.extend_from_slice(&host);
                }
                out.extend_from_slice(&self.reused_uri(smp));
            }
        }
        out.extend_from_slice(b"\r\n");

        if let Some(ref cookie) = self.set_cookie {
            out.extend_from_slice(b"Set-Cookie: ");
            out.extend_from_slice(cookie);
            out.extend_from_slice(b"\r\n");
        }
        if let Some(ref name) = self.clear_cookie {
            out.extend_from_slice(b"Set-Cookie: ");
            out.extend_from_slice(name);
            out.extend_from_slice(b"=; Expires=Thu, 01-Jan-1970 00:00:00 GMT; path=/\r\n");
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }

    fn reused_uri(&self, smp: &SampleCtx<'_>) -> Vec<u8> {
        let mut uri = smp.uri();
        if self.drop_query {
            if let Some(q) = uri.iter().position(|&b| b == b'?') {
                uri.truncate(q);
            }
        }
        if self.append_slash {
            let path_end = uri
                .iter()
                .position(|&b| b == b'?')
                .unwrap_or_else(|| uri.len());
            if path_end == 0 || uri[path_end - 1] != b'/' {
                uri.insert(path_end, b'/');
            }
        }
        uri
    }
}
