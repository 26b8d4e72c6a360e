//! Compiled proxy configuration.
//!
//! A [`Proxy`] is the engine-facing form of one `frontend` or
//! `backend` section: modes, options, timeouts, rule lists, cookie and
//! compression settings, capture slots, plus the shared diagnostics a
//! proxy accumulates (counters and the invalid request/response
//! snapshots). The configuration parser producing these lives outside
//! the engine.

use std::cell::{Cell, RefCell};

use crate::buffer::Buffer;
use crate::channel::Tick;
use crate::compress::CompressionConfig;
use crate::cookies::CookieConfig;
use crate::proto::h1::hdr::DEFAULT_MAX_HEADERS;
use crate::proto::h1::mode::ProxyConnMode;
use crate::proto::h1::{Message, MsgState};
use crate::rules::Rule;
use crate::status;

/// Maximum raw bytes archived in an error snapshot.
const SNAPSHOT_MAX: usize = 16 * 1024;

/// One backend server target.
#[derive(Debug, Clone)]
pub struct Server {
    /// Configured server name.
    pub name: String,
    /// Persistence cookie value designating this server.
    pub cookie: Option<Vec<u8>>,
    /// Health state; a down server is never steered to.
    pub up: bool,
}

impl Server {
    /// A healthy server with an optional cookie value.
    pub fn new(name: &str, cookie: Option<&[u8]>) -> Server {
        Server {
            name: name.to_owned(),
            cookie: cookie.map(|c| c.to_vec()),
            up: true,
        }
    }
}

/// Working mode of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Full HTTP processing.
    Http,
    /// Blind TCP forwarding, no HTTP analysers.
    Tcp,
}

/// Boolean options mirroring the configuration keywords.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOptions {
    /// Accept URIs with bytes above 0x7f without flagging them.
    pub accept_invalid_http_request: bool,
    /// Accept equally sloppy responses from servers.
    pub accept_invalid_http_response: bool,
    /// Mutate `Proxy-Connection` on proxied-form requests.
    pub http_use_proxy_header: bool,
    /// Keep announcing keep-alive to the server despite server-close.
    pub pretend_keepalive: bool,
    /// Allocate a unique id per request.
    pub generate_unique_id: bool,
}

/// Per-proxy timeouts in milliseconds; 0 disables one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    /// Client inactivity.
    pub client: Tick,
    /// Server inactivity.
    pub server: Tick,
    /// Complete request head receipt.
    pub http_request: Tick,
    /// Idle wait for the next request of a kept-alive session.
    pub http_keep_alive: Tick,
    /// Tarpitted request hold time.
    pub tarpit: Tick,
}

/// One configured header capture slot.
#[derive(Debug, Clone)]
pub struct CaptureSlot {
    /// Header name to capture.
    pub name: Vec<u8>,
    /// Stored length limit.
    pub len: usize,
}

/// Monotonic per-proxy counters, log-compatible.
#[derive(Debug, Default)]
pub struct Counters {
    /// Requests fully received.
    pub req_in: Cell<u64>,
    /// Responses fully received.
    pub rsp_in: Cell<u64>,
    /// Requests denied by rules.
    pub denied_req: Cell<u64>,
    /// Responses denied by rules.
    pub denied_rsp: Cell<u64>,
    /// Invalid or timed-out requests.
    pub failed_req: Cell<u64>,
    /// Invalid responses.
    pub failed_rsp: Cell<u64>,
    /// Requests intercepted by the engine (monitor, redirects, auth).
    pub intercepted: Cell<u64>,
    /// Transfers aborted by the client.
    pub cli_aborts: Cell<u64>,
    /// Transfers aborted by the server.
    pub srv_aborts: Cell<u64>,
    /// Raw bytes entering the compressor.
    pub comp_in: Cell<u64>,
    /// Bytes leaving the compressor.
    pub comp_out: Cell<u64>,
}

/// Diagnostic snapshot of an invalid message, kept per proxy.
#[derive(Debug)]
pub struct ErrorSnapshot {
    /// Raw buffer content at failure time, bounded.
    pub raw: Vec<u8>,
    /// Position of the offending byte when known.
    pub err_pos: Option<usize>,
    /// Parser state at failure time.
    pub state: MsgState,
    /// True when the response side failed.
    pub response: bool,
    /// Total bytes seen on the channel before the failure.
    pub total: u64,
}

/// One compiled frontend or backend.
#[derive(Debug)]
pub struct Proxy {
    /// Section name, for logs.
    pub name: String,
    /// Working mode.
    pub mode: ProxyMode,
    /// Configured HTTP connection mode.
    pub conn_mode: ProxyConnMode,
    /// Keyword options.
    pub options: ProxyOptions,
    /// Timeouts.
    pub timeouts: Timeouts,
    /// Request rule pipeline.
    pub req_rules: Vec<Rule>,
    /// Response rule pipeline.
    pub rsp_rules: Vec<Rule>,
    /// Persistence cookie settings.
    pub cookie: Option<CookieConfig>,
    /// Compression settings.
    pub compression: CompressionConfig,
    /// Request header capture slots.
    pub req_cap: Vec<CaptureSlot>,
    /// Response header capture slots.
    pub rsp_cap: Vec<CaptureSlot>,
    /// URI answered 200 before any rule runs.
    pub monitor_uri: Option<Vec<u8>>,
    /// Backend servers.
    pub servers: Vec<Server>,
    /// The proxy is draining for reload.
    pub stopping: bool,
    /// Header index capacity per message.
    pub max_headers: usize,
    /// Custom error payloads by status, overriding the built-ins.
    pub errorfiles: Vec<(u16, Vec<u8>)>,
    /// Monotonic counters.
    pub counters: Counters,
    invalid_req: RefCell<Option<ErrorSnapshot>>,
    invalid_rsp: RefCell<Option<ErrorSnapshot>>,
}

impl Proxy {
    /// A proxy with engine defaults and empty pipelines.
    pub fn new(name: &str) -> Proxy {
        Proxy {
            name: name.to_owned(),
            mode: ProxyMode::Http,
            conn_mode: ProxyConnMode::KeepAlive,
            options: ProxyOptions::default(),
            timeouts: Timeouts::default(),
            req_rules: Vec::new(),
            rsp_rules: Vec::new(),
            cookie: None,
            compression: CompressionConfig::default(),
            req_cap: Vec::new(),
            rsp_cap: Vec::new(),
            monitor_uri: None,
            servers: Vec::new(),
            stopping: false,
            max_headers: DEFAULT_MAX_HEADERS,
            errorfiles: Vec::new(),
            counters: Counters::default(),
            invalid_req: RefCell::new(None),
            invalid_rsp: RefCell::new(None),
        }
    }

    /// The payload to emit for a status, honouring overrides.
    pub fn error_payload(&self, status: u16) -> Vec<u8> {
        for (code, payload) in &self.errorfiles {
            if *code == status {
                return payload.clone();
            }
        }
        status::error_message(status).to_vec()
    }

    /// Archives the offending message for later diagnostics. The most
    /// recent snapshot wins; the copy is bounded so archiving cannot
    /// itself exhaust memory.
    pub fn capture_bad_message(
        &self,
        buf: &Buffer,
        total: u64,
        msg: &Message,
        response: bool,
    ) {
        let end = std::cmp::min(buf.input(), SNAPSHOT_MAX);
        let snapshot = ErrorSnapshot {
            raw: buf.copy_range(0, end),
            err_pos: msg.err_pos,
            state: msg.state,
            response,
            total,
        };
        let slot = if response {
            &self.invalid_rsp
        } else {
            &self.invalid_req
        };
        *slot.borrow_mut() = Some(snapshot);
    }

    /// Reads the archived invalid request, if any.
    pub fn with_invalid_req<R>(&self, f: impl FnOnce(Option<&ErrorSnapshot>) -> R) -> R {
        f(self.invalid_req.borrow().as_ref())
    }

    /// Reads the archived invalid response, if any.
    pub fn with_invalid_rsp<R>(&self, f: impl FnOnce(Option<&ErrorSnapshot>) -> R) -> R {
        f(self.invalid_rsp.borrow().as_ref())
    }
}
