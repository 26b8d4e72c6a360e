//! Session state and the analyser dispatch loop.
//!
//! A [`Session`] groups the client-to-server and server-to-client
//! channels with one [`Transaction`] and the frontend/backend proxies
//! governing them. The embedding event loop feeds bytes and transport
//! events into the channels, calls [`Session::process`] with the
//! current tick, and drains whatever the engine scheduled on the
//! opposite sides. Nothing here blocks; long operations yield and are
//! resumed on the next call.

use std::cell::Cell;
use std::rc::Rc;

use crate::channel::{Analysers, Channel, Tick};
use crate::compress::{CompCtx, Compressor};
use crate::pool::Pool;
use crate::proto::h1::conn;
use crate::proto::h1::txn::{Transaction, TxnFlags};
use crate::proxy::{Proxy, ProxyMode};

/// Captured request URIs are truncated to this length.
pub const REQURI_LEN: usize = 1024;

/// Why a session ended, first cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCause {
    /// Still running or ended normally.
    None,
    /// Client-side timeout.
    CliTo,
    /// Client closed or errored out.
    CliCl,
    /// Server-side timeout.
    SrvTo,
    /// Server closed or errored out.
    SrvCl,
    /// The proxy itself refused or generated the outcome.
    PrxCond,
    /// A resource (buffer, pool) ran out.
    Resource,
    /// An internal inconsistency.
    Internal,
    /// The proxy answered locally on purpose (monitor, stats).
    Local,
}

impl ErrCause {
    fn as_char(self) -> u8 {
        match self {
            ErrCause::None => b'-',
            ErrCause::CliTo => b'c',
            ErrCause::CliCl => b'C',
            ErrCause::SrvTo => b's',
            ErrCause::SrvCl => b'S',
            ErrCause::PrxCond => b'P',
            ErrCause::Resource => b'R',
            ErrCause::Internal => b'I',
            ErrCause::Local => b'L',
        }
    }
}

/// Where in the transaction the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finst {
    /// Not finished yet.
    None,
    /// While waiting for the request.
    Request,
    /// While connecting to a server.
    Connect,
    /// While waiting for response headers.
    Headers,
    /// During data transfer.
    Data,
    /// While transmitting the last data.
    LastData,
    /// While queued for a server slot.
    Queue,
    /// While tarpitted.
    Tarpit,
}

impl Finst {
    fn as_char(self) -> u8 {
        match self {
            Finst::None => b'-',
            Finst::Request => b'R',
            Finst::Connect => b'C',
            Finst::Headers => b'H',
            Finst::Data => b'D',
            Finst::LastData => b'L',
            Finst::Queue => b'Q',
            Finst::Tarpit => b'T',
        }
    }
}

/// Process-wide fixed-size pools shared by the sessions of one event
/// loop.
#[derive(Debug)]
pub struct Pools {
    pub(crate) uri: Pool,
    pub(crate) cap: Pool,
    pub(crate) unique: Pool,
    pub(crate) unique_seq: Cell<u64>,
}

impl Default for Pools {
    fn default() -> Pools {
        Pools {
            uri: Pool::new(REQURI_LEN, 4096),
            cap: Pool::new(64, 16384),
            unique: Pool::new(64, 4096),
            unique_seq: Cell::new(0),
        }
    }
}

/// One proxied connection pair and its transaction.
#[derive(Debug)]
pub struct Session {
    /// Client-to-server channel.
    pub req: Channel,
    /// Server-to-client channel.
    pub res: Channel,
    /// The current transaction.
    pub txn: Transaction,
    /// Accepting frontend.
    pub fe: Rc<Proxy>,
    /// Selected backend.
    pub be: Rc<Proxy>,
    /// Selected server index into the backend's server list.
    pub srv: Option<usize>,
    /// First error cause.
    pub err_cause: ErrCause,
    /// Finish instant of the first error.
    pub finst: Finst,
    /// The server connection is established.
    pub srv_conn: bool,
    /// Unique request id, when the frontend generates them.
    pub unique_id: Option<Vec<u8>>,
    /// Task niceness override from rules.
    pub nice: Option<i32>,
    /// TOS override from rules.
    pub tos: Option<u8>,
    /// SO_MARK override from rules.
    pub mark: Option<u32>,
    /// Log level override from rules.
    pub log_level: Option<u8>,
    /// Session variables written by `set-var` rules.
    pub vars: Vec<(String, Vec<u8>)>,
    pub(crate) pools: Rc<Pools>,
    pub(crate) comp_algo: Option<Rc<dyn Compressor>>,
    pub(crate) comp_ctx: Option<CompCtx>,
}

impl Session {
    /// Accepts a session on a frontend, bound to a backend, with the
    /// given channel buffer capacity.
    pub fn new(fe: Rc<Proxy>, be: Rc<Proxy>, pools: Rc<Pools>, buf_capacity: usize) -> Session {
        let mut req = Channel::new(buf_capacity);
        let res = Channel::new(buf_capacity);
        if fe.mode == ProxyMode::Http {
            req.analysers = Analysers::WAIT_HTTP;
        }
        let txn = Transaction::new(fe.max_headers, fe.req_cap.len(), fe.rsp_cap.len());
        Session {
            req,
            res,
            txn,
            fe,
            be,
            srv: None,
            err_cause: ErrCause::None,
            finst: Finst::None,
            srv_conn: false,
            unique_id: None,
            nice: None,
            tos: None,
            mark: None,
            log_level: None,
            vars: Vec::new(),
            pools,
            comp_algo: None,
            comp_ctx: None,
        }
    }

    /// Runs every analyser that can make progress at this tick.
    pub fn process(&mut self, now: Tick) {
        conn::process(self, now);
    }

    /// Tells the engine the server connection is up; parked forwarding
    /// resumes on the next call to [`Session::process`].
    pub fn server_established(&mut self) {
        self.srv_conn = true;
    }

    /// Clears server-side transport state after a reconnect
    /// (server-close mode reconnects between transactions).
    pub fn server_reset(&mut self) {
        use crate::channel::ChanFlags;
        self.srv_conn = false;
        self.req.flags.remove(ChanFlags::SHUTW | ChanFlags::SHUTW_NOW | ChanFlags::WRITE_ERROR);
        self.res.flags.remove(
            ChanFlags::SHUTR | ChanFlags::SHUTR_NOW | ChanFlags::READ_ERROR | ChanFlags::READ_TIMEOUT,
        );
    }

    /// Records the first error cause and finish instant; later reports
    /// are ignored so the log keeps the root cause.
    pub(crate) fn report_error(&mut self, cause: ErrCause, finst: Finst) {
        if self.err_cause == ErrCause::None {
            self.err_cause = cause;
            self.finst = finst;
        }
    }

    /// The two-character termination code emitted in logs.
    pub fn term_code(&self) -> [u8; 2] {
        [self.err_cause.as_char(), self.finst.as_char()]
    }

    /// Response status of the transaction, 0 before one is known.
    pub fn status(&self) -> u16 {
        self.txn.status
    }

    /// The captured request URI, truncated to [`REQURI_LEN`].
    pub fn uri(&self) -> Option<&[u8]> {
        self.txn.uri.as_deref()
    }

    pub(crate) fn assign_unique_id(&mut self, now: Tick) {
        if !self.fe.options.generate_unique_id || self.unique_id.is_some() {
            return;
        }
        let seq = self.pools.unique_seq.get();
        self.pools.unique_seq.set(seq.wrapping_add(1));
        if let Some(mut id) = self.pools.unique.get() {
            let mut buf = itoa::Buffer::new();
            id.extend_from_slice(buf.format(seq).as_bytes());
            id.push(b'-');
            id.extend_from_slice(buf.format(now).as_bytes());
            self.unique_id = Some(id);
        }
    }

    /// One compact log line with the fields the log pipeline consumes.
    pub fn log_line(&self) -> String {
        let mut out = String::with_capacity(96);
        let mut num = itoa::Buffer::new();
        out.push_str(&self.fe.name);
        out.push(' ');
        out.push_str(&self.be.name);
        out.push('/');
        match self.srv {
            Some(k) => out.push_str(&self.be.servers[k].name),
            None => out.push('-'),
        }
        out.push(' ');
        out.push_str(num.format(self.txn.status));
        out.push(' ');
        let code = self.term_code();
        out.push(code[0] as char);
        out.push(code[1] as char);
        out.push(' ');
        out.push_str(self.txn.meth.as_str());
        out.push(' ');
        match self.txn.uri {
            Some(ref uri) => out.push_str(&String::from_utf8_lossy(uri)),
            None => out.push('-'),
        }
        if let Some(ref id) = self.unique_id {
            out.push(' ');
            out.push_str(&String::from_utf8_lossy(id));
        }
        out
    }

    /// The keep-alive finaliser: preserves the channel buffers but
    /// returns everything per-transaction to its initial state and
    /// re-arms the frontend's initial analyser set.
    pub(crate) fn end_txn(&mut self, now: Tick) {
        if let Some(uri) = self.txn.uri.take() {
            self.pools.uri.put(uri);
        }
        for slot in self
            .txn
            .req_cap
            .iter_mut()
            .chain(self.txn.rsp_cap.iter_mut())
        {
            if let Some(v) = slot.take() {
                self.pools.cap.put(v);
            }
        }
        if let Some(id) = self.unique_id.take() {
            self.pools.unique.put(id);
        }
        self.txn.reset();
        self.txn.flags.insert(TxnFlags::WAIT_NEXT_RQ);
        self.comp_algo = None;
        self.comp_ctx = None;
        self.err_cause = ErrCause::None;
        self.finst = Finst::None;
        self.nice = None;
        self.tos = None;
        self.mark = None;
        self.log_level = None;
        self.vars.clear();
        self.req.analysers = Analysers::WAIT_HTTP;
        self.req.analyse_exp = if self.fe.timeouts.http_keep_alive != 0 {
            now + self.fe.timeouts.http_keep_alive
        } else {
            0
        };
        self.res.analysers = Analysers::empty();
        self.res.analyse_exp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_codes_keep_their_mapping() {
        let cases = [
            (ErrCause::None, Finst::None, *b"--"),
            (ErrCause::CliTo, Finst::Request, *b"cR"),
            (ErrCause::CliCl, Finst::Data, *b"CD"),
            (ErrCause::SrvTo, Finst::Headers, *b"sH"),
            (ErrCause::SrvCl, Finst::Connect, *b"SC"),
            (ErrCause::PrxCond, Finst::Request, *b"PR"),
            (ErrCause::Resource, Finst::Queue, *b"RQ"),
            (ErrCause::Internal, Finst::LastData, *b"IL"),
            (ErrCause::Local, Finst::Tarpit, *b"LT"),
        ];
        let pools = Rc::new(Pools::default());
        for (cause, finst, expect) in cases {
            let mut sess = Session::new(
                Rc::new(Proxy::new("fe")),
                Rc::new(Proxy::new("be")),
                pools.clone(),
                256,
            );
            sess.report_error(cause, finst);
            assert_eq!(sess.term_code(), expect);
        }
    }

    #[test]
    fn first_error_wins() {
        let pools = Rc::new(Pools::default());
        let mut sess = Session::new(
            Rc::new(Proxy::new("fe")),
            Rc::new(Proxy::new("be")),
            pools,
            256,
        );
        sess.report_error(ErrCause::CliTo, Finst::Request);
        sess.report_error(ErrCause::SrvCl, Finst::Data);
        assert_eq!(sess.term_code(), *b"cR");
    }

    #[test]
    fn end_txn_recycles_and_rearms() {
        let pools = Rc::new(Pools::default());
        let mut fe = Proxy::new("fe");
        fe.timeouts.http_keep_alive = 5_000;
        let mut sess = Session::new(Rc::new(fe), Rc::new(Proxy::new("be")), pools, 256);
        sess.txn.uri = Some(b"/x".to_vec());
        sess.txn.status = 200;
        sess.err_cause = ErrCause::PrxCond;
        sess.end_txn(1_000);
        assert_eq!(sess.txn.status, 0);
        assert!(sess.txn.flags.contains(TxnFlags::NOT_FIRST));
        assert!(sess.txn.flags.contains(TxnFlags::WAIT_NEXT_RQ));
        assert_eq!(sess.err_cause, ErrCause::None);
        assert_eq!(sess.req.analysers, Analysers::WAIT_HTTP);
        assert_eq!(sess.req.analyse_exp, 6_000);
        assert!(sess.uri().is_none());
    }

    #[test]
    fn log_line_shape() {
        let pools = Rc::new(Pools::default());
        let mut sess = Session::new(
            Rc::new(Proxy::new("web")),
            Rc::new(Proxy::new("app")),
            pools,
            256,
        );
        sess.txn.status = 200;
        sess.txn.uri = Some(b"/index".to_vec());
        assert_eq!(sess.log_line(), "web app/- 200 -- GET /index");
    }
}
