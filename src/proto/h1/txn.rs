//! HTTP transaction state.
//!
//! A [`Transaction`] pairs the two message directions of one exchange
//! with the shared header index, the verdict flags accumulated by the
//! rule pipelines, captures, and the cookie and authentication facts.
//! It is created once per session and *reset*, never reallocated,
//! between pipelined requests of a kept-alive connection.

use bitflags::bitflags;
use http::Method;

use crate::channel::Channel;
use crate::proto::h1::hdr::HeaderIndex;
use crate::proto::h1::mode::{ConnHdr, WantMode};
use crate::proto::h1::{Message, MsgState};

bitflags! {
    /// Verdicts and facts accumulated over one transaction.
    pub struct TxnFlags: u32 {
        /// At least one previous request completed on this session.
        const NOT_FIRST = 0x0001;
        /// The session is parked waiting for the next request.
        const WAIT_NEXT_RQ = 0x0002;
        /// Mutate `Proxy-Connection` instead of `Connection`.
        const USE_PX_CONN = 0x0004;
        /// A `close` token has been set by the engine on the request.
        const CON_CLO_SET = 0x0008;
        /// A `keep-alive` token has been set by the engine.
        const CON_KAL_SET = 0x0010;
        /// A client-side rule denied the request.
        const CLDENY = 0x0020;
        /// A client-side rule explicitly allowed the request.
        const CLALLOW = 0x0040;
        /// The request is being tarpitted.
        const CLTARPIT = 0x0080;
        /// A server-side rule denied the response.
        const SVDENY = 0x0100;
        /// A server-side rule explicitly allowed the response.
        const SVALLOW = 0x0200;
        /// The response looks cacheable.
        const CACHEABLE = 0x0400;
        /// The response is cacheable and carries a cookie.
        const CACHE_COOK = 0x0800;
        /// Prefer the last known server over rebalancing.
        const PREFER_LAST = 0x1000;
    }
}

/// What was learnt from the client's persistence cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCookie {
    /// No persistence cookie seen.
    None,
    /// A cookie was present but unusable.
    Invalid,
    /// The designated server is down.
    Down,
    /// The cookie designates a live server.
    Valid,
    /// The cookie outlived its allowed age.
    Expired,
    /// The cookie is older than the refresh window.
    Old,
}

/// What happened to the server's Set-Cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCookie {
    /// No Set-Cookie seen.
    None,
    /// Seen and left alone.
    Found,
    /// Deleted on the way through.
    Deleted,
    /// Inserted by the engine.
    Inserted,
    /// Value replaced by the engine.
    Replaced,
    /// Dates refreshed by the engine.
    Updated,
}

/// Basic credentials submitted on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSubmitted {
    /// User name from the decoded pair.
    pub user: String,
    /// Password from the decoded pair.
    pub pass: String,
}

/// How a finished transaction leaves the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEnd {
    /// One side is still moving.
    Pending,
    /// Keep-alive or server-close: reset and wait for the next request.
    Reuse,
    /// Close both sides.
    Close,
    /// Both sides switched to blind forwarding.
    Tunnel,
}

/// One HTTP exchange between a client and a server.
#[derive(Debug)]
pub struct Transaction {
    /// Request-side message state.
    pub req: Message,
    /// Response-side message state.
    pub rsp: Message,
    /// Header index, shared between directions: the request owns it
    /// until the response head starts, which resets it.
    pub hdr_idx: HeaderIndex,
    /// Request method tag.
    pub meth: Method,
    /// Response status code, or the one the engine decided to emit.
    pub status: u16,
    /// Accumulated verdicts and facts.
    pub flags: TxnFlags,
    /// Tokens seen on the governing connection header.
    pub conn_hdr: ConnHdr,
    /// Resolved connection mode for this transaction.
    pub wanted: WantMode,
    /// Captured request URI.
    pub uri: Option<Vec<u8>>,
    /// Captured request headers, one slot per configured capture.
    pub req_cap: Vec<Option<Vec<u8>>>,
    /// Captured response headers.
    pub rsp_cap: Vec<Option<Vec<u8>>>,
    /// First matching client persistence cookie (name=value).
    pub cli_cookie: Option<Vec<u8>>,
    /// Captured server cookie.
    pub srv_cookie: Option<Vec<u8>>,
    /// Client cookie verdict.
    pub ck_state: ClientCookie,
    /// Server cookie verdict.
    pub sck_state: ServerCookie,
    /// Credentials submitted through Authorization.
    pub auth: Option<AuthSubmitted>,
    /// Cookie first-use date (30-bit seconds), 0 when absent.
    pub cookie_first_date: u32,
    /// Cookie last-use date (30-bit seconds), 0 when absent.
    pub cookie_last_date: u32,
}

impl Transaction {
    /// Creates the transaction for a fresh session.
    pub fn new(max_headers: usize, req_cap_slots: usize, rsp_cap_slots: usize) -> Transaction {
        Transaction {
            req: Message::new(MsgState::RqBefore),
            rsp: Message::new(MsgState::RpBefore),
            hdr_idx: HeaderIndex::new(max_headers),
            meth: Method::GET,
            status: 0,
            flags: TxnFlags::empty(),
            conn_hdr: ConnHdr::empty(),
            wanted: WantMode::KeepAlive,
            uri: None,
            req_cap: vec![None; req_cap_slots],
            rsp_cap: vec![None; rsp_cap_slots],
            cli_cookie: None,
            srv_cookie: None,
            ck_state: ClientCookie::None,
            sck_state: ServerCookie::None,
            auth: None,
            cookie_first_date: 0,
            cookie_last_date: 0,
        }
    }

    /// Resets everything for the next request of the same session.
    ///
    /// Buffers stay alive in the channels; only indexes, positions and
    /// per-transaction verdicts return to zero. The `NOT_FIRST` mark
    /// survives, everything else reads like a fresh transaction.
    pub fn reset(&mut self) {
        self.req.reset(MsgState::RqBefore);
        self.rsp.reset(MsgState::RpBefore);
        self.hdr_idx.reset();
        self.meth = Method::GET;
        self.status = 0;
        self.flags = TxnFlags::NOT_FIRST;
        self.conn_hdr = ConnHdr::empty();
        self.wanted = WantMode::KeepAlive;
        self.uri = None;
        for slot in self.req_cap.iter_mut() {
            *slot = None;
        }
        for slot in self.rsp_cap.iter_mut() {
            *slot = None;
        }
        self.cli_cookie = None;
        self.srv_cookie = None;
        self.ck_state = ClientCookie::None;
        self.sck_state = ServerCookie::None;
        self.auth = None;
        self.cookie_first_date = 0;
        self.cookie_last_date = 0;
    }

    /// Synchronises the paired message states once forwarding made
    /// progress, requesting the channel shutdowns the wanted mode
    /// implies. The caller acts on the returned disposition.
    pub fn resync_states(&mut self, req_chn: &mut Channel, res_chn: &mut Channel) -> TxnEnd {
        // A tunnelled side mirrors onto the other.
        if self.req.state == MsgState::Tunnel || self.rsp.state == MsgState::Tunnel {
            self.req.state = MsgState::Tunnel;
            self.rsp.state = MsgState::Tunnel;
            req_chn.clear_analysers();
            res_chn.clear_analysers();
            return TxnEnd::Tunnel;
        }
        if self.req.state == MsgState::Error || self.rsp.state == MsgState::Error {
            return TxnEnd::Close;
        }
        if self.req.state != MsgState::Done || self.rsp.state != MsgState::Done {
            return TxnEnd::Pending;
        }

        match self.wanted {
            WantMode::KeepAlive => TxnEnd::Reuse,
            WantMode::Tunnel => {
                self.req.state = MsgState::Tunnel;
                self.rsp.state = MsgState::Tunnel;
                req_chn.clear_analysers();
                res_chn.clear_analysers();
                TxnEnd::Tunnel
            }
            WantMode::ServerClose => {
                // close the server side, keep the client waiting
                req_chn.shutw_now();
                res_chn.shutr_now();
                TxnEnd::Reuse
            }
            WantMode::Close => {
                req_chn.shutw_now();
                res_chn.shutw_now();
                self.req.state = MsgState::Closing;
                self.rsp.state = MsgState::Closing;
                TxnEnd::Close
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done_pair() -> (Transaction, Channel, Channel) {
        let mut txn = Transaction::new(32, 2, 2);
        txn.req.state = MsgState::Done;
        txn.rsp.state = MsgState::Done;
        (txn, Channel::new(256), Channel::new(256))
    }

    #[test]
    fn reuse_on_keep_alive() {
        let (mut txn, mut req, mut res) = done_pair();
        txn.wanted = WantMode::KeepAlive;
        assert_eq!(txn.resync_states(&mut req, &mut res), TxnEnd::Reuse);
        assert!(!req.output_closed());
    }

    #[test]
    fn server_close_shuts_server_side_only() {
        let (mut txn, mut req, mut res) = done_pair();
        txn.wanted = WantMode::ServerClose;
        assert_eq!(txn.resync_states(&mut req, &mut res), TxnEnd::Reuse);
        assert!(req.output_closed());
        assert!(res.input_closed());
    }

    #[test]
    fn close_shuts_both() {
        let (mut txn, mut req, mut res) = done_pair();
        txn.wanted = WantMode::Close;
        assert_eq!(txn.resync_states(&mut req, &mut res), TxnEnd::Close);
        assert!(req.output_closed());
        assert!(res.output_closed());
        assert_eq!(txn.req.state, MsgState::Closing);
    }

    #[test]
    fn tunnel_mirrors_both_sides() {
        let (mut txn, mut req, mut res) = done_pair();
        txn.req.state = MsgState::Tunnel;
        assert_eq!(txn.resync_states(&mut req, &mut res), TxnEnd::Tunnel);
        assert_eq!(txn.rsp.state, MsgState::Tunnel);
        assert!(req.analysers.is_empty());
    }

    #[test]
    fn pending_until_both_done() {
        let (mut txn, mut req, mut res) = done_pair();
        txn.rsp.state = MsgState::Body;
        assert_eq!(txn.resync_states(&mut req, &mut res), TxnEnd::Pending);
    }

    /// After a reset the transaction is observationally fresh except
    /// for the first-request mark.
    #[test]
    fn reset_is_fresh_but_not_first() {
        let mut txn = Transaction::new(32, 1, 1);
        txn.status = 200;
        txn.meth = Method::POST;
        txn.flags = TxnFlags::CLDENY | TxnFlags::CACHEABLE;
        txn.uri = Some(b"/x".to_vec());
        txn.req_cap[0] = Some(b"v".to_vec());
        txn.cli_cookie = Some(b"sid=1".to_vec());
        txn.ck_state = ClientCookie::Valid;
        txn.cookie_last_date = 77;
        txn.reset();

        let fresh = Transaction::new(32, 1, 1);
        assert_eq!(txn.flags, TxnFlags::NOT_FIRST);
        assert_eq!(txn.status, fresh.status);
        assert_eq!(txn.meth, fresh.meth);
        assert_eq!(txn.req.state, fresh.req.state);
        assert_eq!(txn.rsp.state, fresh.rsp.state);
        assert_eq!(txn.uri, None);
        assert_eq!(txn.req_cap[0], None);
        assert_eq!(txn.cli_cookie, None);
        assert_eq!(txn.ck_state, ClientCookie::None);
        assert_eq!(txn.cookie_last_date, 0);
        assert_eq!(txn.hdr_idx.used(), 0);
    }
}
