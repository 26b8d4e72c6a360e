//! Request and response rule pipelines.
//!
//! A rule couples an action with an optional compiled condition; rule
//! lists run in declared order and the first terminal action decides
//! the verdict. Conditions, custom actions, pattern sets and header
//! matchers arrive compiled from the configuration layer through the
//! trait seams below, so the interpreter itself stays a flat walk with
//! one `match` in the hot path.
//!
//! Header mutations operate on the indexed view: every buffer edit
//! updates the owning index cell and the message end positions in the
//! same operation, so iteration cursors survive arbitrary rule
//! sequences.

pub mod redirect;

use std::fmt;
use std::rc::Rc;

use http::Method;
use tracing::{trace, warn};

use crate::buffer::Buffer;
use crate::proto::h1::hdr::{self, HeaderCursor, HeaderIndex};
use crate::proto::h1::txn::TxnFlags;
use crate::proto::h1::{Message, StartLine};
use crate::rules::redirect::RedirectRule;

/// Read-only view of the transaction offered to compiled conditions.
#[derive(Debug)]
pub struct SampleCtx<'a> {
    /// Buffer of the governed message.
    pub buf: &'a Buffer,
    /// The governed message.
    pub msg: &'a Message,
    /// Header index over the message.
    pub idx: &'a HeaderIndex,
    /// Request method.
    pub meth: &'a Method,
    /// Response status, 0 on the request side.
    pub status: u16,
}

impl<'a> SampleCtx<'a> {
    /// The request URI slice, empty on the response side.
    pub fn uri(&self) -> Vec<u8> {
        match self.msg.start {
            StartLine::Request { u, u_l, .. } => self.buf.copy_range(u, u + u_l),
            _ => Vec::new(),
        }
    }

    /// The URI up to the query string.
    pub fn path(&self) -> Vec<u8> {
        let mut uri = self.uri();
        if let Some(q) = uri.iter().position(|&b| b == b'?') {
            uri.truncate(q);
        }
        uri
    }

    /// First full value of a header.
    pub fn header(&self, name: &[u8]) -> Option<Vec<u8>> {
        let mut ctx = HeaderCursor::new();
        if hdr::find_header(name, self.buf, self.idx, &mut ctx, true) {
            Some(ctx.value(self.buf))
        } else {
            None
        }
    }
}

/// A compiled ACL condition.
pub trait Condition: fmt::Debug {
    /// Evaluates the condition against the current transaction.
    fn eval(&self, smp: &SampleCtx<'_>) -> bool;
}

/// Condition with its `if` / `unless` polarity.
#[derive(Debug, Clone)]
pub struct RuleCond {
    /// The compiled condition tree.
    pub cond: Rc<dyn Condition>,
    /// True for `unless`.
    pub invert: bool,
}

impl RuleCond {
    /// An `if` condition.
    pub fn when(cond: Rc<dyn Condition>) -> RuleCond {
        RuleCond { cond, invert: false }
    }

    /// An `unless` condition.
    pub fn unless(cond: Rc<dyn Condition>) -> RuleCond {
        RuleCond { cond, invert: true }
    }

    fn holds(&self, smp: &SampleCtx<'_>) -> bool {
        self.cond.eval(smp) ^ self.invert
    }
}

/// A condition that always holds.
#[derive(Debug)]
pub struct Always;

impl Condition for Always {
    fn eval(&self, _smp: &SampleCtx<'_>) -> bool {
        true
    }
}

/// Wraps a plain closure as a condition.
pub struct FnCond<F>(pub F);

impl<F> fmt::Debug for FnCond<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCond")
    }
}

impl<F: Fn(&SampleCtx<'_>) -> bool> Condition for FnCond<F> {
    fn eval(&self, smp: &SampleCtx<'_>) -> bool {
        (self.0)(smp)
    }
}

/// A compiled header matcher with capture groups.
pub trait Matcher: fmt::Debug {
    /// Returns capture spans over the haystack; index 0 is the whole
    /// match. `None` when the value does not match.
    fn captures(&self, hay: &[u8]) -> Option<Vec<(usize, usize)>>;
}

/// A mutable pattern table referenced by map and ACL actions.
pub trait PatternSet: fmt::Debug {
    /// Adds a key (ACL) or does nothing if present.
    fn add(&self, key: &[u8], value: &[u8]);
    /// Removes a key.
    fn delete(&self, key: &[u8]);
    /// Sets a key to a value (map).
    fn set(&self, key: &[u8], value: &[u8]);
}

/// One element of a format string evaluated per transaction.
#[derive(Debug, Clone)]
pub enum FmtPart {
    /// Literal bytes.
    Lit(Vec<u8>),
    /// The request URI.
    Uri,
    /// The request path.
    Path,
    /// The request method.
    Method,
    /// The response status.
    Status,
    /// First value of a header.
    Hdr(Vec<u8>),
}

/// A compiled format string.
pub type FormatString = Vec<FmtPart>;

/// Builds a format string against the transaction.
pub fn build_format(fmt: &[FmtPart], smp: &SampleCtx<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    for part in fmt {
        match part {
            FmtPart::Lit(bytes) => out.extend_from_slice(bytes),
            FmtPart::Uri => out.extend_from_slice(&smp.uri()),
            FmtPart::Path => out.extend_from_slice(&smp.path()),
            FmtPart::Method => out.extend_from_slice(smp.meth.as_str().as_bytes()),
            FmtPart::Status => out.extend_from_slice(smp.status.to_string().as_bytes()),
            FmtPart::Hdr(name) => {
                if let Some(v) = smp.header(name) {
                    out.extend_from_slice(&v);
                }
            }
        }
    }
    out
}

/// A literal-only format string.
pub fn lit(bytes: &[u8]) -> FormatString {
    vec![FmtPart::Lit(bytes.to_vec())]
}

/// Verdict of a rule walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep evaluating / proceed with the transaction.
    Continue,
    /// Stop the walk, accept the message.
    Stop,
    /// Reject with the deny status.
    Deny,
    /// Abort with a locally generated response (auth).
    Abort,
    /// The rule produced the final response itself (redirect, stats).
    Done,
    /// The message is too broken to answer politely.
    BadRequest,
}

/// A custom action registered at configuration time.
pub trait Action: fmt::Debug {
    /// Runs the action; a terminal verdict stops the walk.
    fn run(&self, ctx: &mut ActionCtx<'_>) -> Verdict;
}

/// Everything an executing action may touch.
#[derive(Debug)]
pub struct ActionCtx<'a> {
    /// Buffer of the governed message.
    pub buf: &'a mut Buffer,
    /// Header index over the message.
    pub idx: &'a mut HeaderIndex,
    /// The governed message.
    pub msg: &'a mut Message,
    /// Transaction flags to update with the verdicts.
    pub txn_flags: &'a mut TxnFlags,
    /// Request method.
    pub meth: Method,
    /// Response status, 0 on the request side.
    pub status: u16,
    /// True when walking a response-side list.
    pub response: bool,
    /// Realm captured by an `auth` action.
    pub auth_realm: Option<String>,
    /// Redirect captured for the caller to emit.
    pub redirect: Option<Rc<RedirectRule>>,
    /// Task niceness override.
    pub nice: Option<i32>,
    /// IP TOS override for the client socket.
    pub tos: Option<u8>,
    /// SO_MARK override for the client socket.
    pub mark: Option<u32>,
    /// Log level override for this session.
    pub log_level: Option<u8>,
    /// Session variables written by `set-var` actions.
    pub vars: Vec<(String, Vec<u8>)>,
}

impl<'a> ActionCtx<'a> {
    /// Builds the action context over one message direction.
    pub fn new(
        buf: &'a mut Buffer,
        idx: &'a mut HeaderIndex,
        msg: &'a mut Message,
        txn_flags: &'a mut TxnFlags,
        meth: Method,
        status: u16,
        response: bool,
    ) -> ActionCtx<'a> {
        ActionCtx {
            buf,
            idx,
            msg,
            txn_flags,
            meth,
            status,
            response,
            auth_realm: None,
            redirect: None,
            nice: None,
            tos: None,
            mark: None,
            log_level: None,
            vars: Vec::new(),
        }
    }

    fn sample(&self) -> SampleCtx<'_> {
        SampleCtx {
            buf: self.buf,
            msg: self.msg,
            idx: self.idx,
            meth: &self.meth,
            status: self.status,
        }
    }
}

/// The per-rule payload.
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Accept the message, stop evaluating.
    Allow,
    /// Reject the message with the deny status.
    Deny,
    /// Flag the request for tarpitting, then deny after the timer.
    Tarpit,
    /// Demand credentials for this realm.
    Auth {
        /// Realm spliced into the challenge.
        realm: String,
    },
    /// Answer with a redirect built from the rule.
    Redirect(Rc<RedirectRule>),
    /// Mutate the task scheduling weight.
    SetNice(i32),
    /// Set the IP TOS byte on the client socket.
    SetTos(u8),
    /// Set SO_MARK on the client socket.
    SetMark(u32),
    /// Override the log level for this session.
    SetLogLevel(u8),
    /// Store a session variable built from a format string.
    SetVar {
        /// Variable name.
        name: String,
        /// Value format.
        value: FormatString,
    },
    /// Append a header line.
    AddHeader {
        /// Header name.
        name: Vec<u8>,
        /// Value format.
        value: FormatString,
    },
    /// Remove all occurrences, then append.
    SetHeader {
        /// Header name.
        name: Vec<u8>,
        /// Value format.
        value: FormatString,
    },
    /// Delete all occurrences by name.
    DelHeader {
        /// Header name.
        name: Vec<u8>,
    },
    /// Replace each whole matching field-value.
    ReplaceHeader {
        /// Header name.
        name: Vec<u8>,
        /// Compiled matcher with capture groups.
        find: Rc<dyn Matcher>,
        /// Replacement with `\N` back-references.
        replace: Vec<u8>,
    },
    /// Replace each matching comma-separated value.
    ReplaceValue {
        /// Header name.
        name: Vec<u8>,
        /// Compiled matcher with capture groups.
        find: Rc<dyn Matcher>,
        /// Replacement with `\N` back-references.
        replace: Vec<u8>,
    },
    /// Add a key to an ACL pattern set.
    AddAcl {
        /// Referenced set.
        set: Rc<dyn PatternSet>,
        /// Key format.
        key: FormatString,
    },
    /// Delete a key from an ACL pattern set.
    DelAcl {
        /// Referenced set.
        set: Rc<dyn PatternSet>,
        /// Key format.
        key: FormatString,
    },
    /// Write a key/value pair into a map.
    SetMap {
        /// Referenced map.
        set: Rc<dyn PatternSet>,
        /// Key format.
        key: FormatString,
        /// Value format.
        value: FormatString,
    },
    /// Delete a key from a map.
    DelMap {
        /// Referenced map.
        set: Rc<dyn PatternSet>,
        /// Key format.
        key: FormatString,
    },
    /// Dispatch to a registered callback.
    Custom(Rc<dyn Action>),
}

/// One rule of a pipeline.
#[derive(Debug, Clone)]
pub struct Rule {
    /// What to do.
    pub action: RuleAction,
    /// Optional guard.
    pub cond: Option<RuleCond>,
}

impl Rule {
    /// An unconditional rule.
    pub fn new(action: RuleAction) -> Rule {
        Rule { action, cond: None }
    }

    /// A guarded rule.
    pub fn when(action: RuleAction, cond: RuleCond) -> Rule {
        Rule {
            action,
            cond: Some(cond),
        }
    }
}

/// Expands `\N` back-references against captured spans.
fn expand_backrefs(template: &[u8], hay: &[u8], caps: &[(usize, usize)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(template.len());
    let mut k = 0;
    while k < template.len() {
        let b = template[k];
        if b == b'\\' && k + 1 < template.len() && template[k + 1].is_ascii_digit() {
            let n = (template[k + 1] - b'0') as usize;
            if let Some(&(s, e)) = caps.get(n) {
                out.extend_from_slice(&hay[s..e]);
            }
            k += 2;
        } else {
            out.push(b);
            k += 1;
        }
    }
    out
}

/// Replaces the current cursor value (or whole field) in place.
fn replace_in_line(
    ctx: &mut ActionCtx<'_>,
    cur: &mut HeaderCursor,
    find: &dyn Matcher,
    template: &[u8],
) {
    let hay = cur.value(ctx.buf);
    let caps = match find.captures(&hay) {
        Some(c) => c,
        None => return,
    };
    let repl = expand_backrefs(template, &hay, &caps);
    if repl.iter().any(|&b| b == b'\r' || b == b'\n') {
        // a replacement changing the line structure is undefined;
        // drop it and leave a trace of the anomaly
        warn!("replace rule would alter CRLF framing, skipped");
        return;
    }
    let start = cur.line + cur.val;
    let end = start + cur.vlen;
    match ctx.buf.replace(start, end, &repl) {
        Ok(delta) => {
            ctx.idx.grow(cur.idx, delta);
            ctx.msg.move_end(delta);
            cur.vlen = repl.len();
        }
        Err(_) => warn!("no room to apply replace rule"),
    }
}

/// Walks a rule list in declared order. The first matching terminal
/// action stops the walk with its verdict.
pub fn apply_rules(rules: &[Rule], ctx: &mut ActionCtx<'_>) -> Verdict {
    for rule in rules {
        if let Some(ref cond) = rule.cond {
            if !cond.holds(&ctx.sample()) {
                continue;
            }
        }
        trace!(action = ?std::mem::discriminant(&rule.action), "rule matched");
        match rule.action {
            RuleAction::Allow => {
                ctx.txn_flags.insert(if ctx.response {
                    TxnFlags::SVALLOW
                } else {
                    TxnFlags::CLALLOW
                });
                return Verdict::Stop;
            }
            RuleAction::Deny => {
                ctx.txn_flags.insert(if ctx.response {
                    TxnFlags::SVDENY
                } else {
                    TxnFlags::CLDENY
                });
                return Verdict::Deny;
            }
            RuleAction::Tarpit => {
                ctx.txn_flags.insert(TxnFlags::CLTARPIT);
                return Verdict::Deny;
            }
            RuleAction::Auth { ref realm } => {
                ctx.auth_realm = Some(realm.clone());
                return Verdict::Abort;
            }
            RuleAction::Redirect(ref rule) => {
                ctx.redirect = Some(rule.clone());
                return Verdict::Done;
            }
            RuleAction::SetNice(v) => ctx.nice = Some(v),
            RuleAction::SetTos(v) => ctx.tos = Some(v),
            RuleAction::SetMark(v) => ctx.mark = Some(v),
            RuleAction::SetLogLevel(v) => ctx.log_level = Some(v),
            RuleAction::SetVar { ref name, ref value } => {
                let v = build_format(value, &ctx.sample());
                ctx.vars.push((name.clone(), v));
            }
            RuleAction::AddHeader { ref name, ref value } => {
                let v = build_format(value, &ctx.sample());
                let mut line = Vec::with_capacity(name.len() + v.len() + 2);
                line.extend_from_slice(name);
                line.extend_from_slice(b": ");
                line.extend_from_slice(&v);
                if hdr::add_header(ctx.buf, ctx.idx, ctx.msg, &line).is_err() {
                    warn!("no room to add header, rule skipped");
                }
            }
            RuleAction::SetHeader { ref name, ref value } => {
                let v = build_format(value, &ctx.sample());
                hdr::del_header(ctx.buf, ctx.idx, ctx.msg, name);
                let mut line = Vec::with_capacity(name.len() + v.len() + 2);
                line.extend_from_slice(name);
                line.extend_from_slice(b": ");
                line.extend_from_slice(&v);
                if hdr::add_header(ctx.buf, ctx.idx, ctx.msg, &line).is_err() {
                    warn!("no room to set header, rule skipped");
                }
            }
            RuleAction::DelHeader { ref name } => {
                hdr::del_header(ctx.buf, ctx.idx, ctx.msg, name);
            }
            RuleAction::ReplaceHeader {
                ref name,
                ref find,
                ref replace,
            } => {
                let mut cur = HeaderCursor::new();
                while hdr::find_header(name, ctx.buf, ctx.idx, &mut cur, true) {
                    replace_in_line(ctx, &mut cur, find.as_ref(), replace);
                }
            }
            RuleAction::ReplaceValue {
                ref name,
                ref find,
                ref replace,
            } => {
                let mut cur = HeaderCursor::new();
                while hdr::find_header(name, ctx.buf, ctx.idx, &mut cur, false) {
                    replace_in_line(ctx, &mut cur, find.as_ref(), replace);
                }
            }
            RuleAction::AddAcl { ref set, ref key } => {
                let k = build_format(key, &ctx.sample());
                set.add(&k, b"");
            }
            RuleAction::DelAcl { ref set, ref key } => {
                let k = build_format(key, &ctx.sample());
                set.delete(&k);
            }
            RuleAction::SetMap {
                ref set,
                ref key,
                ref value,
            } => {
                let k = build_format(key, &ctx.sample());
                let v = build_format(value, &ctx.sample());
                set.set(&k, &v);
            }
            RuleAction::DelMap { ref set, ref key } => {
                let k = build_format(key, &ctx.sample());
                set.delete(&k);
            }
            RuleAction::Custom(ref action) => {
                let verdict = action.run(ctx);
                if verdict != Verdict::Continue {
                    return verdict;
                }
            }
        }
    }
    Verdict::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::parse::parse_message;
    use crate::proto::h1::MsgState;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn parsed(input: &[u8]) -> (Buffer, Message, HeaderIndex) {
        let mut buf = Buffer::with_capacity(4096);
        assert_eq!(buf.put(input), input.len());
        let mut msg = Message::new(MsgState::RqBefore);
        let mut idx = HeaderIndex::new(32);
        parse_message(&mut buf, &mut msg, &mut idx, false);
        assert_eq!(msg.state, MsgState::Body);
        (buf, msg, idx)
    }

    fn head(buf: &Buffer, msg: &Message) -> String {
        String::from_utf8(buf.copy_range(0, msg.sov)).unwrap()
    }

    fn run(rules: &[Rule], raw: &[u8]) -> (Verdict, Buffer, Message, HeaderIndex, TxnFlags) {
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let mut flags = TxnFlags::empty();
        let mut ctx = ActionCtx::new(
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags,
            Method::GET,
            0,
            false,
        );
        let verdict = apply_rules(rules, &mut ctx);
        (verdict, buf, msg, idx, flags)
    }

    const RAW: &[u8] = b"GET /app?x=1 HTTP/1.1\r\nHost: h\r\nX-Del: v\r\n\r\n";

    #[test]
    fn first_terminal_rule_wins() {
        let rules = [
            Rule::new(RuleAction::AddHeader {
                name: b"X-Seen".to_vec(),
                value: lit(b"1"),
            }),
            Rule::new(RuleAction::Allow),
            Rule::new(RuleAction::Deny),
        ];
        let (verdict, buf, msg, _, flags) = run(&rules, RAW);
        assert_eq!(verdict, Verdict::Stop);
        assert!(flags.contains(TxnFlags::CLALLOW));
        assert!(!flags.contains(TxnFlags::CLDENY));
        assert!(head(&buf, &msg).contains("X-Seen: 1\r\n"));
    }

    #[test]
    fn unless_polarity() {
        let cond = RuleCond::unless(Rc::new(FnCond(|smp: &SampleCtx<'_>| {
            smp.path() == b"/other"
        })));
        let rules = [Rule::when(RuleAction::Deny, cond)];
        let (verdict, _, _, _, flags) = run(&rules, RAW);
        assert_eq!(verdict, Verdict::Deny);
        assert!(flags.contains(TxnFlags::CLDENY));
    }

    #[test]
    fn tarpit_flags_and_denies() {
        let rules = [Rule::new(RuleAction::Tarpit)];
        let (verdict, _, _, _, flags) = run(&rules, RAW);
        assert_eq!(verdict, Verdict::Deny);
        assert!(flags.contains(TxnFlags::CLTARPIT));
    }

    #[test]
    fn set_header_replaces_occurrences() {
        let rules = [Rule::new(RuleAction::SetHeader {
            name: b"Host".to_vec(),
            value: lit(b"new"),
        })];
        let (_, buf, msg, idx, _) = run(&rules, RAW);
        let h = head(&buf, &msg);
        assert!(h.contains("Host: new\r\n"));
        assert!(!h.contains("Host: h\r\n"));
        assert_eq!(idx.used(), 2);
    }

    #[test]
    fn del_header_by_name() {
        let rules = [Rule::new(RuleAction::DelHeader {
            name: b"x-del".to_vec(),
        })];
        let (_, buf, msg, idx, _) = run(&rules, RAW);
        assert!(!head(&buf, &msg).contains("X-Del"));
        assert_eq!(idx.used(), 1);
    }

    #[derive(Debug)]
    struct PrefixMatch(&'static [u8]);

    impl Matcher for PrefixMatch {
        fn captures(&self, hay: &[u8]) -> Option<Vec<(usize, usize)>> {
            if hay.starts_with(self.0) {
                Some(vec![(0, hay.len()), (self.0.len(), hay.len())])
            } else {
                None
            }
        }
    }

    #[test]
    fn replace_header_with_backref() {
        let rules = [Rule::new(RuleAction::ReplaceHeader {
            name: b"Host".to_vec(),
            find: Rc::new(PrefixMatch(b"")),
            replace: b"pre-\\1".to_vec(),
        })];
        let (_, buf, msg, _, _) = run(&rules, RAW);
        assert!(head(&buf, &msg).contains("Host: pre-h\r\n"));
    }

    #[test]
    fn replace_with_crlf_is_skipped() {
        let rules = [Rule::new(RuleAction::ReplaceHeader {
            name: b"Host".to_vec(),
            find: Rc::new(PrefixMatch(b"")),
            replace: b"evil\r\nInjected: 1".to_vec(),
        })];
        let (_, buf, msg, idx, _) = run(&rules, RAW);
        assert!(head(&buf, &msg).contains("Host: h\r\n"));
        assert!(!head(&buf, &msg).contains("Injected"));
        assert_eq!(idx.used(), 2);
    }

    #[derive(Debug, Default)]
    struct MemSet {
        entries: RefCell<BTreeMap<Vec<u8>, Vec<u8>>>,
    }

    impl PatternSet for MemSet {
        fn add(&self, key: &[u8], value: &[u8]) {
            self.entries
                .borrow_mut()
                .entry(key.to_vec())
                .or_insert_with(|| value.to_vec());
        }
        fn delete(&self, key: &[u8]) {
            self.entries.borrow_mut().remove(key);
        }
        fn set(&self, key: &[u8], value: &[u8]) {
            self.entries
                .borrow_mut()
                .insert(key.to_vec(), value.to_vec());
        }
    }

    #[test]
    fn map_actions_build_keys_from_format() {
        let set = Rc::new(MemSet::default());
        let rules = [
            Rule::new(RuleAction::SetMap {
                set: set.clone(),
                key: vec![FmtPart::Path],
                value: vec![FmtPart::Method],
            }),
            Rule::new(RuleAction::AddAcl {
                set: set.clone(),
                key: lit(b"static"),
            }),
        ];
        run(&rules, RAW);
        let entries = set.entries.borrow();
        assert_eq!(entries.get(&b"/app"[..].to_vec()).unwrap(), b"GET");
        assert!(entries.contains_key(&b"static"[..].to_vec()));
    }

    #[derive(Debug)]
    struct CountAction(RefCell<u32>);

    impl Action for CountAction {
        fn run(&self, _ctx: &mut ActionCtx<'_>) -> Verdict {
            *self.0.borrow_mut() += 1;
            Verdict::Continue
        }
    }

    #[test]
    fn custom_action_non_terminal() {
        let counter = Rc::new(CountAction(RefCell::new(0)));
        let rules = [
            Rule::new(RuleAction::Custom(counter.clone())),
            Rule::new(RuleAction::Allow),
        ];
        let (verdict, _, _, _, _) = run(&rules, RAW);
        assert_eq!(verdict, Verdict::Stop);
        assert_eq!(*counter.0.borrow(), 1);
    }

    #[test]
    fn auth_captures_realm() {
        let rules = [Rule::new(RuleAction::Auth {
            realm: "private".into(),
        })];
        let (mut buf, mut msg, mut idx) = parsed(RAW);
        let mut flags = TxnFlags::empty();
        let mut ctx = ActionCtx::new(
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags,
            Method::GET,
            0,
            false,
        );
        assert_eq!(apply_rules(&rules, &mut ctx), Verdict::Abort);
        assert_eq!(ctx.auth_realm.as_deref(), Some("private"));
    }

    #[test]
    fn non_terminal_settings_accumulate() {
        let rules = [
            Rule::new(RuleAction::SetNice(-5)),
            Rule::new(RuleAction::SetTos(0x10)),
            Rule::new(RuleAction::SetLogLevel(3)),
        ];
        let (mut buf, mut msg, mut idx) = parsed(RAW);
        let mut flags = TxnFlags::empty();
        let mut ctx = ActionCtx::new(
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags,
            Method::GET,
            0,
            false,
        );
        assert_eq!(apply_rules(&rules, &mut ctx), Verdict::Continue);
        assert_eq!(ctx.nice, Some(-5));
        assert_eq!(ctx.tos, Some(0x10));
        assert_eq!(ctx.log_level, Some(3));
    }

    #[test]
    fn set_var_builds_from_format() {
        let rules = [Rule::new(RuleAction::SetVar {
            name: "txn.path".into(),
            value: vec![FmtPart::Path],
        })];
        let (mut buf, mut msg, mut idx) = parsed(RAW);
        let mut flags = TxnFlags::empty();
        let mut ctx = ActionCtx::new(
            &mut buf,
            &mut idx,
            &mut msg,
            &mut flags,
            Method::GET,
            0,
            false,
        );
        apply_rules(&rules, &mut ctx);
        assert_eq!(ctx.vars.len(), 1);
        assert_eq!(ctx.vars[0].0, "txn.path");
        assert_eq!(ctx.vars[0].1, b"/app");
    }
}
