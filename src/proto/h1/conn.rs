//! The per-session HTTP analysers.
//!
//! `process` drives every analyser that can make progress at the
//! current tick, in pipeline order: wait for a full request head, run
//! the frontend then backend rule lists, finish the request (cookies,
//! connection mode, compression negotiation), forward the request
//! body; then the mirror image on the response side. The paired
//! transaction FSM resynchronises both directions after each step and
//! decides reuse, closure or tunnelling.
//!
//! Every error path funnels through one of `return_bad_req`,
//! `return_srv_error`, `return_prx_cond` or `aborted_xfer`, which set
//! the termination flags, bump the right counters, strip the remaining
//! analysers and schedule the shutdowns.

use std::cell::Cell;

use tracing::{debug, trace};

use crate::channel::{tick_is_expired, Analysers, ChanFlags, Tick};
use crate::compress;
use crate::proto::h1::body::forward_body;
use crate::proto::h1::framing::{self, Framing};
use crate::proto::h1::hdr::{self, HeaderCursor};
use crate::proto::h1::mode::{self, ModeInputs, ConnHdr, WantMode};
use crate::proto::h1::parse::{parse_message, request_method, response_status, upgrade_v09_to_v10};
use crate::proto::h1::txn::{TxnEnd, TxnFlags};
use crate::proto::h1::{MsgState, StartLine};
use crate::proxy::{CaptureSlot, ProxyMode};
use crate::rules::{apply_rules, ActionCtx, SampleCtx, Verdict};
use crate::session::{ErrCause, Finst, Session};
use crate::status;

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get() + 1);
}

/// Runs analysers until the session makes no further progress.
pub(crate) fn process(sess: &mut Session, now: Tick) {
    if sess.fe.mode == ProxyMode::Tcp {
        let n = sess.req.buf.input() as u64;
        sess.req.forward(n);
        let n = sess.res.buf.input() as u64;
        sess.res.forward(n);
        return;
    }
    loop {
        let before = snapshot(sess);
        step(sess, now);
        if snapshot(sess) == before {
            break;
        }
    }
}

type Snapshot = (u32, u32, MsgState, MsgState, usize, usize, usize, usize, u16, u32);

fn snapshot(sess: &Session) -> Snapshot {
    (
        sess.req.analysers.bits(),
        sess.res.analysers.bits(),
        sess.txn.req.state,
        sess.txn.rsp.state,
        sess.req.buf.input(),
        sess.req.buf.output(),
        sess.res.buf.input(),
        sess.res.buf.output(),
        sess.txn.status,
        sess.txn.flags.bits(),
    )
}

fn step(sess: &mut Session, now: Tick) {
    if sess.txn.req.state == MsgState::Tunnel {
        // blind passthrough in both directions
        let n = sess.req.buf.input();
        if n > 0 {
            sess.req.buf.forward(n);
        }
        let n = sess.res.buf.input();
        if n > 0 {
            sess.res.buf.forward(n);
        }
        return;
    }
    if sess.req.analysers.contains(Analysers::WAIT_HTTP) {
        wait_for_request(sess, now);
    }
    if sess.req.analysers.contains(Analysers::HTTP_TARPIT) {
        handle_tarpit(sess, now);
    }
    if sess.req.analysers.contains(Analysers::HTTP_PROCESS_FE) {
        process_req_rules(sess, now, true);
    }
    if sess.req.analysers.contains(Analysers::HTTP_PROCESS_BE) {
        process_req_rules(sess, now, false);
    }
    if sess.req.analysers.contains(Analysers::HTTP_XFER_BODY) {
        forward_request_body(sess);
    }
    if sess.res.analysers.contains(Analysers::WAIT_HTTP) {
        wait_for_response(sess, now);
    }
    if sess.res.analysers.contains(Analysers::HTTP_PROCESS_BE) {
        process_res_rules(sess, now);
    }
    if sess.res.analysers.contains(Analysers::HTTP_XFER_BODY) {
        forward_response_body(sess);
    }
    maybe_end(sess, now);
}

fn maybe_end(sess: &mut Session, now: Tick) {
    let txn = &mut sess.txn;
    match txn.resync_states(&mut sess.req, &mut sess.res) {
        TxnEnd::Reuse => {
            debug!("transaction complete, reusing session");
            sess.end_txn(now);
        }
        TxnEnd::Tunnel => trace!("both directions tunnelled"),
        TxnEnd::Close | TxnEnd::Pending => {}
    }
}

fn close_silent(sess: &mut Session) {
    sess.req.clear_analysers();
    sess.res.clear_analysers();
    sess.req.shutr_now();
    sess.req.shutw_now();
    sess.res.shutr_now();
    sess.res.shutw_now();
}

/// Emits a locally generated response and tears the session down.
fn emit_local(sess: &mut Session, status: u16, payload: &[u8]) {
    sess.txn.status = status;
    let _ = sess.res.buf.write_out(payload);
    sess.req.buf.truncate_input();
    sess.req.clear_analysers();
    sess.res.clear_analysers();
    sess.req.shutr_now();
    sess.res.shutw_now();
}

/// The request is beyond repair: answer 400 and archive it.
fn return_bad_req(sess: &mut Session) {
    bump(&sess.fe.counters.failed_req);
    sess.fe
        .capture_bad_message(&sess.req.buf, sess.req.total, &sess.txn.req, false);
    sess.txn.req.state = MsgState::Error;
    let payload = sess.fe.error_payload(400);
    emit_local(sess, 400, &payload);
    sess.report_error(ErrCause::PrxCond, Finst::Request);
}

/// The server side failed while the client still deserves an answer.
fn return_srv_error(sess: &mut Session, status: u16, cause: ErrCause) {
    sess.txn.rsp.state = MsgState::Error;
    let payload = sess.be.error_payload(status);
    emit_local(sess, status, &payload);
    sess.req.shutw_now();
    sess.report_error(cause, Finst::Headers);
}

/// A proxy-decided interception (deny, auth, tarpit expiry).
fn return_prx_cond(sess: &mut Session, status: u16, payload: &[u8], finst: Finst) {
    sess.txn.req.state = MsgState::Error;
    emit_local(sess, status, payload);
    sess.report_error(ErrCause::PrxCond, finst);
}

/// A transfer died mid-body; account it to whoever pulled the plug.
fn aborted_xfer(sess: &mut Session, client: bool) {
    if client {
        bump(&sess.fe.counters.cli_aborts);
        sess.report_error(ErrCause::CliCl, Finst::Data);
        sess.txn.req.state = MsgState::Error;
    } else {
        bump(&sess.be.counters.srv_aborts);
        sess.report_error(ErrCause::SrvCl, Finst::Data);
        sess.txn.rsp.state = MsgState::Error;
    }
    close_silent(sess);
}

fn capture_headers(sess: &mut Session, response: bool) {
    let slots: &[CaptureSlot] = if response {
        &sess.fe.rsp_cap
    } else {
        &sess.fe.req_cap
    };
    if slots.is_empty() {
        return;
    }
    let buf = if response {
        &sess.res.buf
    } else {
        &sess.req.buf
    };
    let idx = &sess.txn.hdr_idx;
    let out = if response {
        &mut sess.txn.rsp_cap
    } else {
        &mut sess.txn.req_cap
    };
    for (k, slot) in slots.iter().enumerate() {
        let mut ctx = HeaderCursor::new();
        if hdr::find_header(&slot.name, buf, idx, &mut ctx, true) {
            if let Some(mut v) = sess.pools.cap.get() {
                let val = ctx.value(buf);
                let take = std::cmp::min(slot.len, val.len());
                v.extend_from_slice(&val[..take]);
                out[k] = Some(v);
            }
        }
    }
}

fn parse_auth(sess: &mut Session) {
    let name: &[u8] = if sess.txn.flags.contains(TxnFlags::USE_PX_CONN) {
        b"Proxy-Authorization"
    } else {
        b"Authorization"
    };
    let mut ctx = HeaderCursor::new();
    if !hdr::find_header(name, &sess.req.buf, &sess.txn.hdr_idx, &mut ctx, true) {
        return;
    }
    let v = ctx.value(&sess.req.buf);
    let mut parts = v.splitn(2, |&b| b == b' ');
    let scheme = parts.next().unwrap_or(&[]);
    if !scheme.eq_ignore_ascii_case(b"basic") {
        return;
    }
    let blob = match parts.next() {
        Some(b) => b,
        None => return,
    };
    if let Some(decoded) = crate::b64::decode(blob) {
        if let Some(colon) = decoded.iter().position(|&b| b == b':') {
            sess.txn.auth = Some(crate::proto::h1::txn::AuthSubmitted {
                user: String::from_utf8_lossy(&decoded[..colon]).into_owned(),
                pass: String::from_utf8_lossy(&decoded[colon + 1..]).into_owned(),
            });
        }
    }
}

fn wait_for_request(sess: &mut Session, now: Tick) {
    let accept_invalid = sess.fe.options.accept_invalid_http_request;
    {
        let txn = &mut sess.txn;
        let chn = &mut sess.req;
        // a new message may not start while prior output squats the
        // rewrite reserve
        let parked = txn.req.state == MsgState::RqBefore
            && chn.buf.output() > 0
            && !chn.buf.reserve_free();
        if !parked {
            if txn.req.state == MsgState::RqBefore {
                chn.buf.maybe_realign();
            }
            parse_message(
                &mut chn.buf,
                &mut txn.req,
                &mut txn.hdr_idx,
                accept_invalid,
            );
        }
    }

    if sess.txn.req.state == MsgState::Error {
        return_bad_req(sess);
        return;
    }
    if !sess.txn.req.state.head_complete() {
        if sess.req.analyse_exp == 0 {
            let t = if sess.txn.flags.contains(TxnFlags::WAIT_NEXT_RQ)
                && sess.fe.timeouts.http_keep_alive != 0
            {
                sess.fe.timeouts.http_keep_alive
            } else {
                sess.fe.timeouts.http_request
            };
            if t != 0 {
                sess.req.analyse_exp = now + t;
            }
        }
        let started =
            sess.txn.req.state != MsgState::RqBefore || sess.req.buf.input() > 0;
        if tick_is_expired(sess.req.analyse_exp, now)
            || sess.req.flags.contains(ChanFlags::READ_TIMEOUT)
        {
            if !started && sess.txn.flags.contains(TxnFlags::NOT_FIRST) {
                // idle keep-alive connection, close without noise
                sess.report_error(ErrCause::CliTo, Finst::Request);
                close_silent(sess);
            } else {
                bump(&sess.fe.counters.failed_req);
                sess.txn.req.state = MsgState::Error;
                let payload = sess.fe.error_payload(408);
                emit_local(sess, 408, &payload);
                sess.report_error(ErrCause::CliTo, Finst::Request);
            }
            return;
        }
        if sess.req.flags.contains(ChanFlags::SHUTR) || sess.req.has_error() {
            if !started {
                // nothing was received, just log the close
                sess.report_error(ErrCause::CliCl, Finst::Request);
                close_silent(sess);
            } else {
                bump(&sess.fe.counters.failed_req);
                sess.fe.capture_bad_message(
                    &sess.req.buf,
                    sess.req.total,
                    &sess.txn.req,
                    false,
                );
                sess.txn.req.state = MsgState::Error;
                let payload = sess.fe.error_payload(400);
                emit_local(sess, 400, &payload);
                sess.report_error(ErrCause::CliCl, Finst::Request);
            }
            return;
        }
        if sess.req.buf.room() == 0 && sess.req.buf.output() == 0 {
            // the head cannot possibly fit anymore
            return_bad_req(sess);
        }
        return;
    }

    // -------- the head is complete, run the one-time request setup --
    if sess.txn.req.err_pos.is_some() && !accept_invalid {
        return_bad_req(sess);
        return;
    }
    if let StartLine::Request { v_l: 0, .. } = sess.txn.req.start {
        let txn = &mut sess.txn;
        if upgrade_v09_to_v10(
            &mut sess.req.buf,
            &mut txn.req,
            &mut txn.hdr_idx,
            accept_invalid,
        )
        .is_err()
        {
            return_bad_req(sess);
            return;
        }
    }
    sess.txn.meth = request_method(&sess.req.buf, &sess.txn.req);
    bump(&sess.fe.counters.req_in);
    sess.txn.flags.remove(TxnFlags::WAIT_NEXT_RQ);
    sess.req.analyse_exp = 0;

    // capture the URI for the log pipeline
    if sess.txn.uri.is_none() {
        if let StartLine::Request { u, u_l, .. } = sess.txn.req.start {
            if let Some(mut slot) = sess.pools.uri.get() {
                let take = std::cmp::min(u_l, crate::session::REQURI_LEN);
                slot.extend_from_slice(&sess.req.buf.copy_range(u, u + take));
                sess.txn.uri = Some(slot);
            }
        }
    }
    sess.assign_unique_id(now);

    // monitor-uri answers before any rule may run
    if let Some(monitor) = sess.fe.monitor_uri.clone() {
        if sess.txn.uri.as_deref() == Some(&monitor[..]) {
            bump(&sess.fe.counters.intercepted);
            let payload = sess.fe.error_payload(200);
            emit_local(sess, 200, &payload);
            sess.report_error(ErrCause::Local, Finst::Request);
            return;
        }
    }

    // proxied-form requests may govern Proxy-Connection instead
    if sess.fe.options.http_use_proxy_header {
        if let StartLine::Request { u, u_l, .. } = sess.txn.req.start {
            if u_l > 0 && sess.req.buf.byte(u) != b'/' && sess.req.buf.byte(u) != b'*' {
                sess.txn.flags.insert(TxnFlags::USE_PX_CONN);
            }
        }
    }
    parse_auth(sess);
    capture_headers(sess, false);

    {
        let txn = &mut sess.txn;
        match framing::analyze_request(&mut sess.req.buf, &mut txn.req, &mut txn.hdr_idx) {
            Ok(_) => {}
            Err(_) => {
                return_bad_req(sess);
                return;
            }
        }
    }

    let conn_name: &[u8] = if sess.txn.flags.contains(TxnFlags::USE_PX_CONN) {
        b"Proxy-Connection"
    } else {
        b"Connection"
    };
    sess.txn.conn_hdr =
        mode::parse_connection_header(&sess.req.buf, &sess.txn.hdr_idx, conn_name);

    sess.txn.wanted = mode::want_mode(&ModeInputs {
        fe_mode: sess.fe.conn_mode,
        be_mode: sess.be.conn_mode,
        ver_11: sess
            .txn
            .req
            .flags
            .contains(crate::proto::h1::MsgFlags::VER_11),
        conn_close: sess.txn.conn_hdr.contains(ConnHdr::CLOSE),
        conn_keep_alive: sess.txn.conn_hdr.contains(ConnHdr::KEEP_ALIVE),
        xfer_len_known: sess
            .txn
            .req
            .flags
            .contains(crate::proto::h1::MsgFlags::XFER_LEN),
        fe_stopping: sess.fe.stopping,
    });
    trace!(mode = ?sess.txn.wanted, meth = %sess.txn.meth, "request head processed");

    sess.req.analysers.remove(Analysers::WAIT_HTTP);
    sess.req.analysers.insert(Analysers::HTTP_PROCESS_FE);
}

fn process_req_rules(sess: &mut Session, now: Tick, fe_pass: bool) {
    let px = if fe_pass {
        sess.fe.clone()
    } else {
        sess.be.clone()
    };
    let meth = sess.txn.meth.clone();
    let (verdict, realm, redirect, nice, tos, mark, log_level, vars) = {
        let txn = &mut sess.txn;
        let mut ctx = ActionCtx::new(
            &mut sess.req.buf,
            &mut txn.hdr_idx,
            &mut txn.req,
            &mut txn.flags,
            meth,
            0,
            false,
        );
        let verdict = apply_rules(&px.req_rules, &mut ctx);
        (
            verdict,
            ctx.auth_realm.take(),
            ctx.redirect.take(),
            ctx.nice,
            ctx.tos,
            ctx.mark,
            ctx.log_level,
            std::mem::take(&mut ctx.vars),
        )
    };
    sess.nice = nice.or(sess.nice);
    sess.tos = tos.or(sess.tos);
    sess.mark = mark.or(sess.mark);
    sess.log_level = log_level.or(sess.log_level);
    sess.vars.extend(vars);

    match verdict {
        Verdict::Continue | Verdict::Stop => {}
        Verdict::Deny => {
            if sess.txn.flags.contains(TxnFlags::CLTARPIT) {
                // hold the request, answer much later
                sess.req.analysers = Analysers::HTTP_TARPIT;
                sess.req.analyse_exp = if sess.be.timeouts.tarpit != 0 {
                    now + sess.be.timeouts.tarpit
                } else {
                    now
                };
                sess.req.buf.truncate_input();
                return;
            }
            bump(&px.counters.denied_req);
            let payload = sess.fe.error_payload(403);
            return_prx_cond(sess, 403, &payload, Finst::Request);
            return;
        }
        Verdict::Abort => {
            bump(&sess.fe.counters.intercepted);
            let proxy_auth = sess.txn.flags.contains(TxnFlags::USE_PX_CONN);
            let payload =
                status::auth_challenge(realm.as_deref().unwrap_or("Restricted"), proxy_auth);
            let status = if proxy_auth { 407 } else { 401 };
            return_prx_cond(sess, status, &payload, Finst::Request);
            return;
        }
        Verdict::Done => {
            if let Some(rule) = redirect {
                bump(&sess.fe.counters.intercepted);
                let out = {
                    let txn = &sess.txn;
                    let smp = SampleCtx {
                        buf: &sess.req.buf,
                        msg: &txn.req,
                        idx: &txn.hdr_idx,
                        meth: &txn.meth,
                        status: 0,
                    };
                    rule.build(&smp)
                };
                sess.txn.status = rule.code;
                let _ = sess.res.buf.write_out(&out);
                sess.req.buf.truncate_input();
                sess.req.clear_analysers();
                // the generated response only has to drain
                sess.res.analysers = Analysers::HTTP_XFER_BODY;
                sess.txn.req.state = MsgState::Done;
                sess.txn.rsp.state = MsgState::Done;
                sess.txn.wanted = WantMode::Close;
                sess.req.shutr_now();
                sess.res.shutw_now();
            }
            return;
        }
        Verdict::BadRequest => {
            return_bad_req(sess);
            return;
        }
    }

    if fe_pass {
        sess.req.analysers.remove(Analysers::HTTP_PROCESS_FE);
        sess.req.analysers.insert(Analysers::HTTP_PROCESS_BE);
    } else {
        sess.req.analysers.remove(Analysers::HTTP_PROCESS_BE);
        finish_request(sess, now);
    }
}

/// The tail of request processing once every rule list agreed.
fn finish_request(sess: &mut Session, now: Tick) {
    // backend persistence cookie
    if let Some(cookie_cfg) = sess.be.cookie.clone() {
        let be = sess.be.clone();
        let steered = crate::cookies::manage_client_cookies(
            &mut sess.req.buf,
            &mut sess.txn,
            &cookie_cfg,
            &be.servers,
            (now / 1000) as u32,
        );
        if steered.is_some() {
            sess.srv = steered;
            sess.txn.flags.insert(TxnFlags::PREFER_LAST);
        }
    }

    // interim 100 for a client waiting to send its body
    let expects_body = sess
        .txn
        .req
        .flags
        .contains(crate::proto::h1::MsgFlags::TE_CHNK)
        || sess.txn.req.chunk_len > 0;
    if expects_body
        && sess
            .txn
            .req
            .flags
            .contains(crate::proto::h1::MsgFlags::VER_11)
    {
        let mut ctx = HeaderCursor::new();
        let found = hdr::find_header(
            b"Expect",
            &sess.req.buf,
            &sess.txn.hdr_idx,
            &mut ctx,
            true,
        ) && ctx
            .value(&sess.req.buf)
            .eq_ignore_ascii_case(b"100-continue");
        if found {
            let _ = sess.res.buf.write_out(status::HTTP_100);
            let txn = &mut sess.txn;
            hdr::del_header(
                &mut sess.req.buf,
                &mut txn.hdr_idx,
                &mut txn.req,
                b"Expect",
            );
            txn.req.state = MsgState::Sent100;
        }
    }

    // make the wire agree with the wanted mode
    {
        let fake_ka = sess.be.options.pretend_keepalive;
        let name: &[u8] = if sess.txn.flags.contains(TxnFlags::USE_PX_CONN) {
            b"Proxy-Connection"
        } else {
            b"Connection"
        };
        let wanted = sess.txn.wanted;
        let txn = &mut sess.txn;
        let _ = mode::adjust_connection(
            &mut sess.req.buf,
            &mut txn.hdr_idx,
            &mut txn.req,
            wanted,
            fake_ka,
            name,
        );
    }

    // pick the compression algorithm while the request is available
    let comp_cfg = if !sess.fe.compression.algos.is_empty() {
        sess.fe.compression.clone()
    } else {
        sess.be.compression.clone()
    };
    if !comp_cfg.algos.is_empty() {
        let txn = &mut sess.txn;
        sess.comp_algo = compress::select_request_algorithm(
            &mut sess.req.buf,
            &mut txn.hdr_idx,
            &mut txn.req,
            &comp_cfg,
        );
    }

    if !sess.srv_conn {
        sess.txn
            .req
            .flags
            .insert(crate::proto::h1::MsgFlags::WAIT_CONN);
    }
    sess.req.analysers.insert(Analysers::HTTP_XFER_BODY);
    sess.res.analysers.insert(Analysers::WAIT_HTTP);
    // the header index now belongs to the response
    sess.txn.hdr_idx.reset();
}

fn forward_request_body(sess: &mut Session) {
    if sess
        .txn
        .req
        .flags
        .contains(crate::proto::h1::MsgFlags::WAIT_CONN)
    {
        if !sess.srv_conn {
            return;
        }
        sess.txn
            .req
            .flags
            .remove(crate::proto::h1::MsgFlags::WAIT_CONN);
    }
    let finished = {
        let txn = &mut sess.txn;
        let chn = &mut sess.req;
        if txn.req.sov > 0 {
            // ship the head first
            let n = txn.req.sov;
            chn.buf.forward(n);
            txn.req.rewind(n);
        }
        forward_body(chn, &mut txn.req, None)
    };
    match finished {
        Ok(true) => {
            sess.req.analysers.remove(Analysers::HTTP_XFER_BODY);
        }
        Ok(false) => {}
        Err(ref e) if e.is_incomplete_message() => aborted_xfer(sess, true),
        Err(_) => return_bad_req(sess),
    }
}

fn wait_for_response(sess: &mut Session, now: Tick) {
    let accept_invalid = sess.be.options.accept_invalid_http_response;
    {
        let txn = &mut sess.txn;
        let chn = &mut sess.res;
        let parked = txn.rsp.state == MsgState::RpBefore
            && chn.buf.output() > 0
            && !chn.buf.reserve_free();
        if !parked {
            if txn.rsp.state == MsgState::RpBefore {
                chn.buf.maybe_realign();
            }
            parse_message(
                &mut chn.buf,
                &mut txn.rsp,
                &mut txn.hdr_idx,
                accept_invalid,
            );
        }
    }

    if sess.txn.rsp.state == MsgState::Error {
        bump(&sess.be.counters.failed_rsp);
        sess.be
            .capture_bad_message(&sess.res.buf, sess.res.total, &sess.txn.rsp, true);
        return_srv_error(sess, 502, ErrCause::PrxCond);
        return;
    }
    if !sess.txn.rsp.state.head_complete() {
        if sess.res.analyse_exp == 0 && sess.be.timeouts.server != 0 {
            sess.res.analyse_exp = now + sess.be.timeouts.server;
        }
        if tick_is_expired(sess.res.analyse_exp, now)
            || sess.res.flags.contains(ChanFlags::READ_TIMEOUT)
        {
            bump(&sess.be.counters.failed_rsp);
            return_srv_error(sess, 504, ErrCause::SrvTo);
            return;
        }
        if sess.res.flags.contains(ChanFlags::SHUTR) || sess.res.has_error() {
            bump(&sess.be.counters.failed_rsp);
            return_srv_error(sess, 502, ErrCause::SrvCl);
            return;
        }
        return;
    }

    let status = response_status(&sess.res.buf, &sess.txn.rsp);
    sess.txn.status = status;
    sess.res.analyse_exp = 0;

    if (100..200).contains(&status) && status != 101 {
        // forward the interim response and wait for the real one
        let txn = &mut sess.txn;
        let n = txn.rsp.sov;
        sess.res.buf.forward(n);
        txn.rsp.reset(MsgState::RpBefore);
        txn.hdr_idx.reset();
        trace!(status, "interim response forwarded");
        return;
    }
    bump(&sess.be.counters.rsp_in);
    if status == 101 {
        sess.txn.wanted = WantMode::Tunnel;
    }

    {
        let meth = sess.txn.meth.clone();
        let txn = &mut sess.txn;
        match framing::analyze_response(
            &mut sess.res.buf,
            &mut txn.rsp,
            &mut txn.hdr_idx,
            &meth,
            status,
        ) {
            Ok(Framing::Tunnel) => {
                txn.wanted = WantMode::Tunnel;
                txn.rsp
                    .flags
                    .insert(crate::proto::h1::MsgFlags::XFER_LEN);
                txn.rsp.chunk_len = 0;
            }
            Ok(_) => {}
            Err(_) => {
                bump(&sess.be.counters.failed_rsp);
                sess.be.capture_bad_message(
                    &sess.res.buf,
                    sess.res.total,
                    &sess.txn.rsp,
                    true,
                );
                return_srv_error(sess, 502, ErrCause::PrxCond);
                return;
            }
        }
    }

    // a response without a knowable length pins the connection closed
    if !sess
        .txn
        .rsp
        .flags
        .contains(crate::proto::h1::MsgFlags::XFER_LEN)
        && sess.txn.wanted != WantMode::Tunnel
    {
        sess.txn.wanted = WantMode::Close;
    }

    check_response_cacheability(sess);
    capture_headers(sess, true);

    sess.res.analysers.remove(Analysers::WAIT_HTTP);
    sess.res.analysers.insert(Analysers::HTTP_PROCESS_BE);
}

fn check_response_cacheability(sess: &mut Session) {
    if !matches!(sess.txn.status, 200 | 203 | 206 | 300 | 301 | 410) {
        return;
    }
    let mut ctx = HeaderCursor::new();
    while hdr::find_header(
        b"Cache-Control",
        &sess.res.buf,
        &sess.txn.hdr_idx,
        &mut ctx,
        false,
    ) {
        let v = ctx.value(&sess.res.buf);
        if v.eq_ignore_ascii_case(b"private")
            || v.eq_ignore_ascii_case(b"no-store")
            || v.eq_ignore_ascii_case(b"no-cache")
        {
            return;
        }
    }
    sess.txn.flags.insert(TxnFlags::CACHEABLE);
}

fn process_res_rules(sess: &mut Session, now: Tick) {
    let meth = sess.txn.meth.clone();
    let status = sess.txn.status;
    let mut final_verdict = Verdict::Continue;
    for px in [sess.be.clone(), sess.fe.clone()] {
        if px.rsp_rules.is_empty() {
            continue;
        }
        let (verdict, vars) = {
            let txn = &mut sess.txn;
            let mut ctx = ActionCtx::new(
                &mut sess.res.buf,
                &mut txn.hdr_idx,
                &mut txn.rsp,
                &mut txn.flags,
                meth.clone(),
                status,
                true,
            );
            let verdict = apply_rules(&px.rsp_rules, &mut ctx);
            (verdict, std::mem::take(&mut ctx.vars))
        };
        sess.vars.extend(vars);
        if verdict != Verdict::Continue {
            final_verdict = verdict;
            break;
        }
    }
    match final_verdict {
        Verdict::Continue | Verdict::Stop | Verdict::Done => {}
        Verdict::Deny | Verdict::BadRequest | Verdict::Abort => {
            bump(&sess.be.counters.denied_rsp);
            return_srv_error(sess, 502, ErrCause::PrxCond);
            return;
        }
    }

    // server-side persistence cookie mutation
    if let Some(cookie_cfg) = sess.be.cookie.clone() {
        let be = sess.be.clone();
        let srv_key = sess
            .srv
            .and_then(|k| be.servers.get(k))
            .and_then(|s| s.cookie.clone());
        let _ = crate::cookies::manage_server_cookies(
            &mut sess.res.buf,
            &mut sess.txn,
            &cookie_cfg,
            srv_key.as_deref(),
            (now / 1000) as u32,
        );
        if sess.txn.flags.contains(TxnFlags::CACHEABLE)
            && sess.txn.sck_state != crate::proto::h1::txn::ServerCookie::None
        {
            sess.txn.flags.insert(TxnFlags::CACHE_COOK);
        }
    }

    // response-side Connection header agreement
    {
        let wanted = sess.txn.wanted;
        let txn = &mut sess.txn;
        let _ = mode::adjust_connection(
            &mut sess.res.buf,
            &mut txn.hdr_idx,
            &mut txn.rsp,
            wanted,
            false,
            b"Connection",
        );
    }

    // engage compression if the request negotiated an algorithm
    if let Some(algo) = sess.comp_algo.clone() {
        let comp_cfg = if !sess.fe.compression.algos.is_empty() {
            sess.fe.compression.clone()
        } else {
            sess.be.compression.clone()
        };
        let req_flags = sess.txn.req.flags;
        let txn = &mut sess.txn;
        if let Ok(ctx) = compress::prepare_response(
            &mut sess.res.buf,
            &mut txn.hdr_idx,
            &mut txn.rsp,
            req_flags,
            status,
            &comp_cfg,
            &algo,
            true,
        ) {
            sess.comp_ctx = ctx;
        }
    }

    sess.res.analysers.remove(Analysers::HTTP_PROCESS_BE);
    sess.res.analysers.insert(Analysers::HTTP_XFER_BODY);
}

fn forward_response_body(sess: &mut Session) {
    let finished = {
        let txn = &mut sess.txn;
        let chn = &mut sess.res;
        if txn.rsp.sov > 0 && txn.rsp.state.head_complete() {
            let n = txn.rsp.sov;
            chn.buf.forward(n);
            txn.rsp.rewind(n);
        }
        forward_body(chn, &mut txn.rsp, sess.comp_ctx.as_mut())
    };
    match finished {
        Ok(true) => {
            if let Some(ctx) = sess.comp_ctx.take() {
                let c = &sess.fe.counters;
                c.comp_in.set(c.comp_in.get() + ctx.consumed);
                c.comp_out.set(c.comp_out.get() + ctx.produced);
            }
            // the analyser owns the transfer until the scheduled
            // output fully drains to the client
            if sess.res.buf.output() == 0 {
                sess.res.analysers.remove(Analysers::HTTP_XFER_BODY);
            }
        }
        Ok(false) => {}
        Err(ref e) if e.is_incomplete_message() => aborted_xfer(sess, false),
        Err(_) => {
            sess.txn.rsp.state = MsgState::Error;
            sess.report_error(ErrCause::SrvCl, Finst::Data);
            close_silent(sess);
        }
    }
}

fn handle_tarpit(sess: &mut Session, now: Tick) {
    if sess.req.flags.contains(ChanFlags::SHUTR) || sess.req.has_error() {
        // the client left before the delayed answer, good riddance
        sess.report_error(ErrCause::CliCl, Finst::Tarpit);
        close_silent(sess);
        return;
    }
    if tick_is_expired(sess.req.analyse_exp, now) {
        let payload = sess.fe.error_payload(500);
        return_prx_cond(sess, 500, &payload, Finst::Tarpit);
        return;
    }
    // swallow whatever the client keeps sending
    sess.req.buf.truncate_input();
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::proxy::Proxy;
    use crate::session::{Pools, Session};
    use crate::proto::h1::txn::TxnFlags;

    fn session_with(fe: Proxy, capacity: usize) -> Session {
        Session::new(
            Rc::new(fe),
            Rc::new(Proxy::new("be")),
            Rc::new(Pools::default()),
            capacity,
        )
    }

    #[test]
    fn bad_request_is_answered_and_archived() {
        let mut sess = session_with(Proxy::new("fe"), 4096);
        sess.req.recv(b"GET\x01/ HTTP/1.1\r\n\r\n");
        sess.process(1);
        assert_eq!(sess.status(), 400);
        assert!(sess.res.buf.pull(4096).starts_with(b"HTTP/1.0 400"));
        assert_eq!(sess.term_code(), *b"PR");
        assert_eq!(sess.fe.counters.failed_req.get(), 1);
        sess.fe.with_invalid_req(|snap| {
            let snap = snap.expect("snapshot");
            assert_eq!(snap.err_pos, Some(3));
            assert!(!snap.response);
        });
    }

    #[test]
    fn http09_is_get_only() {
        let mut sess = session_with(Proxy::new("fe"), 4096);
        sess.server_established();
        sess.req.recv(b"POST /a\r\n");
        sess.process(1);
        assert_eq!(sess.status(), 400);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut sess = session_with(Proxy::new("fe"), 512);
        // an endless request line can never fit next to the reserve
        let junk = vec![b'a'; 600];
        sess.req.recv(b"GET /");
        sess.req.recv(&junk);
        sess.process(1);
        assert_eq!(sess.status(), 400);
        assert_eq!(sess.term_code(), *b"PR");
    }

    #[test]
    fn proxied_form_governs_proxy_connection() {
        let mut fe = Proxy::new("fe");
        fe.options.http_use_proxy_header = true;
        let mut sess = session_with(fe, 4096);
        sess.server_established();
        sess.req.recv(
            b"GET http://origin/ HTTP/1.0\r\nProxy-Connection: keep-alive\r\n\r\n",
        );
        sess.process(1);
        assert!(sess.txn.flags.contains(TxnFlags::USE_PX_CONN));
        let fwd = String::from_utf8(sess.req.buf.pull(4096).to_vec()).unwrap();
        assert!(fwd.contains("Proxy-Connection: keep-alive\r\n"), "{}", fwd);
    }

    #[test]
    fn close_with_nothing_received_is_silent() {
        let mut sess = session_with(Proxy::new("fe"), 4096);
        sess.req.shutr();
        sess.process(1);
        assert_eq!(sess.res.buf.output(), 0);
        assert_eq!(sess.term_code(), *b"CR");
        assert_eq!(sess.fe.counters.failed_req.get(), 0);
    }

    #[test]
    fn close_mid_head_is_a_bad_request() {
        let mut sess = session_with(Proxy::new("fe"), 4096);
        sess.req.recv(b"GET / HTTP/1.1\r\nHos");
        sess.req.shutr();
        sess.process(1);
        assert_eq!(sess.status(), 400);
        assert_eq!(sess.term_code(), *b"CR");
        assert_eq!(sess.fe.counters.failed_req.get(), 1);
    }
}
