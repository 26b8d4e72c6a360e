//! The HTTP/1.x engine.
//!
//! Everything in this module works on plain offsets into a channel's
//! ring [`Buffer`](crate::buffer::Buffer): the parser records where the
//! start-line tokens and header lines live, the header index keeps one
//! cell per line, and every in-place mutation patches the offsets with
//! the signed delta the buffer reports. No pointers, no copies of the
//! message head.

use bitflags::bitflags;

pub mod body;
pub mod conn;
pub mod framing;
pub mod hdr;
pub mod mode;
pub mod parse;
pub mod txn;

/// Parse and lifecycle state of one message direction.
///
/// Declaration order is meaningful: states compare by progress, so
/// `state >= MsgState::Body` asks "is the head complete". `Error`
/// deliberately sorts last and must always be tested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum MsgState {
    /// Expecting the start of a request, possibly leading CRLFs.
    RqBefore,
    RqBeforeCr,
    RqMeth,
    RqMethSp,
    RqUri,
    RqUriSp,
    RqVer,
    RqLineEnd,
    /// Expecting the start of a status line, possibly leading CRLFs.
    RpBefore,
    RpBeforeCr,
    RpVer,
    RpVerSp,
    RpCode,
    RpCodeSp,
    RpReason,
    RpLineEnd,
    /// First byte after the start line.
    HdrFirst,
    HdrName,
    HdrL1Sp,
    HdrL1Lf,
    HdrL1Lws,
    HdrVal,
    HdrL2Lf,
    HdrL2Lws,
    /// LF closing the header block.
    LastLf,
    /// Head complete, body analysis may begin.
    Body,
    /// An interim 100 response has been emitted.
    Sent100,
    ChunkSize,
    Data,
    ChunkCrlf,
    Trailers,
    /// Message fully processed.
    Done,
    /// Waiting for scheduled output to drain before closing.
    Closing,
    /// Shutdown acknowledged.
    Closed,
    /// Bytes pass through uninspected in both directions.
    Tunnel,
    /// Unrecoverable protocol error on this direction.
    Error,
}

impl MsgState {
    /// Whether the message head (start line + headers) is complete.
    #[inline]
    pub fn head_complete(self) -> bool {
        self >= MsgState::Body && self != MsgState::Error
    }

    /// Whether the whole message has been handled.
    #[inline]
    pub fn finished(self) -> bool {
        matches!(
            self,
            MsgState::Done | MsgState::Closing | MsgState::Closed | MsgState::Tunnel
        )
    }
}

bitflags! {
    /// Per-message facts learnt while parsing the head.
    pub struct MsgFlags: u32 {
        /// The message advertises HTTP/1.1 (or later).
        const VER_11 = 0x01;
        /// Transfer-Encoding ends in `chunked`.
        const TE_CHNK = 0x02;
        /// A valid Content-Length was seen.
        const CNT_LEN = 0x04;
        /// The transfer length is known without reading to close.
        const XFER_LEN = 0x08;
        /// Forwarding is parked until the server connection is up.
        const WAIT_CONN = 0x10;
    }
}

/// Offsets of the start-line tokens inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartLine {
    /// Nothing parsed yet.
    None,
    /// Request line `METHOD SP URI [SP VERSION]`.
    Request {
        /// Method length; the method starts at offset 0.
        m_l: usize,
        /// URI offset.
        u: usize,
        /// URI length.
        u_l: usize,
        /// Version offset (equals `u + u_l` for HTTP/0.9).
        v: usize,
        /// Version length (0 for HTTP/0.9).
        v_l: usize,
    },
    /// Status line `VERSION SP CODE [SP REASON]`.
    Status {
        /// Version length; the version starts at offset 0.
        v_l: usize,
        /// Status code offset.
        c: usize,
        /// Status code length.
        c_l: usize,
        /// Reason offset.
        r: usize,
        /// Reason length.
        r_l: usize,
    },
}

/// Per-direction parse state over a channel buffer.
///
/// All positions are offsets relative to the first pending input byte
/// of the owning channel. [`Buffer::forward`](crate::buffer::Buffer::forward)
/// shifts that origin, after which the owner rewinds these fields.
#[derive(Debug)]
pub struct Message {
    /// Current parser / lifecycle state.
    pub state: MsgState,
    /// Facts learnt about the message.
    pub flags: MsgFlags,
    /// First byte not yet visited by the parser.
    pub next: usize,
    /// Start of the line being parsed.
    pub sol: usize,
    /// Position of the current line terminator.
    pub eol: usize,
    /// Start of the current header value while in the head, then the
    /// start of the body once the head completes.
    pub sov: usize,
    /// Position of the empty line closing the header block.
    pub eoh: usize,
    /// Position of the first protocol anomaly, when capture is enabled.
    pub err_pos: Option<usize>,
    /// Start-line token offsets.
    pub start: StartLine,
    /// Bytes remaining in the current data region.
    pub chunk_len: u64,
    /// Cumulative declared body length.
    pub body_len: u64,
}

impl Message {
    /// Creates a message in the given initial state.
    pub fn new(state: MsgState) -> Message {
        Message {
            state,
            flags: MsgFlags::empty(),
            next: 0,
            sol: 0,
            eol: 0,
            sov: 0,
            eoh: 0,
            err_pos: None,
            start: StartLine::None,
            chunk_len: 0,
            body_len: 0,
        }
    }

    /// Resets everything for the next message of a kept-alive session.
    pub fn reset(&mut self, state: MsgState) {
        *self = Message::new(state);
    }

    /// Propagates a buffer length delta into the end-of-head positions.
    ///
    /// Every in-place edit of an indexed header line goes through here
    /// so `sov`, `eoh` and `next` keep pointing at the same bytes.
    pub fn move_end(&mut self, delta: isize) {
        self.sov = (self.sov as isize + delta) as usize;
        self.eoh = (self.eoh as isize + delta) as usize;
        self.next = (self.next as isize + delta) as usize;
    }

    /// Rewinds all positions after `n` bytes were forwarded out of the
    /// buffer origin.
    pub fn rewind(&mut self, n: usize) {
        self.next -= std::cmp::min(self.next, n);
        self.sol -= std::cmp::min(self.sol, n);
        self.eol -= std::cmp::min(self.eol, n);
        self.sov -= std::cmp::min(self.sov, n);
        self.eoh -= std::cmp::min(self.eoh, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_progress_ordering() {
        assert!(MsgState::RqBefore < MsgState::Body);
        assert!(MsgState::LastLf < MsgState::Body);
        assert!(MsgState::Done.head_complete());
        assert!(!MsgState::Error.head_complete());
        assert!(MsgState::Tunnel.finished());
        assert!(!MsgState::Error.finished());
    }

    #[test]
    fn move_end_shifts_tail_positions() {
        let mut msg = Message::new(MsgState::Body);
        msg.sov = 40;
        msg.eoh = 38;
        msg.next = 40;
        msg.move_end(-5);
        assert_eq!((msg.sov, msg.eoh, msg.next), (35, 33, 35));
        msg.move_end(7);
        assert_eq!((msg.sov, msg.eoh, msg.next), (42, 40, 42));
    }
}
