//! Directional half of a proxied connection.
//!
//! A [`Channel`] couples a ring [`Buffer`] with the transport-facing
//! state the engine needs: shutdown and error flags, the analyser
//! bitmask that says which protocol passes still have to run on the
//! pending input, an analysis expiry tick, and the auto-forward
//! counter used while a body is being streamed through.

use bitflags::bitflags;

use crate::buffer::Buffer;

/// Millisecond tick. Zero means "no expiry armed".
pub type Tick = u64;

/// Returns true when an armed expiry tick has passed.
#[inline]
pub fn tick_is_expired(exp: Tick, now: Tick) -> bool {
    exp != 0 && now >= exp
}

bitflags! {
    /// Transport and scheduling state of one channel.
    pub struct ChanFlags: u32 {
        /// Read side definitely closed.
        const SHUTR = 0x0001;
        /// Write side definitely closed.
        const SHUTW = 0x0002;
        /// Close the read side as soon as possible.
        const SHUTR_NOW = 0x0004;
        /// Close the write side once pending output drains.
        const SHUTW_NOW = 0x0008;
        /// The transport reported a read error.
        const READ_ERROR = 0x0010;
        /// The transport reported a write error.
        const WRITE_ERROR = 0x0020;
        /// The read side timed out.
        const READ_TIMEOUT = 0x0040;
        /// The write side timed out.
        const WRITE_TIMEOUT = 0x0080;
        /// Read as soon as possible, even a partial buffer is useful.
        const READ_DONTWAIT = 0x0100;
        /// Wake the producer task when room appears.
        const WAKE_WRITE = 0x0200;
        /// More data is expected shortly, coalesce writes.
        const EXPECT_MORE = 0x0400;
        /// Never wait for more data before processing.
        const NEVER_WAIT = 0x0800;
        /// Forward shutdowns to the other side automatically.
        const AUTO_CLOSE = 0x1000;
        /// Establish the server connection automatically when needed.
        const AUTO_CONNECT = 0x2000;
    }
}

bitflags! {
    /// Analysers still to be run on a channel's input.
    pub struct Analysers: u32 {
        /// Wait for a complete HTTP message head.
        const WAIT_HTTP = 0x01;
        /// Run the frontend rule pipeline.
        const HTTP_PROCESS_FE = 0x02;
        /// Run the backend rule pipeline.
        const HTTP_PROCESS_BE = 0x04;
        /// Forward the message body.
        const HTTP_XFER_BODY = 0x08;
        /// Hold the request while the tarpit timer runs.
        const HTTP_TARPIT = 0x10;
        /// Wait for a request body (expect/continue handling).
        const HTTP_BODY = 0x20;
        /// Inner processing hook between FE and BE passes.
        const HTTP_INNER = 0x40;
    }
}

/// One direction of a proxied connection.
#[derive(Debug)]
pub struct Channel {
    /// The ring buffer shared by the input and output sub-areas.
    pub buf: Buffer,
    /// Transport and scheduling flags.
    pub flags: ChanFlags,
    /// Analysis passes still owed to the pending input.
    pub analysers: Analysers,
    /// Expiry tick for the current analysis phase; 0 when unarmed.
    pub analyse_exp: Tick,
    /// Bytes that may cross input to output without further analysis.
    pub to_forward: u64,
    /// Total bytes ever received on this channel.
    pub total: u64,
}

impl Channel {
    /// Creates a channel over a buffer of the given capacity.
    pub fn new(capacity: usize) -> Channel {
        Channel {
            buf: Buffer::with_capacity(capacity),
            flags: ChanFlags::AUTO_CLOSE,
            analysers: Analysers::empty(),
            analyse_exp: 0,
            to_forward: 0,
            total: 0,
        }
    }

    /// Feeds transport bytes into the channel. Bytes covered by the
    /// auto-forward counter move straight to output. Returns how many
    /// bytes were taken.
    pub fn recv(&mut self, bytes: &[u8]) -> usize {
        let n = self.buf.put(bytes);
        self.total += n as u64;
        if self.to_forward > 0 && n > 0 {
            let fwd = std::cmp::min(self.to_forward, n as u64) as usize;
            self.buf.forward(fwd);
            self.to_forward -= fwd as u64;
        }
        n
    }

    /// Schedules `n` input bytes for forwarding. What is already
    /// buffered moves immediately; the remainder is remembered and
    /// drained by [`Channel::recv`] as it arrives.
    pub fn forward(&mut self, n: u64) -> usize {
        let now = std::cmp::min(n, self.buf.input() as u64) as usize;
        self.buf.forward(now);
        self.to_forward += n - now as u64;
        now
    }

    /// True once the read side is or is about to be closed.
    #[inline]
    pub fn input_closed(&self) -> bool {
        self.flags.intersects(ChanFlags::SHUTR | ChanFlags::SHUTR_NOW)
    }

    /// True once the write side is or is about to be closed.
    #[inline]
    pub fn output_closed(&self) -> bool {
        self.flags.intersects(ChanFlags::SHUTW | ChanFlags::SHUTW_NOW)
    }

    /// Marks the read side closed (transport saw EOF).
    pub fn shutr(&mut self) {
        self.flags.insert(ChanFlags::SHUTR);
        self.flags.remove(ChanFlags::SHUTR_NOW);
    }

    /// Marks the write side closed.
    pub fn shutw(&mut self) {
        self.flags.insert(ChanFlags::SHUTW);
        self.flags.remove(ChanFlags::SHUTW_NOW);
    }

    /// Requests a read shutdown at the next opportunity.
    pub fn shutr_now(&mut self) {
        self.flags.insert(ChanFlags::SHUTR_NOW);
    }

    /// Requests a write shutdown once pending output drains.
    pub fn shutw_now(&mut self) {
        self.flags.insert(ChanFlags::SHUTW_NOW);
    }

    /// True when a transport error was recorded on either side.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.flags
            .intersects(ChanFlags::READ_ERROR | ChanFlags::WRITE_ERROR)
    }

    /// Drops remaining analysers, usually on an abort path.
    pub fn clear_analysers(&mut self) {
        self.analysers = Analysers::empty();
        self.analyse_exp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_counts_total() {
        let mut chn = Channel::new(64);
        assert_eq!(chn.recv(b"abc"), 3);
        assert_eq!(chn.recv(b"de"), 2);
        assert_eq!(chn.total, 5);
        assert_eq!(chn.buf.input(), 5);
    }

    #[test]
    fn forward_spans_future_bytes() {
        let mut chn = Channel::new(64);
        chn.recv(b"abcd");
        chn.forward(10);
        assert_eq!(chn.buf.output(), 4);
        assert_eq!(chn.to_forward, 6);
        chn.recv(b"efghijklmn");
        assert_eq!(chn.buf.output(), 10);
        assert_eq!(chn.to_forward, 0);
        // Bytes past the forwarded span stay in input.
        assert_eq!(chn.buf.input(), 4);
    }

    #[test]
    fn tick_zero_is_eternity() {
        assert!(!tick_is_expired(0, u64::MAX));
        assert!(tick_is_expired(5, 5));
        assert!(!tick_is_expired(5, 4));
    }
}
