#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # janus
//!
//! janus is the HTTP/1.x protocol engine of a high-performance reverse
//! proxy. It sits between a client-facing channel and a server-facing
//! channel: for each connection it parses an HTTP/0.9, HTTP/1.0 or
//! HTTP/1.1 request, applies a configurable rule pipeline, forwards the
//! request to a backend, parses the response, applies response-side
//! rules, optionally compresses the body, and drives connection
//! lifecycle (keep-alive, server-close, tunnel, close) across both
//! directions.
//!
//! ## "Low-level"
//!
//! janus deliberately owns no sockets, timers or configuration files.
//! The embedding event loop reads bytes into [`Channel`] buffers, calls
//! [`Session::process`], and writes out whatever the engine scheduled.
//! Compiled rule conditions, pattern sets and compression algorithms are
//! registered by the caller through the trait seams in [`rules`] and
//! [`compress`].
//!
//! The parser is resumable at any byte: it can be preempted whenever the
//! transport runs dry and restarted without loss, because it only ever
//! commits a state and a resume offset. All message positions are plain
//! offsets into the channel's ring [`Buffer`], so headers can be mutated
//! in place without invalidating anything.
//!
//! [`Channel`]: crate::channel::Channel
//! [`Session::process`]: crate::session::Session::process
//! [`Buffer`]: crate::buffer::Buffer

pub use crate::error::{Error, Result};

mod b64;
mod error;

pub mod buffer;
pub mod channel;
pub mod compress;
pub mod cookies;
mod pool;
pub mod proto;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod status;
