//! Proxied-protocol implementations.

pub mod h1;
