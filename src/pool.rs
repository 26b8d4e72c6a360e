//! Fixed-size byte pools.
//!
//! Captured URIs, captured headers and unique-id strings are carved out
//! of per-purpose pools with fixed element sizes, so a busy process has
//! a bounded, predictable footprint. Exhaustion is an ordinary outcome
//! the callers must tolerate (a capture is simply skipped).

use std::cell::RefCell;

/// A pool of byte buffers with a fixed element size and element count.
#[derive(Debug)]
pub(crate) struct Pool {
    elem_size: usize,
    inner: RefCell<Inner>,
}

#[derive(Debug)]
struct Inner {
    free: Vec<Vec<u8>>,
    remaining: usize,
}

impl Pool {
    pub(crate) fn new(elem_size: usize, count: usize) -> Pool {
        Pool {
            elem_size,
            inner: RefCell::new(Inner {
                free: Vec::new(),
                remaining: count,
            }),
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Takes an element, or `None` when the pool is exhausted.
    pub(crate) fn get(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        if let Some(mut v) = inner.free.pop() {
            v.clear();
            return Some(v);
        }
        if inner.remaining == 0 {
            return None;
        }
        inner.remaining -= 1;
        Some(Vec::with_capacity(self.elem_size))
    }

    /// Returns an element for reuse.
    pub(crate) fn put(&self, v: Vec<u8>) {
        self.inner.borrow_mut().free.push(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_and_reusable() {
        let pool = Pool::new(8, 2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        assert!(pool.get().is_some());
        assert_eq!(pool.elem_size(), 8);
    }
}
