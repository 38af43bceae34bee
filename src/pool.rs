//! Process-wide buffer pool.
//!
//! Connections check buffers out when a transaction starts and the checkout
//! returns them on drop, reset. Allocations and frees only ever happen from
//! the event-loop thread, so the pool is a plain single-threaded structure.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::buffer::Buffer;

pub trait Reset {
    fn reset(&mut self);
}

struct PoolInner {
    buffers: Vec<Buffer>,
    buffer_size: usize,
    rewrite_margin: usize,
    /// buffers still allowed to be created on demand
    spare: usize,
}

/// Pool of equally-sized [`Buffer`]s.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<PoolInner>>,
}

impl Pool {
    /// `count` buffers are preallocated; up to `extra` more can be created
    /// on demand before `checkout` starts returning `None`.
    pub fn with_capacity(count: usize, extra: usize, buffer_size: usize, rewrite_margin: usize) -> Pool {
        let buffers = (0..count)
            .map(|_| Buffer::with_capacity_and_margin(buffer_size, rewrite_margin))
            .collect();
        Pool {
            inner: Rc::new(RefCell::new(PoolInner {
                buffers,
                buffer_size,
                rewrite_margin,
                spare: extra,
            })),
        }
    }

    pub fn checkout(&self) -> Option<Checkout> {
        let mut inner = self.inner.borrow_mut();
        let buffer = match inner.buffers.pop() {
            Some(buffer) => Some(buffer),
            None if inner.spare > 0 => {
                inner.spare -= 1;
                Some(Buffer::with_capacity_and_margin(
                    inner.buffer_size,
                    inner.rewrite_margin,
                ))
            }
            None => None,
        };
        buffer.map(|buffer| Checkout {
            buffer: Some(buffer),
            pool: Rc::downgrade(&self.inner),
        })
    }

    pub fn available(&self) -> usize {
        let inner = self.inner.borrow();
        inner.buffers.len() + inner.spare
    }
}

/// RAII handle on a pooled buffer. The buffer is reset and returned to the
/// pool on drop.
pub struct Checkout {
    buffer: Option<Buffer>,
    pool: std::rc::Weak<RefCell<PoolInner>>,
}

impl Deref for Checkout {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().expect("checkout already returned")
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().expect("checkout already returned")
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let (Some(mut buffer), Some(pool)) = (self.buffer.take(), self.pool.upgrade()) {
            buffer.reset();
            pool.borrow_mut().buffers.push(buffer);
        }
    }
}
