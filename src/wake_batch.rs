// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use arrayvec::ArrayVec;
use core::task::Waker;

const NUM_WAKERS: usize = 32;

/// A fixed-capacity batch of wakers, so that tasks can be readied outside the
/// waiter list lock in bounded groups.
pub(crate) struct WakeBatch {
    inner: ArrayVec<Waker, NUM_WAKERS>,
}

impl WakeBatch {
    pub(crate) const fn new() -> Self {
        Self {
            inner: ArrayVec::new_const(),
        }
    }

    /// Adds a [`Waker`] to the batch, returning `true` if the batch needs to
    /// be flushed because it is full.
    pub(crate) fn add_waker(&mut self, waker: Waker) -> bool {
        self.inner.push(waker);
        self.inner.is_full()
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.inner.drain(..) {
            waker.wake();
        }
    }
}
