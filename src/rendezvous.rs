// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The rendezvous semaphore.
//!
//! A [`SyncSema`] carries no counter of its own: tokens exist only while a
//! releaser is present. One releaser offering `n` tokens meets `n` acquirers,
//! whichever side arrives first, and the releaser itself stays parked until
//! all of its tokens have been taken. Channels use this shape for their
//! synchronous handoff.
//!
//! The waiter list is role-homogeneous at every point where the lock is
//! released: a caller always drains opposite-role waiters before it enqueues
//! itself, so acquirers and releasers never queue behind one another.

use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::mem;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, Waker};

use pin_project::{pin_project, pinned_drop};
use static_assertions::assert_impl_all;

use crate::blockprofile;
use crate::list::{Linked, Links, List};
use crate::mutex::{Mutex, MutexGuard};
use crate::util::loom_const_fn;
use crate::wake_batch::WakeBatch;

/// A semaphore without a counter: releases block until every token they
/// offered has been consumed by an acquire.
pub struct SyncSema {
    waiters: Mutex<List<Waiter>>,
}

assert_impl_all!(SyncSema: Send, Sync);

/// Future returned by [`SyncSema::acquire`].
///
/// # Cancellation
///
/// Dropping the future removes its waiter from the queue. A token that was
/// already handed to this waiter is forfeited.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct RendezvousAcquire<'a> {
    sema: &'a SyncSema,
    #[pin]
    waiter: Waiter,
}

/// Future returned by [`SyncSema::release`].
///
/// # Cancellation
///
/// Dropping the future removes its waiter from the queue; tokens it still
/// held are forfeited and acquirers waiting for them will keep sleeping.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct RendezvousRelease<'a> {
    sema: &'a SyncSema,
    n: u32,
    #[pin]
    waiter: Waiter,
}

#[repr(C)]
#[pin_project]
struct Waiter {
    /// The node shared with the other role.
    ///
    /// This must be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    #[pin]
    node: UnsafeCell<Node>,
    state: WaitState,
    acquire_time: i64,
}

struct Node {
    links: Links<Waiter>,
    /// `-1` marks an acquirer. A positive value marks a releaser and counts
    /// the tokens it still holds; acquirers decrement it in place and pop the
    /// releaser when it reaches zero.
    nrelease: i64,
    wakeup: Wakeup,
    release_time: i64,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

const ACQUIRER: i64 = -1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WaitState {
    Start,
    Waiting,
    Completed,
}

#[derive(Debug)]
enum Wakeup {
    Empty,
    Waiting(Waker),
    Woken,
}

// === impl SyncSema ===

impl SyncSema {
    loom_const_fn! {
        pub const fn new() -> SyncSema {
            SyncSema {
                waiters: Mutex::new(List::new()),
            }
        }
    }

    /// Takes one token, sleeping until a [`release`](Self::release) provides
    /// it.
    ///
    /// If a releaser is parked at the head of the queue, one of its tokens is
    /// consumed and the acquire completes immediately (readying the releaser
    /// if that was its last token). Otherwise the caller joins the queue.
    pub fn acquire(&self) -> RendezvousAcquire<'_> {
        RendezvousAcquire {
            sema: self,
            waiter: Waiter::new(ACQUIRER),
        }
    }

    /// Offers `n` tokens and sleeps until all of them have been consumed.
    ///
    /// Parked acquirers are readied immediately, one token each; if tokens
    /// remain after that, the caller joins the queue as a releaser and parks
    /// until the last token is taken. `release(0)` completes immediately.
    pub fn release(&self, n: u32) -> RendezvousRelease<'_> {
        RendezvousRelease {
            sema: self,
            n,
            waiter: Waiter::new(0),
        }
    }

    /// Verifies that an opaque mirror of `SyncSema` reserved by a higher
    /// layer matches the real structure size.
    ///
    /// # Panics
    ///
    /// Panics if `expected` differs from `size_of::<SyncSema>()`; the
    /// mismatch is a build-time contract violation and there is nothing to
    /// recover.
    pub fn check_size(expected: usize) {
        let actual = size_of::<SyncSema>();
        assert!(
            expected == actual,
            "bad SyncSema size: expected {expected}, have {actual}"
        );
    }
}

impl Default for SyncSema {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Waiter ===

impl Waiter {
    fn new(nrelease: i64) -> Self {
        Self {
            node: UnsafeCell::new(Node {
                links: Links::new(),
                nrelease,
                wakeup: Wakeup::Empty,
                release_time: 0,
                _pin: PhantomPinned,
            }),
            state: WaitState::Start,
            acquire_time: 0,
        }
    }

    /// Marks a dequeued waiter as woken and hands back its waker.
    ///
    /// The `_list` parameter is the witness that the queue lock is held.
    fn wake(this: NonNull<Self>, _list: &mut List<Waiter>) -> Option<Waker> {
        // Safety: the node is only mutated under the queue lock, which the
        // caller holds.
        unsafe {
            let node = &mut *(*this.as_ptr()).node.get();
            if node.release_time != 0 {
                node.release_time = blockprofile::cputicks();
            }
            match mem::replace(&mut node.wakeup, Wakeup::Woken) {
                Wakeup::Waiting(waker) => Some(waker),
                wakeup => unreachable!("woke a waiter in the {wakeup:?} state"),
            }
        }
    }

    /// Parks this waiter: registers the waker, stamps the profile sentinel,
    /// and links the node onto the queue tail. Must be called with the queue
    /// lock held; the caller returns `Poll::Pending` after dropping it.
    fn park(
        mut self: Pin<&mut Self>,
        waiters: &mut List<Waiter>,
        nrelease: i64,
        waker: &Waker,
    ) {
        // Safety: we never move out of `ptr`, only mutate its fields.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };
        let this = self.project();

        if blockprofile::enabled() && *this.acquire_time == 0 {
            *this.acquire_time = blockprofile::cputicks();
        }

        // Safety: the node is only mutated under the queue lock, which the
        // caller holds.
        unsafe {
            let node = &mut *this.node.get();
            node.nrelease = nrelease;
            node.release_time = if *this.acquire_time != 0 { -1 } else { 0 };
            node.wakeup = Wakeup::Waiting(waker.clone());
        }
        waiters.push_back(ptr);
        *this.state = WaitState::Waiting;
    }

    /// Polls a parked waiter: completes once a peer has consumed the wakeup,
    /// refreshes the registered waker otherwise. Must be called with the
    /// queue lock held; the lock is dropped before any block event is
    /// reported.
    fn poll_parked(
        self: Pin<&mut Self>,
        waiters: MutexGuard<'_, List<Waiter>>,
        waker: &Waker,
    ) -> Poll<()> {
        let this = self.project();

        // Safety: holding the queue lock.
        let release_time = unsafe {
            let node = &mut *this.node.get();
            match node.wakeup {
                Wakeup::Woken => node.release_time,
                Wakeup::Waiting(ref mut curr) => {
                    if !curr.will_wake(waker) {
                        *curr = waker.clone();
                    }
                    return Poll::Pending;
                }
                Wakeup::Empty => {
                    node.wakeup = Wakeup::Waiting(waker.clone());
                    return Poll::Pending;
                }
            }
        };
        drop(waiters);

        *this.state = WaitState::Completed;
        if release_time > 0 {
            blockprofile::blockevent(release_time - *this.acquire_time);
        }
        Poll::Ready(())
    }

    /// Unlinks this waiter on future drop, if a peer has not already dequeued
    /// it.
    fn release(mut self: Pin<&mut Self>, sema: &SyncSema) {
        // Safety: we never move out of `ptr`.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };
        let this = self.as_mut().project();

        if *this.state != WaitState::Waiting {
            return;
        }

        let mut waiters = sema.waiters.lock();
        // Safety: holding the queue lock.
        let linked = unsafe { !matches!((*this.node.get()).wakeup, Wakeup::Woken) };
        if linked {
            // Safety: a waiter in the Waiting state whose wakeup has not been
            // consumed is linked into this queue.
            unsafe {
                waiters.remove(ptr);
            }
        }
    }
}

// Safety: `Waiter` is pinned inside its future for as long as it is linked,
// and its node is the first field, mutated only under the queue lock.
unsafe impl Linked for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<Links<Waiter>> {
        // Safety: `target` points to a live waiter; going through raw
        // pointers avoids creating a temporary reference to the node.
        unsafe {
            let node = &raw const (*target.as_ptr()).node;
            let links = &raw mut (*(*node).get()).links;
            NonNull::new_unchecked(links)
        }
    }
}

// === impl RendezvousAcquire ===

impl Future for RendezvousAcquire<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let sema = *this.sema;

        match this.waiter.as_ref().state {
            WaitState::Start => {}
            WaitState::Waiting => {
                let waiters = sema.waiters.lock();
                return this.waiter.poll_parked(waiters, cx.waker());
            }
            WaitState::Completed => return Poll::Ready(()),
        }

        let mut waiters = sema.waiters.lock();

        if let Some(head) = waiters.front() {
            // take one token from a parked releaser; it stays parked until
            // its last token is gone
            // Safety: holding the queue lock.
            let drained = unsafe {
                let node = &mut *(*head.as_ptr()).node.get();
                if node.nrelease > 0 {
                    node.nrelease -= 1;
                    Some(node.nrelease == 0)
                } else {
                    None
                }
            };

            if let Some(last_token) = drained {
                let waker = if last_token {
                    let popped = waiters.pop_front();
                    debug_assert_eq!(popped, Some(head));
                    Waiter::wake(head, &mut waiters)
                } else {
                    None
                };
                drop(waiters);

                if let Some(waker) = waker {
                    tracing::trace!("readied drained releaser");
                    waker.wake();
                }

                let waiter = this.waiter.project();
                *waiter.state = WaitState::Completed;
                return Poll::Ready(());
            }
        }

        // no releaser present; the queue holds only acquirers (or nothing)
        this.waiter.park(&mut waiters, ACQUIRER, cx.waker());
        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for RendezvousAcquire<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.waiter.release(this.sema);
    }
}

// === impl RendezvousRelease ===

impl Future for RendezvousRelease<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let sema = *this.sema;

        match this.waiter.as_ref().state {
            WaitState::Start => {}
            WaitState::Waiting => {
                let waiters = sema.waiters.lock();
                return this.waiter.poll_parked(waiters, cx.waker());
            }
            WaitState::Completed => return Poll::Ready(()),
        }

        let mut n = *this.n;
        if n == 0 {
            let waiter = this.waiter.project();
            *waiter.state = WaitState::Completed;
            return Poll::Ready(());
        }

        let mut batch = WakeBatch::new();
        let mut waiters = sema.waiters.lock();

        // hand a token each to parked acquirers, front to back
        while n > 0 {
            let Some(head) = waiters.front() else { break };
            // Safety: holding the queue lock.
            let is_acquirer = unsafe { (*(*head.as_ptr()).node.get()).nrelease == ACQUIRER };
            if !is_acquirer {
                // only releasers are queued; queue up behind them
                break;
            }

            let popped = waiters.pop_front();
            debug_assert_eq!(popped, Some(head));
            n -= 1;

            if let Some(waker) = Waiter::wake(head, &mut waiters)
                && batch.add_waker(waker)
            {
                MutexGuard::unlocked(&mut waiters, || batch.wake_all());
            }
        }

        if n == 0 {
            drop(waiters);
            batch.wake_all();
            let waiter = this.waiter.project();
            *waiter.state = WaitState::Completed;
            return Poll::Ready(());
        }

        // tokens remain; park until acquirers have taken them all
        this.waiter.park(&mut waiters, i64::from(n), cx.waker());
        drop(waiters);
        batch.wake_all();
        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for RendezvousRelease<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.waiter.release(this.sema);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn release_first_waits_for_all_tokens() {
        let sema = SyncSema::new();

        let mut releaser = task::spawn(sema.release(3));
        assert_pending!(releaser.poll());

        for taken in 1..=3_u32 {
            let mut acquirer = task::spawn(sema.acquire());
            assert_ready!(acquirer.poll());
            assert_eq!(releaser.is_woken(), taken == 3);
        }

        assert_ready!(releaser.poll());
    }

    #[test]
    fn acquire_first_is_drained_without_parking_the_releaser() {
        let sema = SyncSema::new();

        let mut a1 = task::spawn(sema.acquire());
        let mut a2 = task::spawn(sema.acquire());
        assert_pending!(a1.poll());
        assert_pending!(a2.poll());

        let mut releaser = task::spawn(sema.release(2));
        assert_ready!(releaser.poll());

        assert!(a1.is_woken());
        assert!(a2.is_woken());
        assert_ready!(a1.poll());
        assert_ready!(a2.poll());
    }

    #[test]
    fn tokens_go_to_queued_acquirers_first() {
        let sema = SyncSema::new();

        let mut a1 = task::spawn(sema.acquire());
        assert_pending!(a1.poll());

        // one token for the parked acquirer, one left over for the releaser
        // to park on
        let mut releaser = task::spawn(sema.release(2));
        assert_pending!(releaser.poll());
        assert!(a1.is_woken());
        assert_ready!(a1.poll());

        let mut a2 = task::spawn(sema.acquire());
        assert_ready!(a2.poll());
        assert!(releaser.is_woken());
        assert_ready!(releaser.poll());
    }

    #[test]
    fn release_zero_completes_immediately() {
        let sema = SyncSema::new();
        let mut releaser = task::spawn(sema.release(0));
        assert_ready!(releaser.poll());
    }

    #[test]
    fn dropped_acquirer_is_unlinked() {
        let sema = SyncSema::new();

        let mut a1 = task::spawn(sema.acquire());
        assert_pending!(a1.poll());
        drop(a1);

        let mut a2 = task::spawn(sema.acquire());
        assert_pending!(a2.poll());

        let mut releaser = task::spawn(sema.release(1));
        assert_ready!(releaser.poll());
        assert!(a2.is_woken());
        assert_ready!(a2.poll());
    }

    #[test]
    fn check_size_accepts_the_real_layout() {
        SyncSema::check_size(size_of::<SyncSema>());
    }

    #[test]
    #[should_panic(expected = "bad SyncSema size")]
    fn check_size_rejects_a_stale_mirror() {
        SyncSema::check_size(size_of::<SyncSema>() + 8);
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;
    use crate::loom;
    use crate::loom::future::block_on;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    #[test]
    fn acquire_meets_release() {
        loom::model(|| {
            let sema = Arc::new(SyncSema::new());

            let acquirer = {
                let sema = Arc::clone(&sema);
                thread::spawn(move || {
                    block_on(sema.acquire());
                })
            };

            block_on(sema.release(1));
            acquirer.join().unwrap();
        });
    }

    #[test]
    fn one_releaser_two_acquirers() {
        loom::model(|| {
            let sema = Arc::new(SyncSema::new());

            let spawn_acquirer = || {
                let sema = Arc::clone(&sema);
                thread::spawn(move || {
                    block_on(sema.acquire());
                })
            };
            let a1 = spawn_acquirer();
            let a2 = spawn_acquirer();

            block_on(sema.release(2));
            a1.join().unwrap();
            a2.join().unwrap();
        });
    }
}
