// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ticket notification list behind condition variables.
//!
//! A [`NotifyList`] separates *registering* interest from *waiting*: a task
//! calls [`add`] to draw a ticket (typically while still holding the user's
//! outer lock), releases that lock, and only then calls [`wait`]. A
//! notification that lands in between is not lost; the waiter observes it by
//! comparing its ticket against the `notify` counter and returns without
//! parking.
//!
//! Tickets are monotonically increasing 32-bit serials. All comparisons go
//! through a signed wrap-around difference, so the counters may roll over
//! freely as long as fewer than 2³¹ tickets are outstanding at once.
//! [`notify_one`] always notifies the smallest outstanding ticket, which
//! makes the discipline strictly first-in, first-out.
//!
//! [`add`]: NotifyList::add
//! [`wait`]: NotifyList::wait
//! [`notify_one`]: NotifyList::notify_one

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
use crate::loom::sync::atomic::{AtomicU32, Ordering};
use crate::mutex::{Mutex, MutexGuard};
use crate::util::loom_const_fn;
use crate::wake_batch::WakeBatch;

/// A ticket-ordered wait/notify list.
pub struct NotifyList {
    /// The next ticket to issue. Only ever advanced by [`NotifyList::add`].
    wait: AtomicU32,
    /// The next ticket to notify. Read without the lock on the fast paths,
    /// written only under it.
    notify: AtomicU32,
    waiters: Mutex<List<Waiter>>,
}

assert_impl_all!(NotifyList: Send, Sync);

/// Wrap-aware ticket comparison: `a` precedes `b` as long as fewer than 2³¹
/// tickets separate them.
const fn less(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Future returned by [`NotifyList::wait`].
///
/// # Cancellation
///
/// Dropping the future removes its waiter from the list. A notification that
/// already picked this ticket is forfeited; it is not re-routed to another
/// waiter.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    list: &'a NotifyList,
    ticket: u32,
    #[pin]
    waiter: Waiter,
}

#[repr(C)]
#[pin_project]
struct Waiter {
    /// The node shared with the notifying side.
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
    /// The ticket this waiter drew from [`NotifyList::add`]. Enqueue order is
    /// not ticket order; notify_one scans for the exact match.
    ticket: u32,
    wakeup: Wakeup,
    release_time: i64,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

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

// === impl NotifyList ===

impl NotifyList {
    loom_const_fn! {
        pub const fn new() -> NotifyList {
            NotifyList {
                wait: AtomicU32::new(0),
                notify: AtomicU32::new(0),
                waiters: Mutex::new(List::new()),
            }
        }
    }

    #[cfg(test)]
    loom_const_fn! {
        /// A list whose counters start at `start`, for exercising roll-over.
        const fn with_start(start: u32) -> NotifyList {
            NotifyList {
                wait: AtomicU32::new(start),
                notify: AtomicU32::new(start),
                waiters: Mutex::new(List::new()),
            }
        }
    }

    /// Draws the next ticket.
    ///
    /// Never takes the lock, so it may be called while holding other locks,
    /// including by many tasks concurrently. The returned ticket is handed to
    /// [`wait`](Self::wait) once the caller is ready to sleep.
    pub fn add(&self) -> u32 {
        self.wait.fetch_add(1, Ordering::SeqCst)
    }

    /// Sleeps until `ticket` has been notified.
    ///
    /// Returns immediately if a [`notify_one`](Self::notify_one) or
    /// [`notify_all`](Self::notify_all) that covers `ticket` already ran.
    pub fn wait(&self, ticket: u32) -> Wait<'_> {
        Wait {
            list: self,
            ticket,
            waiter: Waiter::new(ticket),
        }
    }

    /// Notifies the waiter holding the smallest outstanding ticket, if any
    /// ticket is outstanding.
    ///
    /// The picked waiter may not have enqueued itself yet; in that case only
    /// the `notify` counter advances, and the waiter observes it when its
    /// `wait` call compares tickets.
    pub fn notify_one(&self) {
        if self.wait.load(Ordering::SeqCst) == self.notify.load(Ordering::SeqCst) {
            return;
        }

        let mut waiters = self.waiters.lock();
        let t = self.notify.load(Ordering::SeqCst);
        if t == self.wait.load(Ordering::SeqCst) {
            return;
        }
        self.notify.store(t.wrapping_add(1), Ordering::SeqCst);

        let dequeued = waiters.remove_first(|waiter| {
            // Safety: holding the list lock.
            unsafe { (*waiter.node.get()).ticket == t }
        });
        let waker = dequeued.and_then(|node| Waiter::wake(node, &mut waiters));
        drop(waiters);

        if let Some(waker) = waker {
            tracing::trace!(ticket = t, "notified waiter");
            waker.wake();
        }
    }

    /// Notifies every outstanding ticket.
    ///
    /// All waiters registered before this call are readied; the tickets they
    /// hold are consumed whether or not their tasks ever reach
    /// [`wait`](Self::wait). Waiters are readied outside the lock in bounded
    /// batches.
    pub fn notify_all(&self) {
        if self.wait.load(Ordering::SeqCst) == self.notify.load(Ordering::SeqCst) {
            return;
        }

        let mut batch = WakeBatch::new();
        let mut waiters = self.waiters.lock();
        let cut = self.wait.load(Ordering::SeqCst);
        // Tickets drawn after this store observe it and never park; every
        // older ticket is either in the list right now or will see the
        // counter when it checks.
        self.notify.store(cut, Ordering::SeqCst);
        tracing::trace!(cut, queued = waiters.len(), "notifying all");

        loop {
            let mut flush = false;
            while let Some(node) = waiters.remove_first(|waiter| {
                // Safety: holding the list lock.
                unsafe { less((*waiter.node.get()).ticket, cut) }
            }) {
                if let Some(waker) = Waiter::wake(node, &mut waiters)
                    && batch.add_waker(waker)
                {
                    flush = true;
                    break;
                }
            }

            if !flush {
                break;
            }
            // the batch is full; ready it with the list unlocked, then take
            // another pass
            MutexGuard::unlocked(&mut waiters, || batch.wake_all());
        }
        drop(waiters);
        batch.wake_all();
    }

    /// Verifies that an opaque mirror of `NotifyList` reserved by a higher
    /// layer matches the real structure size.
    ///
    /// # Panics
    ///
    /// Panics if `expected` differs from `size_of::<NotifyList>()`; the
    /// mismatch is a build-time contract violation and there is nothing to
    /// recover.
    pub fn check_size(expected: usize) {
        let actual = size_of::<NotifyList>();
        assert!(
            expected == actual,
            "bad NotifyList size: expected {expected}, have {actual}"
        );
    }
}

impl Default for NotifyList {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Waiter ===

impl Waiter {
    fn new(ticket: u32) -> Self {
        Self {
            node: UnsafeCell::new(Node {
                links: Links::new(),
                ticket,
                wakeup: Wakeup::Empty,
                release_time: 0,
                _pin: PhantomPinned,
            }),
            state: WaitState::Start,
            acquire_time: 0,
        }
    }

    /// Marks a dequeued waiter as woken, stamping its wakeup time if it asked
    /// for one, and hands back the waker.
    ///
    /// The `_list` parameter is the witness that the list lock is held.
    fn wake(this: NonNull<Self>, _list: &mut List<Waiter>) -> Option<Waker> {
        // Safety: the node is only mutated under the list lock, which the
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
}

// Safety: `Waiter` is pinned inside its future for as long as it is linked,
// and its node is the first field, mutated only under the list lock.
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

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of the waiter, only mutate its fields.
        let ptr = unsafe {
            NonNull::from(Pin::into_inner_unchecked(
                self.as_mut().project().waiter.as_mut(),
            ))
        };
        let this = self.project();
        let list = *this.list;
        let ticket = *this.ticket;
        let waiter = this.waiter.project();

        match *waiter.state {
            WaitState::Start => {
                let mut waiters = list.waiters.lock();

                if less(ticket, list.notify.load(Ordering::SeqCst)) {
                    // already notified before we got here
                    *waiter.state = WaitState::Completed;
                    return Poll::Ready(());
                }

                if blockprofile::enabled() && *waiter.acquire_time == 0 {
                    *waiter.acquire_time = blockprofile::cputicks();
                }

                // Safety: the node is only mutated under the list lock, which
                // we hold.
                unsafe {
                    let node = &mut *waiter.node.get();
                    node.release_time = if *waiter.acquire_time != 0 { -1 } else { 0 };
                    node.wakeup = Wakeup::Waiting(cx.waker().clone());
                }
                waiters.push_back(ptr);
                *waiter.state = WaitState::Waiting;

                // park-with-unlock: the guard drops as we return
                Poll::Pending
            }
            WaitState::Waiting => {
                let mut waiters = list.waiters.lock();

                // Safety: holding the list lock.
                let woken = unsafe {
                    let node = &mut *waiter.node.get();
                    match node.wakeup {
                        Wakeup::Woken => Some(node.release_time),
                        Wakeup::Waiting(ref mut curr) => {
                            if !curr.will_wake(cx.waker()) {
                                *curr = cx.waker().clone();
                            }
                            None
                        }
                        Wakeup::Empty => {
                            node.wakeup = Wakeup::Waiting(cx.waker().clone());
                            None
                        }
                    }
                };

                let release_time = if let Some(release_time) = woken {
                    release_time
                } else if less(ticket, list.notify.load(Ordering::SeqCst)) {
                    // a notify_all covered our ticket but has not dequeued us
                    // yet; serve ourselves
                    // Safety: an unwoken Waiting waiter is linked into this
                    // list.
                    unsafe {
                        waiters.remove(ptr);
                    }
                    // Safety: holding the list lock; the node is no longer
                    // linked.
                    unsafe {
                        let node = &mut *waiter.node.get();
                        if node.release_time != 0 {
                            node.release_time = blockprofile::cputicks();
                        }
                        node.wakeup = Wakeup::Woken;
                        node.release_time
                    }
                } else {
                    return Poll::Pending;
                };
                drop(waiters);

                *waiter.state = WaitState::Completed;
                if release_time > 0 {
                    blockprofile::blockevent(release_time - *waiter.acquire_time);
                }
                Poll::Ready(())
            }
            WaitState::Completed => Poll::Ready(()),
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Wait<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        // Safety: we never move out of the waiter.
        let ptr = unsafe {
            NonNull::from(Pin::into_inner_unchecked(
                self.as_mut().project().waiter.as_mut(),
            ))
        };
        let this = self.project();
        let waiter = this.waiter.project();

        if *waiter.state != WaitState::Waiting {
            return;
        }

        let mut waiters = this.list.waiters.lock();
        // Safety: holding the list lock.
        let linked = unsafe { !matches!((*waiter.node.get()).wakeup, Wakeup::Woken) };
        if linked {
            // Safety: a waiter in the Waiting state whose wakeup has not been
            // consumed is linked into this list.
            unsafe {
                waiters.remove(ptr);
            }
        }
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
    fn ticket_then_notify_is_never_lost() {
        loom::model(|| {
            let list = Arc::new(NotifyList::new());

            let t = list.add();
            let waiter = {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    block_on(list.wait(t));
                })
            };

            list.notify_one();
            waiter.join().unwrap();
        });
    }

    #[test]
    fn notify_all_covers_concurrent_waiters() {
        loom::model(|| {
            let list = Arc::new(NotifyList::new());

            let t1 = list.add();
            let t2 = list.add();
            let w1 = {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    block_on(list.wait(t1));
                })
            };
            let w2 = {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    block_on(list.wait(t2));
                })
            };

            list.notify_all();
            w1.join().unwrap();
            w2.join().unwrap();
        });
    }
}
