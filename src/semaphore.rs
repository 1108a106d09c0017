// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The counted semaphore and its address-keyed sleep table.
//!
//! This is the substrate that mutexes, read-write mutexes, and wait groups
//! are built on. The caller owns a 32-bit counter and manipulates it directly
//! on its own fast paths; [`SemaTable::acquire`] and [`SemaTable::release`]
//! provide the sleep and wakeup halves for the contended case. Conceptually
//! this is a futex with simpler, strictly paired semantics: every sleep is
//! matched with exactly one wakeup, even when the wakeup races ahead of the
//! sleep.
//!
//! Waiters sleeping on a counter are parked in a fixed-size table of buckets,
//! keyed by the hash of the counter's address. Each bucket is cache-line
//! padded; under contention, false sharing across buckets would otherwise
//! dominate the cost of the table.

use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::mem;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};

use pin_project::{pin_project, pinned_drop};
use static_assertions::{assert_impl_all, const_assert};

use crate::blockprofile;
use crate::list::{Linked, Links, List};
use crate::loom::sync::atomic::{AtomicU32, Ordering};
use crate::mutex::Mutex;
use crate::util::{CachePadded, loom_const_fn};

/// Prime, so that bucket choice decorrelates from the address strides
/// allocators tend to hand out.
#[cfg(not(loom))]
const TABLE_SIZE: usize = 251;
/// Shrunk under loom so that model state stays tractable.
#[cfg(loom)]
const TABLE_SIZE: usize = 7;

const_assert!(is_prime(TABLE_SIZE));

const fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// The address-keyed sleep table backing the counted semaphore.
///
/// A `SemaTable` is process-wide state: the runtime allocates one at
/// initialization and never destroys it. The module-level `acquire` and
/// `release` functions operate on the shared instance. Waiters whose counters
/// hash to different buckets never contend on a lock or appear in each
/// other's scans.
pub struct SemaTable {
    buckets: [CachePadded<Bucket>; TABLE_SIZE],
}

assert_impl_all!(SemaTable: Send, Sync);

struct Bucket {
    /// The number of waiters parked in this bucket.
    ///
    /// Readable without the bucket lock; this is the "someone is waiting"
    /// indicator that [`SemaTable::release`] consults before it is willing to
    /// take the lock at all. Incremented by an acquirer *before* its final
    /// re-check of the counter, decremented when the waiter backs out or is
    /// dequeued.
    nwait: AtomicU32,
    waiters: Mutex<List<Waiter>>,
}

impl Bucket {
    loom_const_fn! {
        const fn new() -> Bucket {
            Bucket {
                nwait: AtomicU32::new(0),
                waiters: Mutex::new(List::new()),
            }
        }
    }
}

/// Future returned by [`SemaTable::acquire`].
///
/// # Cancellation
///
/// Dropping an `Acquire` future removes its waiter from the sleep table. A
/// wakeup that was already routed to the waiter is forfeited; the counter
/// increment that caused it remains visible to other acquirers, so no permit
/// is lost.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'a> {
    table: &'a SemaTable,
    addr: &'a AtomicU32,
    profile: bool,
    #[pin]
    waiter: Waiter,
}

/// A waiter record, linked into a bucket of the sleep table while its task is
/// parked.
#[repr(C)]
#[pin_project]
struct Waiter {
    /// The node shared with the dequeuing side.
    ///
    /// This must be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    #[pin]
    node: UnsafeCell<Node>,
    /// The future's own view of where it is in its lifecycle. Only ever
    /// touched by the owning task.
    state: WaitState,
    /// Tick stamp taken when the waiter first went to sleep, `0` when
    /// profiling is off.
    acquire_time: i64,
}

struct Node {
    /// Intrusive linked list pointers.
    links: Links<Waiter>,
    /// The address of the counter this waiter sleeps on. A bucket holds
    /// waiters for every counter hashing into it; the release scan matches on
    /// this.
    addr: usize,
    /// The parked task, or what became of it.
    wakeup: Wakeup,
    /// `0` when profiling is off, `-1` while parked with profiling on, the
    /// wakeup tick stamp once dequeued.
    release_time: i64,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WaitState {
    /// Not linked into any bucket. Dropping in this state is a no-op.
    Start,
    /// Linked into the bucket for `addr`, waker registered. Dropping in this
    /// state must unlink, unless a releaser already did.
    Waiting,
    /// The counter slot was obtained. Terminal.
    Completed,
}

#[derive(Debug)]
enum Wakeup {
    Empty,
    Waiting(Waker),
    Woken,
}

// === impl SemaTable ===

impl SemaTable {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [const { CachePadded(Bucket::new()) }; TABLE_SIZE],
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| CachePadded(Bucket::new())),
        }
    }

    /// Takes one count from the 32-bit counter at `addr`, sleeping until a
    /// [`release`](Self::release) hands a count over if none is available.
    ///
    /// The counter is caller-owned; the borrow taken here is what keeps its
    /// address stable while a waiter sleeps on it. While the counter is
    /// positive the acquire completes lock-free. A waiter readied by a
    /// release is not guaranteed the count: a fresh acquirer may take it on
    /// the fast path first, in which case the readied waiter queues again.
    /// The uncontended case buys its throughput with exactly this unfairness;
    /// callers that need strict handoff build it a level up.
    ///
    /// If `profile` is true and block profiling is enabled, the time spent
    /// asleep is reported to the registered
    /// [`BlockEventSource`](crate::blockprofile::BlockEventSource).
    pub fn acquire<'a>(&'a self, addr: &'a AtomicU32, profile: bool) -> Acquire<'a> {
        Acquire {
            table: self,
            addr,
            profile,
            waiter: Waiter::new(addr_key(addr)),
        }
    }

    /// Adds one count to the counter at `addr` and, if a waiter is asleep on
    /// that address, readies one.
    ///
    /// Never suspends, and takes the bucket lock only when the bucket's
    /// waiter count says a sleeper may exist.
    pub fn release(&self, addr: &AtomicU32) {
        addr.fetch_add(1, Ordering::SeqCst);

        let key = addr_key(addr);
        let bucket = self.bucket_for(key);

        // The counter increment above is ordered before this load, and an
        // acquirer orders its nwait increment before its final counter
        // re-check. Whichever side runs second observes the other, so a
        // sleeper is never stranded.
        if bucket.nwait.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut waiters = bucket.waiters.lock();
        if bucket.nwait.load(Ordering::SeqCst) == 0 {
            return;
        }

        // A bucket holds waiters for every address hashing into it; wake the
        // first one that is actually sleeping on this counter.
        let dequeued = waiters.remove_first(|waiter| {
            // Safety: holding the bucket lock.
            unsafe { (*waiter.node.get()).addr == key }
        });
        let waker = dequeued.and_then(|node| {
            bucket.nwait.fetch_sub(1, Ordering::SeqCst);
            Waiter::wake(node, &mut waiters)
        });
        drop(waiters);

        if let Some(waker) = waker {
            tracing::trace!(addr = key, "readied semaphore waiter");
            waker.wake();
        }
    }

    fn bucket_for(&self, key: usize) -> &Bucket {
        &self.buckets[(key >> 3) % TABLE_SIZE]
    }
}

impl Default for SemaTable {
    fn default() -> Self {
        Self::new()
    }
}

fn addr_key(addr: &AtomicU32) -> usize {
    ptr::from_ref(addr) as usize
}

/// Lock-free attempt to take one count: CAS the counter down while it is
/// positive.
fn try_take(addr: &AtomicU32) -> bool {
    let mut v = addr.load(Ordering::SeqCst);
    while v > 0 {
        match addr.compare_exchange(v, v - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => v = actual,
        }
    }
    false
}

// === process-wide table ===

#[cfg(not(loom))]
static SEMTABLE: SemaTable = SemaTable::new();

/// [`SemaTable::acquire`] on the process-wide table.
#[cfg(not(loom))]
pub fn acquire(addr: &AtomicU32, profile: bool) -> Acquire<'_> {
    SEMTABLE.acquire(addr, profile)
}

/// [`SemaTable::release`] on the process-wide table.
#[cfg(not(loom))]
pub fn release(addr: &AtomicU32) {
    SEMTABLE.release(addr);
}

// === impl Waiter ===

impl Waiter {
    fn new(addr: usize) -> Self {
        Self {
            node: UnsafeCell::new(Node {
                links: Links::new(),
                addr,
                wakeup: Wakeup::Empty,
                release_time: 0,
                _pin: PhantomPinned,
            }),
            state: WaitState::Start,
            acquire_time: 0,
        }
    }

    /// Marks a dequeued waiter as woken, stamping its wakeup time if it asked
    /// for one, and hands back the waker to invoke once the lock is dropped.
    ///
    /// The `_list` parameter is the witness that the bucket lock is held.
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

    fn poll_acquire(
        mut self: Pin<&mut Self>,
        table: &SemaTable,
        addr: &AtomicU32,
        profile: bool,
        waker: &Waker,
    ) -> Poll<()> {
        // Safety: we never move out of `ptr` below, only mutate its fields.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };

        loop {
            let this = self.as_mut().project();
            match *this.state {
                WaitState::Start => {
                    if try_take(addr) {
                        *this.state = WaitState::Completed;
                        return Poll::Ready(());
                    }

                    let bucket = table.bucket_for(addr_key(addr));
                    let mut waiters = bucket.waiters.lock();

                    // The increment must land before the re-check below.
                    // release() bumps the counter first and then looks at
                    // nwait, so one of the two orderings always observes the
                    // other.
                    bucket.nwait.fetch_add(1, Ordering::SeqCst);

                    if try_take(addr) {
                        bucket.nwait.fetch_sub(1, Ordering::SeqCst);
                        *this.state = WaitState::Completed;
                        return Poll::Ready(());
                    }

                    if profile && blockprofile::enabled() && *this.acquire_time == 0 {
                        *this.acquire_time = blockprofile::cputicks();
                    }

                    // Safety: the node is only mutated under the bucket lock,
                    // which we hold.
                    unsafe {
                        let node = &mut *this.node.get();
                        node.release_time = if *this.acquire_time != 0 { -1 } else { 0 };
                        node.wakeup = Wakeup::Waiting(waker.clone());
                    }
                    waiters.push_back(ptr);
                    *this.state = WaitState::Waiting;

                    // Dropping the guard and returning Pending is the
                    // park-with-unlock point; the registered waker absorbs
                    // any wakeup that lands from here on.
                    return Poll::Pending;
                }
                WaitState::Waiting => {
                    let bucket = table.bucket_for(addr_key(addr));
                    let waiters = bucket.waiters.lock();

                    // Safety: holding the bucket lock.
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

                    // A releaser handed us a wakeup, but the count it
                    // published may already have been taken by a fast-path
                    // acquirer. Take it or queue again.
                    if try_take(addr) {
                        *this.state = WaitState::Completed;
                        if release_time > 0 {
                            blockprofile::blockevent(release_time - *this.acquire_time);
                        }
                        return Poll::Ready(());
                    }

                    *this.state = WaitState::Start;
                }
                WaitState::Completed => return Poll::Ready(()),
            }
        }
    }

    /// Unlinks this waiter on future drop, if a releaser has not already
    /// dequeued it.
    fn release(mut self: Pin<&mut Self>, table: &SemaTable, addr: &AtomicU32) {
        // Safety: we never move out of `ptr` below.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };
        let this = self.as_mut().project();

        if *this.state != WaitState::Waiting {
            return;
        }

        let bucket = table.bucket_for(addr_key(addr));
        let mut waiters = bucket.waiters.lock();

        // Safety: holding the bucket lock.
        let linked = unsafe { !matches!((*this.node.get()).wakeup, Wakeup::Woken) };
        if linked {
            // Safety: a waiter in the Waiting state whose wakeup has not been
            // consumed is linked into exactly this bucket's list.
            unsafe {
                waiters.remove(ptr);
            }
            bucket.nwait.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Safety: `Waiter` is pinned inside its future for as long as it is linked,
// and its node is the first field, mutated only under the bucket lock.
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

// === impl Acquire ===

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.waiter
            .poll_acquire(this.table, this.addr, *this.profile, cx.waker())
    }
}

#[pinned_drop]
impl PinnedDrop for Acquire<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.waiter.release(this.table, this.addr);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn fast_path() {
        let table = SemaTable::new();
        let addr = AtomicU32::new(1);

        let mut fut = task::spawn(table.acquire(&addr, false));
        assert_ready!(fut.poll());
        assert_eq!(addr.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn paired_acquire_release() {
        let table = SemaTable::new();
        let addr = AtomicU32::new(1);

        let mut t1 = task::spawn(table.acquire(&addr, false));
        assert_ready!(t1.poll());

        let mut t2 = task::spawn(table.acquire(&addr, false));
        assert_pending!(t2.poll());

        table.release(&addr);
        assert!(t2.is_woken());
        assert_ready!(t2.poll());
        assert_eq!(addr.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_before_poll_is_not_lost() {
        let table = SemaTable::new();
        let addr = AtomicU32::new(0);

        let mut t1 = task::spawn(table.acquire(&addr, false));
        assert_pending!(t1.poll());

        table.release(&addr);
        assert!(t1.is_woken());
        assert_ready!(t1.poll());
        assert_eq!(addr.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stolen_count_requeues_the_woken_waiter() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .set_default();

        let table = SemaTable::new();
        let addr = AtomicU32::new(0);

        let mut t1 = task::spawn(table.acquire(&addr, false));
        assert_pending!(t1.poll());

        table.release(&addr);
        assert!(t1.is_woken());

        // t3 jumps the queue on the fast path before t1 gets to run.
        let mut t3 = task::spawn(table.acquire(&addr, false));
        assert_ready!(t3.poll());

        // t1 finds the count gone and queues again.
        assert_pending!(t1.poll());

        table.release(&addr);
        assert!(t1.is_woken());
        assert_ready!(t1.poll());
        assert_eq!(addr.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_wakes_only_matching_address() {
        let table = SemaTable::new();
        let x = AtomicU32::new(0);
        let y = AtomicU32::new(0);

        let mut on_x = task::spawn(table.acquire(&x, false));
        assert_pending!(on_x.poll());

        // y has no sleeper; its count must not leak to the waiter on x.
        table.release(&y);
        assert!(!on_x.is_woken());
        assert_pending!(on_x.poll());
        assert_eq!(y.load(Ordering::SeqCst), 1);

        table.release(&x);
        assert!(on_x.is_woken());
        assert_ready!(on_x.poll());
    }

    #[test]
    fn dropped_waiter_is_unlinked() {
        let table = SemaTable::new();
        let addr = AtomicU32::new(0);

        let mut t1 = task::spawn(table.acquire(&addr, false));
        assert_pending!(t1.poll());
        drop(t1);

        let mut t2 = task::spawn(table.acquire(&addr, false));
        assert_pending!(t2.poll());

        // the release must skip the dead record and wake t2
        table.release(&addr);
        assert!(t2.is_woken());
        assert_ready!(t2.poll());
    }

    #[test]
    fn process_wide_table() {
        let addr = AtomicU32::new(0);

        let mut t1 = task::spawn(acquire(&addr, false));
        assert_pending!(t1.poll());

        release(&addr);
        assert!(t1.is_woken());
        assert_ready!(t1.poll());
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
    fn no_missed_wakeup() {
        loom::model(|| {
            let table = Arc::new(SemaTable::new());
            let addr = Arc::new(AtomicU32::new(0));

            let acquirer = {
                let table = Arc::clone(&table);
                let addr = Arc::clone(&addr);
                thread::spawn(move || {
                    block_on(table.acquire(&addr, false));
                })
            };

            table.release(&addr);
            acquirer.join().unwrap();

            assert_eq!(addr.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn one_slot_mutual_exclusion() {
        loom::model(|| {
            let table = Arc::new(SemaTable::new());
            let addr = Arc::new(AtomicU32::new(1));
            let in_critical = Arc::new(AtomicU32::new(0));

            let worker = {
                let table = Arc::clone(&table);
                let addr = Arc::clone(&addr);
                let in_critical = Arc::clone(&in_critical);
                thread::spawn(move || {
                    block_on(table.acquire(&addr, false));
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                    table.release(&addr);
                })
            };

            block_on(table.acquire(&addr, false));
            assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
            in_critical.fetch_sub(1, Ordering::SeqCst);
            table.release(&addr);

            worker.join().unwrap();
        });
    }
}
