// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Block-time profiling hooks.
//!
//! The runtime registers its tick source and event sink once at startup via
//! [`set_source`] and turns sampling on and off with [`set_rate`]. While the
//! rate is zero or no source is registered, the wait paths skip all stamping
//! and reporting.
//!
//! A parked waiter carries a `release_time` field: `0` while profiling is off,
//! `-1` while parked ("stamp me on wakeup"), and the wakeup tick value once
//! the waker has dequeued it. The woken task reports the difference between
//! its own enqueue stamp and the wakeup stamp to [`BlockEventSource::blockevent`].

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// The hooks a runtime provides to observe block times.
///
/// Function pointers rather than a trait object, so that registration is a
/// single thin pointer store.
#[derive(Debug)]
pub struct BlockEventSource {
    /// Monotonic tick source, comparable across CPUs.
    pub cputicks: fn() -> i64,
    /// Receives the number of ticks a task spent blocked on one of the
    /// primitives in this crate.
    pub blockevent: fn(cycles: i64),
}

// Profiling configuration is intentionally plain `core` atomics: it is not
// part of any wakeup protocol and reads of it are allowed to race with
// reconfiguration.
static RATE: AtomicU32 = AtomicU32::new(0);
static SOURCE: AtomicPtr<BlockEventSource> = AtomicPtr::new(ptr::null_mut());

/// Registers the runtime's tick source and event sink.
pub fn set_source(source: &'static BlockEventSource) {
    SOURCE.store(
        ptr::from_ref(source).cast_mut(),
        Ordering::Release,
    );
}

/// Sets the process-wide block-profile rate. Zero disables profiling.
pub fn set_rate(rate: u32) {
    RATE.store(rate, Ordering::Relaxed);
}

/// Returns the current block-profile rate.
pub fn rate() -> u32 {
    RATE.load(Ordering::Relaxed)
}

fn source() -> Option<&'static BlockEventSource> {
    // Safety: the pointer is only ever written by `set_source`, which takes a
    // `'static` reference.
    unsafe { SOURCE.load(Ordering::Acquire).cast_const().as_ref() }
}

/// Returns `true` if wait paths should stamp their enqueue time.
pub(crate) fn enabled() -> bool {
    rate() > 0 && !SOURCE.load(Ordering::Acquire).is_null()
}

/// Reads the registered tick source, or `0` if none is registered.
pub(crate) fn cputicks() -> i64 {
    match source() {
        Some(s) => (s.cputicks)(),
        None => 0,
    }
}

/// Reports a blocked interval to the registered sink.
pub(crate) fn blockevent(cycles: i64) {
    if let Some(s) = source() {
        (s.blockevent)(cycles);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicU32;
    use crate::semaphore::SemaTable;
    use std::sync::atomic::{AtomicI64, Ordering::SeqCst};
    use tokio_test::{assert_pending, assert_ready, task};

    static TICKS: AtomicI64 = AtomicI64::new(0);
    static LAST_EVENT: AtomicI64 = AtomicI64::new(-1);

    fn fake_cputicks() -> i64 {
        TICKS.fetch_add(10, SeqCst) + 10
    }

    fn record_blockevent(cycles: i64) {
        LAST_EVENT.store(cycles, SeqCst);
    }

    static SOURCE: BlockEventSource = BlockEventSource {
        cputicks: fake_cputicks,
        blockevent: record_blockevent,
    };

    #[test]
    fn reports_block_time_for_parked_acquire() {
        set_source(&SOURCE);
        set_rate(1);

        let table = SemaTable::new();
        let addr = AtomicU32::new(0);
        let mut fut = task::spawn(table.acquire(&addr, true));
        assert_pending!(fut.poll());

        table.release(&addr);
        assert!(fut.is_woken());
        assert_ready!(fut.poll());

        // every tick read advances the fake clock, so the delta is positive
        assert!(LAST_EVENT.load(SeqCst) > 0);

        set_rate(0);
    }
}
