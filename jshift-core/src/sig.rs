// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Change-notification plumbing between input primitives and their
//! subscribers.
//!
//! A [`Signal`] carries `(time, value, init)` triples to connected slots.
//! Slots may be *tracked*: a slot carrying weak guards is invoked only while
//! every guarded object is still alive and is silently removed once any of
//! them is gone. This is what lets shift sets attach to upstream buttons
//! without creating ownership cycles; the subscription keeps neither side
//! alive.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Slot signature shared by every primitive's change signal.
pub type SlotFn = dyn Fn(u32, i16, bool) + Send + Sync;

/// Weak guard attached to a slot; see [`guard`].
pub type Guard = Weak<dyn Any + Send + Sync>;

/// Creates a guard from a shared object.
pub fn guard<T: Any + Send + Sync>(obj: &Arc<T>) -> Guard {
    let obj: Arc<dyn Any + Send + Sync> = obj.clone();
    Arc::downgrade(&obj)
}

/// Token identifying a subscription on one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection(u64);

struct Slot {
    id: u64,
    func: Arc<SlotFn>,
    guards: Vec<Guard>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    next_id: u64,
}

#[derive(Default)]
pub struct Signal {
    inner: Mutex<Inner>,
}

impl Signal {
    pub fn new() -> Self {
        Signal::default()
    }

    /// Subscribes an untracked slot. The slot lives until the signal does or
    /// until it is explicitly disconnected.
    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        self.connect_tracked(f, Vec::new())
    }

    /// Subscribes a slot guarded by `guards`. Once any guarded object is
    /// dropped the slot is skipped and removed.
    pub fn connect_tracked<F>(&self, f: F, guards: Vec<Guard>) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push(Slot {
            id,
            func: Arc::new(f),
            guards,
        });
        Connection(id)
    }

    pub fn disconnect(&self, conn: Connection) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.retain(|s| s.id != conn.0);
    }

    /// Invokes every live slot with `(time, value, init)`.
    ///
    /// The slot list is snapshotted up front and the lock is not held across
    /// invocations, so a slot may connect to or drive this same signal
    /// without deadlocking. Guarded objects are upgraded for the duration of
    /// the call; slots whose guards fail to upgrade are culled here.
    pub fn emit(&self, time: u32, value: i16, init: bool) {
        type Held = Vec<Arc<dyn Any + Send + Sync>>;
        let live: Vec<(Arc<SlotFn>, Held)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut live = Vec::with_capacity(inner.slots.len());
            inner.slots.retain(|slot| {
                let mut held = Vec::with_capacity(slot.guards.len());
                for g in &slot.guards {
                    match g.upgrade() {
                        Some(obj) => held.push(obj),
                        None => return false,
                    }
                }
                live.push((slot.func.clone(), held));
                true
            });
            live
        };

        for (func, _held) in live {
            func(time, value, init);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.inner.lock().unwrap().slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_connected_slots() {
        let sig = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sig.connect(move |_, v, _| {
            h.fetch_add(v as usize, Ordering::SeqCst);
        });
        sig.emit(0, 2, false);
        sig.emit(1, 3, false);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn disconnect_detaches() {
        let sig = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let conn = sig.connect(move |_, _, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sig.emit(0, 1, false);
        sig.disconnect(conn);
        sig.emit(0, 1, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dead_guard_culls_slot() {
        let sig = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let tracked = Arc::new(17u32);
        let h = hits.clone();
        sig.connect_tracked(
            move |_, _, _| {
                h.fetch_add(1, Ordering::SeqCst);
            },
            vec![guard(&tracked)],
        );
        sig.emit(0, 1, false);
        assert_eq!(sig.len(), 1);
        drop(tracked);
        sig.emit(0, 1, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sig.len(), 0);
    }

    #[test]
    fn reentrant_connect_does_not_deadlock() {
        let sig = Arc::new(Signal::new());
        let inner = sig.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sig.connect(move |_, _, _| {
            let h = h.clone();
            inner.connect(move |_, _, _| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        });
        sig.emit(0, 1, false);
        // The slot added during emit is only seen by the next one.
        sig.emit(0, 2, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
