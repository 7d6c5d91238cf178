// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Input primitives: axes, buttons and the ordered collections the shift
//! engine is built from.
//!
//! The set of primitives is closed: every node of the input graph is an
//! [`Axis`] or a [`Button`]; hat buttons are ordinary buttons fed by a
//! transforming subscription on their axis (see [`Button::hat_pair`]).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::Arc;

use crate::abi::BTN_MISC;
use crate::sig::{Connection, Guard, Signal};

/// One analog axis of a physical joystick.
///
/// Holds the last seen value and notifies subscribers on change. An axis may
/// be *consumed* by `<axisbuttons>`, after which it no longer appears in the
/// virtual axis list; the object itself stays alive to feed its hat buttons.
pub struct Axis {
    code: u8,
    value: AtomicI16,
    change: Signal,
}

impl Axis {
    pub fn new(code: u8) -> Self {
        Axis {
            code,
            value: AtomicI16::new(0),
            change: Signal::new(),
        }
    }

    /// Kernel axis code reported through `JSIOCGAXMAP`.
    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn value(&self) -> i16 {
        self.value.load(Ordering::Relaxed)
    }

    /// Drives a new value. `init` events always fire the change signal;
    /// otherwise an unchanged value is swallowed.
    pub fn input(&self, time: u32, value: i16, init: bool) {
        if !init && self.value.load(Ordering::Relaxed) == value {
            return;
        }
        self.value.store(value, Ordering::Relaxed);
        self.change.emit(time, value, init);
    }

    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        self.change.connect(f)
    }

    pub fn connect_tracked<F>(&self, f: F, guards: Vec<Guard>) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        self.change.connect_tracked(f, guards)
    }

    pub fn disconnect(&self, conn: Connection) {
        self.change.disconnect(conn);
    }
}

impl fmt::Debug for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Axis")
            .field("code", &self.code)
            .field("value", &self.value())
            .finish()
    }
}

/// A logical on/off input.
///
/// The value is kept as `i16` so analog-shaped states pass through
/// unclipped. The order index gives the stable position of the button in the
/// virtual device's output list.
pub struct Button {
    code: u16,
    order: u32,
    value: AtomicI16,
    initialised: AtomicBool,
    change: Signal,
}

impl Button {
    pub fn new(code: u16, order: u32) -> Self {
        Button {
            code,
            order,
            value: AtomicI16::new(0),
            initialised: AtomicBool::new(false),
            change: Signal::new(),
        }
    }

    /// Kernel button code reported through `JSIOCGBTNMAP`.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Order index used for deterministic output numbering.
    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn value(&self) -> i16 {
        self.value.load(Ordering::Relaxed)
    }

    /// Drives a new value.
    ///
    /// The change signal fires on the very first input, on every value
    /// change, and always for `init` events; anything else is swallowed.
    pub fn input(&self, time: u32, value: i16, init: bool) {
        let first = !self.initialised.swap(true, Ordering::Relaxed);
        if !init && !first && self.value.load(Ordering::Relaxed) == value {
            return;
        }
        self.value.store(value, Ordering::Relaxed);
        self.change.emit(time, value, init);
    }

    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        self.change.connect(f)
    }

    pub fn connect_tracked<F>(&self, f: F, guards: Vec<Guard>) -> Connection
    where
        F: Fn(u32, i16, bool) + Send + Sync + 'static,
    {
        self.change.connect_tracked(f, guards)
    }

    pub fn disconnect(&self, conn: Connection) {
        self.change.disconnect(conn);
    }

    /// Synthesizes the `(negative, positive)` hat button pair for `axis`.
    ///
    /// Each hat button is pressed while the axis value is strictly on its
    /// side of zero; the value 0 releases both. There is deliberately no
    /// hysteresis. The buttons draw fresh order indices from `order` so they
    /// sort after existing buttons, negative first.
    pub fn hat_pair(axis: &Arc<Axis>, order: &mut u32) -> (Arc<Button>, Arc<Button>) {
        let neg = Self::hat(axis, false, order);
        let pos = Self::hat(axis, true, order);
        (neg, pos)
    }

    fn hat(axis: &Arc<Axis>, positive: bool, order: &mut u32) -> Arc<Button> {
        let button = Arc::new(Button::new(BTN_MISC, *order));
        *order += 1;
        let weak = Arc::downgrade(&button);
        axis.connect_tracked(
            move |time, value, init| {
                if let Some(b) = weak.upgrade() {
                    // i32 math so i16::MIN negates cleanly.
                    let v = i32::from(value);
                    let pressed = (if positive { v } else { -v } > 0) as i16;
                    b.input(time, pressed, init);
                }
            },
            vec![crate::sig::guard(&button)],
        );
        button
    }
}

impl fmt::Debug for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Button")
            .field("code", &self.code)
            .field("order", &self.order)
            .field("value", &self.value())
            .finish()
    }
}

/// Identity of a button for keying maps; stable while the button is alive.
pub(crate) fn button_id(b: &Arc<Button>) -> usize {
    Arc::as_ptr(b) as usize
}

#[derive(Clone)]
struct ByOrder(Arc<Button>);

impl PartialEq for ByOrder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ByOrder {}

impl PartialOrd for ByOrder {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByOrder {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.order(), button_id(&self.0)).cmp(&(other.0.order(), button_id(&other.0)))
    }
}

/// A set of buttons ordered by order index (ties broken by identity).
///
/// The iteration order is the output numbering clients of the virtual device
/// see, so it must be deterministic.
#[derive(Clone, Default)]
pub struct ButtonSet(BTreeSet<ByOrder>);

impl ButtonSet {
    pub fn new() -> Self {
        ButtonSet::default()
    }

    pub fn insert(&mut self, button: Arc<Button>) -> bool {
        self.0.insert(ByOrder(button))
    }

    pub fn remove(&mut self, button: &Arc<Button>) -> bool {
        self.0.remove(&ByOrder(button.clone()))
    }

    pub fn contains(&self, button: &Arc<Button>) -> bool {
        self.0.contains(&ByOrder(button.clone()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Button>> {
        self.0.iter().map(|b| &b.0)
    }

    pub fn extend(&mut self, other: &ButtonSet) {
        for b in other.iter() {
            self.insert(b.clone());
        }
    }

    /// Members of `self` that are not in `other`, in order.
    pub fn difference(&self, other: &ButtonSet) -> ButtonSet {
        let mut out = ButtonSet::new();
        for b in self.iter() {
            if !other.contains(b) {
                out.insert(b.clone());
            }
        }
        out
    }
}

impl fmt::Debug for ButtonSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// A partial, identity-keyed map from button to button.
///
/// A `None` value means the key has been erased (its mapping no longer
/// resolves to anything); this is how spent inputs disappear from name
/// lookups once their shift set is built.
#[derive(Clone, Default)]
pub struct ButtonMapping {
    entries: Vec<(Arc<Button>, Option<Arc<Button>>)>,
}

impl ButtonMapping {
    pub fn new() -> Self {
        ButtonMapping::default()
    }

    pub fn insert(&mut self, key: Arc<Button>, value: Option<Arc<Button>>) {
        for (k, v) in &mut self.entries {
            if Arc::ptr_eq(k, &key) {
                *v = value;
                return;
            }
        }
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &Arc<Button>) -> Option<&Option<Arc<Button>>> {
        self.entries
            .iter()
            .find(|(k, _)| Arc::ptr_eq(k, key))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<Button>, &Option<Arc<Button>>)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Arc<Button>, &mut Option<Arc<Button>>)> {
        self.entries.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ButtonMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
