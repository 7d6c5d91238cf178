// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shift sets: layered aliases over a set of physical buttons.
//!
//! A [`ShiftSet`] replaces its input buttons with one of several parallel
//! output groups. Which group is active is selected by *condition* buttons:
//! every condition slot is registered under a `(button, trigger value)` pair,
//! and slots sharing a pair rotate on each occurrence of the trigger.
//! Switching groups moves the pressed state of every input over to the newly
//! active group's buttons so clients never see a stuck button.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::input::{button_id, Button, ButtonMapping, ButtonSet};
use crate::sig::guard;

struct ConditionState {
    condition: (Arc<Button>, i16),
    sub_shifts: Vec<Arc<ShiftSet>>,
}

#[derive(Default)]
struct State {
    current_set: usize,
    /// Input button identity → one output button per condition slot.
    shift_map: HashMap<usize, Vec<Arc<Button>>>,
    /// `(condition identity, trigger value)` → ring of condition slots.
    rotation_map: HashMap<(usize, i16), VecDeque<usize>>,
    condition_states: Vec<ConditionState>,
}

pub struct ShiftSet {
    inputs: ButtonSet,
    weak_self: Weak<ShiftSet>,
    state: Mutex<State>,
}

impl ShiftSet {
    /// Creates a shift set over `inputs` and subscribes to each of them.
    ///
    /// The subscriptions are guarded by both the shift set and the input
    /// button, so neither keeps the other alive.
    pub fn create(inputs: ButtonSet) -> Arc<ShiftSet> {
        let set = Arc::new_cyclic(|weak_self| ShiftSet {
            inputs,
            weak_self: weak_self.clone(),
            state: Mutex::new(State::default()),
        });
        for button in set.inputs.iter() {
            let weak = set.weak_self.clone();
            let from = button_id(button);
            button.connect_tracked(
                move |time, value, init| {
                    if let Some(s) = weak.upgrade() {
                        s.input(time, value, init, from);
                    }
                },
                vec![guard(&set), guard(button)],
            );
        }
        set
    }

    pub fn inputs(&self) -> &ButtonSet {
        &self.inputs
    }

    /// Appends one condition slot triggered by `button` reaching `state`.
    ///
    /// For every input a slot output is either taken from `shared` (the
    /// `<reuse>` aliases of this condition) or freshly allocated with the
    /// input's kernel code. Outputs of the first slot inherit their input's
    /// order index so the base layer keeps the physical numbering; later
    /// slots draw new indices from `button_order` and sort after it.
    ///
    /// Returns the input → output mapping of the new slot, which the parser
    /// pushes as a rename layer for nested elements.
    pub fn add_condition(
        &self,
        button: &Arc<Button>,
        state: i16,
        shared: &ButtonMapping,
        button_order: &mut u32,
    ) -> ButtonMapping {
        // Condition buttons are removed from the input set by the parser
        // before the shift set exists.
        assert!(
            !self.inputs.contains(button),
            "condition button is part of the shift input set"
        );

        let mut st = self.state.lock().unwrap();
        let first_set = st.shift_map.is_empty();
        let mut outputs = ButtonMapping::new();

        for input in self.inputs.iter() {
            let order = if first_set {
                input.order()
            } else {
                let o = *button_order;
                *button_order += 1;
                o
            };
            let output = match shared.get(input) {
                Some(Some(alias)) => alias.clone(),
                _ => Arc::new(Button::new(input.code(), order)),
            };

            let condition_states_len = st.condition_states.len();
            let slots = st.shift_map.entry(button_id(input)).or_default();
            assert_eq!(slots.len(), condition_states_len);
            slots.push(output.clone());

            outputs.insert(input.clone(), Some(output));
        }

        let slot = st.condition_states.len();
        let key = (button_id(button), state);
        if st.rotation_map.get(&key).map_or(true, VecDeque::is_empty) {
            let weak = self.weak_self.clone();
            let self_guard: crate::sig::Guard = self.weak_self.clone();
            button.connect_tracked(
                move |time, value, _init| {
                    if let Some(s) = weak.upgrade() {
                        s.shift_input(time, value, key);
                    }
                },
                vec![self_guard, guard(button)],
            );
        }
        st.rotation_map.entry(key).or_default().push_back(slot);
        st.condition_states.push(ConditionState {
            condition: (button.clone(), state),
            sub_shifts: Vec::new(),
        });

        outputs
    }

    /// Attaches nested shift sets to the most recently added condition slot.
    pub fn set_sub_shifts(&self, shifts: Vec<Arc<ShiftSet>>) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(!st.condition_states.is_empty());
        if let Some(last) = st.condition_states.last_mut() {
            last.sub_shifts = shifts;
        }
    }

    /// Routes an event from input button `from` to the active slot's output.
    ///
    /// During an initialization sweep the inactive slots are driven to 0 with
    /// the init flag set, so clients see the initial state of every logical
    /// button no matter which layer is active.
    fn input(&self, time: u32, value: i16, init: bool, from: usize) {
        let (target, sweep) = {
            let st = self.state.lock().unwrap();
            let outputs = match st.shift_map.get(&from) {
                Some(outputs) => outputs,
                None => return,
            };
            if st.current_set >= outputs.len() {
                return;
            }
            let sweep = if init {
                outputs
                    .iter()
                    .enumerate()
                    .filter(|&(slot, _)| slot != st.current_set)
                    .map(|(_, b)| b.clone())
                    .collect()
            } else {
                Vec::new()
            };
            (outputs[st.current_set].clone(), sweep)
        };

        // Deliver with the state lock released: outputs may feed nested
        // shift sets or, through <reuse>, other members of this one.
        target.input(time, value, init);
        for button in sweep {
            button.input(time, 0, true);
        }
    }

    /// Handles an occurrence of the trigger `key`: rotates the slot ring and
    /// moves button state from the previously active slot to the new one.
    fn shift_input(&self, time: u32, value: i16, key: (usize, i16)) {
        if value != key.1 {
            return;
        }

        let copies = {
            let mut st = self.state.lock().unwrap();
            let ring = match st.rotation_map.get_mut(&key) {
                Some(ring) => ring,
                None => return,
            };
            if let Some(head) = ring.pop_front() {
                ring.push_back(head);
            }
            let new_set = match ring.front() {
                Some(&slot) => slot,
                None => return,
            };
            if new_set == st.current_set {
                return;
            }

            let mut copies = Vec::new();
            for input in self.inputs.iter() {
                let slots = match st.shift_map.get(&button_id(input)) {
                    Some(slots) => slots,
                    None => continue,
                };
                let old = &slots[st.current_set];
                let new = &slots[new_set];
                // Aliased outputs keep their state; no copy, no zero.
                if !Arc::ptr_eq(old, new) {
                    copies.push((old.clone(), new.clone(), old.value()));
                }
            }
            st.current_set = new_set;
            copies
        };

        for (old, new, value) in copies {
            old.input(time, 0, false);
            new.input(time, value, false);
        }
    }

    /// Contributes this shift set's view to a running output set: inputs and
    /// condition buttons are removed, slot outputs added, nested shift sets
    /// applied on top. A shift set without any condition slot is an identity
    /// layer and passes its inputs through.
    pub fn all_outputs(&self, outputs: &mut ButtonSet) {
        let st = self.state.lock().unwrap();

        for input in self.inputs.iter() {
            outputs.remove(input);
        }

        for slots in st.shift_map.values() {
            for button in slots {
                outputs.insert(button.clone());
            }
        }

        for cs in &st.condition_states {
            outputs.remove(&cs.condition.0);
            for sub in &cs.sub_shifts {
                sub.all_outputs(outputs);
            }
        }

        if st.condition_states.is_empty() {
            for input in self.inputs.iter() {
                outputs.insert(input.clone());
            }
        }
    }

    /// Number of condition slots.
    pub fn slot_count(&self) -> usize {
        self.state.lock().unwrap().condition_states.len()
    }

    /// Index of the active condition slot.
    pub fn current_slot(&self) -> usize {
        self.state.lock().unwrap().current_set
    }
}

impl fmt::Debug for ShiftSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("ShiftSet")
            .field("inputs", &self.inputs)
            .field("slots", &st.condition_states.len())
            .field("current", &st.current_set)
            .finish()
    }
}
