// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The declarative XML map: name registry, lookup layers and the parser that
//! turns a map document into the input graph.
//!
//! Grammar, informally:
//!
//! ```text
//! <bset name="?" use="csv?" begin="?" end="?">   nested <bset>/<axisbuttons>
//! <axisbuttons axis="N" neg_name="?" pos_name="?"/>
//! <shift name="?">  <bset>… <condition>…  </shift>
//! <condition button="name" state="csv" name="?">  <reuse>… <shift>… <bset>…
//! <reuse replace="names" with="names"/>
//! <calibrate>  <broken_line axis=… centre_min=… centre_max=… slope_neg=…
//!              slope_pos=… precision=?/>  <none axis=… precision=?/>
//! </calibrate>
//! ```
//!
//! Physical buttons are pre-registered under their numbers ("0"…"k") and in
//! the anonymous top-level bucket `""`. Nested `<condition>` scopes push
//! rename layers; every lookup is rewritten through the live layer stack.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;
use std::sync::Arc;

use log::debug;
use vec_map::VecMap;
use xmltree::{Element, XMLNode};

use crate::abi::{JsCorr, JS_CORR_BROKEN, JS_CORR_NONE};
use crate::input::{Axis, Button, ButtonMapping, ButtonSet};
use crate::shift::ShiftSet;

/// Axis corrections parsed from a `<calibrate>` element, keyed by real axis
/// index.
pub type Calibration = VecMap<JsCorr>;

/// Attribute names of the four broken-line coefficients, in wire order.
pub(crate) const BROKEN_LINE_COEFS: [&str; 4] =
    ["centre_min", "centre_max", "slope_neg", "slope_pos"];

/// The error type for map parsing. Every variant is fatal to the open that
/// triggered the parse.
#[derive(Debug)]
pub enum Error {
    /// The map file could not be read.
    Io(std::io::Error),
    /// The map file is not well-formed XML.
    Xml(xmltree::ParseError),
    /// `<axisbuttons>` named an axis that does not exist or was already
    /// consumed.
    UnknownAxis(String),
    /// A `use`/`replace`/`with` name did not resolve to any live button.
    UnknownName(String),
    /// The `button` attribute of a `<condition>` did not resolve.
    ConditionNotFound(String),
    /// The `button` attribute of a `<condition>` resolved to more than one
    /// button.
    ConditionNotSingular(String),
    /// A `<condition>` with several trigger states carried a `name`.
    NamedMultiState,
    /// The `state` list of a `<condition>` was empty.
    BadStateList(String),
    /// `replace` and `with` of a `<reuse>` differ in size.
    ReuseSizeMismatch(String, String),
    /// A `<reuse>` replaced a button that is not part of the shift's inputs.
    ReuseOutsideShift,
    /// A `<reuse>` mapped a button onto itself.
    ReuseCircular,
    /// A `<broken_line>` lacked one of its four coefficients.
    MissingCoefficient(&'static str),
    /// An attribute that must be numeric was not.
    BadNumber(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "error reading map file: {}", e),
            Error::Xml(e) => write!(f, "error parsing map file: {}", e),
            Error::UnknownAxis(s) => write!(f, "no such axis '{}'", s),
            Error::UnknownName(s) => write!(f, "can't find use name '{}'", s),
            Error::ConditionNotFound(s) => write!(f, "button '{}' not found", s),
            Error::ConditionNotSingular(s) => write!(
                f,
                "'button' attribute of condition element must refer to a single button (got '{}')",
                s
            ),
            Error::NamedMultiState => {
                f.write_str("condition name not valid for multiple conditions")
            }
            Error::BadStateList(s) => write!(f, "bad button state '{}'", s),
            Error::ReuseSizeMismatch(a, b) => {
                write!(f, "'{}' and '{}' are of different size", a, b)
            }
            Error::ReuseOutsideShift => {
                f.write_str("condition bset contains button from outside shift")
            }
            Error::ReuseCircular => f.write_str("condition bset is circular"),
            Error::MissingCoefficient(name) => {
                write!(f, "broken_line calibration element must contain '{}'", name)
            }
            Error::BadNumber(s) => write!(f, "malformed number '{}'", s),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Xml(e) => Some(e),
            _ => None,
        }
    }
}

/// Construction-time state threaded through the parser.
///
/// `buttons` is the name registry; the empty name is the top-level bucket
/// holding every currently-live button. `layers` is the stack of rename
/// mappings pushed by nested `<condition>` scopes; layer entries are
/// shared-mutable because erasing a spent shift rewrites mappings in
/// enclosing scopes.
pub struct InputContext {
    pub axes: Vec<Option<Arc<Axis>>>,
    pub buttons: BTreeMap<String, ButtonSet>,
    pub button_order: u32,
    pub conditionals: ButtonSet,
    layers: Vec<Rc<RefCell<ButtonMapping>>>,
}

impl InputContext {
    pub fn new() -> Self {
        InputContext {
            axes: Vec::new(),
            buttons: BTreeMap::new(),
            button_order: 0,
            conditionals: ButtonSet::new(),
            layers: Vec::new(),
        }
    }

    fn top_level(&mut self) -> &mut ButtonSet {
        self.buttons.entry(String::new()).or_default()
    }
}

impl Default for InputContext {
    fn default() -> Self {
        InputContext::new()
    }
}

fn tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split([',', ';', ' ']).filter(|t| !t.is_empty())
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, Error> {
    s.parse().map_err(|_| Error::BadNumber(s.to_string()))
}

fn child_elements(elem: &Element) -> impl Iterator<Item = &Element> {
    elem.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

/// Resolves `name` in the registry and rewrites the result through the layer
/// stack, bottom to top. An empty result means "not present".
fn lookup(ctx: &InputContext, name: &str) -> Option<ButtonSet> {
    let base = ctx.buttons.get(name)?;
    if base.is_empty() {
        return None;
    }
    let mut ret = base.clone();
    for layer in &ctx.layers {
        for (key, value) in layer.borrow().iter() {
            if ret.remove(key) {
                if let Some(value) = value {
                    ret.insert(value.clone());
                }
            }
        }
    }
    if ret.is_empty() {
        None
    } else {
        Some(ret)
    }
}

/// Unions the lookups of every `",; "`-separated token; any unresolved token
/// is an error.
fn lookup_multiple(ctx: &InputContext, names: &str) -> Result<ButtonSet, Error> {
    let mut set = ButtonSet::new();
    for token in tokens(names) {
        match lookup(ctx, token) {
            Some(found) => set.extend(&found),
            None => return Err(Error::UnknownName(token.to_string())),
        }
    }
    Ok(set)
}

/// `<axisbuttons axis="N" neg_name="?" pos_name="?"/>`: consumes the axis
/// and synthesizes its hat button pair.
fn parse_axis_buttons(elem: &Element, ctx: &mut InputContext) -> Result<Option<ButtonSet>, Error> {
    if elem.name != "axisbuttons" {
        return Ok(None);
    }
    let axis_str = match elem.attributes.get("axis") {
        Some(s) => s.clone(),
        None => return Ok(None),
    };
    let axis = axis_str.parse::<usize>().unwrap_or(ctx.axes.len());
    let axis_ptr = match ctx.axes.get(axis) {
        Some(Some(a)) => a.clone(),
        _ => return Err(Error::UnknownAxis(axis_str)),
    };

    let (neg, pos) = Button::hat_pair(&axis_ptr, &mut ctx.button_order);

    let mut set = ButtonSet::new();
    set.insert(neg.clone());
    set.insert(pos.clone());
    ctx.top_level().extend(&set);

    if let Some(name) = elem.attributes.get("neg_name") {
        let entry = ctx.buttons.entry(name.clone()).or_default();
        entry.clear();
        entry.insert(neg);
    }
    if let Some(name) = elem.attributes.get("pos_name") {
        let entry = ctx.buttons.entry(name.clone()).or_default();
        entry.clear();
        entry.insert(pos);
    }

    // The axis no longer appears in the virtual axis list.
    ctx.axes[axis] = None;

    Ok(Some(set))
}

/// `<bset>`: builds a button set from `use`, `begin`/`end` and nested
/// children; binds it in the registry when named.
fn parse_bset(
    elem: &Element,
    ctx: &mut InputContext,
    overwrite: bool,
) -> Result<Option<ButtonSet>, Error> {
    if elem.name != "bset" {
        return Ok(None);
    }

    let mut bset = match elem.attributes.get("use") {
        Some(csv) => lookup_multiple(ctx, csv)?,
        None => ButtonSet::new(),
    };

    if let (Some(begin), Some(end)) = (elem.attributes.get("begin"), elem.attributes.get("end")) {
        let begin: u32 = parse_num(begin)?;
        let end: u32 = parse_num(end)?;
        for number in begin..=end {
            if let Some(found) = lookup(ctx, &number.to_string()) {
                bset.extend(&found);
            }
        }
    }

    for child in child_elements(elem) {
        if let Some(to_add) = parse_bset(child, ctx, true)? {
            bset.extend(&to_add);
        }
        if let Some(to_add) = parse_axis_buttons(child, ctx)? {
            bset.extend(&to_add);
        }
    }

    if let Some(name) = elem.attributes.get("name") {
        if overwrite {
            ctx.buttons.insert(name.clone(), bset.clone());
        }
    }

    Ok(Some(bset))
}

/// `<reuse replace="names" with="names"/>`: records per-slot aliases for
/// the surrounding `<condition>`. Returns whether the element matched;
/// anything that is not a `reuse` element is a no-op.
fn parse_reuse(
    elem: &Element,
    ctx: &InputContext,
    shared: &mut ButtonMapping,
    inputs: &ButtonSet,
) -> Result<bool, Error> {
    if elem.name != "reuse" {
        return Ok(false);
    }
    let (replace, with) = match (elem.attributes.get("replace"), elem.attributes.get("with")) {
        (Some(r), Some(w)) => (r, w),
        _ => return Ok(false),
    };

    let map_input = lookup_multiple(ctx, replace)?;
    let map_output = lookup_multiple(ctx, with)?;

    if map_input.len() != map_output.len() {
        return Err(Error::ReuseSizeMismatch(replace.clone(), with.clone()));
    }

    for (from, to) in map_input.iter().zip(map_output.iter()) {
        if !inputs.contains(from) {
            return Err(Error::ReuseOutsideShift);
        }
        if Arc::ptr_eq(from, to) {
            return Err(Error::ReuseCircular);
        }
        shared.insert(from.clone(), Some(to.clone()));
    }

    Ok(true)
}

/// `<calibrate>`: reads axis correction entries. Unknown children and
/// entries without an `axis` attribute are skipped.
fn parse_calibrate(elem: &Element) -> Result<Option<Calibration>, Error> {
    if elem.name != "calibrate" {
        return Ok(None);
    }

    let mut cal = Calibration::new();
    for child in child_elements(elem) {
        let kind = match child.name.as_str() {
            "broken_line" => JS_CORR_BROKEN,
            "none" => JS_CORR_NONE,
            _ => continue,
        };
        let axis_str = match child.attributes.get("axis") {
            Some(s) => s,
            None => continue,
        };
        let axis: usize = parse_num(axis_str)?;

        let mut entry = JsCorr {
            kind,
            ..JsCorr::default()
        };
        if let Some(prec) = child.attributes.get("precision") {
            entry.prec = parse_num(prec)?;
        }
        if kind == JS_CORR_BROKEN {
            for (slot, name) in BROKEN_LINE_COEFS.iter().enumerate() {
                let value = child
                    .attributes
                    .get(*name)
                    .ok_or(Error::MissingCoefficient(*name))?;
                entry.coef[slot] = parse_num(value)?;
            }
        }
        cal.insert(axis, entry);
    }
    Ok(Some(cal))
}

/// `<condition>`: resolves the trigger button. Without a shift this is the
/// first parser pass and only the button is wanted; with one, the condition
/// slots are added, `<reuse>` children collected, and nested elements parsed
/// under the new rename layer.
///
/// A condition with several trigger states is a bare alias: one slot per
/// state, no children, no name.
fn parse_condition(
    elem: &Element,
    ctx: &mut InputContext,
    shift: Option<&Arc<ShiftSet>>,
) -> Result<Option<Arc<Button>>, Error> {
    if elem.name != "condition" {
        return Ok(None);
    }
    let button_name = match elem.attributes.get("button") {
        Some(s) => s.clone(),
        None => return Ok(None),
    };

    let found = lookup(ctx, &button_name)
        .ok_or_else(|| Error::ConditionNotFound(button_name.clone()))?;
    if found.len() != 1 {
        return Err(Error::ConditionNotSingular(button_name));
    }
    let button = found.iter().next().unwrap().clone();

    let shift = match shift {
        Some(shift) => shift,
        None => return Ok(Some(button)),
    };

    let states_str = elem
        .attributes
        .get("state")
        .cloned()
        .unwrap_or_else(|| "1".to_string());
    let states: Vec<&str> = tokens(&states_str).collect();

    if states.len() > 1 && elem.attributes.get("name").is_some() {
        return Err(Error::NamedMultiState);
    }
    if states.is_empty() {
        return Err(Error::BadStateList(states_str.clone()));
    }

    let parse_children = states.len() == 1;

    let mut shared = ButtonMapping::new();
    if parse_children {
        for child in child_elements(elem) {
            parse_reuse(child, ctx, &mut shared, shift.inputs())?;
        }
    }

    let mut new_buttons = ButtonMapping::new();
    for state in &states {
        let state: i16 = parse_num(state)?;
        new_buttons = shift.add_condition(&button, state, &shared, &mut ctx.button_order);
        if !parse_children {
            shift.set_sub_shifts(Vec::new());
        }

        if let Some(name) = elem.attributes.get("name") {
            let entry = ctx.buttons.entry(name.clone()).or_default();
            entry.clear();
            for (_, output) in new_buttons.iter() {
                if let Some(output) = output {
                    entry.insert(output.clone());
                }
            }
        }
    }

    if parse_children {
        ctx.layers.push(Rc::new(RefCell::new(new_buttons)));

        let mut sub_shifts = Vec::new();
        for child in child_elements(elem) {
            if let Some(sub) = parse_shift(child, ctx)? {
                sub_shifts.push(sub);
            } else {
                parse_bset(child, ctx, true)?;
            }
        }
        shift.set_sub_shifts(sub_shifts);

        ctx.layers.pop();
    }

    Ok(Some(button))
}

/// Removes the spent input buttons of a shift from the context: rewrites
/// layer mappings that still point at them (top of the stack first), then
/// strips them from every registry bucket. Every input must have been
/// removed from at least one of the two places.
fn erase(ctx: &mut InputContext, spent: &ButtonSet) {
    let mut to_del = spent.clone();
    let before = to_del.len();

    for layer in ctx.layers.iter().rev() {
        for (_, value) in layer.borrow_mut().iter_mut() {
            let hit = value.as_ref().map_or(false, |b| to_del.contains(b));
            if hit {
                if let Some(b) = value.take() {
                    to_del.remove(&b);
                }
            }
        }
    }
    let from_layers = before - to_del.len();

    let mut deleted = ButtonSet::new();
    ctx.buttons.retain(|_, bucket| {
        for button in to_del.iter() {
            if bucket.remove(button) {
                deleted.insert(button.clone());
            }
        }
        !bucket.is_empty()
    });

    debug!(
        "erased {} buttons from layers and {} from the name registry",
        from_layers,
        deleted.len()
    );
    debug_assert!(to_del.iter().all(|b| deleted.contains(b)));
}

/// `<shift>`: two passes over the children: the first collects the input
/// set and the condition buttons, the second adds the condition slots.
fn parse_shift(elem: &Element, ctx: &mut InputContext) -> Result<Option<Arc<ShiftSet>>, Error> {
    if elem.name != "shift" {
        return Ok(None);
    }

    let mut input_set: Option<ButtonSet> = None;
    let mut condition_buttons = ButtonSet::new();
    for child in child_elements(elem) {
        if let Some(new_set) = parse_bset(child, ctx, true)? {
            input_set.get_or_insert_with(ButtonSet::new).extend(&new_set);
        } else if let Some(button) = parse_condition(child, ctx, None)? {
            condition_buttons.insert(button);
        }
    }

    let mut input_set = match input_set {
        Some(set) => set,
        None => match ctx.layers.last() {
            // No bset given: fall back to what is live in this scope.
            None => {
                let top = ctx.buttons.get("").cloned().unwrap_or_default();
                debug!("no bset given: using {} top-level buttons", top.len());
                top.difference(&ctx.conditionals)
            }
            Some(layer) => {
                let mut set = ButtonSet::new();
                for (_, value) in layer.borrow().iter() {
                    if let Some(button) = value {
                        set.insert(button.clone());
                    }
                }
                debug!("no bset given: using {} inherited buttons", set.len());
                set
            }
        },
    };

    ctx.conditionals.extend(&condition_buttons);
    // Condition buttons are neither inputs nor outputs.
    for button in ctx.conditionals.iter() {
        input_set.remove(button);
    }
    debug!("after removing conditions: {} input buttons", input_set.len());

    let shift = ShiftSet::create(input_set.clone());

    for child in child_elements(elem) {
        parse_condition(child, ctx, Some(&shift))?;
    }

    if let Some(name) = elem.attributes.get("name") {
        let mut outputs = ButtonSet::new();
        shift.all_outputs(&mut outputs);
        ctx.buttons.insert(name.clone(), outputs);
    }

    erase(ctx, &input_set);

    Ok(Some(shift))
}

/// Walks the root's children in document order, building the graph.
/// Calibrations are collected for the caller to apply to the real joystick.
pub(crate) fn parse_root(
    root: &Element,
    ctx: &mut InputContext,
) -> Result<(Vec<Arc<ShiftSet>>, Vec<Calibration>), Error> {
    let mut shifts = Vec::new();
    let mut calibrations = Vec::new();

    for child in child_elements(root) {
        if parse_bset(child, ctx, true)?.is_some() {
            continue;
        }
        if parse_axis_buttons(child, ctx)?.is_some() {
            continue;
        }
        if let Some(shift) = parse_shift(child, ctx)? {
            shifts.push(shift);
            continue;
        }
        if let Some(cal) = parse_calibrate(child)? {
            calibrations.push(cal);
        }
    }

    Ok((shifts, calibrations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_doc(xml: &str) -> Element {
        Element::parse(xml.as_bytes()).unwrap()
    }

    /// A context as a joystick open would seed it: buttons registered under
    /// their numbers and the top-level bucket, axes live.
    fn context(buttons: usize, axes: usize) -> InputContext {
        let mut ctx = InputContext::new();
        for i in 0..axes {
            ctx.axes.push(Some(Arc::new(Axis::new(i as u8))));
        }
        for i in 0..buttons {
            let button = Arc::new(Button::new(0x120 + i as u16, i as u32));
            let mut set = ButtonSet::new();
            set.insert(button.clone());
            ctx.buttons.insert(i.to_string(), set);
            ctx.top_level().insert(button);
        }
        ctx.button_order = buttons as u32;
        ctx
    }

    fn phys(ctx: &InputContext, i: usize) -> Arc<Button> {
        ctx.buttons[&i.to_string()].iter().next().unwrap().clone()
    }

    /// Assembles the virtual button list the way the mapped joystick does.
    fn virtual_buttons(ctx: &InputContext, shifts: &[Arc<ShiftSet>]) -> Vec<Arc<Button>> {
        let mut all = ctx.buttons.get("").cloned().unwrap_or_default();
        for shift in shifts {
            shift.all_outputs(&mut all);
        }
        all.difference(&ctx.conditionals).iter().cloned().collect()
    }

    #[test]
    fn passthrough_shift_keeps_its_button() {
        let mut ctx = context(1, 0);
        let b0 = phys(&ctx, 0);
        let doc = parse_doc(r#"<config><shift><bset use="0"/></shift></config>"#);
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();

        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].slot_count(), 0);
        let buttons = virtual_buttons(&ctx, &shifts);
        assert_eq!(buttons.len(), 1);
        assert!(Arc::ptr_eq(&buttons[0], &b0));

        b0.input(100, 1, false);
        assert_eq!(buttons[0].value(), 1);
    }

    #[test]
    fn two_layer_shift() {
        let mut ctx = context(3, 0);
        let (b0, b2) = (phys(&ctx, 0), phys(&ctx, 2));
        let doc = parse_doc(
            r#"<config>
                 <shift name="out">
                   <bset use="0,1"/>
                   <condition button="2" state="1"/>
                   <condition button="2" state="2"/>
                 </shift>
               </config>"#,
        );
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();
        let shift = &shifts[0];
        assert_eq!(shift.slot_count(), 2);

        let buttons = virtual_buttons(&ctx, shifts.as_slice());
        assert_eq!(buttons.len(), 4);
        // Physical buttons and the condition never appear in the output.
        for vb in &buttons {
            assert!(!Arc::ptr_eq(vb, &b0));
            assert!(!Arc::ptr_eq(vb, &b2));
        }
        assert!(ctx.conditionals.contains(&b2));

        // Press 0: the base layer's button 0 goes high.
        b0.input(1, 1, false);
        assert_eq!(buttons[0].value(), 1);
        assert_eq!(buttons[2].value(), 0);

        // Trigger value 2 activates the second layer; the state moves to
        // virtual button 2 (the shifted copy of 0).
        b2.input(2, 2, false);
        assert_eq!(buttons[0].value(), 0);
        assert_eq!(buttons[2].value(), 1);

        // Releasing the trigger rotates nothing.
        b2.input(3, 0, false);
        assert_eq!(buttons[2].value(), 1);

        // Value 1 goes back to the base layer.
        b2.input(4, 1, false);
        assert_eq!(buttons[0].value(), 1);
        assert_eq!(buttons[2].value(), 0);

        // The shift's name is bound to its outputs.
        assert_eq!(ctx.buttons["out"].len(), 4);
    }

    #[test]
    fn circular_reuse_is_rejected() {
        let mut ctx = context(3, 0);
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0,1"/>
                   <condition button="2" state="1"><reuse replace="0" with="0"/></condition>
                 </shift>
               </config>"#,
        );
        match parse_root(&doc, &mut ctx) {
            Err(Error::ReuseCircular) => {}
            other => panic!("expected circular reuse error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn reuse_size_mismatch_is_rejected() {
        let mut ctx = context(4, 0);
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0,1"/>
                   <condition button="3" state="1"><reuse replace="0,1" with="2"/></condition>
                 </shift>
               </config>"#,
        );
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::ReuseSizeMismatch(..))
        ));
    }

    #[test]
    fn reuse_outside_shift_is_rejected() {
        let mut ctx = context(3, 0);
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0"/>
                   <condition button="2" state="1"><reuse replace="1" with="0"/></condition>
                 </shift>
               </config>"#,
        );
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::ReuseOutsideShift)
        ));
    }

    #[test]
    fn reuse_aliases_across_sibling_conditions() {
        let mut ctx = context(3, 0);
        let (b0, b2) = (phys(&ctx, 0), phys(&ctx, 2));
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0,1"/>
                   <condition button="2" state="1" name="fire"/>
                   <condition button="2" state="2"><reuse replace="0,1" with="fire"/></condition>
                 </shift>
               </config>"#,
        );
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();
        let buttons = virtual_buttons(&ctx, &shifts);
        // The fully aliased second slot adds no new buttons.
        assert_eq!(buttons.len(), 2);

        // Press 0 in the base slot, then rotate to the aliased slot: the
        // shared outputs keep their state with no copy or zero.
        b2.input(0, 1, false);
        b0.input(1, 1, false);
        let held: Vec<i16> = buttons.iter().map(|b| b.value()).collect();
        b2.input(2, 2, false);
        let after: Vec<i16> = buttons.iter().map(|b| b.value()).collect();
        assert_eq!(held, after);
    }

    #[test]
    fn rotation_cycles_slots_in_insertion_order() {
        let mut ctx = context(2, 0);
        let (b0, b1) = (phys(&ctx, 0), phys(&ctx, 1));
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0"/>
                   <condition button="1" state="1"/>
                   <condition button="1" state="1"/>
                 </shift>
               </config>"#,
        );
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();
        let shift = &shifts[0];
        assert_eq!(shift.slot_count(), 2);
        let buttons = virtual_buttons(&ctx, &shifts);
        assert_eq!(buttons.len(), 2);

        b0.input(0, 1, false);
        assert_eq!(buttons[0].value(), 1);

        // Each 0→1 edge advances the rotation; k+1 presses return to slot 0.
        b1.input(1, 1, false);
        assert_eq!((buttons[0].value(), buttons[1].value()), (0, 1));
        b1.input(2, 0, false);
        b1.input(3, 1, false);
        assert_eq!((buttons[0].value(), buttons[1].value()), (1, 0));
    }

    #[test]
    fn axisbuttons_consume_their_axis() {
        let mut ctx = context(0, 4);
        let axis = ctx.axes[3].clone().unwrap();
        let doc =
            parse_doc(r#"<config><axisbuttons axis="3" neg_name="left" pos_name="right"/></config>"#);
        parse_root(&doc, &mut ctx).unwrap();

        assert!(ctx.axes[3].is_none());
        let left = lookup(&ctx, "left").unwrap().iter().next().unwrap().clone();
        let right = lookup(&ctx, "right").unwrap().iter().next().unwrap().clone();

        axis.input(0, -32000, false);
        assert_eq!((left.value(), right.value()), (1, 0));
        axis.input(1, 32000, false);
        assert_eq!((left.value(), right.value()), (0, 1));
        axis.input(2, 0, false);
        assert_eq!((left.value(), right.value()), (0, 0));
    }

    #[test]
    fn axisbuttons_unknown_or_consumed_axis() {
        let mut ctx = context(0, 2);
        let doc = parse_doc(r#"<config><axisbuttons axis="9"/></config>"#);
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::UnknownAxis(_))
        ));

        let doc = parse_doc(
            r#"<config><axisbuttons axis="1"/><axisbuttons axis="1"/></config>"#,
        );
        let mut ctx = context(0, 2);
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::UnknownAxis(_))
        ));
    }

    #[test]
    fn unknown_use_name() {
        let mut ctx = context(1, 0);
        let doc = parse_doc(r#"<config><shift><bset use="missile"/></shift></config>"#);
        match parse_root(&doc, &mut ctx) {
            Err(Error::UnknownName(name)) => assert_eq!(name, "missile"),
            other => panic!("expected unknown name, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn condition_button_must_be_singular() {
        let mut ctx = context(3, 0);
        let doc = parse_doc(
            r#"<config>
                 <bset name="pair" use="1,2"/>
                 <shift><bset use="0"/><condition button="pair"/></shift>
               </config>"#,
        );
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::ConditionNotSingular(_))
        ));

        let mut ctx = context(3, 0);
        let doc = parse_doc(r#"<config><shift><bset use="0"/><condition button="nope"/></shift></config>"#);
        assert!(matches!(
            parse_root(&doc, &mut ctx),
            Err(Error::ConditionNotFound(_))
        ));
    }

    #[test]
    fn multi_state_condition_cannot_be_named() {
        let mut ctx = context(2, 0);
        let doc = parse_doc(
            r#"<config>
                 <shift><bset use="0"/><condition button="1" state="1,2" name="x"/></shift>
               </config>"#,
        );
        assert!(matches!(parse_root(&doc, &mut ctx), Err(Error::NamedMultiState)));
    }

    #[test]
    fn multi_state_condition_is_a_bare_alias() {
        let mut ctx = context(2, 0);
        // The reuse child would be circular, but multi-state conditions do
        // not process children at all.
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0"/>
                   <condition button="1" state="1 2"><reuse replace="0" with="0"/></condition>
                 </shift>
               </config>"#,
        );
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();
        assert_eq!(shifts[0].slot_count(), 2);
    }

    #[test]
    fn default_input_set_is_top_level_minus_conditionals() {
        let mut ctx = context(3, 0);
        let doc = parse_doc(r#"<config><shift><condition button="2" state="1"/></shift></config>"#);
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();

        assert_eq!(shifts[0].inputs().len(), 2);
        let buttons = virtual_buttons(&ctx, &shifts);
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].code(), 0x120);
        assert_eq!(buttons[1].code(), 0x121);
    }

    #[test]
    fn nested_shift_inherits_the_layer() {
        let mut ctx = context(4, 0);
        let b0 = phys(&ctx, 0);
        let doc = parse_doc(
            r#"<config>
                 <shift>
                   <bset use="0,1"/>
                   <condition button="2" state="1">
                     <shift><condition button="3" state="1"/></shift>
                   </condition>
                 </shift>
               </config>"#,
        );
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();

        // Outer layer buttons were consumed by the inner shift; only the
        // innermost outputs remain.
        let buttons = virtual_buttons(&ctx, &shifts);
        assert_eq!(buttons.len(), 2);

        // Events flow through both layers.
        b0.input(0, 1, false);
        assert_eq!(buttons[0].value(), 1);
    }

    #[test]
    fn erase_strips_spent_inputs_from_the_registry() {
        let mut ctx = context(2, 0);
        let doc = parse_doc(r#"<config><shift><bset use="0,1"/><condition button="0" state="1"/></shift></config>"#);
        // Condition button 0 is subtracted from the inputs first, so only
        // button 1 is replaced and erased.
        let (shifts, _) = parse_root(&doc, &mut ctx).unwrap();
        assert_eq!(shifts[0].inputs().len(), 1);
        assert!(lookup(&ctx, "1").is_none());
        assert!(ctx.buttons.get("").map_or(true, |top| top.len() <= 1));
    }

    #[test]
    fn bset_begin_end_and_nesting() {
        let mut ctx = context(4, 2);
        let doc = parse_doc(
            r#"<config>
                 <bset name="grp" begin="1" end="2">
                   <bset use="3"/>
                   <axisbuttons axis="0"/>
                 </bset>
               </config>"#,
        );
        parse_root(&doc, &mut ctx).unwrap();
        // 1, 2, 3 plus the two hat buttons.
        assert_eq!(ctx.buttons["grp"].len(), 5);
        assert!(ctx.axes[0].is_none());
    }

    #[test]
    fn calibrate_entries() {
        let doc = parse_doc(
            r#"<calibrate>
                 <broken_line axis="0" precision="10" centre_min="-100" centre_max="100"
                              slope_neg="5" slope_pos="5"/>
                 <none axis="2"/>
                 <something_else axis="1"/>
               </calibrate>"#,
        );
        let cal = parse_calibrate(&doc).unwrap().unwrap();
        assert_eq!(cal.len(), 2);
        let broken = cal[0];
        assert_eq!(broken.kind, JS_CORR_BROKEN);
        assert_eq!(broken.prec, 10);
        assert_eq!(&broken.coef[..4], &[-100, 100, 5, 5]);
        assert_eq!(cal[2].kind, JS_CORR_NONE);
        assert!(cal.get(1).is_none());
    }

    #[test]
    fn calibrate_errors() {
        let doc = parse_doc(r#"<calibrate><broken_line axis="0" centre_min="1"/></calibrate>"#);
        assert!(matches!(
            parse_calibrate(&doc),
            Err(Error::MissingCoefficient(_))
        ));

        let doc = parse_doc(
            r#"<calibrate>
                 <broken_line axis="zero" precision="1" centre_min="1" centre_max="1"
                              slope_neg="1" slope_pos="1"/>
               </calibrate>"#,
        );
        assert!(matches!(parse_calibrate(&doc), Err(Error::BadNumber(_))));
    }

    #[test]
    fn ordering_is_stable_across_independent_parses() {
        let xml = r#"<config>
                       <axisbuttons axis="1" neg_name="left" pos_name="right"/>
                       <shift>
                         <bset use="0,1,2"/>
                         <condition button="3" state="1"/>
                         <condition button="3" state="2"/>
                       </shift>
                     </config>"#;
        let mut fingerprints = Vec::new();
        for _ in 0..2 {
            let mut ctx = context(4, 2);
            let (shifts, _) = parse_root(&parse_doc(xml), &mut ctx).unwrap();
            let buttons = virtual_buttons(&ctx, &shifts);
            fingerprints.push(
                buttons
                    .iter()
                    .map(|b| (b.code(), b.order()))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(fingerprints[0], fingerprints[1]);
    }
}
