// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Joysticks: the real device behind an FD and the mapped view built from a
//! map document.

use std::ffi::CStr;
use std::fmt;
use std::fs::File;
use std::os::raw::{c_char, c_ulong};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libc as c;
use log::{debug, error};
use xmltree::{Element, XMLNode};

use crate::abi::{self, JsCorr, JS_CORR_BROKEN, JS_CORR_UNMAPPED};
use crate::input::{Axis, Button, ButtonSet};
use crate::map::{self, Calibration, Error as MapError, InputContext, BROKEN_LINE_COEFS};
use crate::shift::ShiftSet;

/// A joystick as seen by the event bridge: a name, primitive axes and
/// buttons, and an axis correction array.
///
/// Device I/O failures are not part of the signatures; implementations log
/// and fall back to neutral values, and the composed state stays consistent.
pub trait Joystick: Send + Sync {
    fn name(&self) -> String;
    fn num_axes(&self) -> usize;
    fn num_buttons(&self) -> usize;
    fn axis(&self, idx: usize) -> Arc<Axis>;
    fn button(&self, idx: usize) -> Arc<Button>;

    /// Correction entries for every axis, in axis order.
    fn correction(&self) -> Vec<JsCorr>;
    fn set_correction(&self, corr: &[JsCorr]);

    /// Applies a parsed `<calibrate>` on top of the current corrections.
    /// Entries for axes the joystick does not have are ignored.
    fn calibrate(&self, cal: &Calibration) {
        let mut corr = self.correction();
        for (axis, entry) in cal.iter() {
            if axis < corr.len() {
                corr[axis] = *entry;
            }
        }
        self.set_correction(&corr);
    }
}

/// The real joystick behind an open `/dev/input/jsN` descriptor.
///
/// Does not own the descriptor; whoever opened the device keeps it alive for
/// as long as this wrapper is used.
pub struct DeviceJoystick {
    fd: RawFd,
    name: String,
    axes: Vec<Arc<Axis>>,
    buttons: Vec<Arc<Button>>,
}

impl DeviceJoystick {
    /// Queries the driver for name, axis/button maps and counts, and builds
    /// one primitive per physical input. Buttons take their index as order.
    pub fn from_fd(fd: RawFd) -> DeviceJoystick {
        let mut namebuf = [0u8; 256];
        let name = unsafe {
            if c::ioctl(fd, abi::jsiocgname(namebuf.len()) as c_ulong, namebuf.as_mut_ptr()) > 0 {
                CStr::from_ptr(namebuf.as_ptr() as *const c_char)
                    .to_string_lossy()
                    .into_owned()
            } else {
                String::new()
            }
        };

        let mut btnmap = [0u16; 512];
        let mut axmap = [0u8; 64];
        let mut buttons: u8 = 0;
        let mut axes: u8 = 0;
        unsafe {
            if c::ioctl(fd, abi::JSIOCGBTNMAP as c_ulong, btnmap.as_mut_ptr()) < 0
                || c::ioctl(fd, abi::JSIOCGAXMAP as c_ulong, axmap.as_mut_ptr()) < 0
                || c::ioctl(fd, abi::JSIOCGBUTTONS as c_ulong, &mut buttons) < 0
                || c::ioctl(fd, abi::JSIOCGAXES as c_ulong, &mut axes) < 0
            {
                debug!("joystick fd {} did not answer all map queries", fd);
            }
        }

        let buttons = (0..buttons as usize)
            .map(|i| Arc::new(Button::new(btnmap[i], i as u32)))
            .collect();
        let axes = (0..axes as usize)
            .map(|i| Arc::new(Axis::new(axmap[i])))
            .collect();

        DeviceJoystick {
            fd,
            name,
            axes,
            buttons,
        }
    }

    /// Driver version as reported by `JSIOCGVERSION`, 0 when unavailable.
    pub fn driver_version(fd: RawFd) -> u32 {
        let mut version: u32 = 0;
        unsafe {
            if c::ioctl(fd, abi::JSIOCGVERSION as c_ulong, &mut version) < 0 {
                debug!("joystick fd {} has no driver version", fd);
            }
        }
        version
    }
}

impl Joystick for DeviceJoystick {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn num_axes(&self) -> usize {
        self.axes.len()
    }

    fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    fn axis(&self, idx: usize) -> Arc<Axis> {
        self.axes[idx].clone()
    }

    fn button(&self, idx: usize) -> Arc<Button> {
        self.buttons[idx].clone()
    }

    fn correction(&self) -> Vec<JsCorr> {
        let mut corr = vec![JsCorr::default(); self.axes.len()];
        unsafe {
            if c::ioctl(self.fd, abi::JSIOCGCORR as c_ulong, corr.as_mut_ptr()) < 0 {
                error!("JSIOCGCORR failed on fd {}", self.fd);
            }
        }
        corr
    }

    fn set_correction(&self, corr: &[JsCorr]) {
        let mut full = vec![JsCorr::default(); self.axes.len()];
        let n = corr.len().min(full.len());
        full[..n].copy_from_slice(&corr[..n]);
        unsafe {
            if c::ioctl(self.fd, abi::JSIOCSCORR as c_ulong, full.as_ptr()) < 0 {
                error!("JSIOCSCORR failed on fd {}", self.fd);
            }
        }
    }
}

impl fmt::Debug for DeviceJoystick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceJoystick")
            .field("fd", &self.fd)
            .field("name", &self.name)
            .field("axes", &self.axes.len())
            .field("buttons", &self.buttons.len())
            .finish()
    }
}

/// The virtual joystick: the real device's inputs routed through the parsed
/// map.
///
/// Owns the shift sets (and through them the output buttons) and the map
/// document, which is mutated and saved again when a client calibrates the
/// device.
pub struct MappedJoystick {
    name: String,
    buttons: Vec<Arc<Button>>,
    /// Indices of the real axes that are still visible.
    axes: Vec<usize>,
    input: Arc<dyn Joystick>,
    shifts: Vec<Arc<ShiftSet>>,
    doc: Mutex<Element>,
    config_out: Option<PathBuf>,
}

impl MappedJoystick {
    /// Reads and parses `mapfile` over `input`. Every error is fatal to the
    /// open that requested the device.
    pub fn new(
        input: Arc<dyn Joystick>,
        mapfile: &Path,
        config_out: Option<PathBuf>,
    ) -> Result<MappedJoystick, MapError> {
        let file = File::open(mapfile).map_err(MapError::Io)?;
        let root = Element::parse(file).map_err(MapError::Xml)?;
        Self::from_document(input, root, config_out)
    }

    pub(crate) fn from_document(
        input: Arc<dyn Joystick>,
        root: Element,
        config_out: Option<PathBuf>,
    ) -> Result<MappedJoystick, MapError> {
        let mut ctx = InputContext::new();
        for i in 0..input.num_axes() {
            ctx.axes.push(Some(input.axis(i)));
        }
        for i in 0..input.num_buttons() {
            let button = input.button(i);
            // Fresh orders start past every physical one so later layers
            // sort after the originals.
            ctx.button_order = ctx.button_order.max(button.order() + 1);
            let mut set = ButtonSet::new();
            set.insert(button.clone());
            ctx.buttons.insert(i.to_string(), set);
            ctx.buttons.entry(String::new()).or_default().insert(button);
        }

        let (shifts, calibrations) = map::parse_root(&root, &mut ctx)?;
        for cal in &calibrations {
            input.calibrate(cal);
        }

        let mut all = ctx.buttons.get("").cloned().unwrap_or_default();
        for shift in &shifts {
            shift.all_outputs(&mut all);
        }
        let buttons: Vec<Arc<Button>> =
            all.difference(&ctx.conditionals).iter().cloned().collect();
        let axes: Vec<usize> = ctx
            .axes
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|_| i))
            .collect();

        Ok(MappedJoystick {
            name: format!("JShift: {}", input.name()),
            buttons,
            axes,
            input,
            shifts,
            doc: Mutex::new(root),
            config_out,
        })
    }

    /// The shift sets parsed from the map, outermost first.
    pub fn shifts(&self) -> &[Arc<ShiftSet>] {
        &self.shifts
    }
}

impl Joystick for MappedJoystick {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn num_axes(&self) -> usize {
        self.axes.len()
    }

    fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    fn axis(&self, idx: usize) -> Arc<Axis> {
        self.input.axis(self.axes[idx])
    }

    fn button(&self, idx: usize) -> Arc<Button> {
        self.buttons[idx].clone()
    }

    fn correction(&self) -> Vec<JsCorr> {
        let orig = self.input.correction();
        self.axes.iter().map(|&real| orig[real]).collect()
    }

    /// Applies client corrections to the visible axes, leaving masked ones
    /// untouched, and rewrites the autogenerated `<calibrate>` section of
    /// the map when a write-back path is configured.
    fn set_correction(&self, corr: &[JsCorr]) {
        let mut full = self.input.correction();
        for (virt, &real) in self.axes.iter().enumerate() {
            if let Some(entry) = corr.get(virt) {
                full[real] = *entry;
            }
        }
        self.input.set_correction(&full);

        let path = match &self.config_out {
            Some(path) => path,
            None => return,
        };

        // Masked axes keep their correction; mark them so the file gets a
        // comment instead of a stale entry.
        for (real, entry) in full.iter_mut().enumerate() {
            if !self.axes.contains(&real) {
                entry.kind = JS_CORR_UNMAPPED;
            }
        }

        let mut doc = self.doc.lock().unwrap();
        remove_autogenerated(&mut doc);
        add_calibration(&mut doc, &full);
        match File::create(path) {
            Ok(out) => {
                if let Err(e) = doc.write(out) {
                    error!("can't write calibrated map {}: {}", path.display(), e);
                }
            }
            Err(e) => error!("can't create calibrated map {}: {}", path.display(), e),
        }
    }
}

impl fmt::Debug for MappedJoystick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedJoystick")
            .field("name", &self.name)
            .field("buttons", &self.buttons.len())
            .field("axes", &self.axes)
            .field("shifts", &self.shifts.len())
            .finish()
    }
}

fn is_autogenerated_calibrate(node: &XMLNode) -> bool {
    match node {
        XMLNode::Element(e) => {
            e.name == "calibrate"
                && e.attributes.get("autogenerated").map(String::as_str) == Some("true")
        }
        _ => false,
    }
}

/// Strips every `<calibrate autogenerated="true">` (and its trailing
/// newline) left behind by a previous save.
fn remove_autogenerated(root: &mut Element) {
    let mut i = 0;
    while i < root.children.len() {
        if !is_autogenerated_calibrate(&root.children[i]) {
            i += 1;
            continue;
        }
        root.children.remove(i);
        if let Some(XMLNode::Text(text)) = root.children.get(i) {
            if text == "\n" {
                root.children.remove(i);
            }
        }
    }
}

/// Appends `<calibrate autogenerated="true">` describing every real axis.
/// Axes masked out of the virtual device are emitted as comments so that
/// reloading the file reproduces the same state.
fn add_calibration(root: &mut Element, corr: &[JsCorr]) {
    let needs_newline = match root.children.last() {
        Some(XMLNode::Text(text)) => !text.ends_with('\n'),
        _ => true,
    };
    if needs_newline {
        root.children.push(XMLNode::Text("\n".to_string()));
    }

    let mut cal = Element::new("calibrate");
    cal.attributes
        .insert("autogenerated".to_string(), "true".to_string());
    cal.children.push(XMLNode::Text("\n  ".to_string()));

    for (axis, entry) in corr.iter().enumerate() {
        if entry.kind == JS_CORR_UNMAPPED {
            cal.children.push(XMLNode::Comment(format!(
                " axis {} is mapped to hat buttons ",
                axis
            )));
        } else {
            let name = if entry.kind == JS_CORR_BROKEN {
                "broken_line"
            } else {
                "none"
            };
            let mut elem = Element::new(name);
            elem.attributes.insert("axis".to_string(), axis.to_string());
            elem.attributes
                .insert("precision".to_string(), entry.prec.to_string());
            if entry.kind == JS_CORR_BROKEN {
                for (slot, coef) in BROKEN_LINE_COEFS.iter().enumerate() {
                    elem.attributes
                        .insert((*coef).to_string(), entry.coef[slot].to_string());
                }
            }
            cal.children.push(XMLNode::Element(elem));
        }

        let last = axis == corr.len() - 1;
        cal.children
            .push(XMLNode::Text(if last { "\n" } else { "\n  " }.to_string()));
    }

    root.children.push(XMLNode::Element(cal));
    root.children.push(XMLNode::Text("\n".to_string()));
}
