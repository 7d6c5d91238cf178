// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! jshift-core - input graph and shift-layer engine
//! ================================================
//!
//! This crate is the data model behind the jshift virtual joystick: a real
//! Linux joystick's buttons and axes are reconfigured, renamed, duplicated
//! and rotated across *shift layers* described by a declarative XML map, so
//! one physical controller can expose several logical control schemes
//! selected by shift buttons.
//!
//! The pieces, bottom up:
//!
//! * [`sig`]: change signals with weakly-tracked slots; the observer
//!   plumbing everything else subscribes through.
//! * [`input`]: [`Axis`] and [`Button`] primitives, hat button synthesis,
//!   and the ordered button collections.
//! * [`shift`]: [`ShiftSet`], the layered alias over a set of buttons.
//! * [`map`]: the XML map parser and the name-resolution context.
//! * [`joystick`]: the [`Joystick`] trait, the real device behind an FD,
//!   and [`MappedJoystick`], the virtual composition with calibration
//!   write-back.
//! * [`abi`]: the kernel joystick interface: event and correction records
//!   and ioctl numbers.
//!
//! Driving the graph is synchronous: feeding a physical event into a
//! primitive's `input` fans out through the subscriptions on the calling
//! thread, and the virtual buttons' change signals fire before `input`
//! returns. The event bridge in the `jshift` crate builds on exactly that.

pub mod abi;
pub mod input;
pub mod joystick;
pub mod map;
pub mod shift;
pub mod sig;

pub use crate::input::{Axis, Button, ButtonMapping, ButtonSet};
pub use crate::joystick::{DeviceJoystick, Joystick, MappedJoystick};
pub use crate::map::{Calibration, Error as MapError, InputContext};
pub use crate::shift::ShiftSet;
