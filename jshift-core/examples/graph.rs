// Parses a map file over a synthetic joystick and prints the virtual layout
// a client would see. Useful for checking a map without any hardware:
//
//     cargo run --example graph -- my-map.xml [buttons] [axes]

use std::env;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};

use jshift_core::abi::JsCorr;
use jshift_core::{Axis, Button, Joystick, MappedJoystick};

struct SyntheticJoystick {
    buttons: Vec<Arc<Button>>,
    axes: Vec<Arc<Axis>>,
    corr: Mutex<Vec<JsCorr>>,
}

impl SyntheticJoystick {
    fn new(buttons: usize, axes: usize) -> Self {
        SyntheticJoystick {
            buttons: (0..buttons)
                .map(|i| Arc::new(Button::new(0x120 + i as u16, i as u32)))
                .collect(),
            axes: (0..axes).map(|i| Arc::new(Axis::new(i as u8))).collect(),
            corr: Mutex::new(vec![JsCorr::default(); axes]),
        }
    }
}

impl Joystick for SyntheticJoystick {
    fn name(&self) -> String {
        "Synthetic".to_string()
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
        self.corr.lock().unwrap().clone()
    }

    fn set_correction(&self, corr: &[JsCorr]) {
        let mut held = self.corr.lock().unwrap();
        let n = corr.len().min(held.len());
        held[..n].copy_from_slice(&corr[..n]);
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: graph MAPFILE [buttons] [axes]");
            process::exit(1);
        }
    };
    let buttons = args.next().and_then(|s| s.parse().ok()).unwrap_or(8);
    let axes = args.next().and_then(|s| s.parse().ok()).unwrap_or(4);

    let phys = Arc::new(SyntheticJoystick::new(buttons, axes));
    let mapped = match MappedJoystick::new(phys, Path::new(&path), None) {
        Ok(mapped) => mapped,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            process::exit(1);
        }
    };

    println!("{} ({} shift sets)", mapped.name(), mapped.shifts().len());
    println!("buttons:");
    for i in 0..mapped.num_buttons() {
        let b = mapped.button(i);
        println!("  {:3}  code {:#05x}  order {}", i, b.code(), b.order());
    }
    println!("axes:");
    for i in 0..mapped.num_axes() {
        println!("  {:3}  code {:#04x}", i, mapped.axis(i).code());
    }
}
