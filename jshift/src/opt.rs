// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The option surface a host front end exposes.
//!
//! The daemon executable itself lives with the character-device host; this
//! module gives it the option model, the device-number resolution and the
//! session configuration, so every front end agrees on the contract:
//! exit code 0 on success, 1 on option or usage errors, runtime errors
//! passed through.

use std::env;
use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;

use clap::Parser;
use nix::errno::Errno;
use nix::sys::stat::{major, minor, stat, SFlag};

use crate::session::SessionConfig;

pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for option and usage errors, including the ones
/// [`Options::try_parse_from`] reports.
pub const EXIT_USAGE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "jshift",
    about = "Present a shift-layered virtual joystick over a real one"
)]
pub struct Options {
    /// Output joystick device major number.
    #[arg(short = 'M', long = "maj", value_name = "MAJ")]
    pub major: Option<u32>,

    /// Output joystick device minor number.
    #[arg(short = 'm', long = "min", value_name = "MIN")]
    pub minor: Option<u32>,

    /// Take major/minor device numbers from this existing character device
    /// node instead.
    #[arg(short = 'O', long, value_name = "DEV")]
    pub outdev: Option<PathBuf>,

    /// Real joystick device.
    #[arg(short = 'I', long, value_name = "DEV")]
    pub indev: PathBuf,

    /// XML map file.
    #[arg(short = 'c', long, value_name = "CFG")]
    pub config: PathBuf,

    /// Output XML map, written whenever a client calibrates the virtual
    /// joystick.
    #[arg(long, value_name = "CFG")]
    pub calibrated: Option<PathBuf>,
}

/// Registration data for the virtual device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub major: u32,
    pub minor: u32,
    /// `DEVNAME` the host registers, `jshift<minor>`.
    pub devname: String,
}

#[derive(Debug)]
pub enum OptError {
    /// Neither explicit device numbers nor a usable `--outdev` were given.
    MissingNumbers,
    Stat(PathBuf, Errno),
    NotCharDev(PathBuf),
    Io(io::Error),
}

impl Display for OptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptError::MissingNumbers => f.write_str(
                "please give device major/minor numbers to use - either -M/-m or -O options",
            ),
            OptError::Stat(path, e) => write!(f, "couldn't stat {}: {}", path.display(), e),
            OptError::NotCharDev(path) => write!(
                f,
                "{} should be the output joystick - it must be a character device",
                path.display()
            ),
            OptError::Io(e) => e.fmt(f),
        }
    }
}

impl error::Error for OptError {}

impl Options {
    /// Turns parsed options into the session configuration and the device
    /// registration data.
    ///
    /// Relative map paths are made absolute up front; the host typically
    /// daemonizes and changes its working directory to `/` before the first
    /// open.
    pub fn resolve(self) -> Result<(SessionConfig, DeviceInfo), OptError> {
        let (major_no, minor_no) = match (self.major, self.minor) {
            (Some(major_no), Some(minor_no)) => (major_no, minor_no),
            _ => match &self.outdev {
                Some(dev) => {
                    let st = stat(dev.as_path()).map_err(|e| OptError::Stat(dev.clone(), e))?;
                    if st.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFCHR.bits() {
                        return Err(OptError::NotCharDev(dev.clone()));
                    }
                    (major(st.st_rdev) as u32, minor(st.st_rdev) as u32)
                }
                None => return Err(OptError::MissingNumbers),
            },
        };

        let cwd = env::current_dir().map_err(OptError::Io)?;
        let absolute = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        };

        let config = SessionConfig {
            indev: self.indev,
            config: absolute(self.config),
            calibrated: self.calibrated.map(absolute),
        };
        let info = DeviceInfo {
            major: major_no,
            minor: minor_no,
            devname: format!("jshift{}", minor_no),
        };

        Ok((config, info))
    }
}
