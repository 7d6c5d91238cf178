// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One serving session: the descriptor table and the dedicated I/O thread.
//!
//! The host forwards each character-device callback here with the file
//! handle it assigned at open. Descriptors are independent (every open
//! carries its own descriptor on the real device and its own parse of the
//! map) and are guarded by their own lock; the table lock is only ever
//! taken to look a descriptor up or to snapshot the watch list, never while
//! a descriptor lock is held.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::bridge::{JsFile, OpenError};
use crate::host::{IoctlReply, PollHandle, PollReply, ReadReply};
use crate::wakepipe::{self, WakePipe};

/// What a session serves: the real device, the map, and the optional
/// write-back path for client-issued calibrations.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub indev: PathBuf,
    pub config: PathBuf,
    pub calibrated: Option<PathBuf>,
}

struct Shared {
    config: SessionConfig,
    files: Mutex<BTreeMap<u64, Arc<JsFile>>>,
    wake: WakePipe,
}

/// The serving session. Dropping it shuts the I/O thread down and closes
/// every descriptor.
pub struct Session {
    shared: Arc<Shared>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> io::Result<Session> {
        let shared = Arc::new(Shared {
            config,
            files: Mutex::new(BTreeMap::new()),
            wake: WakePipe::new()?,
        });

        let io_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name("jshift-io".to_string())
            .spawn(move || io_loop(&io_shared))?;

        Ok(Session {
            shared,
            io_thread: Some(io_thread),
        })
    }

    /// Opens a fresh descriptor; configuration errors fail this open only.
    pub fn open(&self) -> Result<u64, OpenError> {
        let file = JsFile::open(&self.shared.config)?;
        Ok(self.insert(Arc::new(file)))
    }

    fn insert(&self, file: Arc<JsFile>) -> u64 {
        let mut files = self.shared.files.lock().unwrap();
        let mut fh = 0;
        while files.contains_key(&fh) {
            fh += 1;
        }
        files.insert(fh, file);
        fh
    }

    /// Drops the descriptor's state. Returns whether the handle was known.
    pub fn release(&self, fh: u64) -> bool {
        self.shared.files.lock().unwrap().remove(&fh).is_some()
    }

    fn file(&self, fh: u64) -> Option<Arc<JsFile>> {
        self.shared.files.lock().unwrap().get(&fh).cloned()
    }

    pub fn read(&self, fh: u64, reply: Box<dyn ReadReply>, size: usize, nonblock: bool) {
        match self.file(fh) {
            Some(file) => file.read(reply, size, nonblock, &self.shared.wake),
            None => {
                warn!("read on unknown descriptor {}", fh);
                reply.error(Errno::EBADF);
            }
        }
    }

    pub fn poll(&self, fh: u64, reply: Box<dyn PollReply>, handle: Option<Box<dyn PollHandle>>) {
        match self.file(fh) {
            Some(file) => file.poll(reply, handle, &self.shared.wake),
            None => {
                warn!("poll on unknown descriptor {}", fh);
                reply.reply(0);
            }
        }
    }

    pub fn ioctl(&self, fh: u64, cmd: u32, in_buf: &[u8], out_size: usize, reply: Box<dyn IoctlReply>) {
        match self.file(fh) {
            Some(file) => file.ioctl(cmd, in_buf, out_size, reply),
            None => {
                warn!("ioctl on unknown descriptor {}", fh);
                reply.error(Errno::EBADF);
            }
        }
    }

    /// The host's cancellation callback for a read it parked earlier.
    pub fn interrupt_read(&self, fh: u64) {
        if let Some(file) = self.file(fh) {
            file.interrupt_read();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.wake.exit();
        if let Some(io_thread) = self.io_thread.take() {
            let _ = io_thread.join();
        }
    }
}

/// The multiplex loop: waits on the wake pipe and on the real-device FDs of
/// every descriptor that wants input, and drains whichever became readable.
///
/// The descriptor table is snapshotted first and each descriptor locked
/// individually afterwards, never both at once.
fn io_loop(shared: &Shared) {
    let wake_fd = shared.wake.wait_fd();
    loop {
        let files: Vec<Arc<JsFile>> = shared.files.lock().unwrap().values().cloned().collect();
        let watched: Vec<Arc<JsFile>> = files.into_iter().filter(|f| f.want_input()).collect();

        let mut fds = Vec::with_capacity(watched.len() + 1);
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(wake_fd) },
            PollFlags::POLLIN,
        ));
        for file in &watched {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(file.input_fd()) },
                PollFlags::POLLIN,
            ));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("multiplex wait failed: {}", e);
                return;
            }
        }

        if fds[0]
            .revents()
            .map_or(false, |r| r.contains(PollFlags::POLLIN))
        {
            if shared.wake.take() == wakepipe::EXIT {
                return;
            }
            // Watch list may have changed; rebuild before serving FDs.
            continue;
        }

        let ready: Vec<bool> = fds[1..]
            .iter()
            .map(|fd| {
                fd.revents().map_or(false, |r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                })
            })
            .collect();
        drop(fds);

        for (file, ready) in watched.iter().zip(ready) {
            if ready {
                file.read_available();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ReadReply;
    use jshift_core::abi::{JsEvent, EVENT_SIZE, JS_EVENT_BUTTON};
    use jshift_core::{Axis, Button};
    use std::time::{Duration, Instant};

    fn config() -> SessionConfig {
        SessionConfig {
            indev: PathBuf::from("/dev/null"),
            config: PathBuf::from("/nonexistent/map.xml"),
            calibrated: None,
        }
    }

    struct Sink(Arc<Mutex<Vec<Result<Vec<u8>, Errno>>>>);

    impl ReadReply for Sink {
        fn data(self: Box<Self>, buf: &[u8]) {
            self.0.lock().unwrap().push(Ok(buf.to_vec()));
        }

        fn error(self: Box<Self>, errno: Errno) {
            self.0.lock().unwrap().push(Err(errno));
        }
    }

    #[test]
    fn unknown_descriptors_are_rejected() {
        let session = Session::new(config()).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        session.read(42, Box::new(Sink(outcomes.clone())), EVENT_SIZE, true);
        assert_eq!(*outcomes.lock().unwrap(), vec![Err(Errno::EBADF)]);
        assert!(!session.release(42));
        session.interrupt_read(42);
    }

    #[test]
    fn shutdown_joins_the_io_thread() {
        let session = Session::new(config()).unwrap();
        // A plain wake must not terminate the loop.
        session.shared.wake.notify();
        drop(session);
    }

    #[test]
    fn io_thread_completes_parked_reads() {
        let session = Session::new(config()).unwrap();

        let map_path = std::env::temp_dir().join(format!("jshift-session-{}.xml", std::process::id()));
        std::fs::write(&map_path, r#"<config><shift><bset use="0"/></shift></config>"#).unwrap();

        let phys: Arc<dyn jshift_core::Joystick> = Arc::new(OneButton {
            button: Arc::new(Button::new(0x120, 0)),
        });
        let virt = jshift_core::MappedJoystick::new(phys.clone(), &map_path, None).unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        }
        let fh = session.insert(Arc::new(crate::bridge::JsFile::from_parts(
            fds[0], 0, phys, virt,
        )));

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        session.read(fh, Box::new(Sink(outcomes.clone())), 8 * EVENT_SIZE, false);
        assert!(outcomes.lock().unwrap().is_empty());

        let buf = JsEvent {
            time: 5,
            value: 1,
            kind: JS_EVENT_BUTTON,
            number: 0,
        }
        .to_bytes();
        let n = unsafe {
            libc::write(fds[1], buf.as_ptr() as *const std::os::raw::c_void, buf.len())
        };
        assert_eq!(n, buf.len() as isize);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = outcomes.lock().unwrap().first() {
                let data = outcome.as_ref().expect("read should succeed");
                assert_eq!(data.len(), EVENT_SIZE);
                break;
            }
            assert!(Instant::now() < deadline, "parked read never completed");
            thread::sleep(Duration::from_millis(10));
        }

        assert!(session.release(fh));
        unsafe {
            libc::close(fds[1]);
        }
        let _ = std::fs::remove_file(&map_path);
    }

    struct OneButton {
        button: Arc<Button>,
    }

    impl jshift_core::Joystick for OneButton {
        fn name(&self) -> String {
            "One".to_string()
        }

        fn num_axes(&self) -> usize {
            0
        }

        fn num_buttons(&self) -> usize {
            1
        }

        fn axis(&self, _idx: usize) -> Arc<Axis> {
            unreachable!()
        }

        fn button(&self, _idx: usize) -> Arc<Button> {
            self.button.clone()
        }

        fn correction(&self) -> Vec<jshift_core::abi::JsCorr> {
            Vec::new()
        }

        fn set_correction(&self, _corr: &[jshift_core::abi::JsCorr]) {}
    }
}
