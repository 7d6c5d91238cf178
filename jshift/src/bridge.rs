// Copyright 2024 jshift Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-descriptor event bridge.
//!
//! Every open on the virtual device gets its own [`JsFile`]: its own
//! descriptor on the real joystick, its own parse of the map, and its own
//! event queue. Physical events are drained from the FD, fanned through the
//! input graph, and whatever falls out of the virtual buttons and axes is
//! queued for the client in kernel joystick order.

use std::collections::VecDeque;
use std::error;
use std::ffi::CString;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::raw::c_void;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use libc as c;
use log::warn;
use nix::errno::Errno;

use jshift_core::abi::{
    self, JsCorr, JsEvent, CORR_SIZE, EVENT_SIZE, JS_EVENT_AXIS, JS_EVENT_BUTTON, JS_EVENT_INIT,
};
use jshift_core::{DeviceJoystick, Joystick, MapError, MappedJoystick};

use crate::host::{IoctlReply, PollHandle, ReadReply};
use crate::session::SessionConfig;
use crate::wakepipe::WakePipe;

/// Why a descriptor could not be opened. The host reports these as "cannot
/// open device"; they never bring the daemon down.
#[derive(Debug)]
pub enum OpenError {
    /// The real joystick could not be opened.
    Device(io::Error),
    /// The map was rejected.
    Map(MapError),
}

impl Display for OpenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::Device(e) => write!(f, "can't open input device: {}", e),
            OpenError::Map(e) => e.fmt(f),
        }
    }
}

impl error::Error for OpenError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            OpenError::Device(e) => Some(e),
            OpenError::Map(e) => Some(e),
        }
    }
}

impl From<MapError> for OpenError {
    fn from(e: MapError) -> Self {
        OpenError::Map(e)
    }
}

struct ParkedRead {
    reply: Box<dyn ReadReply>,
    size: usize,
}

struct FileState {
    read_req: Option<ParkedRead>,
    poll_handle: Option<Box<dyn PollHandle>>,
    phys: Arc<dyn Joystick>,
    virt: MappedJoystick,
}

/// One open descriptor on the virtual joystick.
pub struct JsFile {
    fd: RawFd,
    version: u32,
    /// Outbound queue; its own lock because the sink slots push into it
    /// while the graph is driven under the state lock.
    events: Arc<Mutex<VecDeque<JsEvent>>>,
    state: Mutex<FileState>,
}

impl JsFile {
    /// Opens the real device, parses the map and wires the event sinks.
    pub fn open(config: &SessionConfig) -> Result<JsFile, OpenError> {
        let path = CString::new(config.indev.as_os_str().as_bytes()).map_err(|_| {
            OpenError::Device(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device path contains NUL",
            ))
        })?;
        let fd = unsafe { c::open(path.as_ptr(), c::O_RDONLY | c::O_NONBLOCK) };
        if fd < 0 {
            return Err(OpenError::Device(io::Error::last_os_error()));
        }

        let version = DeviceJoystick::driver_version(fd);
        let phys: Arc<dyn Joystick> = Arc::new(DeviceJoystick::from_fd(fd));
        let virt = match MappedJoystick::new(phys.clone(), &config.config, config.calibrated.clone())
        {
            Ok(virt) => virt,
            Err(e) => {
                unsafe {
                    c::close(fd);
                }
                return Err(e.into());
            }
        };

        Ok(Self::from_parts(fd, version, phys, virt))
    }

    /// Assembles a bridge from its pieces and subscribes an event sink on
    /// every virtual button and axis. Takes ownership of `fd`.
    pub(crate) fn from_parts(
        fd: RawFd,
        version: u32,
        phys: Arc<dyn Joystick>,
        virt: MappedJoystick,
    ) -> JsFile {
        let events: Arc<Mutex<VecDeque<JsEvent>>> = Arc::default();

        for i in 0..virt.num_buttons() {
            let queue = events.clone();
            virt.button(i).connect(move |time, value, init| {
                queue.lock().unwrap().push_back(JsEvent {
                    time,
                    value,
                    kind: JS_EVENT_BUTTON | if init { JS_EVENT_INIT } else { 0 },
                    number: i as u8,
                });
            });
        }
        for i in 0..virt.num_axes() {
            let queue = events.clone();
            virt.axis(i).connect(move |time, value, init| {
                queue.lock().unwrap().push_back(JsEvent {
                    time,
                    value,
                    kind: JS_EVENT_AXIS | if init { JS_EVENT_INIT } else { 0 },
                    number: i as u8,
                });
            });
        }

        JsFile {
            fd,
            version,
            events,
            state: Mutex::new(FileState {
                read_req: None,
                poll_handle: None,
                phys,
                virt,
            }),
        }
    }

    /// The real device's descriptor, multiplexed over by the I/O thread.
    pub fn input_fd(&self) -> RawFd {
        self.fd
    }

    /// Whether the I/O thread should watch our FD: a read is parked or a
    /// poll waiter wants to hear about input.
    pub fn want_input(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.read_req.is_some() || st.poll_handle.is_some()
    }

    /// Routes one physical event into the graph.
    fn route(phys: &dyn Joystick, event: JsEvent) {
        let init = event.kind & JS_EVENT_INIT != 0;
        let number = event.number as usize;
        match event.kind & !JS_EVENT_INIT {
            JS_EVENT_BUTTON => {
                if number < phys.num_buttons() {
                    phys.button(number).input(event.time, event.value, init);
                }
            }
            JS_EVENT_AXIS => {
                if number < phys.num_axes() {
                    phys.axis(number).input(event.time, event.value, init);
                }
            }
            _ => {}
        }
    }

    /// Drains the non-blocking FD completely; read errors end the drain and
    /// whatever was queued so far is still delivered.
    fn read_all_input(&self, st: &FileState) {
        let mut buf = [0u8; EVENT_SIZE];
        loop {
            let n = unsafe { c::read(self.fd, buf.as_mut_ptr() as *mut c_void, EVENT_SIZE) };
            if n != EVENT_SIZE as isize {
                break;
            }
            Self::route(&*st.phys, JsEvent::from_bytes(&buf));
        }
    }

    /// Completes the parked read if at least one event fits. The queue is
    /// stably sorted by `(time, type, number)` first, matching kernel
    /// delivery order.
    fn attempt_output(&self, st: &mut FileState) -> bool {
        let wanted = match &st.read_req {
            Some(park) => park.size / EVENT_SIZE,
            None => return false,
        };

        let mut events = self.events.lock().unwrap();
        events
            .make_contiguous()
            .sort_by_key(|e| (e.time, e.kind, e.number));

        let count = wanted.min(events.len());
        if count == 0 {
            return false;
        }

        let park = match st.read_req.take() {
            Some(park) => park,
            None => return false,
        };
        let mut buf = Vec::with_capacity(count * EVENT_SIZE);
        for event in events.drain(..count) {
            buf.extend_from_slice(&event.to_bytes());
        }
        drop(events);

        park.reply.data(&buf);
        true
    }

    /// Client `read`. Parks when nothing is available on a blocking
    /// descriptor; the host cancels a parked read through
    /// [`JsFile::interrupt_read`].
    pub fn read(&self, reply: Box<dyn ReadReply>, size: usize, nonblock: bool, wake: &WakePipe) {
        let mut st = self.state.lock().unwrap();

        if size < EVENT_SIZE {
            // Not even one event fits: an empty read, nothing consumed.
            reply.data(&[]);
            return;
        }

        if let Some(prev) = st.read_req.replace(ParkedRead { reply, size }) {
            warn!("new read replaces a parked one");
            prev.reply.error(Errno::EINTR);
        }

        self.read_all_input(&st);
        if self.attempt_output(&mut st) {
            return;
        }

        if nonblock {
            if let Some(park) = st.read_req.take() {
                park.reply.error(Errno::EWOULDBLOCK);
            }
            return;
        }

        // Stay parked; make sure the I/O thread has seen us.
        wake.notify();
    }

    /// Client `poll`. A newer handle replaces (and thereby releases) the
    /// previous one.
    pub fn poll(
        &self,
        reply: Box<dyn crate::host::PollReply>,
        handle: Option<Box<dyn PollHandle>>,
        wake: &WakePipe,
    ) {
        let mut st = self.state.lock().unwrap();

        if let Some(handle) = handle {
            st.poll_handle = Some(handle);
        }

        let mut revents = 0;
        if !self.events.lock().unwrap().is_empty() {
            revents |= c::POLLIN as u32;
        }
        reply.reply(revents);

        if st.poll_handle.is_some() {
            // The host wants to know when more input is available.
            wake.notify();
        }
    }

    /// Called by the I/O thread when the real device became readable.
    pub fn read_available(&self) {
        let mut st = self.state.lock().unwrap();

        self.read_all_input(&st);

        if !self.events.lock().unwrap().is_empty() {
            if let Some(handle) = st.poll_handle.take() {
                handle.notify();
            }
        }

        if st.read_req.is_some() {
            self.attempt_output(&mut st);
        }
    }

    /// The host's cancellation path for a parked read.
    pub fn interrupt_read(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(park) = st.read_req.take() {
            park.reply.error(Errno::EINTR);
        }
    }

    /// Client `ioctl`, the fixed joystick set. Unknown commands are invalid.
    ///
    /// Replies follow the host's two-phase protocol: while the client buffer
    /// is not mapped yet (`out_size`/`in_buf` empty), the bridge answers
    /// with the buffer size it needs and the host retries.
    pub fn ioctl(&self, cmd: u32, in_buf: &[u8], out_size: usize, reply: Box<dyn IoctlReply>) {
        const NAME: u32 = abi::strip_size(abi::jsiocgname(0));
        const VERSION: u32 = abi::strip_size(abi::JSIOCGVERSION);
        const AXES: u32 = abi::strip_size(abi::JSIOCGAXES);
        const BUTTONS: u32 = abi::strip_size(abi::JSIOCGBUTTONS);
        const AXMAP: u32 = abi::strip_size(abi::JSIOCGAXMAP);
        const BTNMAP: u32 = abi::strip_size(abi::JSIOCGBTNMAP);
        const GCORR: u32 = abi::strip_size(abi::JSIOCGCORR);
        const SCORR: u32 = abi::strip_size(abi::JSIOCSCORR);

        let st = self.state.lock().unwrap();
        let cmd_size = abi::ioc_size(cmd);

        match abi::strip_size(cmd) {
            NAME => {
                let name = st.virt.name();
                let len = if name.is_empty() { 0 } else { name.len() + 1 };
                if out_size == 0 {
                    reply.retry_read(len);
                } else {
                    let mut buf = name.into_bytes();
                    if !buf.is_empty() {
                        buf.push(0);
                    }
                    reply.data(&buf);
                }
            }
            VERSION => {
                if out_size == 0 {
                    reply.retry_read(4);
                } else {
                    reply.data(&self.version.to_ne_bytes());
                }
            }
            AXES => {
                if out_size == 0 {
                    reply.retry_read(1);
                } else {
                    reply.data(&[st.virt.num_axes() as u8]);
                }
            }
            BUTTONS => {
                if out_size == 0 {
                    reply.retry_read(1);
                } else {
                    reply.data(&[st.virt.num_buttons() as u8]);
                }
            }
            AXMAP => {
                if out_size == 0 {
                    reply.retry_read(cmd_size);
                } else {
                    let mut buf = vec![0u8; cmd_size];
                    let fill = cmd_size.min(st.virt.num_axes());
                    for (i, slot) in buf[..fill].iter_mut().enumerate() {
                        *slot = st.virt.axis(i).code();
                    }
                    reply.data(&buf);
                }
            }
            BTNMAP => {
                if out_size == 0 {
                    reply.retry_read(cmd_size);
                } else {
                    let mut buf = vec![0u8; cmd_size];
                    let fill = (cmd_size / 2).min(st.virt.num_buttons());
                    for i in 0..fill {
                        buf[i * 2..i * 2 + 2]
                            .copy_from_slice(&st.virt.button(i).code().to_ne_bytes());
                    }
                    reply.data(&buf);
                }
            }
            GCORR => {
                let len = st.virt.num_axes() * CORR_SIZE;
                if out_size < len {
                    reply.retry_read(len);
                } else {
                    let mut buf = Vec::with_capacity(len);
                    for corr in st.virt.correction() {
                        buf.extend_from_slice(&corr.to_bytes());
                    }
                    reply.data(&buf);
                }
            }
            SCORR => {
                let len = st.virt.num_axes() * CORR_SIZE;
                if in_buf.len() < len {
                    reply.retry_write(len);
                } else {
                    let corr: Vec<JsCorr> = in_buf[..len]
                        .chunks_exact(CORR_SIZE)
                        .map(|chunk| JsCorr::from_bytes(chunk.try_into().unwrap()))
                        .collect();
                    st.virt.set_correction(&corr);
                    reply.data(&[]);
                }
            }
            _ => {
                warn!("unknown ioctl {:#010x}", cmd);
                reply.error(Errno::EINVAL);
            }
        }
    }
}

impl Drop for JsFile {
    fn drop(&mut self) {
        unsafe {
            c::close(self.fd);
        }
    }
}

impl fmt::Debug for JsFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsFile")
            .field("fd", &self.fd)
            .field("version", &self.version)
            .field("queued", &self.events.lock().unwrap().len())
            .finish()
    }
}
