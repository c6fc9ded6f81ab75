//! In-memory stand-ins for the serial link and the wall clock.
//!
//! `MockChannel` keeps its state behind an `Rc<RefCell<..>>` so a test can
//! keep a handle on it after moving a clone into a [`Session`](crate::Session).
//! Only built for tests or with the `mock` feature.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use hedrot_traits::{ByteChannel, ChannelError, Clock, PortDescriptor};

use crate::protocol::{
    RawFrame, H2R_END_OF_FRAME, H2R_I_AM_THERE, H2R_START_TRANSMIT_INFO, H2R_STOP_TRANSMIT_INFO,
    R2H_ARE_YOU_THERE,
};

#[derive(Debug, Default)]
pub struct MockState {
    pub ports: Vec<PortDescriptor>,
    pub open_port: Option<String>,
    /// Every port name passed to `open`, successful or not.
    pub open_attempts: Vec<String>,
    pub close_count: usize,
    pub written: Vec<u8>,
    pub incoming: VecDeque<Vec<u8>>,
    /// Port answering `ARE_YOU_THERE` with `I_AM_THERE`.
    pub responding_port: Option<String>,
    pub failing_ports: Vec<String>,
    pub fail_writes: bool,
    pub fail_reads: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Rc<RefCell<MockState>>,
}

impl MockChannel {
    pub fn new<S: AsRef<str>>(ports: &[S]) -> Self {
        let channel = Self::default();
        channel.state.borrow_mut().ports = ports
            .iter()
            .map(|p| PortDescriptor::new(p.as_ref()))
            .collect();
        channel
    }

    /// Queues one chunk, returned by a single `read` call. Chunks queued
    /// together stand for bytes arriving between reads.
    pub fn push_incoming(&self, bytes: impl Into<Vec<u8>>) {
        self.state.borrow_mut().incoming.push_back(bytes.into());
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().written)
    }

    pub fn open_port(&self) -> Option<String> {
        self.state.borrow().open_port.clone()
    }

    pub fn open_attempts(&self) -> Vec<String> {
        self.state.borrow().open_attempts.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.borrow().close_count
    }

    pub fn set_responding_port(&self, name: Option<&str>) {
        self.state.borrow_mut().responding_port = name.map(str::to_owned);
    }

    pub fn set_port_failing(&self, name: &str) {
        self.state.borrow_mut().failing_ports.push(name.to_owned());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }
}

impl ByteChannel for MockChannel {
    fn enumerate(&mut self) -> Vec<PortDescriptor> {
        self.state.borrow().ports.clone()
    }

    fn open(&mut self, port: &PortDescriptor, _baud_rate: u32) -> Result<(), ChannelError> {
        let mut state = self.state.borrow_mut();
        state.open_attempts.push(port.name.clone());
        if state.failing_ports.contains(&port.name) {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cannot open {}", port.name),
            )));
        }
        state.open_port = Some(port.name.clone());
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.open_port.take().is_some() {
            state.close_count += 1;
        }
        state.incoming.clear();
    }

    fn is_open(&self) -> bool {
        self.state.borrow().open_port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let mut state = self.state.borrow_mut();
        if state.open_port.is_none() {
            return Err(ChannelError::NotOpen);
        }
        if state.fail_writes {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            )));
        }
        state.written.extend_from_slice(bytes);
        if bytes == [R2H_ARE_YOU_THERE] && state.open_port == state.responding_port {
            state.incoming.push_back(vec![H2R_I_AM_THERE]);
        }
        Ok(bytes.len())
    }

    fn readable(&mut self) -> bool {
        let state = self.state.borrow();
        state.open_port.is_some() && (state.fail_reads || !state.incoming.is_empty())
    }

    fn read(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.state.borrow_mut();
        if state.open_port.is_none() {
            return Err(ChannelError::NotOpen);
        }
        if state.fail_reads {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "read failed",
            )));
        }
        Ok(state.incoming.pop_front().unwrap_or_default())
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.now.set(seconds);
    }

    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }
}

/// Handshake bytes as the board sends them: start marker, `key value,`
/// pairs, stop marker.
pub fn info_bytes(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut bytes = vec![H2R_START_TRANSMIT_INFO];
    for (key, value) in pairs {
        bytes.extend_from_slice(format!("{} {},", key, value).as_bytes());
    }
    bytes.push(H2R_STOP_TRANSMIT_INFO);
    bytes
}

/// A minimal handshake a firmware 10 board would send at 1000 Hz.
pub fn default_info_pairs() -> Vec<(&'static str, &'static str)> {
    vec![
        ("firmware_version", "10"),
        ("samplerate", "1000"),
        ("gyroHalfScaleSensitivity", "2000"),
        ("gyroBitDepth", "16"),
        ("accOffset", "0.0 0.0 0.0"),
        ("accScaling", "16384.0 16384.0 16384.0"),
        ("magOffset", "0.0 0.0 0.0"),
        ("magScaling", "100.0 100.0 100.0"),
    ]
}

/// Encoded frame followed by the end-of-frame marker.
pub fn frame_bytes(frame: &RawFrame) -> Vec<u8> {
    let mut bytes = frame.encode().to_vec();
    bytes.push(H2R_END_OF_FRAME);
    bytes
}
