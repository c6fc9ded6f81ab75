use std::fmt;
use std::time::Instant;

// --- Basic Types ---
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: f32) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub fn norm_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f32; 3]> for Vector3 {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl From<[i16; 3]> for Vector3 {
    fn from(v: [i16; 3]) -> Self {
        Self::new(v[0] as f32, v[1] as f32, v[2] as f32)
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector3(x={}, y={}, z={})", self.x, self.y, self.z)
    }
}

/// Orientation quaternion, scalar first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn norm_squared(&self) -> f32 {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Inverse of a unit quaternion.
    pub fn conjugate(&self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Display for Quaternion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quaternion(w={}, x={}, y={}, z={})", self.w, self.x, self.y, self.z)
    }
}

/// Tait-Bryan angles in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EulerAngles {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl fmt::Display for EulerAngles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EulerAngles(yaw={}, pitch={}, roll={})", self.yaw, self.pitch, self.roll)
    }
}

// --- Byte channel ---

/// A port the host can see, as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: String,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Error from the serial port layer
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// Plain I/O failure while reading or writing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation needs an open port
    #[error("No port is open")]
    NotOpen,

    /// Port index outside the last enumeration
    #[error("No port with index {0}")]
    NoSuchPort(usize),
}

/// Non-blocking access to the serial link carrying the head-tracker stream.
///
/// The channel owns at most one open port at a time. None of the methods may
/// block waiting for data: `read` returns an empty buffer when nothing is
/// pending and reserves `Err` for genuine I/O failures.
pub trait ByteChannel {
    fn enumerate(&mut self) -> Vec<PortDescriptor>;

    fn open(&mut self, port: &PortDescriptor, baud_rate: u32) -> Result<(), ChannelError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn write(&mut self, bytes: &[u8]) -> Result<usize, ChannelError>;

    /// True when bytes are waiting to be read.
    fn readable(&mut self) -> bool;

    fn read(&mut self) -> Result<Vec<u8>, ChannelError>;
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn enumerate(&mut self) -> Vec<PortDescriptor> {
        (**self).enumerate()
    }

    fn open(&mut self, port: &PortDescriptor, baud_rate: u32) -> Result<(), ChannelError> {
        (**self).open(port, baud_rate)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        (**self).write(bytes)
    }

    fn readable(&mut self) -> bool {
        (**self).readable()
    }

    fn read(&mut self) -> Result<Vec<u8>, ChannelError> {
        (**self).read()
    }
}

// --- Time ---

/// Monotonic time source in seconds, used for ping and autodiscovery deadlines.
pub trait Clock {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quaternion_default_is_identity() {
        assert_eq!(Quaternion::default(), Quaternion::IDENTITY);
        assert_eq!(Quaternion::IDENTITY.norm_squared(), 1.0);
    }

    #[test]
    fn test_conjugate_negates_vector_part() {
        let q = Quaternion::new(0.5, 0.5, -0.5, 0.5);
        assert_eq!(q.conjugate(), Quaternion::new(0.5, -0.5, 0.5, -0.5));
    }

    #[test]
    fn test_vector_from_raw_triple() {
        let v = Vector3::from([100i16, -2, 16384]);
        assert_eq!(v.to_array(), [100.0, -2.0, 16384.0]);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
