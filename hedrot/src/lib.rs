//! Receiver side of the hedrot head tracker.
//!
//! [`Session`] owns the serial link to one board. The host calls
//! [`Session::tick`] periodically; each tick discovers or keeps the device
//! alive, decodes the pending bytes, runs every complete frame through the
//! [`FusionEngine`] and feeds the calibration corpora. Discrete events are
//! drained with [`Session::pull_notification`].
//!
//! ## Features
//!
//! - `mock`: in-memory [`ByteChannel`] and [`Clock`] for hardware-free testing

pub mod calibration;
pub mod fusion;
pub mod math;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod notification;
pub mod protocol;
pub mod session;
pub mod settings;

pub use calibration::realtime::{RtMagCalibration, RtMagStrategy, RtPhase, RtUpdate};
pub use calibration::{
    CalibrationData, CalibrationError, CalibrationResult, CalibrationSummary,
    OfflineCalibrationMethod,
};
pub use fusion::{FusionEngine, FusionOutput, FusionParams, GyroCalState, SensorCalibration};
pub use hedrot_traits::{
    ByteChannel, ChannelError, Clock, EulerAngles, MonotonicClock, PortDescriptor, Quaternion,
    Vector3,
};
pub use notification::{Notification, NotificationQueue};
pub use protocol::{CalibrationVector, RawFrame, Register};
pub use session::{CalibrationTarget, CommunicationState, Session};
pub use settings::{
    AxesReference, DeviceSettings, ReceiverSettings, RotationOrder, RtMagSettings, SettingsError,
};

#[derive(Debug, thiserror::Error)]
pub enum HedrotError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation needs a device that completed the handshake
    #[error("No device connected")]
    NotConnected,

    /// A command could not be written; the session was reinitialized
    #[error("Write to the device failed")]
    WriteFailed,
}

pub type Result<T> = std::result::Result<T, HedrotError>;
