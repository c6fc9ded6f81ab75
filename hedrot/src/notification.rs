use std::collections::VecDeque;

pub const MAX_NOTIFICATIONS: usize = 1000;

/// Discrete events reported to the host, drained once per tick.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::FromRepr,
)]
#[repr(u8)]
pub enum Notification {
    PortListUpdated = 1,
    PortOpened = 2,
    WrongFirmwareVersion = 3,
    StatusChanged = 4,
    SettingsTransmissionFailed = 5,
    SettingsReady = 6,
    ExportFailed = 7,
    ImportFailed = 8,
    CalibrationNotValid = 9,
    GyroCalStarted = 10,
    GyroCalFinished = 11,
    MagCalStarted = 21,
    MagCalSucceeded = 22,
    MagCalFailed = 23,
    ExportMagCalRawSamplesFailed = 24,
    AccCalStarted = 31,
    AccCalSucceeded = 32,
    AccCalFailed = 33,
    AccCalPaused = 34,
    AccCalResumed = 35,
    ExportAccCalRawSamplesFailed = 36,
    RtMagCalSucceeded = 40,
    ExportRtMagCalRawSamplesFailed = 41,
    BoardOverload = 50,
}

impl Notification {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Fixed-capacity FIFO. Pushing into a full queue drops the oldest entry,
/// so producers never block and the host always sees the most recent events.
#[derive(Debug, Clone)]
pub struct NotificationQueue<T = Notification> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> NotificationQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_NOTIFICATIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn pull(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for NotificationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_fifo_order() {
        let mut queue = NotificationQueue::new();
        queue.push(Notification::PortOpened);
        queue.push(Notification::StatusChanged);
        assert_eq!(queue.pull(), Some(Notification::PortOpened));
        assert_eq!(queue.pull(), Some(Notification::StatusChanged));
        assert_eq!(queue.pull(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue: NotificationQueue<u32> = NotificationQueue::new();
        for i in 0..1001u32 {
            queue.push(i);
        }
        assert_eq!(queue.len(), MAX_NOTIFICATIONS);
        let pulled: Vec<u32> = std::iter::from_fn(|| queue.pull()).collect();
        assert_eq!(pulled.len(), 1000);
        assert_eq!(pulled, (1..1001).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_codes_round_trip() {
        for n in Notification::iter() {
            assert_eq!(Notification::from_repr(n.code()), Some(n));
        }
        assert_eq!(Notification::from_repr(0), None);
    }
}
