use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock instant captured when a poll call returns.
///
/// Passed through to message callbacks as the receive time of the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_micros(u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn from_micros(micros_since_epoch: u64) -> Self {
        Self { micros_since_epoch }
    }

    pub fn micros_since_epoch(&self) -> u64 {
        self.micros_since_epoch
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.micros_since_epoch)
    }
}

impl fmt::Display for Timestamp {
    /// `seconds.microseconds` since the Unix epoch.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros_since_epoch / 1_000_000,
            self.micros_since_epoch % 1_000_000
        )
    }
}
