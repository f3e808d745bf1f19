use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle stage of a spawned process.
///
/// Ordered so that a later stage compares greater than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessStatus {
    /// Process requested, pid not yet known
    Starting = 0,
    /// Pid known and stdio live
    Running = 1,
    /// Exit code known or process forcibly killed
    Ended = 2,
}

impl ProcessStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessStatus::Starting,
            1 => ProcessStatus::Running,
            _ => ProcessStatus::Ended,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Monotonic status storage. `advance` never moves the status backwards.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self(AtomicU8::new(ProcessStatus::Starting as u8))
    }
}

impl StatusCell {
    pub fn get(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if it is later than the current stage.
    ///
    /// Returns the stage that was stored before the call.
    pub fn advance(&self, next: ProcessStatus) -> ProcessStatus {
        ProcessStatus::from_u8(self.0.fetch_max(next as u8, Ordering::AcqRel))
    }
}
