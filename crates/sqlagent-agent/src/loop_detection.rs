//! Detects a run that keeps failing the same way.

use sqlagent_types::ErrorKind;

/// Counts consecutive attempts that failed with the same error kind.
#[derive(Debug, Clone, Default)]
pub struct ErrorStreak {
    last: Option<ErrorKind>,
    count: u32,
}

impl ErrorStreak {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and return the current streak length (>= 1).
    pub fn record(&mut self, kind: ErrorKind) -> u32 {
        if self.last == Some(kind) {
            self.count += 1;
        } else {
            self.last = Some(kind);
            self.count = 1;
        }
        self.count
    }

    pub fn last(&self) -> Option<ErrorKind> {
        self.last
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
