use serde::{Deserialize, Serialize};

use crate::domain::SignalState;

/// Number of stored signals per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    pub pending: usize,
    pub processing: usize,
    pub success: usize,
    pub failed: usize,
}

impl SignalCounts {
    pub fn record(&mut self, state: SignalState) {
        match state {
            SignalState::Pending => self.pending += 1,
            SignalState::Processing => self.processing += 1,
            SignalState::Success => self.success += 1,
            SignalState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.success + self.failed
    }

    /// No signal is waiting or in flight.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
