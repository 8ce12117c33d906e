use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::OverrideMode;

/// Lock-free holder of the operator override.
#[derive(Debug, Default)]
pub struct ModeController {
    mode: AtomicU8,
}

impl ModeController {
    pub fn new(initial: OverrideMode) -> Self {
        Self {
            mode: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn mode(&self) -> OverrideMode {
        OverrideMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Replaces the mode and returns the one it displaced.
    pub fn set_mode(&self, mode: OverrideMode) -> OverrideMode {
        OverrideMode::from_u8(self.mode.swap(mode.to_u8(), Ordering::AcqRel))
    }
}
