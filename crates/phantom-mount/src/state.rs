//! Mount lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// The mount's lifecycle. Transitions only move forward; `Unmounting`
/// is terminal from the IPC router's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MountState {
    Mounting = 0,
    Ready = 1,
    Unmounting = 2,
    MountFailed = 3,
}

impl MountState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Mounting,
            1 => Self::Ready,
            2 => Self::Unmounting,
            _ => Self::MountFailed,
        }
    }

    /// Status string surfaced through `GetStatus`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mounting => "Mounting",
            Self::Ready => "Ready",
            Self::Unmounting => "Unmounting",
            Self::MountFailed => "MountFailed",
        }
    }
}

/// Lock-free state cell shared across tasks.
#[derive(Debug)]
pub struct MountStateCell(AtomicU8);

impl Default for MountStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(MountState::Mounting as u8))
    }
}

impl MountStateCell {
    pub fn get(&self) -> MountState {
        MountState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: MountState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `Unmounting`, returning the prior state so callers can
    /// tell a first unmount from a repeat.
    pub fn begin_unmount(&self) -> MountState {
        let prior = self
            .0
            .swap(MountState::Unmounting as u8, Ordering::AcqRel);
        MountState::from_u8(prior)
    }
}
