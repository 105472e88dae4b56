//! Shared run state and link state

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Process-wide pause flag.
///
/// Only the failure injector raises it and only the end of that same outage
/// clears it; everything else reads.
#[derive(Debug, Default)]
pub struct RunState {
    paused: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// Broker link state as driven by the connection supervisor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Active,
    Paused,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Active => "active",
            LinkState::Paused => "paused",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_toggle() {
        let state = RunState::new();
        assert!(!state.is_paused());
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }

    #[test]
    fn test_link_state_serialization() {
        assert_eq!(LinkState::default(), LinkState::Disconnected);
        assert_eq!(serde_json::to_string(&LinkState::Active).unwrap(), "\"active\"");
        assert_eq!(LinkState::Paused.to_string(), "paused");
    }
}
