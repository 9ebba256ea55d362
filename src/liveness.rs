//! Link liveness.
//!
//! The explicit connect/disconnect callbacks and actual data arrival are
//! observed on independent paths and can disagree for a while, so liveness
//! also counts recent data as an implicit "connected" signal.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Default window during which received data counts as liveness.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Explicit link state as reported by transport callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionLiveness {
    state: LinkState,
    last_data_at: Option<DateTime<Local>>,
    window: Duration,
}

impl ConnectionLiveness {
    pub fn new(window: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            last_data_at: None,
            window,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn explicit_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn last_data_at(&self) -> Option<DateTime<Local>> {
        self.last_data_at
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting;
    }

    pub fn on_connect_ack(&mut self, accepted: bool) {
        self.state = if accepted {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
    }

    pub fn on_disconnect(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// Record data arrival. Does not change the explicit state.
    pub fn on_data_received(&mut self, at: DateTime<Local>) {
        self.last_data_at = Some(at);
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(Local::now())
    }

    /// Explicitly connected, or data seen less than `window` before `now`.
    pub fn is_live_at(&self, now: DateTime<Local>) -> bool {
        if self.explicit_connected() {
            return true;
        }
        let Some(last) = self.last_data_at else {
            return false;
        };
        match now.signed_duration_since(last).to_std() {
            Ok(elapsed) => elapsed < self.window,
            // Data stamped after `now`.
            Err(_) => true,
        }
    }
}

impl Default for ConnectionLiveness {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }
}
