use serde::{Deserialize, Serialize};

use crate::types::OverrideMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchCause {
    Regulation,
    ManualOverride,
    SafetyCutoff,
    Emergency,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSource {
    LocalSensor,
    RemoteStation,
}

impl PollSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalSensor => "local_sensor",
            Self::RemoteStation => "remote_station",
        }
    }
}

/// Discrete controller occurrences handed to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    ModeChanged {
        from: OverrideMode,
        to: OverrideMode,
    },
    PendingOnStarted {
        difference: f64,
        threshold: f64,
    },
    PendingOnCancelled {
        difference: Option<f64>,
    },
    PendingOffStarted {
        difference: f64,
        threshold: f64,
    },
    PendingOffCancelled {
        difference: Option<f64>,
    },
    RelayTurnedOn {
        cause: SwitchCause,
    },
    RelayTurnedOff {
        cause: SwitchCause,
    },
    MaxOnTimeExceeded {
        on_for_s: u64,
        mode: OverrideMode,
    },
    PollFailed {
        source: PollSource,
        error: String,
    },
    PollRecovered {
        source: PollSource,
    },
    EmergencyLatched,
    EmergencyCleared,
    ConfigReloaded,
    Shutdown,
}

impl ControllerEvent {
    /// Value of the `event` tag, used for filtering stored logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModeChanged { .. } => "mode_changed",
            Self::PendingOnStarted { .. } => "pending_on_started",
            Self::PendingOnCancelled { .. } => "pending_on_cancelled",
            Self::PendingOffStarted { .. } => "pending_off_started",
            Self::PendingOffCancelled { .. } => "pending_off_cancelled",
            Self::RelayTurnedOn { .. } => "relay_turned_on",
            Self::RelayTurnedOff { .. } => "relay_turned_off",
            Self::MaxOnTimeExceeded { .. } => "max_on_time_exceeded",
            Self::PollFailed { .. } => "poll_failed",
            Self::PollRecovered { .. } => "poll_recovered",
            Self::EmergencyLatched => "emergency_latched",
            Self::EmergencyCleared => "emergency_cleared",
            Self::ConfigReloaded => "config_reloaded",
            Self::Shutdown => "shutdown",
        }
    }
}
