use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DomainError, InvalidModeError},
    humidity::absolute_humidity,
};

/// Operator override. `Hand` forces the relay on, `Aus` forces it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverrideMode {
    #[default]
    Auto,
    Hand,
    Aus,
}

impl OverrideMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::Hand => "Hand",
            Self::Aus => "Aus",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Hand => 1,
            Self::Aus => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Hand,
            2 => Self::Aus,
            _ => Self::Auto,
        }
    }
}

impl fmt::Display for OverrideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideMode {
    type Err = InvalidModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Auto" => Ok(Self::Auto),
            "Hand" => Ok(Self::Hand),
            "Aus" => Ok(Self::Aus),
            other => Err(InvalidModeError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    #[default]
    Off,
    On,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Relay position plus the monotonic millisecond at which it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct RelayStatus {
    pub state: RelayState,
    pub since_ms: u64,
}

impl RelayStatus {
    pub fn on_for_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            RelayState::On => now_ms.saturating_sub(self.since_ms),
            RelayState::Off => 0,
        }
    }
}

/// A temperature/humidity observation. Absolute humidity is derived on construction
/// and cannot be set independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct SensorReading {
    temperature_c: f64,
    relative_humidity_pct: f64,
    absolute_humidity: f64,
    observed_at: Option<DateTime<Utc>>,
    valid: bool,
}

impl SensorReading {
    /// Placeholder before the first successful poll.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn observe(
        temperature_c: f64,
        relative_humidity_pct: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let absolute_humidity = absolute_humidity(temperature_c, relative_humidity_pct)?;
        Ok(Self {
            temperature_c,
            relative_humidity_pct,
            absolute_humidity,
            observed_at: Some(observed_at),
            valid: true,
        })
    }

    /// Keeps the last good values but flags the reading as failed.
    pub fn invalidated(&self) -> Self {
        Self {
            valid: false,
            ..*self
        }
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn relative_humidity_pct(&self) -> f64 {
        self.relative_humidity_pct
    }

    pub fn absolute_humidity(&self) -> f64 {
        self.absolute_humidity
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// True once any poll has succeeded, even if the latest one failed.
    pub fn has_value(&self) -> bool {
        self.observed_at.is_some()
    }

    #[cfg(test)]
    pub(crate) fn with_absolute_humidity(absolute_humidity: f64) -> Self {
        Self {
            temperature_c: 20.0,
            relative_humidity_pct: 50.0,
            absolute_humidity,
            observed_at: Some(Utc::now()),
            valid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct EnvironmentSnapshot {
    pub inside: SensorReading,
    pub outside: SensorReading,
}

impl EnvironmentSnapshot {
    pub fn difference(&self) -> Option<f64> {
        if self.inside.has_value() && self.outside.has_value() {
            Some(self.inside.absolute_humidity - self.outside.absolute_humidity)
        } else {
            None
        }
    }
}

/// One entry of the remote provider's station list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub temperature_c: Option<f64>,
    pub relative_humidity_pct: Option<f64>,
    pub coordinates: Option<[f64; 2]>,
}
