use std::{
    path::{Component, Path},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, types::OverrideMode};

const MAX_EVALUATION_PERIOD_MS: u64 = 1_000;
const MIN_EVALUATION_PERIOD_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationConfig {
    pub api_poll_interval_s: u64,
    pub local_sensor_poll_interval_s: u64,
    pub on_threshold: f64,
    pub off_threshold: f64,
    pub on_delay_s: u64,
    pub off_delay_s: u64,
    pub max_on_time_s: u64,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            api_poll_interval_s: 600,
            local_sensor_poll_interval_s: 1,
            on_threshold: 2.0,
            off_threshold: 1.7,
            on_delay_s: 60,
            off_delay_s: 300,
            max_on_time_s: 300,
        }
    }
}

impl RegulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.on_threshold.is_finite() {
            return Err(ConfigError::NotFinite("on_threshold"));
        }
        if !self.off_threshold.is_finite() {
            return Err(ConfigError::NotFinite("off_threshold"));
        }
        if self.on_threshold <= self.off_threshold {
            return Err(ConfigError::ThresholdsNotOrdered {
                on: self.on_threshold,
                off: self.off_threshold,
            });
        }

        let positive = [
            ("api_poll_interval_s", self.api_poll_interval_s),
            ("local_sensor_poll_interval_s", self.local_sensor_poll_interval_s),
            ("on_delay_s", self.on_delay_s),
            ("off_delay_s", self.off_delay_s),
            ("max_on_time_s", self.max_on_time_s),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }
        Ok(())
    }

    pub fn api_poll_interval(&self) -> Duration {
        Duration::from_secs(self.api_poll_interval_s)
    }

    pub fn local_sensor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.local_sensor_poll_interval_s)
    }

    pub fn on_delay_ms(&self) -> u64 {
        self.on_delay_s.saturating_mul(1_000)
    }

    pub fn off_delay_ms(&self) -> u64 {
        self.off_delay_s.saturating_mul(1_000)
    }

    pub fn max_on_time_ms(&self) -> u64 {
        self.max_on_time_s.saturating_mul(1_000)
    }

    /// Evaluation cadence: at least ten checks per max-on window, never slower than 1 s.
    pub fn evaluation_period(&self) -> Duration {
        let period_ms = (self.max_on_time_ms() / 10)
            .clamp(MIN_EVALUATION_PERIOD_MS, MAX_EVALUATION_PERIOD_MS);
        Duration::from_millis(period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_file: String,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_history_len() -> usize {
    720
}

impl LoggingConfig {
    /// `log_file` is joined onto the data directory, so it may not be empty, absolute or
    /// climb out with `..`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidLogFile(self.log_file.clone());
        if self.log_file.trim().is_empty() {
            return Err(invalid());
        }
        let path = Path::new(&self.log_file);
        let escapes = path.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        let names_file = path
            .components()
            .any(|component| matches!(component, Component::Normal(_)));
        if path.is_absolute() || escapes || !names_file {
            return Err(invalid());
        }
        if self.history_len == 0 {
            return Err(ConfigError::NotPositive("history_len"));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: "log.json".to_string(),
            history_len: default_history_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub regulation: RegulationConfig,
    pub api_station_id: String,
    #[serde(default)]
    pub relay_mode: OverrideMode,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            regulation: RegulationConfig::default(),
            api_station_id: "ARO".to_string(),
            relay_mode: OverrideMode::Auto,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.regulation.validate()?;
        if self.api_station_id.trim().is_empty() {
            return Err(ConfigError::EmptyStation);
        }
        self.logging.validate()
    }
}
