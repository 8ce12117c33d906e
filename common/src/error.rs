use thiserror::Error;

/// Physically implausible sensor input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("temperature {0} °C is outside the plausible range")]
    TemperatureOutOfRange(f64),
    #[error("relative humidity {0} % is outside 0-100")]
    HumidityOutOfRange(f64),
}

/// Sensor, weather station or relay unreachable, or returned unusable data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("sensor read failed: {0}")]
    Sensor(String),
    #[error("station request failed: {0}")]
    Station(String),
    #[error("station {0} not found in provider response")]
    UnknownStation(String),
    #[error("station {0} reported no temperature or humidity")]
    IncompleteStation(String),
    #[error("relay write failed: {0}")]
    Relay(String),
    #[error("indicator write failed: {0}")]
    Indicator(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("on_threshold ({on}) must be greater than off_threshold ({off})")]
    ThresholdsNotOrdered { on: f64, off: f64 },
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("api_station_id cannot be empty")]
    EmptyStation,
    #[error("log_file '{0}' must be a relative path inside the data directory")]
    InvalidLogFile(String),
    #[error("invalid config payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mode '{0}'; expected Auto, Hand or Aus")]
pub struct InvalidModeError(pub String);

/// Any failure of a single poll; both kinds are recovered by the poller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PollError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
