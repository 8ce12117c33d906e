pub mod config;
pub mod error;
pub mod events;
pub mod humidity;
pub mod mode;
pub mod regulation;
pub mod types;

pub use config::{LoggingConfig, RegulationConfig, RuntimeConfig};
pub use error::{ConfigError, DomainError, InvalidModeError, PollError, TransportError};
pub use events::{ControllerEvent, PollSource, SwitchCause};
pub use humidity::absolute_humidity;
pub use mode::ModeController;
pub use regulation::{PendingTransition, RegulationEngine, RegulationStatus};
pub use types::{EnvironmentSnapshot, OverrideMode, RelayState, RelayStatus, SensorReading, Station};
