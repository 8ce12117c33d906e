use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tracing::info;

use ventilation_common::{RelayState, Station, TransportError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature_c: f64,
    pub relative_humidity_pct: f64,
}

/// Indoor temperature/humidity sensor. Reads are short and synchronous.
pub trait LocalSensor: Send + Sync {
    fn read(&self) -> Result<SensorSample, TransportError>;
}

/// Remote weather provider returning every station it knows.
#[async_trait]
pub trait StationClient: Send + Sync {
    async fn fetch_stations(&self) -> Result<Vec<Station>, TransportError>;
}

/// Exhaust fan relay output.
pub trait RelayDriver: Send + Sync {
    fn apply(&self, state: RelayState) -> Result<(), TransportError>;

    /// Idempotent; called on shutdown whatever the last applied state was.
    fn de_energize(&self) -> Result<(), TransportError> {
        self.apply(RelayState::Off)
    }
}

/// Run and fault lamps on the controller front panel.
pub trait IndicatorDriver: Send + Sync {
    fn set_run(&self, on: bool) -> Result<(), TransportError>;
    fn set_fault(&self, on: bool) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct Drivers {
    pub sensor: Arc<dyn LocalSensor>,
    pub stations: Arc<dyn StationClient>,
    pub relay: Arc<dyn RelayDriver>,
    pub indicator: Arc<dyn IndicatorDriver>,
}

impl Drivers {
    pub fn simulated() -> Self {
        Self {
            sensor: Arc::new(SimulatedSensor::default()),
            stations: Arc::new(SimulatedStationFeed::default()),
            relay: Arc::new(TracingRelay::default()),
            indicator: Arc::new(TracingIndicator::default()),
        }
    }
}

// Hardware integration point: replace with an SHT31 driver on the target board.
#[derive(Debug, Default)]
pub struct SimulatedSensor {
    tick: AtomicU64,
}

impl LocalSensor for SimulatedSensor {
    fn read(&self) -> Result<SensorSample, TransportError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        Ok(SensorSample {
            temperature_c: 19.0 + (tick % 8) as f64 * 0.2,
            relative_humidity_pct: 64.0 + (tick % 6) as f64 * 0.5,
        })
    }
}

#[derive(Debug, Default)]
pub struct SimulatedStationFeed {
    tick: AtomicU64,
}

#[async_trait]
impl StationClient for SimulatedStationFeed {
    async fn fetch_stations(&self) -> Result<Vec<Station>, TransportError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        let drift = (tick % 5.0) * 0.3;

        Ok(vec![
            Station {
                id: "ARO".to_string(),
                name: "Arosa".to_string(),
                temperature_c: Some(4.0 + drift),
                relative_humidity_pct: Some(78.0 - drift),
                coordinates: Some([9.68, 46.79]),
            },
            Station {
                id: "SMA".to_string(),
                name: "Zürich / Fluntern".to_string(),
                temperature_c: Some(9.5 + drift),
                relative_humidity_pct: Some(71.0),
                coordinates: Some([8.57, 47.38]),
            },
            Station {
                id: "BER".to_string(),
                name: "Bern / Zollikofen".to_string(),
                temperature_c: Some(8.1 - drift),
                relative_humidity_pct: Some(83.0),
                coordinates: Some([7.46, 46.99]),
            },
        ])
    }
}

/// Logs relay writes instead of driving a GPIO line.
#[derive(Debug, Default)]
pub struct TracingRelay {
    energized: AtomicBool,
}

impl RelayDriver for TracingRelay {
    fn apply(&self, state: RelayState) -> Result<(), TransportError> {
        let on = state.is_on();
        if self.energized.swap(on, Ordering::Relaxed) != on {
            info!("relay output set {}", state.as_str());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingIndicator {
    run: AtomicBool,
    fault: AtomicBool,
}

impl IndicatorDriver for TracingIndicator {
    fn set_run(&self, on: bool) -> Result<(), TransportError> {
        if self.run.swap(on, Ordering::Relaxed) != on {
            info!("run lamp {}", if on { "on" } else { "off" });
        }
        Ok(())
    }

    fn set_fault(&self, on: bool) -> Result<(), TransportError> {
        if self.fault.swap(on, Ordering::Relaxed) != on {
            info!("fault lamp {}", if on { "on" } else { "off" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ventilation_common::absolute_humidity;

    #[test]
    fn simulated_sensor_stays_plausible() {
        let sensor = SimulatedSensor::default();
        for _ in 0..50 {
            let sample = sensor.read().unwrap();
            assert!(absolute_humidity(sample.temperature_c, sample.relative_humidity_pct).is_ok());
        }
    }

    #[tokio::test]
    async fn simulated_feed_contains_default_station() {
        let stations = SimulatedStationFeed::default().fetch_stations().await.unwrap();
        assert!(stations.iter().any(|station| station.id == "ARO"));
    }

    #[test]
    fn indicator_tracks_lamp_state() {
        let indicator = TracingIndicator::default();

        indicator.set_run(true).unwrap();
        indicator.set_fault(true).unwrap();
        indicator.set_fault(false).unwrap();

        assert!(indicator.run.load(Ordering::Relaxed));
        assert!(!indicator.fault.load(Ordering::Relaxed));
    }

    #[test]
    fn de_energize_is_idempotent() {
        let relay = TracingRelay::default();
        relay.apply(RelayState::On).unwrap();

        relay.de_energize().unwrap();
        relay.de_energize().unwrap();

        assert!(!relay.energized.load(Ordering::Relaxed));
    }
}
