use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ventilation_common::{
    ControllerEvent, PollError, PollSource, SensorReading, Station, TransportError,
};

use crate::{
    drivers::{LocalSensor, StationClient},
    service::Shared,
};

/// Upper bound for one provider request; shortened further when the poll period is shorter.
const STATION_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Due times advance from the previous due time, not from when the poll finished.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSchedule {
    next_due: Instant,
}

impl PollSchedule {
    pub(crate) fn starting_at(first_due: Instant) -> Self {
        Self {
            next_due: first_due,
        }
    }

    /// Next due time after `now`; periods that were overrun are skipped.
    pub(crate) fn advance(&mut self, period: Duration, now: Instant) -> Instant {
        self.next_due += period;
        while self.next_due <= now {
            self.next_due += period;
        }
        self.next_due
    }
}

/// Logs every failure but reports only the edges of a failure streak.
#[derive(Debug)]
struct PollHealth {
    source: PollSource,
    failing: bool,
}

impl PollHealth {
    fn new(source: PollSource) -> Self {
        Self {
            source,
            failing: false,
        }
    }

    fn record(&mut self, outcome: &Result<SensorReading, PollError>) -> Option<ControllerEvent> {
        match outcome {
            Ok(_) if self.failing => {
                self.failing = false;
                info!("{} poll recovered", self.source.as_str());
                Some(ControllerEvent::PollRecovered {
                    source: self.source,
                })
            }
            Ok(_) => None,
            Err(err) => {
                warn!("{} poll failed: {err}", self.source.as_str());
                if self.failing {
                    return None;
                }
                self.failing = true;
                Some(ControllerEvent::PollFailed {
                    source: self.source,
                    error: err.to_string(),
                })
            }
        }
    }
}

fn track(shared: &Shared, health: &mut PollHealth, outcome: &Result<SensorReading, PollError>) {
    if let Some(event) = health.record(outcome) {
        shared.set_source_failing(health.source, health.failing);
        shared.emit(event);
    }
}

/// Writes one half of the snapshot. A failed poll keeps the last values flagged invalid.
pub(crate) fn publish(
    shared: &Shared,
    source: PollSource,
    outcome: &Result<SensorReading, PollError>,
) {
    shared.snapshot.send_modify(|snapshot| {
        let slot = match source {
            PollSource::LocalSensor => &mut snapshot.inside,
            PollSource::RemoteStation => &mut snapshot.outside,
        };
        *slot = match outcome {
            Ok(reading) => *reading,
            Err(_) => slot.invalidated(),
        };
    });
}

fn read_local(sensor: &dyn LocalSensor) -> Result<SensorReading, PollError> {
    let sample = sensor.read()?;
    Ok(SensorReading::observe(
        sample.temperature_c,
        sample.relative_humidity_pct,
        Utc::now(),
    )?)
}

async fn fetch_with_timeout(
    client: &dyn StationClient,
    bound: Duration,
) -> Result<Vec<Station>, TransportError> {
    match tokio::time::timeout(bound, client.fetch_stations()).await {
        Ok(fetched) => fetched,
        Err(_) => Err(TransportError::Station(format!(
            "no response within {} ms",
            bound.as_millis()
        ))),
    }
}

fn select_station(stations: &[Station], station_id: &str) -> Result<SensorReading, PollError> {
    let station = stations
        .iter()
        .find(|station| station.id == station_id)
        .ok_or_else(|| TransportError::UnknownStation(station_id.to_string()))?;

    let (Some(temperature_c), Some(relative_humidity_pct)) =
        (station.temperature_c, station.relative_humidity_pct)
    else {
        return Err(TransportError::IncompleteStation(station_id.to_string()).into());
    };

    Ok(SensorReading::observe(
        temperature_c,
        relative_humidity_pct,
        Utc::now(),
    )?)
}

pub(crate) async fn local_sensor_loop(
    shared: Arc<Shared>,
    sensor: Arc<dyn LocalSensor>,
    cancel: CancellationToken,
) {
    let mut schedule = PollSchedule::starting_at(Instant::now());
    let mut health = PollHealth::new(PollSource::LocalSensor);

    loop {
        let outcome = read_local(sensor.as_ref());
        track(&shared, &mut health, &outcome);
        publish(&shared, PollSource::LocalSensor, &outcome);

        let period = shared.config.borrow().regulation.local_sensor_poll_interval();
        let due = schedule.advance(period, Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {}
        }
    }
    debug!("local sensor poller stopped");
}

/// Polls the provider on schedule, and immediately when `api_station_id` changes.
pub(crate) async fn remote_station_loop(
    shared: Arc<Shared>,
    client: Arc<dyn StationClient>,
    cancel: CancellationToken,
) {
    let mut config_rx = shared.config.subscribe();
    let mut station_id = config_rx.borrow_and_update().api_station_id.clone();
    let mut schedule = PollSchedule::starting_at(Instant::now());
    let mut health = PollHealth::new(PollSource::RemoteStation);

    'polling: loop {
        let period = shared.config.borrow().regulation.api_poll_interval();
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = fetch_with_timeout(client.as_ref(), STATION_FETCH_TIMEOUT.min(period)) => fetched,
        };

        let outcome = match fetched {
            Ok(stations) => {
                let outcome = select_station(&stations, &station_id);
                shared.stations.send_replace(stations);
                outcome
            }
            Err(err) => Err(err.into()),
        };
        track(&shared, &mut health, &outcome);
        publish(&shared, PollSource::RemoteStation, &outcome);

        let period = shared.config.borrow().regulation.api_poll_interval();
        let due = schedule.advance(period, Instant::now());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'polling,
                _ = tokio::time::sleep_until(due) => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break 'polling;
                    }
                    let configured = config_rx.borrow_and_update().api_station_id.clone();
                    if configured == station_id {
                        continue;
                    }
                    info!("station changed {station_id} -> {configured}; polling now");
                    station_id = configured;
                    // The old station's values must not drive regulation meanwhile.
                    shared
                        .snapshot
                        .send_modify(|snapshot| snapshot.outside = snapshot.outside.invalidated());
                    schedule = PollSchedule::starting_at(Instant::now());
                    break;
                }
            }
        }
    }
    debug!("remote station poller stopped");
}
