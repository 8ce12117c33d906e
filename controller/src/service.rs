use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ventilation_common::{
    ConfigError, ControllerEvent, EnvironmentSnapshot, ModeController, OverrideMode,
    PollSource, RegulationConfig, RegulationEngine, RegulationStatus, RelayState, RuntimeConfig,
    SensorReading, Station,
};

use crate::{
    drivers::{Drivers, IndicatorDriver, RelayDriver},
    sources::{local_sensor_loop, remote_station_loop},
    store::EventLog,
};

/// How long `force_off` waits for the evaluation task to take over the latch.
const EMERGENCY_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the pollers, the evaluation task and the HTTP handlers. Every watch
/// channel has exactly one writing task, except `emergency`, which only handlers write.
pub(crate) struct Shared {
    pub(crate) snapshot: watch::Sender<EnvironmentSnapshot>,
    pub(crate) regulation: watch::Sender<RegulationStatus>,
    pub(crate) config: watch::Sender<RuntimeConfig>,
    pub(crate) stations: watch::Sender<Vec<Station>>,
    pub(crate) mode: ModeController,
    emergency: watch::Sender<bool>,
    mode_changed: Notify,
    indicator: Arc<dyn IndicatorDriver>,
    failing_sources: Mutex<u8>,
    history: Mutex<VecDeque<DashboardPoint>>,
    events: EventLog,
    clock_origin: Instant,
}

impl Shared {
    pub(crate) fn new(
        config: RuntimeConfig,
        events: EventLog,
        indicator: Arc<dyn IndicatorDriver>,
    ) -> Arc<Self> {
        let history_len = config.logging.history_len;
        Arc::new(Self {
            snapshot: watch::Sender::new(EnvironmentSnapshot::default()),
            regulation: watch::Sender::new(RegulationStatus::default()),
            mode: ModeController::new(config.relay_mode),
            config: watch::Sender::new(config),
            stations: watch::Sender::new(Vec::new()),
            emergency: watch::Sender::new(false),
            mode_changed: Notify::new(),
            indicator,
            failing_sources: Mutex::new(0),
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            events,
            clock_origin: Instant::now(),
        })
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock_origin
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        debug!(event = event.name(), "controller event");
        self.events.emit(event);
    }

    fn emit_all(&self, events: Vec<ControllerEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// The fault lamp is lit while either poller is in a failure streak.
    pub(crate) fn set_source_failing(&self, source: PollSource, failing: bool) {
        let bit = match source {
            PollSource::LocalSensor => 0b01,
            PollSource::RemoteStation => 0b10,
        };
        let fault = {
            let mut mask = self
                .failing_sources
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if failing {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
            *mask != 0
        };
        if let Err(err) = self.indicator.set_fault(fault) {
            warn!("failed to set fault lamp: {err}");
        }
    }

    fn fault(&self) -> bool {
        *self
            .failing_sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            != 0
    }

    fn record_history(&self, point: DashboardPoint) {
        let capacity = self.config.borrow().logging.history_len;
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(point);
        while history.len() > capacity {
            history.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DashboardPoint {
    pub timestamp: DateTime<Utc>,
    pub inside: SensorReading,
    pub outside: SensorReading,
    pub difference: Option<f64>,
    pub relay: RelayState,
    pub mode: OverrideMode,
}

#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub snapshot: EnvironmentSnapshot,
    pub regulation: RegulationStatus,
    pub mode: OverrideMode,
    pub station_id: String,
    pub station_name: Option<String>,
    pub relay_on_for_s: u64,
    pub pending_elapsed_s: Option<u64>,
    pub fault: bool,
}

pub struct ControllerService {
    shared: Arc<Shared>,
    relay: Arc<dyn RelayDriver>,
    indicator: Arc<dyn IndicatorDriver>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControllerService {
    /// Validates `config` and spawns the two pollers plus the evaluation task.
    pub fn start(
        config: RuntimeConfig,
        drivers: Drivers,
        events: EventLog,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Shared::new(config, events, drivers.indicator.clone());
        let cancel = CancellationToken::new();

        if let Err(err) = drivers
            .indicator
            .set_run(true)
            .and_then(|()| drivers.indicator.set_fault(false))
        {
            warn!("failed to initialise indicator lamps: {err}");
        }

        let tasks = vec![
            tokio::spawn(local_sensor_loop(
                shared.clone(),
                drivers.sensor,
                cancel.clone(),
            )),
            tokio::spawn(remote_station_loop(
                shared.clone(),
                drivers.stations,
                cancel.clone(),
            )),
            tokio::spawn(evaluation_loop(
                shared.clone(),
                drivers.relay.clone(),
                cancel.clone(),
            )),
        ];
        info!("controller tasks started");

        Ok(Self {
            shared,
            relay: drivers.relay,
            indicator: drivers.indicator,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn current_status(&self) -> ControllerStatus {
        let now_ms = self.shared.now_ms();
        let snapshot = *self.shared.snapshot.borrow();
        let regulation = *self.shared.regulation.borrow();
        let station_id = self.shared.config.borrow().api_station_id.clone();
        let station_name = self
            .shared
            .stations
            .borrow()
            .iter()
            .find(|station| station.id == station_id)
            .map(|station| station.name.clone());

        ControllerStatus {
            snapshot,
            regulation,
            mode: self.shared.mode.mode(),
            station_id,
            station_name,
            relay_on_for_s: regulation.relay.on_for_ms(now_ms) / 1_000,
            pending_elapsed_s: regulation
                .pending
                .map(|pending| pending.elapsed_ms(now_ms) / 1_000),
            fault: self.shared.fault(),
        }
    }

    pub fn mode(&self) -> OverrideMode {
        self.shared.mode.mode()
    }

    /// Applies unconditionally; the evaluation task reacts without waiting for its next tick.
    pub fn set_mode(&self, mode: OverrideMode) -> OverrideMode {
        let previous = self.shared.mode.set_mode(mode);
        if previous != mode {
            info!("mode changed {previous} -> {mode}");
            self.shared
                .emit(ControllerEvent::ModeChanged { from: previous, to: mode });
        }
        self.shared.mode_changed.notify_one();
        previous
    }

    /// Emergency stop. The output is de-energized right away and held off in every mode
    /// until `clear_emergency`. The latch lives in memory only. Returns false when it was
    /// already latched.
    pub async fn force_off(&self) -> bool {
        let already_latched = self.shared.emergency.send_replace(true);
        if let Err(err) = self.relay.de_energize() {
            warn!("failed to de-energize relay for emergency stop: {err}");
        }
        if already_latched {
            return false;
        }
        warn!("emergency stop latched");

        let mut regulation_rx = self.shared.regulation.subscribe();
        let confirmed = matches!(
            tokio::time::timeout(
                EMERGENCY_CONFIRM_TIMEOUT,
                regulation_rx.wait_for(|status| status.emergency_latched),
            )
            .await,
            Ok(Ok(_))
        );
        if !confirmed {
            warn!("evaluation task did not confirm the emergency latch");
        }
        true
    }

    /// Returns false when no emergency stop was latched.
    pub fn clear_emergency(&self) -> bool {
        let was_latched = self.shared.emergency.send_replace(false);
        if was_latched {
            info!("emergency stop released");
        }
        was_latched
    }

    pub fn emergency_latched(&self) -> bool {
        *self.shared.emergency.borrow()
    }

    /// Replaces the runtime config; the override mode is owned by `set_mode` and kept.
    pub fn reload_config(&self, mut config: RuntimeConfig) -> Result<(), ConfigError> {
        config.validate()?;
        config.relay_mode = self.shared.mode.mode();
        self.shared.config.send_replace(config);
        info!("runtime config reloaded");
        self.shared.emit(ControllerEvent::ConfigReloaded);
        Ok(())
    }

    pub fn config(&self) -> RuntimeConfig {
        let mut config = self.shared.config.borrow().clone();
        config.relay_mode = self.shared.mode.mode();
        config
    }

    pub fn stations(&self) -> Vec<Station> {
        self.shared.stations.borrow().clone()
    }

    /// Newest `limit` dashboard points, oldest first.
    pub fn history(&self, limit: usize) -> Vec<DashboardPoint> {
        let history = self
            .shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).copied().collect()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(err) = task.await {
                warn!("controller task ended abnormally: {err}");
            }
        }

        if let Err(err) = self.relay.de_energize() {
            warn!("failed to de-energize relay on shutdown: {err}");
        }
        if let Err(err) = self.indicator.set_run(false) {
            warn!("failed to clear run lamp: {err}");
        }
        self.shared.emit(ControllerEvent::Shutdown);
        info!("controller stopped");
    }
}

fn evaluation_interval(config: &RegulationConfig) -> Interval {
    let mut interval = tokio::time::interval(config.evaluation_period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Returns what is now on the output line; a failed write leaves it unchanged so the
/// next tick retries.
fn apply_relay(
    relay: &dyn RelayDriver,
    desired: RelayState,
    applied: Option<RelayState>,
) -> Option<RelayState> {
    if applied == Some(desired) {
        return applied;
    }
    match relay.apply(desired) {
        Ok(()) => Some(desired),
        Err(err) => {
            warn!("relay write {} failed: {err}", desired.as_str());
            applied
        }
    }
}

async fn evaluation_loop(
    shared: Arc<Shared>,
    relay: Arc<dyn RelayDriver>,
    cancel: CancellationToken,
) {
    let mut snapshot_rx = shared.snapshot.subscribe();
    let mut config_rx = shared.config.subscribe();
    let mut emergency_rx = shared.emergency.subscribe();
    let regulation = config_rx.borrow_and_update().regulation.clone();

    let mut ticker = evaluation_interval(&regulation);
    let mut engine = RegulationEngine::new(regulation, shared.now_ms());
    let mut applied = None;

    loop {
        let mut snapshot_updated = false;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = shared.mode_changed.notified() => {}
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                snapshot_rx.mark_unchanged();
                snapshot_updated = true;
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let regulation = config_rx.borrow_and_update().regulation.clone();
                if regulation != *engine.config() {
                    ticker = evaluation_interval(&regulation);
                    shared.emit_all(engine.reload_config(regulation));
                }
            }
            changed = emergency_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let latched = *emergency_rx.borrow_and_update();
                let events = if latched {
                    engine.force_off(shared.now_ms())
                } else {
                    engine.clear_emergency()
                };
                shared.emit_all(events);
            }
        }

        let snapshot = *shared.snapshot.borrow();
        let mode = shared.mode.mode();
        shared.emit_all(engine.tick(mode, &snapshot, shared.now_ms()));
        applied = apply_relay(relay.as_ref(), engine.relay().state, applied);
        shared.regulation.send_replace(engine.status());

        if snapshot_updated {
            shared.record_history(DashboardPoint {
                timestamp: Utc::now(),
                inside: snapshot.inside,
                outside: snapshot.outside,
                difference: engine.status().difference,
                relay: engine.relay().state,
                mode,
            });
        }
    }

    shared.emit_all(engine.shut_down(shared.now_ms()));
    shared.regulation.send_replace(engine.status());
    debug!("evaluation task stopped");
}
