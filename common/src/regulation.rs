use serde::Serialize;

use crate::{
    config::RegulationConfig,
    events::{ControllerEvent, SwitchCause},
    types::{EnvironmentSnapshot, OverrideMode, RelayState, RelayStatus},
};

/// A relay change that has been requested by the thresholds but not yet held for its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingTransition {
    pub target: RelayState,
    pub armed_since_ms: u64,
}

impl PendingTransition {
    pub fn arm(target: RelayState, now_ms: u64) -> Self {
        Self {
            target,
            armed_since_ms: now_ms,
        }
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.armed_since_ms)
    }

    pub fn is_due(&self, now_ms: u64, delay_ms: u64) -> bool {
        self.elapsed_ms(now_ms) >= delay_ms
    }
}

/// What the evaluation task publishes after every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct RegulationStatus {
    pub relay: RelayStatus,
    pub pending: Option<PendingTransition>,
    pub difference: Option<f64>,
    pub override_cut_off: bool,
    pub emergency_latched: bool,
}

#[derive(Debug, Clone)]
pub struct RegulationEngine {
    config: RegulationConfig,
    relay: RelayStatus,
    pending: Option<PendingTransition>,
    active_mode: OverrideMode,
    // Set when the safety ceiling ends a Hand override; cleared by the next mode change.
    override_cut_off: bool,
    // Emergency stop: Off in every mode until explicitly released.
    emergency_latched: bool,
    last_difference: Option<f64>,
}

impl RegulationEngine {
    /// Starts de-energized in `Auto`; a different persisted mode is applied on the first tick.
    pub fn new(config: RegulationConfig, now_ms: u64) -> Self {
        Self {
            config,
            relay: RelayStatus {
                state: RelayState::Off,
                since_ms: now_ms,
            },
            pending: None,
            active_mode: OverrideMode::Auto,
            override_cut_off: false,
            emergency_latched: false,
            last_difference: None,
        }
    }

    pub fn config(&self) -> &RegulationConfig {
        &self.config
    }

    pub fn relay(&self) -> RelayStatus {
        self.relay
    }

    pub fn pending(&self) -> Option<PendingTransition> {
        self.pending
    }

    pub fn active_mode(&self) -> OverrideMode {
        self.active_mode
    }

    pub fn status(&self) -> RegulationStatus {
        RegulationStatus {
            relay: self.relay,
            pending: self.pending,
            difference: self.last_difference,
            override_cut_off: self.override_cut_off,
            emergency_latched: self.emergency_latched,
        }
    }

    pub fn tick(
        &mut self,
        mode: OverrideMode,
        snapshot: &EnvironmentSnapshot,
        now_ms: u64,
    ) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        if self.emergency_latched {
            // Track the operator's choice so it applies cleanly once released.
            self.active_mode = mode;
            self.last_difference = usable_difference(snapshot);
            self.switch(RelayState::Off, now_ms, SwitchCause::Emergency, &mut events);
            return events;
        }

        if mode != self.active_mode {
            self.enter_mode(mode, now_ms, &mut events);
        }
        self.last_difference = usable_difference(snapshot);

        match mode {
            OverrideMode::Auto => self.evaluate_auto(now_ms, &mut events),
            OverrideMode::Hand => self.enforce_hand(now_ms, &mut events),
            OverrideMode::Aus => {
                self.switch(
                    RelayState::Off,
                    now_ms,
                    SwitchCause::ManualOverride,
                    &mut events,
                );
            }
        }

        events
    }

    /// Swaps thresholds and delays while keeping time already accrued by a pending transition.
    pub fn reload_config(&mut self, config: RegulationConfig) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        self.config = config;

        if let Some(pending) = self.pending {
            let still_supported = match (pending.target, self.last_difference) {
                (RelayState::On, Some(difference)) => difference >= self.config.on_threshold,
                (RelayState::Off, Some(difference)) => difference <= self.config.off_threshold,
                (_, None) => false,
            };
            if !still_supported {
                self.cancel_pending(&mut events);
            }
        }

        events
    }

    /// Latches the relay off in every mode. Repeated calls are no-ops.
    pub fn force_off(&mut self, now_ms: u64) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        if self.emergency_latched {
            return events;
        }
        self.emergency_latched = true;
        self.override_cut_off = false;
        self.cancel_pending(&mut events);
        events.push(ControllerEvent::EmergencyLatched);
        self.switch(RelayState::Off, now_ms, SwitchCause::Emergency, &mut events);
        events
    }

    /// Releases the latch; the next tick resumes the current mode from an unarmed state.
    pub fn clear_emergency(&mut self) -> Vec<ControllerEvent> {
        if !self.emergency_latched {
            return Vec::new();
        }
        self.emergency_latched = false;
        vec![ControllerEvent::EmergencyCleared]
    }

    pub fn emergency_latched(&self) -> bool {
        self.emergency_latched
    }

    /// De-energizes for process exit.
    pub fn shut_down(&mut self, now_ms: u64) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        self.pending = None;
        self.switch(RelayState::Off, now_ms, SwitchCause::Shutdown, &mut events);
        events
    }

    fn enter_mode(&mut self, mode: OverrideMode, now_ms: u64, events: &mut Vec<ControllerEvent>) {
        self.cancel_pending(events);
        self.override_cut_off = false;
        self.active_mode = mode;

        match mode {
            OverrideMode::Hand => {
                if self.relay.state == RelayState::On {
                    // Hand gets its own full max-on window starting now.
                    self.relay.since_ms = now_ms;
                } else {
                    self.switch(RelayState::On, now_ms, SwitchCause::ManualOverride, events);
                }
            }
            OverrideMode::Aus => {
                self.switch(RelayState::Off, now_ms, SwitchCause::ManualOverride, events);
            }
            OverrideMode::Auto => {}
        }
    }

    fn enforce_hand(&mut self, now_ms: u64, events: &mut Vec<ControllerEvent>) {
        if self.check_max_on_time(now_ms, events) {
            self.override_cut_off = true;
            return;
        }
        if !self.override_cut_off {
            self.switch(RelayState::On, now_ms, SwitchCause::ManualOverride, events);
        }
    }

    fn evaluate_auto(&mut self, now_ms: u64, events: &mut Vec<ControllerEvent>) {
        if self.check_max_on_time(now_ms, events) {
            return;
        }

        // Never switch on missing data.
        let Some(difference) = self.last_difference else {
            self.cancel_pending(events);
            return;
        };

        match self.relay.state {
            RelayState::Off if difference >= self.config.on_threshold => {
                self.advance_pending(RelayState::On, difference, now_ms, events);
            }
            RelayState::On if difference <= self.config.off_threshold => {
                self.advance_pending(RelayState::Off, difference, now_ms, events);
            }
            _ => self.cancel_pending(events),
        }
    }

    fn check_max_on_time(&mut self, now_ms: u64, events: &mut Vec<ControllerEvent>) -> bool {
        if self.relay.state != RelayState::On {
            return false;
        }
        let on_for_ms = self.relay.on_for_ms(now_ms);
        if on_for_ms < self.config.max_on_time_ms() {
            return false;
        }

        self.cancel_pending(events);
        events.push(ControllerEvent::MaxOnTimeExceeded {
            on_for_s: on_for_ms / 1_000,
            mode: self.active_mode,
        });
        self.switch(RelayState::Off, now_ms, SwitchCause::SafetyCutoff, events);
        true
    }

    fn advance_pending(
        &mut self,
        target: RelayState,
        difference: f64,
        now_ms: u64,
        events: &mut Vec<ControllerEvent>,
    ) {
        let pending = match self.pending {
            Some(pending) if pending.target == target => pending,
            _ => {
                self.cancel_pending(events);
                let armed = PendingTransition::arm(target, now_ms);
                self.pending = Some(armed);
                events.push(match target {
                    RelayState::On => ControllerEvent::PendingOnStarted {
                        difference,
                        threshold: self.config.on_threshold,
                    },
                    RelayState::Off => ControllerEvent::PendingOffStarted {
                        difference,
                        threshold: self.config.off_threshold,
                    },
                });
                armed
            }
        };

        let delay_ms = match target {
            RelayState::On => self.config.on_delay_ms(),
            RelayState::Off => self.config.off_delay_ms(),
        };
        if pending.is_due(now_ms, delay_ms) {
            self.pending = None;
            self.switch(target, now_ms, SwitchCause::Regulation, events);
        }
    }

    fn cancel_pending(&mut self, events: &mut Vec<ControllerEvent>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let difference = self.last_difference;
        events.push(match pending.target {
            RelayState::On => ControllerEvent::PendingOnCancelled { difference },
            RelayState::Off => ControllerEvent::PendingOffCancelled { difference },
        });
    }

    fn switch(
        &mut self,
        target: RelayState,
        now_ms: u64,
        cause: SwitchCause,
        events: &mut Vec<ControllerEvent>,
    ) {
        if self.relay.state == target {
            return;
        }
        self.relay = RelayStatus {
            state: target,
            since_ms: now_ms,
        };
        events.push(match target {
            RelayState::On => ControllerEvent::RelayTurnedOn { cause },
            RelayState::Off => ControllerEvent::RelayTurnedOff { cause },
        });
    }
}

/// Outside must be currently valid; inside may be stale but must have been observed once.
fn usable_difference(snapshot: &EnvironmentSnapshot) -> Option<f64> {
    if !snapshot.outside.is_valid() || !snapshot.inside.has_value() {
        return None;
    }
    Some(snapshot.inside.absolute_humidity() - snapshot.outside.absolute_humidity())
}
