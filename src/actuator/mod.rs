//! Timed door relay.
//!
//! An open command asserts the relay and buzzer immediately and arms a
//! fixed-length window measured from the most recent open. The indicator
//! follows once the indicator delay has elapsed. A periodic tick ends the
//! window and drops every output.
//!
//! State lives behind one mutex; pin writes happen outside it so a slow
//! GPIO backend never stalls the HTTP threads that call `open`.

pub mod gpio;
pub mod ticker;

pub use gpio::{InputPin, Level, MemoryPin, OutputPin};
pub use ticker::{ActuatorTicker, Button, TickerHandle};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const RELAY_DURATION: Duration = Duration::from_millis(3000);
pub const INDICATOR_DELAY: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActuatorTiming {
    pub relay_duration: Duration,
    pub indicator_delay: Duration,
}

impl Default for ActuatorTiming {
    fn default() -> Self {
        Self {
            relay_duration: RELAY_DURATION,
            indicator_delay: INDICATOR_DELAY,
        }
    }
}

/// The three driven outputs.
#[derive(Clone)]
pub struct ActuatorOutputs {
    pub relay: Arc<dyn OutputPin>,
    pub buzzer: Arc<dyn OutputPin>,
    pub indicator: Arc<dyn OutputPin>,
}

impl ActuatorOutputs {
    /// In-memory pins for hosts without GPIO.
    pub fn in_memory() -> Self {
        Self {
            relay: Arc::new(MemoryPin::new("relay")),
            buzzer: Arc::new(MemoryPin::new("buzzer")),
            indicator: Arc::new(MemoryPin::new("indicator")),
        }
    }

    fn assert_primary(&self) {
        drive(self.buzzer.as_ref(), Level::High);
        drive(self.relay.as_ref(), Level::High);
    }

    fn deassert_all(&self) {
        drive(self.relay.as_ref(), Level::Low);
        drive(self.buzzer.as_ref(), Level::Low);
        drive(self.indicator.as_ref(), Level::Low);
    }
}

fn drive(pin: &dyn OutputPin, level: Level) {
    if let Err(err) = pin.set(level) {
        log::error!("failed to drive {} {:?}: {:#}", pin.name(), level, err);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActuatorState {
    pub active: bool,
    /// Time of the most recent open; boot time until the first one.
    pub activation_time: Instant,
    pub indicator_on: bool,
}

impl ActuatorState {
    fn new(now: Instant) -> Self {
        Self {
            active: false,
            activation_time: now,
            indicator_on: false,
        }
    }

    fn activate(&mut self, now: Instant) -> OpenOutcome {
        let was_active = self.active;
        self.active = true;
        self.activation_time = now;
        if was_active {
            OpenOutcome::Extended
        } else {
            OpenOutcome::Activated
        }
    }

    fn evaluate(&mut self, now: Instant, timing: &ActuatorTiming) -> TickAction {
        if !self.active {
            return TickAction::Idle;
        }
        let elapsed = now.saturating_duration_since(self.activation_time);
        if elapsed >= timing.relay_duration {
            self.active = false;
            self.indicator_on = false;
            return TickAction::Released;
        }
        if !self.indicator_on && elapsed >= timing.indicator_delay {
            self.indicator_on = true;
            return TickAction::IndicatorOn;
        }
        TickAction::Holding
    }
}

/// What an open did. Callers reply the same way either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Activated,
    Extended,
}

/// What a tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    Holding,
    IndicatorOn,
    Released,
}

pub struct ActuatorController {
    state: Mutex<ActuatorState>,
    outputs: ActuatorOutputs,
    timing: ActuatorTiming,
}

impl ActuatorController {
    pub fn new(outputs: ActuatorOutputs, timing: ActuatorTiming) -> Self {
        Self {
            state: Mutex::new(ActuatorState::new(Instant::now())),
            outputs,
            timing,
        }
    }

    pub fn open(&self) -> OpenOutcome {
        self.open_at(Instant::now())
    }

    pub fn open_at(&self, now: Instant) -> OpenOutcome {
        let outcome = self.lock().activate(now);
        self.outputs.assert_primary();
        match outcome {
            OpenOutcome::Activated => log::info!("door relay activated"),
            OpenOutcome::Extended => log::info!("door relay window extended"),
        }
        outcome
    }

    pub fn tick(&self) -> TickAction {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> TickAction {
        let action = self.lock().evaluate(now, &self.timing);
        match action {
            TickAction::IndicatorOn => drive(self.outputs.indicator.as_ref(), Level::High),
            TickAction::Released => {
                self.outputs.deassert_all();
                // An open that landed between the decision and the writes
                // above must not be left with its outputs dropped.
                if self.lock().active {
                    log::debug!("door reopened during release; re-asserting");
                    self.outputs.assert_primary();
                } else {
                    log::info!("door relay deactivated");
                }
            }
            TickAction::Idle | TickAction::Holding => {}
        }
        action
    }

    /// Ends any open window and drives every output low.
    pub fn shutdown(&self) {
        let was_active = {
            let mut state = self.lock();
            let was_active = state.active;
            state.active = false;
            state.indicator_on = false;
            was_active
        };
        self.outputs.deassert_all();
        if was_active {
            log::info!("door relay released at shutdown");
        }
    }

    pub fn state(&self) -> ActuatorState {
        *self.lock()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    fn lock(&self) -> MutexGuard<'_, ActuatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
