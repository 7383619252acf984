//! Background loop that advances the actuator and polls the door button.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{ActuatorController, InputPin};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_BUTTON_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Local push button that opens the door.
///
/// Fires on the press edge, at most once per debounce window.
pub struct Button {
    pin: Arc<dyn InputPin>,
    debounce: Duration,
    was_pressed: bool,
    last_press: Option<Instant>,
}

impl Button {
    pub fn new(pin: Arc<dyn InputPin>, debounce: Duration) -> Self {
        Self {
            pin,
            debounce,
            was_pressed: false,
            last_press: None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        let pressed = match self.pin.is_active() {
            Ok(pressed) => pressed,
            Err(err) => {
                log::debug!("button read failed: {:#}", err);
                false
            }
        };
        let edge = pressed && !self.was_pressed;
        self.was_pressed = pressed;
        if !edge {
            return false;
        }
        if let Some(last) = self.last_press {
            if now.saturating_duration_since(last) < self.debounce {
                return false;
            }
        }
        self.last_press = Some(now);
        true
    }
}

pub struct ActuatorTicker {
    controller: Arc<ActuatorController>,
    interval: Duration,
    button: Option<Button>,
}

impl ActuatorTicker {
    pub fn new(controller: Arc<ActuatorController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            button: None,
        }
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.button = Some(button);
        self
    }

    pub fn spawn(self) -> Result<TickerHandle> {
        if self.interval.is_zero() {
            return Err(anyhow!("actuator tick interval must be non-zero"));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("actuator-tick".to_string())
            .spawn(move || self.run(&shutdown_thread))
            .context("spawn actuator ticker")?;
        Ok(TickerHandle {
            shutdown,
            join: Some(join),
        })
    }

    fn run(mut self, shutdown: &AtomicBool) {
        log::debug!("actuator ticker running every {:?}", self.interval);
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(button) = self.button.as_mut() {
                if button.poll(Instant::now()) {
                    log::info!("door button pressed");
                    self.controller.open();
                }
            }
            self.controller.tick();
            std::thread::sleep(self.interval);
        }
    }
}

#[derive(Debug)]
pub struct TickerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TickerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("actuator ticker thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorOutputs, ActuatorTiming};

    #[derive(Default)]
    struct FakeButton {
        pressed: AtomicBool,
    }

    impl FakeButton {
        fn set(&self, pressed: bool) {
            self.pressed.store(pressed, Ordering::SeqCst);
        }
    }

    impl InputPin for FakeButton {
        fn is_active(&self) -> Result<bool> {
            Ok(self.pressed.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn button_fires_on_edge_and_respects_debounce() {
        let pin = Arc::new(FakeButton::default());
        let mut button = Button::new(pin.clone(), Duration::from_millis(2000));
        let t0 = Instant::now();

        assert!(!button.poll(t0));
        pin.set(true);
        assert!(button.poll(t0));
        // Held down: no repeat.
        assert!(!button.poll(t0 + Duration::from_millis(3000)));

        pin.set(false);
        assert!(!button.poll(t0 + Duration::from_millis(3100)));
        pin.set(true);
        assert!(button.poll(t0 + Duration::from_millis(3200)));

        pin.set(false);
        assert!(!button.poll(t0 + Duration::from_millis(3300)));
        pin.set(true);
        assert!(!button.poll(t0 + Duration::from_millis(3400)));
    }

    #[test]
    fn ticker_releases_relay_in_background() -> Result<()> {
        let controller = Arc::new(ActuatorController::new(
            ActuatorOutputs::in_memory(),
            ActuatorTiming {
                relay_duration: Duration::from_millis(60),
                indicator_delay: Duration::from_millis(20),
            },
        ));
        let handle = ActuatorTicker::new(controller.clone(), Duration::from_millis(5)).spawn()?;

        controller.open();
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_active() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop()?;
        assert!(!controller.is_active());
        Ok(())
    }

    #[test]
    fn button_press_opens_door() -> Result<()> {
        let controller = Arc::new(ActuatorController::new(
            ActuatorOutputs::in_memory(),
            ActuatorTiming::default(),
        ));
        let pin = Arc::new(FakeButton::default());
        let handle = ActuatorTicker::new(controller.clone(), Duration::from_millis(5))
            .with_button(Button::new(pin.clone(), DEFAULT_BUTTON_DEBOUNCE))
            .spawn()?;

        pin.set(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !controller.is_active() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop()?;
        assert!(controller.is_active());
        Ok(())
    }

    #[test]
    fn zero_interval_is_rejected() {
        let controller = Arc::new(ActuatorController::new(
            ActuatorOutputs::in_memory(),
            ActuatorTiming::default(),
        ));
        assert!(ActuatorTicker::new(controller, Duration::ZERO).spawn().is_err());
    }
}
