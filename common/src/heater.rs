use embedded_hal::digital::{OutputPin, PinState};
use log::{info, warn};

use crate::types::HeaterState;

/// Owns the heater on/off state and the two outputs that mirror it.
///
/// The stored state is the only record of what the outputs show; nothing reads
/// the pins back.
#[derive(Debug)]
pub struct HeaterController<L, R> {
    led: L,
    relay: R,
    state: HeaterState,
}

impl<L: OutputPin, R: OutputPin> HeaterController<L, R> {
    /// Takes both outputs and drives them low.
    pub fn new(led: L, relay: R) -> Self {
        let mut controller = Self {
            led,
            relay,
            state: HeaterState::Off,
        };
        controller.drive(PinState::Low);
        controller
    }

    pub fn set(&mut self, on: bool) {
        let state = HeaterState::from_on(on);
        info!("Heater {}", state.as_str());
        self.drive(PinState::from(on));
        self.state = state;
    }

    pub fn is_on(&self) -> bool {
        self.state.is_on()
    }

    pub fn state(&self) -> HeaterState {
        self.state
    }

    /// LED and relay outputs, in that order.
    pub fn outputs(&self) -> (&L, &R) {
        (&self.led, &self.relay)
    }

    fn drive(&mut self, level: PinState) {
        if let Err(err) = self.led.set_state(level) {
            warn!("failed to drive heater LED: {err:?}");
        }
        if let Err(err) = self.relay.set_state(level) {
            warn!("failed to drive heater relay: {err:?}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        cell::RefCell,
        convert::Infallible,
        rc::Rc,
        sync::Once,
    };

    use embedded_hal::digital::{ErrorKind, ErrorType};
    use log::{Level, LevelFilter, Log, Metadata, Record};

    use super::*;

    /// Output pin whose level history is visible after it has been moved into
    /// a controller.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingPin {
        pub levels: Rc<RefCell<Vec<bool>>>,
    }

    impl RecordingPin {
        pub(crate) fn level(&self) -> Option<bool> {
            self.levels.borrow().last().copied()
        }
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(true);
            Ok(())
        }
    }

    struct BrokenPin;

    impl ErrorType for BrokenPin {
        type Error = ErrorKind;
    }

    impl OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }
    }

    thread_local! {
        static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
    }

    struct CaptureLogger;

    impl Log for CaptureLogger {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &Record<'_>) {
            CAPTURED.with(|lines| {
                lines
                    .borrow_mut()
                    .push((record.level(), record.args().to_string()))
            });
        }

        fn flush(&self) {}
    }

    static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;
    static INSTALL: Once = Once::new();

    /// Log lines emitted on the current test thread since the last call.
    pub(crate) fn take_log_lines() -> Vec<(Level, String)> {
        INSTALL.call_once(|| {
            let _ = log::set_logger(&CAPTURE_LOGGER);
            log::set_max_level(LevelFilter::Trace);
        });
        CAPTURED.with(|lines| lines.borrow_mut().drain(..).collect())
    }

    pub(crate) fn recording_controller() -> (
        HeaterController<RecordingPin, RecordingPin>,
        RecordingPin,
        RecordingPin,
    ) {
        let led = RecordingPin::default();
        let relay = RecordingPin::default();
        let controller = HeaterController::new(led.clone(), relay.clone());
        (controller, led, relay)
    }

    fn heater_lines(lines: &[(Level, String)]) -> Vec<&str> {
        lines
            .iter()
            .filter(|(level, msg)| *level == Level::Info && msg.starts_with("Heater "))
            .map(|(_, msg)| msg.as_str())
            .collect()
    }

    #[test]
    fn starts_off_with_outputs_low() {
        take_log_lines();
        let (controller, led, relay) = recording_controller();

        assert!(!controller.is_on());
        assert_eq!(led.level(), Some(false));
        assert_eq!(relay.level(), Some(false));
        assert!(heater_lines(&take_log_lines()).is_empty());
    }

    #[test]
    fn set_on_asserts_both_outputs_and_logs_once() {
        let (mut controller, led, relay) = recording_controller();
        take_log_lines();

        controller.set(true);

        assert!(controller.is_on());
        assert_eq!(controller.state(), HeaterState::On);
        assert_eq!(led.level(), Some(true));
        assert_eq!(relay.level(), Some(true));
        assert_eq!(heater_lines(&take_log_lines()), vec!["Heater on"]);
    }

    #[test]
    fn repeated_off_is_idempotent() {
        let (mut controller, led, relay) = recording_controller();
        take_log_lines();

        controller.set(false);

        assert!(!controller.is_on());
        assert_eq!(led.level(), Some(false));
        assert_eq!(relay.level(), Some(false));
        assert_eq!(heater_lines(&take_log_lines()), vec!["Heater off"]);
    }

    #[test]
    fn outputs_always_match_state() {
        let (mut controller, led, relay) = recording_controller();

        for on in [true, true, false, true, false, false] {
            controller.set(on);
            assert_eq!(controller.is_on(), on);
            assert_eq!(led.level(), Some(on));
            assert_eq!(relay.level(), Some(on));
        }
        assert_eq!(*led.levels.borrow(), *relay.levels.borrow());
    }

    #[test]
    fn pin_failures_do_not_change_recorded_state() {
        let mut controller = HeaterController::new(BrokenPin, BrokenPin);
        take_log_lines();

        controller.set(true);

        assert!(controller.is_on());
        let lines = take_log_lines();
        assert_eq!(heater_lines(&lines), vec!["Heater on"]);
        assert_eq!(
            lines.iter().filter(|(level, _)| *level == Level::Warn).count(),
            2
        );
    }
}
