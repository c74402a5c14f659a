use std::sync::Arc;
#[cfg(any(test, feature = "test-util"))]
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const LED_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "count", rename_all = "snake_case")]
pub enum IndicatorEvent {
    Idle,
    AwaitingConfirmation,
    PartialConfirmation(u32),
    Confirmed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedState {
    #[default]
    Off,
    Blinking,
    Solid,
}

impl LedState {
    pub fn is_lit(self) -> bool {
        !matches!(self, LedState::Off)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct LedPattern(pub [LedState; LED_COUNT]);

impl LedPattern {
    pub const OFF: LedPattern = LedPattern([LedState::Off; LED_COUNT]);

    pub fn for_event(event: IndicatorEvent) -> Self {
        match event {
            IndicatorEvent::Idle | IndicatorEvent::Expired => Self::OFF,
            IndicatorEvent::AwaitingConfirmation => Self([LedState::Blinking; LED_COUNT]),
            IndicatorEvent::PartialConfirmation(count) => {
                let mut leds = [LedState::Blinking; LED_COUNT];
                for led in leds.iter_mut().take(count as usize) {
                    *led = LedState::Solid;
                }
                Self(leds)
            }
            IndicatorEvent::Confirmed => Self([LedState::Solid; LED_COUNT]),
        }
    }

    pub fn leds(&self) -> [LedState; LED_COUNT] {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("indicator output failed: {0}")]
    Output(String),
}

/// Receives pairing transitions. Called while the session lock is held, so
/// implementations must return promptly.
pub trait IndicatorSink: Send + Sync {
    fn on_event(&self, event: IndicatorEvent);
}

/// The three physical (or logical) indicator outputs.
pub trait LedOutput: Send + Sync {
    fn apply(&self, pattern: LedPattern) -> Result<(), IndicatorError>;
}

/// Collects events in memory.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<IndicatorEvent>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingSink {
    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl IndicatorSink for RecordingSink {
    fn on_event(&self, event: IndicatorEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLedOutput;

impl LedOutput for TracingLedOutput {
    fn apply(&self, pattern: LedPattern) -> Result<(), IndicatorError> {
        let [led1, led2, led3] = pattern.leds();
        tracing::info!(?led1, ?led2, ?led3, "Indicator LEDs updated");
        Ok(())
    }
}

/// Maps pairing events to LED patterns on a background task.
///
/// `on_event` only enqueues, so it never blocks the pairing state machine.
#[derive(Debug, Clone)]
pub struct IndicatorController {
    tx: mpsc::UnboundedSender<IndicatorEvent>,
}

impl IndicatorController {
    /// Must be called from within a tokio runtime.
    pub fn spawn(output: Arc<dyn LedOutput>, enabled: bool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<IndicatorEvent>();
        let task = tokio::spawn(async move {
            let mut current = None;
            while let Some(event) = rx.recv().await {
                let pattern = if enabled {
                    LedPattern::for_event(event)
                } else {
                    LedPattern::OFF
                };
                if current == Some(pattern) {
                    continue;
                }
                match output.apply(pattern) {
                    Ok(()) => current = Some(pattern),
                    Err(err) => {
                        tracing::warn!(?event, "Failed to update indicator: {err}");
                        current = None;
                    }
                }
            }
            tracing::debug!("Indicator controller stopped");
        });
        (Self { tx }, task)
    }
}

impl IndicatorSink for IndicatorController {
    fn on_event(&self, event: IndicatorEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "Indicator controller gone; event dropped");
        }
    }
}
