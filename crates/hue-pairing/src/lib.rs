//! Link-button pairing: the session state machine and the indicator it drives.

pub mod clock;
pub mod indicator;
pub mod session;

pub use clock::{Clock, SystemClock};
pub use indicator::{
    IndicatorController, IndicatorError, IndicatorEvent, IndicatorSink, LedOutput, LedPattern,
    LedState, TracingLedOutput,
};
pub use session::{
    ConfirmOutcome, PairingError, PairingSession, PairingSessionManager, PairingSettings,
    PairingSnapshot, PairingStatus,
};

#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
#[cfg(any(test, feature = "test-util"))]
pub use indicator::RecordingSink;
