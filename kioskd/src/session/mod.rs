//! Kiosk session lifecycle: badge scan to farewell.

pub mod exit_intent;
pub mod runtime;
pub mod timers;
pub mod types;

pub use exit_intent::ExitIntentDetector;
pub use runtime::{SessionConfig, SessionEvent, SessionHandle, SessionRuntime, SessionSnapshot, VoiceChannel};
pub use timers::TimerPurpose;
