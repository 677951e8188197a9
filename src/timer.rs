use std::time::Duration;

use async_trait::async_trait;

/// What a timer callback refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Autoscan,
    OnlineContent,
}

/// Opaque parameter round-tripped through the external timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerParameter {
    pub kind: TimerKind,
    pub id: i32,
}

/// Receives timer callbacks; implemented by the content orchestrator.
#[async_trait]
pub trait TimerSubscriber: Send + Sync {
    async fn timer_notify(&self, parameter: TimerParameter);
}

/// The external timer the core subscribes to. Implementations are owned by
/// the server shell; only this contract is consumed here.
pub trait Timer: Send + Sync {
    fn add_subscriber(&self, interval: Duration, parameter: TimerParameter, once: bool);
    fn remove_subscriber(&self, parameter: TimerParameter, silent: bool);
}

/// Timer that never fires; placeholder for tests and timed-mode-less setups.
#[derive(Debug, Default)]
pub struct NullTimer;

impl Timer for NullTimer {
    fn add_subscriber(&self, _interval: Duration, _parameter: TimerParameter, _once: bool) {}
    fn remove_subscriber(&self, _parameter: TimerParameter, _silent: bool) {}
}
