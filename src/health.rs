use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineObserver;

/// Flags written by the poll task and read by the HTTP surface.
#[derive(Clone)]
pub struct HealthStatus {
    state: Arc<HealthState>,
}

struct HealthState {
    event_active: AtomicBool,
    drained: AtomicBool,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            state: Arc::new(HealthState {
                event_active: AtomicBool::new(false),
                drained: AtomicBool::new(false),
            }),
        }
    }
}

impl HealthStatus {
    /// False while a drain-worthy event is active.
    pub fn is_ready(&self) -> bool {
        !self.state.event_active.load(Ordering::SeqCst)
    }

    /// Sticky once a drain completed, until the process restarts.
    pub fn is_drained(&self) -> bool {
        self.state.drained.load(Ordering::SeqCst)
    }
}

impl EngineObserver for HealthStatus {
    fn on_clear(&self) {
        if self.state.event_active.swap(false, Ordering::SeqCst) {
            debug!("ready again");
        }
    }

    fn on_scheduled_event(&self) {
        if !self.state.event_active.swap(true, Ordering::SeqCst) {
            debug!("not ready, scheduled event is active");
        }
    }

    fn on_after_drain(&self) {
        self.state.drained.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_follow_engine_transitions() {
        let health = HealthStatus::default();
        assert!(health.is_ready());
        assert!(!health.is_drained());

        health.on_scheduled_event();
        health.on_after_drain();
        assert!(!health.is_ready());
        assert!(health.is_drained());

        health.on_clear();
        assert!(health.is_ready());
        assert!(health.is_drained());
    }
}
