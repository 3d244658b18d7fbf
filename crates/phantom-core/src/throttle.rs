//! Failed-authentication throttling keyed by request source.

use crate::settings::AuthSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SourceState {
    failures: Vec<Instant>,
    locked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct AuthThrottle {
    threshold: usize,
    window: Duration,
    lockout: Duration,
    sources: Mutex<HashMap<String, SourceState>>,
}

impl AuthThrottle {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            threshold: settings.failure_threshold as usize,
            window: Duration::from_secs(settings.failure_window_secs),
            lockout: Duration::from_secs(settings.lockout_secs),
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_locked_out(&self, source: &str) -> bool {
        self.is_locked_out_at(source, Instant::now())
    }

    fn is_locked_out_at(&self, source: &str, now: Instant) -> bool {
        let mut sources = self.sources.lock();
        match sources.get_mut(source) {
            Some(state) => match state.locked_until {
                Some(until) if until > now => true,
                Some(_) => {
                    state.locked_until = None;
                    state.failures.clear();
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn record_failure(&self, source: &str) {
        self.record_failure_at(source, Instant::now());
    }

    fn record_failure_at(&self, source: &str, now: Instant) {
        let mut sources = self.sources.lock();
        let state = sources.entry(source.to_string()).or_default();
        let window = self.window;
        state.failures.retain(|t| now.duration_since(*t) <= window);
        state.failures.push(now);
        if state.failures.len() >= self.threshold {
            tracing::warn!(source, "authentication locked out after repeated failures");
            state.locked_until = Some(now + self.lockout);
        }
    }

    pub fn record_success(&self, source: &str) {
        self.sources.lock().remove(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> AuthThrottle {
        AuthThrottle::new(&AuthSettings {
            failure_threshold: 3,
            failure_window_secs: 60,
            lockout_secs: 30,
        })
    }

    #[test]
    fn locks_out_after_threshold_and_recovers() {
        let t = throttle();
        let start = Instant::now();
        for _ in 0..2 {
            t.record_failure_at("gui", start);
        }
        assert!(!t.is_locked_out_at("gui", start));
        t.record_failure_at("gui", start);
        assert!(t.is_locked_out_at("gui", start + Duration::from_secs(1)));
        assert!(!t.is_locked_out_at("other", start));
        assert!(!t.is_locked_out_at("gui", start + Duration::from_secs(31)));
    }

    #[test]
    fn old_failures_fall_out_of_window() {
        let t = throttle();
        let start = Instant::now();
        t.record_failure_at("gui", start);
        t.record_failure_at("gui", start);
        t.record_failure_at("gui", start + Duration::from_secs(120));
        assert!(!t.is_locked_out_at("gui", start + Duration::from_secs(120)));
    }

    #[test]
    fn success_clears_history() {
        let t = throttle();
        let start = Instant::now();
        t.record_failure_at("gui", start);
        t.record_failure_at("gui", start);
        t.record_success("gui");
        t.record_failure_at("gui", start);
        assert!(!t.is_locked_out_at("gui", start));
    }
}
