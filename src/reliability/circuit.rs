//! Consecutive-failure circuit breaker used by the command bus authorize
//! stage. Once open, commands are denied until an explicit operator reset.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self { state: CircuitState::Closed, failures: 0, threshold }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::Closed {
            self.failures = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn allow(&self) -> bool {
        self.state == CircuitState::Closed
    }

    /// Manual operator reset. The breaker never closes on its own.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_opens_on_threshold() {
        let mut cb = CircuitBreaker::new(3);
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert!(!cb.allow());
        assert_eq!(cb.state, CircuitState::Open);
    }

    #[test]
    fn test_success_does_not_close_open_circuit() {
        let mut cb = CircuitBreaker::new(2);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.allow());
        cb.record_success();
        assert!(!cb.allow(), "open circuit requires manual reset");
    }

    #[test]
    fn test_manual_reset_closes() {
        let mut cb = CircuitBreaker::new(1);
        cb.record_failure();
        assert!(!cb.allow());
        cb.reset();
        assert!(cb.allow());
        assert_eq!(cb.failures, 0);
    }

    #[test]
    fn test_success_resets_streak_while_closed() {
        let mut cb = CircuitBreaker::new(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
    }
}
