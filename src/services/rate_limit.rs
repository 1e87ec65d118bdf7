use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracked clients above which idle entries are dropped on the next check.
const PRUNE_THRESHOLD: usize = 10_000;

/// Operations that are budgeted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Submit,
    Download,
}

/// At most `count` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub count: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Too many requests. Try again in {} seconds.", retry_after.as_secs().max(1))]
pub struct Throttled {
    pub retry_after: Duration,
}

/// In-memory sliding-window limiter keyed by operation class and client.
pub struct RateLimiter {
    submit: Budget,
    download: Budget,
    windows: Mutex<HashMap<(OperationClass, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(submit: Budget, download: Budget) -> Self {
        Self {
            submit,
            download,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn budget(&self, class: OperationClass) -> Budget {
        match class {
            OperationClass::Submit => self.submit,
            OperationClass::Download => self.download,
        }
    }

    pub fn check(&self, class: OperationClass, key: &str) -> Result<(), Throttled> {
        self.check_at(class, key, Instant::now())
    }

    /// Admit or reject one request observed at `now`.
    pub fn check_at(&self, class: OperationClass, key: &str, now: Instant) -> Result<(), Throttled> {
        let budget = self.budget(class);
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if windows.len() > PRUNE_THRESHOLD {
            self.retain_active(&mut windows, now);
        }
        let hits = windows.entry((class, key.to_string())).or_default();

        while hits
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= budget.window)
        {
            hits.pop_front();
        }

        if hits.len() >= budget.count {
            let retry_after = hits
                .front()
                .map(|oldest| budget.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(budget.window);
            return Err(Throttled { retry_after });
        }

        hits.push_back(now);
        Ok(())
    }

    /// Drop clients with no hits inside their window.
    pub fn prune(&self, now: Instant) {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.retain_active(&mut windows, now);
    }

    fn retain_active(
        &self,
        windows: &mut HashMap<(OperationClass, String), VecDeque<Instant>>,
        now: Instant,
    ) {
        windows.retain(|(class, _), hits| {
            let window = self.budget(*class).window;
            hits.back()
                .is_some_and(|t| now.saturating_duration_since(*t) < window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Budget {
                count: 2,
                window: Duration::from_secs(60),
            },
            Budget {
                count: 3,
                window: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_admits_up_to_budget_then_throttles() {
        let limiter = limiter();
        let start = Instant::now();
        assert!(limiter.check_at(OperationClass::Submit, "1.2.3.4", start).is_ok());
        assert!(limiter
            .check_at(OperationClass::Submit, "1.2.3.4", start + Duration::from_secs(10))
            .is_ok());

        let err = limiter
            .check_at(OperationClass::Submit, "1.2.3.4", start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(40));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at(OperationClass::Submit, "k", start).unwrap();
        limiter
            .check_at(OperationClass::Submit, "k", start + Duration::from_secs(30))
            .unwrap();
        assert!(limiter
            .check_at(OperationClass::Submit, "k", start + Duration::from_secs(59))
            .is_err());
        assert!(limiter
            .check_at(OperationClass::Submit, "k", start + Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_classes_and_clients_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.check_at(OperationClass::Submit, "a", now).unwrap();
        limiter.check_at(OperationClass::Submit, "a", now).unwrap();
        assert!(limiter.check_at(OperationClass::Submit, "a", now).is_err());
        assert!(limiter.check_at(OperationClass::Submit, "b", now).is_ok());
        assert!(limiter.check_at(OperationClass::Download, "a", now).is_ok());
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at(OperationClass::Submit, "k", start).unwrap();
        limiter.check_at(OperationClass::Submit, "k", start).unwrap();
        for s in 1..50 {
            let _ = limiter.check_at(OperationClass::Submit, "k", start + Duration::from_secs(s));
        }
        assert!(limiter
            .check_at(OperationClass::Submit, "k", start + Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_prune_forgets_idle_clients() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at(OperationClass::Download, "idle", start).unwrap();
        limiter.prune(start + Duration::from_secs(61));
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
