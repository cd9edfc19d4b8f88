use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Healthy,
    Degraded,
    Failed,
}

/// Which consecutive-failure counter decides fatal exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// Failures are counted across all addresses in polling order; any
    /// successful poll resets the count.
    #[default]
    Global,
    /// Each address keeps its own streak.
    PerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommsHealth {
    pub address: u8,
    pub consecutive_failures: u32,
    pub state: LinkState,
}

impl CommsHealth {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            consecutive_failures: 0,
            state: LinkState::Healthy,
        }
    }
}

/// Consecutive poll failure bookkeeping for the whole run.
#[derive(Debug)]
pub struct HealthTracker {
    modules: BTreeMap<u8, CommsHealth>,
    consecutive_failures: u32,
    threshold: u32,
    scope: FailureScope,
}

impl HealthTracker {
    pub fn new(addresses: &[u8], threshold: u32, scope: FailureScope) -> Self {
        Self {
            modules: addresses
                .iter()
                .map(|&a| (a, CommsHealth::new(a)))
                .collect(),
            consecutive_failures: 0,
            threshold,
            scope,
        }
    }

    pub fn health(&self, address: u8) -> CommsHealth {
        self.modules
            .get(&address)
            .cloned()
            .unwrap_or_else(|| CommsHealth::new(address))
    }

    /// Process-wide consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self, address: u8) {
        let module = self
            .modules
            .entry(address)
            .or_insert_with(|| CommsHealth::new(address));
        if module.consecutive_failures > 0 {
            log::info!(
                "Module {address} recovered after {} failed polls",
                module.consecutive_failures
            );
        }
        module.consecutive_failures = 0;
        module.state = LinkState::Healthy;
        self.consecutive_failures = 0;
    }

    /// Counts a failed poll. Fails with [`Error::CommsExhausted`] once the
    /// counter selected by the failure scope reaches the threshold.
    pub fn record_failure(&mut self, address: u8) -> Result<LinkState, Error> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let module = self
            .modules
            .entry(address)
            .or_insert_with(|| CommsHealth::new(address));
        module.consecutive_failures = module.consecutive_failures.saturating_add(1);

        let streak = match self.scope {
            FailureScope::Global => self.consecutive_failures,
            FailureScope::PerAddress => module.consecutive_failures,
        };
        if streak >= self.threshold {
            module.state = LinkState::Failed;
            return Err(Error::CommsExhausted {
                address,
                consecutive_failures: streak,
            });
        }
        module.state = LinkState::Degraded;
        log::debug!(
            "Module {address} degraded: {} consecutive failures, {} overall",
            module.consecutive_failures,
            self.consecutive_failures
        );
        Ok(module.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_failures_then_success_resets() {
        let mut tracker = HealthTracker::new(&[1, 2, 3], 10, FailureScope::Global);
        for i in 0..9u8 {
            let state = tracker.record_failure(1 + i % 3).unwrap();
            assert_eq!(state, LinkState::Degraded);
        }
        assert_eq!(tracker.consecutive_failures(), 9);
        tracker.record_success(2);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.health(2).state, LinkState::Healthy);
        assert!(tracker.record_failure(1).is_ok());
    }

    #[test]
    fn tenth_global_failure_is_fatal() {
        let mut tracker = HealthTracker::new(&[1, 2], 10, FailureScope::Global);
        for i in 0..9u8 {
            tracker.record_failure(1 + i % 2).unwrap();
        }
        match tracker.record_failure(2) {
            Err(Error::CommsExhausted {
                address,
                consecutive_failures,
            }) => {
                assert_eq!(address, 2);
                assert_eq!(consecutive_failures, 10);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(tracker.health(2).state, LinkState::Failed);
    }

    #[test]
    fn single_success_clears_degradation() {
        let mut tracker = HealthTracker::new(&[4], 10, FailureScope::Global);
        tracker.record_failure(4).unwrap();
        assert_eq!(tracker.health(4).state, LinkState::Degraded);
        assert_eq!(tracker.health(4).consecutive_failures, 1);
        tracker.record_success(4);
        assert_eq!(tracker.health(4), CommsHealth::new(4));
    }

    #[test]
    fn per_address_scope_counts_each_module() {
        let mut tracker = HealthTracker::new(&[1, 2], 3, FailureScope::PerAddress);
        // address 2 keeps answering, address 1 never does
        tracker.record_failure(1).unwrap();
        tracker.record_success(2);
        tracker.record_failure(1).unwrap();
        tracker.record_success(2);
        assert!(matches!(
            tracker.record_failure(1),
            Err(Error::CommsExhausted {
                address: 1,
                consecutive_failures: 3
            })
        ));
    }

    #[test]
    fn global_scope_is_reset_by_other_modules() {
        let mut tracker = HealthTracker::new(&[1, 2], 3, FailureScope::Global);
        for _ in 0..10 {
            tracker.record_failure(1).unwrap();
            tracker.record_success(2);
        }
        assert_eq!(tracker.health(1).consecutive_failures, 10);
        assert_eq!(tracker.health(1).state, LinkState::Degraded);
    }
}
