//! Error escalation
//!
//! Counts consecutive transport failures and rotates the network identity
//! once they reach the ceiling. Rotation attempts are capped; past the cap
//! every further escalation reports exhaustion.

use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use meshcrawl_net::{SharedRotator, TransportError};

/// What the caller should do after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Below the ceiling, or rotation failed below the cap
    KeepGoing,
    /// Identity rotated successfully; the error counter was reset
    Rotated,
    /// Rotation cap exceeded; the failing URL cannot be recovered
    Exhausted,
}

/// Escalation thresholds
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub max_consecutive_errors: u32,
    pub max_rotation_attempts: u32,
    /// Pause between disconnect and reconnect
    pub settle_pause: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            max_rotation_attempts: 10,
            settle_pause: Duration::from_secs(2),
        }
    }
}

pub struct ErrorEscalation {
    rotator: SharedRotator,
    policy: EscalationPolicy,
    consecutive_errors: u32,
    rotation_attempts: u32,
    rotations: u32,
}

impl ErrorEscalation {
    pub fn new(rotator: SharedRotator, policy: EscalationPolicy) -> Self {
        Self {
            rotator,
            policy,
            consecutive_errors: 0,
            rotation_attempts: 0,
            rotations: 0,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Successful rotations so far
    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    /// A fetch succeeded; only unbroken runs of failures escalate
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    pub async fn record_failure(&mut self, url: &Url, err: &TransportError) -> Escalation {
        self.consecutive_errors += 1;
        warn!(
            url = %url,
            consecutive = self.consecutive_errors,
            "Transport error: {}",
            err
        );

        if self.consecutive_errors < self.policy.max_consecutive_errors {
            return Escalation::KeepGoing;
        }

        info!("Too many consecutive errors, switching network location...");
        self.rotate().await
    }

    async fn rotate(&mut self) -> Escalation {
        self.rotation_attempts += 1;
        if self.rotation_attempts > self.policy.max_rotation_attempts {
            error!(
                "Maximum location switches ({}) reached, giving up",
                self.policy.max_rotation_attempts
            );
            return Escalation::Exhausted;
        }

        self.rotator.disconnect().await;
        tokio::time::sleep(self.policy.settle_pause).await;

        let Some(location) = self.rotator.next_location() else {
            error!("No more locations available from {}", self.rotator.name());
            return Escalation::KeepGoing;
        };

        info!("Switching {} to: {}", self.rotator.name(), location);
        if self.rotator.connect(&location).await {
            self.consecutive_errors = 0;
            self.rotations += 1;
            info!("Switched to location: {}", location);
            Escalation::Rotated
        } else {
            error!(
                "Failed to switch to {}, staying on current connection",
                location
            );
            Escalation::KeepGoing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRotator;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn policy(max_rotation_attempts: u32) -> EscalationPolicy {
        EscalationPolicy {
            max_consecutive_errors: 3,
            max_rotation_attempts,
            settle_pause: Duration::ZERO,
        }
    }

    fn err() -> TransportError {
        TransportError::Timeout(30)
    }

    fn url() -> Url {
        Url::parse("https://a.ca/page").unwrap()
    }

    #[tokio::test]
    async fn test_third_failure_rotates_once() {
        let rotator = Arc::new(MockRotator::new());
        let mut escalation = ErrorEscalation::new(rotator.clone(), policy(10));

        assert_eq!(escalation.record_failure(&url(), &err()).await, Escalation::KeepGoing);
        assert_eq!(escalation.record_failure(&url(), &err()).await, Escalation::KeepGoing);
        assert_eq!(rotator.connect_count(), 0);

        assert_eq!(escalation.record_failure(&url(), &err()).await, Escalation::Rotated);
        assert_eq!(rotator.connect_count(), 1);
        assert_eq!(rotator.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(escalation.consecutive_errors(), 0);
        assert_eq!(escalation.rotations(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let rotator = Arc::new(MockRotator::new());
        let mut escalation = ErrorEscalation::new(rotator.clone(), policy(10));

        escalation.record_failure(&url(), &err()).await;
        escalation.record_failure(&url(), &err()).await;
        escalation.record_success();
        escalation.record_failure(&url(), &err()).await;

        assert_eq!(escalation.consecutive_errors(), 1);
        assert_eq!(rotator.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_going_and_retries() {
        let rotator = Arc::new(MockRotator::new());
        rotator.set_succeed(false);
        let mut escalation = ErrorEscalation::new(rotator.clone(), policy(10));

        for _ in 0..3 {
            escalation.record_failure(&url(), &err()).await;
        }
        assert_eq!(rotator.connect_count(), 1);
        assert_eq!(escalation.consecutive_errors(), 3);

        // Still at the ceiling: the next failure tries again
        assert_eq!(escalation.record_failure(&url(), &err()).await, Escalation::KeepGoing);
        assert_eq!(rotator.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_cap_exceeded_is_exhausted() {
        let rotator = Arc::new(MockRotator::new());
        rotator.set_succeed(false);
        let mut escalation = ErrorEscalation::new(rotator.clone(), policy(2));

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(escalation.record_failure(&url(), &err()).await);
        }

        assert_eq!(
            outcomes,
            vec![
                Escalation::KeepGoing,
                Escalation::KeepGoing,
                Escalation::KeepGoing,
                Escalation::KeepGoing,
                Escalation::Exhausted,
            ]
        );
        assert_eq!(rotator.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_no_location_is_not_exhaustion() {
        let rotator = Arc::new(MockRotator::without_locations());
        let mut escalation = ErrorEscalation::new(rotator.clone(), policy(10));

        for _ in 0..2 {
            escalation.record_failure(&url(), &err()).await;
        }
        assert_eq!(escalation.record_failure(&url(), &err()).await, Escalation::KeepGoing);
        assert_eq!(rotator.connect_count(), 0);
    }
}
