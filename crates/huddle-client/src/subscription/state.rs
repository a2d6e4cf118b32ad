use crate::error::{ClientError, Result};

/// Lifecycle of one room subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Degraded,
    Resubscribing,
    Closed,
}

/// Inputs driving [`SubscriptionState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// The room screen opened.
    Mount,
    /// A channel confirmed its subscription.
    Confirmed,
    /// The periodic check, or a closed channel, found the connection dead.
    HealthCheckFailed,
    /// Opening the channels failed.
    OpenFailed,
    /// Tear down and reopen from `Degraded`.
    Resubscribe,
    /// The room screen closed.
    Unmount,
}

impl SubscriptionState {
    pub fn next(self, input: Transition) -> Result<Self> {
        use SubscriptionState::*;
        use Transition::*;

        let next = match (self, input) {
            (_, Unmount) => Closed,
            (Idle, Mount) => Subscribing,
            (Subscribing | Resubscribing | Active, Confirmed) => Active,
            (Subscribing | Resubscribing | Active | Degraded, HealthCheckFailed) => Degraded,
            (Subscribing | Resubscribing, OpenFailed) => Degraded,
            (Degraded, Resubscribe) => Resubscribing,
            (from, input) => return Err(ClientError::InvalidTransition { from, input }),
        };
        Ok(next)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// A live session whose channels are open or being opened.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Subscribing | Self::Active | Self::Resubscribing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionState::*;
    use Transition::*;

    #[test]
    fn happy_path_and_recovery() {
        let mut state = Idle;
        for (input, expected) in [
            (Mount, Subscribing),
            (Confirmed, Active),
            (Confirmed, Active),
            (HealthCheckFailed, Degraded),
            (Resubscribe, Resubscribing),
            (Confirmed, Active),
            (Unmount, Closed),
        ] {
            state = state.next(input).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn open_failure_degrades() {
        assert_eq!(Subscribing.next(OpenFailed).unwrap(), Degraded);
        assert_eq!(Resubscribing.next(OpenFailed).unwrap(), Degraded);
        assert_eq!(Degraded.next(HealthCheckFailed).unwrap(), Degraded);
    }

    #[test]
    fn closed_is_terminal() {
        for input in [Mount, Confirmed, HealthCheckFailed, OpenFailed, Resubscribe] {
            assert!(matches!(
                Closed.next(input),
                Err(ClientError::InvalidTransition { from: Closed, .. })
            ));
        }
        assert_eq!(Closed.next(Unmount).unwrap(), Closed);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(Idle.next(Confirmed).is_err());
        assert!(Active.next(Resubscribe).is_err());
        assert!(Active.next(Mount).is_err());
        assert!(Degraded.next(Confirmed).is_err());
    }
}
