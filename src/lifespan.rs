//! Lifespan policy deciding when an aggregate instance terminates.

use std::any::Any;
use std::time::Duration;

use crate::aggregate::Aggregate;

/// Decision returned by a lifespan hook after each command outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Terminate the instance cleanly after responding.
    Stop,
    /// Remain alive with no deadline, releasing transient buffers.
    Hibernate,
    /// Arm an inactivity timer; on expiry, terminate.
    Timeout(Duration),
    /// Remain alive indefinitely.
    Infinity,
}

/// Strategy consulted by an aggregate instance after every outcome.
///
/// Hook precedence per outcome: a failed command consults
/// [`after_error`](AggregateLifespan::after_error); a command that
/// produced events consults [`after_event`](AggregateLifespan::after_event)
/// once per event (the last decision wins); an event-less success
/// consults [`after_command`](AggregateLifespan::after_command).
///
/// `after_command` receives the command type-erased because one
/// aggregate serves many command types; implementors downcast with
/// [`Any::downcast_ref`] when they need the concrete command.
///
/// All hooks default to [`Lifespan::Infinity`], so a policy only
/// overrides the cases it cares about.
pub trait AggregateLifespan<A: Aggregate>: Send + Sync + 'static {
    /// Called after a successful command that produced no events.
    fn after_command(&self, _command: &dyn Any) -> Lifespan {
        Lifespan::Infinity
    }

    /// Called once per produced event; the last decision wins.
    fn after_event(&self, _event: &A::Event) -> Lifespan {
        Lifespan::Infinity
    }

    /// Called after a failed command.
    fn after_error(&self, _error: &A::Error) -> Lifespan {
        Lifespan::Infinity
    }
}

/// The system default lifespan: keep the instance alive forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLifespan;

impl<A: Aggregate> AggregateLifespan<A> for DefaultLifespan {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{BankAccount, BankAccountError, BankAccountEvent};

    #[test]
    fn default_lifespan_keeps_instance_alive() {
        let lifespan = DefaultLifespan;
        let command: Box<dyn Any> = Box::new(());
        assert_eq!(
            AggregateLifespan::<BankAccount>::after_command(&lifespan, command.as_ref()),
            Lifespan::Infinity
        );
        assert_eq!(
            AggregateLifespan::<BankAccount>::after_event(
                &lifespan,
                &BankAccountEvent::Deposited { amount: 1 }
            ),
            Lifespan::Infinity
        );
        assert_eq!(
            AggregateLifespan::<BankAccount>::after_error(&lifespan, &BankAccountError::NotOpened),
            Lifespan::Infinity
        );
    }

    #[test]
    fn custom_lifespan_can_downcast_command() {
        struct StopOnUnit;
        impl AggregateLifespan<BankAccount> for StopOnUnit {
            fn after_command(&self, command: &dyn Any) -> Lifespan {
                if command.downcast_ref::<()>().is_some() {
                    Lifespan::Stop
                } else {
                    Lifespan::Infinity
                }
            }
        }

        let lifespan = StopOnUnit;
        let unit: Box<dyn Any> = Box::new(());
        let other: Box<dyn Any> = Box::new(42u32);
        assert_eq!(lifespan.after_command(unit.as_ref()), Lifespan::Stop);
        assert_eq!(lifespan.after_command(other.as_ref()), Lifespan::Infinity);
    }
}
