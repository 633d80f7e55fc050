//! Crate-level error types for routing, configuration, and dispatch.

use crate::event_store::EventStoreError;

/// Error returned when dispatching a command fails.
///
/// Generic over `E`, the domain-specific error type that the routed
/// command handler may produce (e.g., "insufficient funds").
///
/// `WrongExpectedVersion` never appears here: version conflicts are
/// absorbed by the aggregate instance's retry loop and only surface as
/// [`TooManyAttempts`](DispatchError::TooManyAttempts) once the retry
/// budget is exhausted.
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E: std::error::Error + Send + Sync + 'static> {
    /// No routing entry exists for the command's kind.
    #[error("no route registered for command {0}")]
    UnregisteredCommand(&'static str),

    /// The identity rule produced an empty or non-string value.
    #[error("command identity resolved to an empty or missing value")]
    InvalidAggregateIdentity,

    /// Command rejected by the handler.
    ///
    /// Wraps the domain-specific error returned from the command
    /// handler, forwarding its `Display` and `Error` impls verbatim.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Each attempt encountered a version conflict with a concurrent
    /// writer and the retry budget ran out.
    #[error("optimistic concurrency conflict: retries exhausted")]
    TooManyAttempts,

    /// The dispatch deadline expired before the instance replied.
    ///
    /// The in-flight command is not cancelled; it runs to completion
    /// inside the instance so the event store is never left half-written.
    #[error("aggregate instance did not reply within the dispatch deadline")]
    ExecutionTimeout,

    /// The aggregate instance stopped before accepting or completing
    /// the command.
    #[error("aggregate instance stopped before completing the command")]
    AggregateStopped,

    /// Events were appended but the nominated subscribers did not
    /// acknowledge them within the dispatch timeout.
    #[error("nominated subscribers did not acknowledge the appended events in time")]
    ConsistencyTimeout,

    /// A nominated subscriber is unknown or declared eventual-only and
    /// therefore can never satisfy a strong consistency wait.
    #[error("subscriber '{0}' cannot satisfy a consistency wait")]
    InvalidConsistency(String),

    /// A middleware halted the dispatch for a reason of its own.
    #[error("dispatch halted by middleware: {0}")]
    Halted(String),

    /// The registry returned a handle of an unexpected type.
    #[error("registry returned an incompatible instance handle: {0}")]
    Registry(String),

    /// Event store failure other than a version conflict.
    #[error(transparent)]
    Store(EventStoreError),
}

/// Error returned when registering routes on a [`Router`](crate::Router).
///
/// All variants are configuration-time failures: a router that built
/// without error never produces them at dispatch time.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The command kind already has a routing entry in this router.
    #[error("command {0} is already registered")]
    DuplicateCommand(&'static str),

    /// A field-selector identity rule was given an empty field name.
    #[error("identity field name must not be empty")]
    EmptyIdentityField,

    /// The aggregate kind already has an `identify` directive.
    #[error("aggregate {0} already has an identity definition")]
    DuplicateIdentify(&'static str),
}

/// Error returned when building an [`Application`](crate::Application).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A registered command has neither a per-command identity rule nor
    /// a per-aggregate `identify` directive.
    #[error("command {0} has no identity rule and aggregate {1} has no identify directive")]
    MissingIdentity(&'static str, &'static str),

    /// A route's default consistency nominates a subscriber that was
    /// never declared on the application.
    #[error("route for {command} nominates unknown subscriber '{subscriber}'")]
    UnknownSubscriber {
        /// Command kind whose route carries the nomination.
        command: &'static str,
        /// The undeclared subscriber name.
        subscriber: String,
    },

    /// A route's default consistency nominates a subscriber declared
    /// eventual-only.
    #[error("route for {command} nominates eventual-only subscriber '{subscriber}'")]
    EventualSubscriber {
        /// Command kind whose route carries the nomination.
        command: &'static str,
        /// The eventual-only subscriber name.
        subscriber: String,
    },
}
