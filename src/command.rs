//! Command contract, handler normalization, and dispatch options.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;

/// Caller-provided metadata forwarded onto every appended event.
pub type Metadata = HashMap<String, Value>;

/// Event type of the aggregate a command is routed to.
pub type EventOf<C> = <<C as Command>::Aggregate as Aggregate>::Event;

/// Domain error type of the aggregate a command is routed to.
pub type ErrorOf<C> = <<C as Command>::Aggregate as Aggregate>::Error;

/// An intention to change an aggregate.
///
/// The runtime treats commands as opaque domain values except for
/// identity extraction, which is why commands must be `Serialize`: a
/// field-selector identity rule reads the named field from the
/// command's serialized form.
///
/// The associated `Aggregate` type is the compile-time half of the
/// routing table -- it fixes which aggregate kind the command targets,
/// while the [`Router`](crate::Router) supplies the handler, identity
/// rule, lifespan, and defaults at configuration time.
pub trait Command: Serialize + Send + Sync + 'static {
    /// The aggregate kind this command is addressed to.
    type Aggregate: Aggregate;
}

/// Normalized output of a command handler.
///
/// Handlers produce zero or more events, optionally paired with an
/// inline domain reply. The reply is surfaced to the caller only when
/// the dispatch requests [`Returning::ExecutionResult`]; every other
/// returning mode drops it.
#[derive(Debug, Clone, PartialEq)]
pub enum Produced<E> {
    /// Zero or more events.
    Events(Vec<E>),
    /// Events plus an inline domain reply.
    EventsWithReply {
        /// The produced events.
        events: Vec<E>,
        /// Domain reply forwarded via `ExecutionResult::reply`.
        reply: Value,
    },
}

impl<E> Produced<E> {
    /// Borrow the produced events regardless of variant.
    pub fn events(&self) -> &[E] {
        match self {
            Produced::Events(events) => events,
            Produced::EventsWithReply { events, .. } => events,
        }
    }

    /// Split into the event list and the optional inline reply.
    pub(crate) fn into_parts(self) -> (Vec<E>, Option<Value>) {
        match self {
            Produced::Events(events) => (events, None),
            Produced::EventsWithReply { events, reply } => (events, Some(reply)),
        }
    }
}

impl<E> From<Vec<E>> for Produced<E> {
    fn from(events: Vec<E>) -> Self {
        Produced::Events(events)
    }
}

/// A command handler: the pure decision function applied to the current
/// aggregate state.
///
/// # Contract
///
/// - `handle` must not perform I/O or mutate external state. The
///   instance re-executes it after an optimistic-concurrency conflict,
///   so it must be deterministic in `(state, command)`.
/// - Return `Ok(vec![].into())` for a no-op command, `Err` to reject it.
///
/// Closures of the matching shape implement this trait, so simple
/// routes can be registered without a named handler type.
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Decide which events `command` produces against `state`.
    fn handle(
        &self,
        state: &C::Aggregate,
        command: &C,
    ) -> Result<Produced<EventOf<C>>, ErrorOf<C>>;
}

impl<C, F> CommandHandler<C> for F
where
    C: Command,
    F: Fn(&C::Aggregate, &C) -> Result<Produced<EventOf<C>>, ErrorOf<C>>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        state: &C::Aggregate,
        command: &C,
    ) -> Result<Produced<EventOf<C>>, ErrorOf<C>> {
        self(state, command)
    }
}

/// How long a dispatch waits for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Release the caller after this long.
    After(Duration),
}

impl Timeout {
    /// System default dispatch deadline: 5 seconds.
    pub const DEFAULT: Timeout = Timeout::After(Duration::from_millis(5000));
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::DEFAULT
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

/// Which downstream subscribers a dispatch waits on before returning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Return as soon as the events are appended.
    #[default]
    Eventual,
    /// Wait for every subscriber declared strongly consistent on the
    /// application.
    Strong,
    /// Wait for exactly these subscribers, by declared name.
    Subscribers(Vec<String>),
}

/// Which shape the dispatch reply takes on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Returning {
    /// A bare acknowledgement.
    #[default]
    None,
    /// The aggregate's state after the command.
    AggregateState,
    /// The aggregate's version after the command.
    AggregateVersion,
    /// The full execution result (state, version, events, metadata,
    /// optional inline reply).
    ExecutionResult,
}

/// System default retry budget for optimistic-concurrency conflicts.
pub(crate) const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

/// Per-dispatch options layered over the route and router defaults.
///
/// Every field is optional; an unset field falls through to the
/// per-command registration, then the router default, then the system
/// default.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use commandry::{Consistency, DispatchOpts, Returning};
///
/// let opts = DispatchOpts::default()
///     .returning(Returning::ExecutionResult)
///     .consistency(Consistency::Strong)
///     .timeout(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatchOpts {
    /// UUID of the message that caused this dispatch, if any.
    pub causation_id: Option<Uuid>,
    /// Correlation UUID; generated when absent.
    pub correlation_id: Option<Uuid>,
    /// Metadata merged onto every appended event.
    pub metadata: Metadata,
    /// Consistency override.
    pub consistency: Option<Consistency>,
    /// Returning override.
    pub returning: Option<Returning>,
    /// Deadline override.
    pub timeout: Option<Timeout>,
    /// Retry budget override.
    pub retry_attempts: Option<u32>,
}

impl DispatchOpts {
    /// Set the causation UUID.
    pub fn causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Set the correlation UUID.
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Insert one metadata entry.
    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the consistency mode.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Set the reply shape.
    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = Some(returning);
        self
    }

    /// Set the dispatch deadline.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Set the optimistic-concurrency retry budget.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }
}

impl From<Duration> for DispatchOpts {
    fn from(duration: Duration) -> Self {
        DispatchOpts::default().timeout(duration)
    }
}

impl From<Timeout> for DispatchOpts {
    fn from(timeout: Timeout) -> Self {
        DispatchOpts::default().timeout(timeout)
    }
}

/// Last path segment of a type name, generics stripped.
///
/// `std::any::type_name` yields fully qualified names like
/// `my_app::billing::OpenAccount`; routing diagnostics only want the
/// final `OpenAccount`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}
