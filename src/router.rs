//! Routing table: configuration-time binding of command kinds to
//! handler, identity rule, lifespan, and dispatch defaults.
//!
//! The router is data, not code: registration populates an immutable
//! `TypeId`-keyed table and dispatch is a single lookup. Route entries
//! hold their handler and identity rule as erased closures so one table
//! serves every command type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::command::{
    Command, CommandHandler, Consistency, ErrorOf, EventOf, Produced, Returning, Timeout,
    short_type_name,
};
use crate::error::RouterError;
use crate::lifespan::{AggregateLifespan, DefaultLifespan};
use crate::pipeline::Middleware;

/// How the raw aggregate identity is extracted from a command.
pub(crate) enum IdentityRule<C> {
    /// Read the named field from the command's serialized form.
    Field(String),
    /// Apply a unary function to the command.
    By(Arc<dyn Fn(&C) -> Option<String> + Send + Sync>),
}

impl<C> Clone for IdentityRule<C> {
    fn clone(&self) -> Self {
        match self {
            IdentityRule::Field(name) => IdentityRule::Field(name.clone()),
            IdentityRule::By(f) => IdentityRule::By(f.clone()),
        }
    }
}

/// The stream prefix prepended to the raw identity.
#[derive(Clone)]
pub(crate) enum IdentityPrefix {
    /// A literal string.
    Literal(String),
    /// A zero-arg function evaluated per dispatch.
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl IdentityPrefix {
    pub(crate) fn evaluate(&self) -> String {
        match self {
            IdentityPrefix::Literal(prefix) => prefix.clone(),
            IdentityPrefix::Dynamic(f) => f(),
        }
    }
}

/// Configuration for one command kind, registered on a [`Router`].
///
/// Every setting beyond the handler is optional: identity may come from
/// the aggregate-level [`Identify`] directive, the lifespan defaults to
/// keep-alive-forever, and unset dispatch defaults fall through to the
/// router and system defaults.
///
/// # Examples
///
/// ```ignore
/// let route = Route::new(BankAccountHandler)
///     .identify_field("account_number")
///     .prefix("bank-account-")
///     .timeout(Duration::from_secs(2));
/// ```
pub struct Route<C: Command> {
    pub(crate) handler:
        Arc<dyn Fn(&C::Aggregate, &C) -> Result<Produced<EventOf<C>>, ErrorOf<C>> + Send + Sync>,
    pub(crate) identity: Option<IdentityRule<C>>,
    pub(crate) prefix: Option<IdentityPrefix>,
    pub(crate) lifespan: Arc<dyn AggregateLifespan<C::Aggregate>>,
    pub(crate) consistency: Option<Consistency>,
    pub(crate) returning: Option<Returning>,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) retry_attempts: Option<u32>,
}

impl<C: Command> Route<C> {
    /// Bind `handler` as the decision function for this command kind.
    pub fn new(handler: impl CommandHandler<C>) -> Self {
        let erased: Arc<
            dyn Fn(&C::Aggregate, &C) -> Result<Produced<EventOf<C>>, ErrorOf<C>> + Send + Sync,
        > = Arc::new(move |state, command| handler.handle(state, command));
        Self {
            handler: erased,
            identity: None,
            prefix: None,
            lifespan: Arc::new(DefaultLifespan),
            consistency: None,
            returning: None,
            timeout: None,
            retry_attempts: None,
        }
    }

    /// Extract the identity by reading `field` from the serialized
    /// command. String and integer values are accepted; anything else
    /// fails the dispatch with `InvalidAggregateIdentity`.
    pub fn identify_field(mut self, field: impl Into<String>) -> Self {
        self.identity = Some(IdentityRule::Field(field.into()));
        self
    }

    /// Extract the identity with a unary function over the command.
    /// Returning `None` or an empty string fails the dispatch.
    pub fn identify_by(
        mut self,
        f: impl Fn(&C) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.identity = Some(IdentityRule::By(Arc::new(f)));
        self
    }

    /// Prepend a literal prefix to the identity.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(IdentityPrefix::Literal(prefix.into()));
        self
    }

    /// Prepend a prefix computed per dispatch.
    pub fn prefix_with(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.prefix = Some(IdentityPrefix::Dynamic(Arc::new(f)));
        self
    }

    /// Lifespan policy for instances executing this command.
    pub fn lifespan(mut self, lifespan: impl AggregateLifespan<C::Aggregate>) -> Self {
        self.lifespan = Arc::new(lifespan);
        self
    }

    /// Default consistency for this command kind.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Default reply shape for this command kind.
    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = Some(returning);
        self
    }

    /// Default dispatch deadline for this command kind.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Default retry budget for this command kind.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }
}

/// Aggregate-level identity directive: applies to every command routed
/// to the aggregate that lacks a per-command rule.
pub struct Identify {
    pub(crate) field: String,
    pub(crate) prefix: Option<IdentityPrefix>,
}

impl Identify {
    /// Identify the aggregate by reading `field` from each command.
    pub fn by_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            prefix: None,
        }
    }

    /// Prepend a literal prefix to the identity.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(IdentityPrefix::Literal(prefix.into()));
        self
    }

    /// Prepend a prefix computed per dispatch.
    pub fn prefix_with(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.prefix = Some(IdentityPrefix::Dynamic(Arc::new(f)));
        self
    }
}

pub(crate) struct AggregateIdentity {
    pub field: String,
    pub prefix: Option<IdentityPrefix>,
}

/// One registered command kind, with the typed entry erased behind
/// `Any` and the facts the builder needs for validation kept unerased.
pub(crate) struct RouteSlot {
    pub command_kind: &'static str,
    pub aggregate_kind: &'static str,
    pub has_identity: bool,
    pub default_consistency: Option<Consistency>,
    entry: Box<dyn Any + Send + Sync>,
}

/// Router-wide dispatch defaults, below per-command registration and
/// above the system defaults.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouterDefaults {
    pub consistency: Option<Consistency>,
    pub returning: Option<Returning>,
    pub timeout: Option<Timeout>,
    pub retry_attempts: Option<u32>,
}

/// Immutable table mapping command kinds to their dispatch
/// configuration.
///
/// Built declaratively and consumed by
/// [`ApplicationBuilder`](crate::ApplicationBuilder); never mutated
/// after the application is built.
#[derive(Default)]
pub struct Router {
    routes: HashMap<TypeId, RouteSlot>,
    identities: HashMap<&'static str, AggregateIdentity>,
    middleware: Vec<Arc<dyn Middleware>>,
    defaults: RouterDefaults,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route` for command kind `C`.
    ///
    /// # Errors
    ///
    /// * [`RouterError::DuplicateCommand`] if `C` is already registered.
    /// * [`RouterError::EmptyIdentityField`] if a field-selector rule
    ///   names an empty field.
    pub fn register<C: Command>(mut self, route: Route<C>) -> Result<Self, RouterError> {
        if let Some(IdentityRule::Field(field)) = &route.identity
            && field.is_empty()
        {
            return Err(RouterError::EmptyIdentityField);
        }

        let key = TypeId::of::<C>();
        if self.routes.contains_key(&key) {
            return Err(RouterError::DuplicateCommand(short_type_name::<C>()));
        }

        self.routes.insert(
            key,
            RouteSlot {
                command_kind: short_type_name::<C>(),
                aggregate_kind: <C::Aggregate as Aggregate>::KIND,
                has_identity: route.identity.is_some(),
                default_consistency: route.consistency.clone(),
                entry: Box::new(route),
            },
        );
        Ok(self)
    }

    /// Declare an aggregate-level identity for `A`.
    ///
    /// # Errors
    ///
    /// * [`RouterError::EmptyIdentityField`] if the field name is empty.
    /// * [`RouterError::DuplicateIdentify`] if `A` already has one.
    pub fn identify<A: Aggregate>(mut self, identify: Identify) -> Result<Self, RouterError> {
        if identify.field.is_empty() {
            return Err(RouterError::EmptyIdentityField);
        }
        if self.identities.contains_key(A::KIND) {
            return Err(RouterError::DuplicateIdentify(A::KIND));
        }
        self.identities.insert(
            A::KIND,
            AggregateIdentity {
                field: identify.field,
                prefix: identify.prefix,
            },
        );
        Ok(self)
    }

    /// Append a user middleware. User middleware run before the
    /// built-in identity-extraction and consistency-guarantee
    /// middleware, in declaration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Router-wide default consistency.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.defaults.consistency = Some(consistency);
        self
    }

    /// Router-wide default reply shape.
    pub fn default_returning(mut self, returning: Returning) -> Self {
        self.defaults.returning = Some(returning);
        self
    }

    /// Router-wide default dispatch deadline.
    pub fn default_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.defaults.timeout = Some(timeout.into());
        self
    }

    /// Router-wide default retry budget.
    pub fn default_retry_attempts(mut self, attempts: u32) -> Self {
        self.defaults.retry_attempts = Some(attempts);
        self
    }

    /// Typed route lookup: a single map access plus a downcast.
    pub(crate) fn route<C: Command>(&self) -> Option<&Route<C>> {
        self.routes
            .get(&TypeId::of::<C>())
            .and_then(|slot| slot.entry.downcast_ref::<Route<C>>())
    }

    pub(crate) fn identity_for(&self, aggregate_kind: &str) -> Option<&AggregateIdentity> {
        self.identities.get(aggregate_kind)
    }

    pub(crate) fn defaults(&self) -> &RouterDefaults {
        &self.defaults
    }

    pub(crate) fn user_middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    /// Iterate the registered slots for build-time validation.
    pub(crate) fn slots(&self) -> impl Iterator<Item = &RouteSlot> {
        self.routes.values()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.routes.values().map(|s| s.command_kind).collect();
        kinds.sort_unstable();
        f.debug_struct("Router")
            .field("commands", &kinds)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}
