//! Middleware contract and the mutable pipeline record it operates on.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::command::{Consistency, Metadata, Returning, Timeout};

/// Why a middleware halted the dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The identity rule produced an empty or missing value.
    InvalidAggregateIdentity,
    /// A nominated subscriber cannot satisfy a consistency wait.
    InvalidConsistency(String),
    /// A user middleware halted for a reason of its own.
    Other(String),
}

/// Outcome summary placed on the pipeline after the aggregate instance
/// replied, for the benefit of the after/failure middleware passes.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResponse {
    /// The command executed; events (possibly zero) were appended.
    Executed {
        /// Aggregate version after the command.
        aggregate_version: u64,
        /// How many events the command produced.
        event_count: usize,
    },
    /// The command failed.
    Failed {
        /// Display form of the error.
        error: String,
    },
}

/// Identity resolved by the identity-extraction middleware.
pub(crate) struct ResolvedIdentity {
    pub identity: String,
    pub prefix: Option<String>,
}

/// Deferred identity resolution, captured by the dispatcher over the
/// concrete command and its routing entry so the type-erased middleware
/// can evaluate it.
pub(crate) type IdentityResolver =
    Box<dyn Fn() -> Result<ResolvedIdentity, ()> + Send + Sync>;

/// The mutable record a dispatch threads through its middleware chain.
///
/// Identity fields (`identity`, `identity_prefix`, `stream_uuid`) are
/// unset until the built-in [`IdentityExtraction`] middleware runs;
/// user middleware registered before it must not rely on them in
/// `before_dispatch`.
pub struct Pipeline {
    /// Short name of the command type being dispatched.
    pub command_kind: &'static str,
    /// Kind of the aggregate the command routes to.
    pub aggregate_kind: &'static str,
    /// Unique ID of this dispatch.
    pub command_uuid: Uuid,
    /// UUID of the message that caused this dispatch, if any.
    pub causation_id: Option<Uuid>,
    /// Correlation UUID (generated when the caller supplied none).
    pub correlation_id: Uuid,
    /// Metadata merged onto every appended event.
    pub metadata: Metadata,
    /// Effective consistency mode.
    pub consistency: Consistency,
    /// Effective reply shape.
    pub returning: Returning,
    /// Effective dispatch deadline.
    pub timeout: Timeout,
    /// Effective optimistic-concurrency retry budget.
    pub retry_attempts: u32,
    /// Raw identity extracted from the command.
    pub identity: Option<String>,
    /// Evaluated identity prefix, if any.
    pub identity_prefix: Option<String>,
    /// `prefix ++ identity`, the stream the command executes against.
    pub stream_uuid: Option<String>,
    /// Cross-middleware scratch space, visible to later middleware and
    /// to the inverse pass.
    pub assigns: HashMap<String, Value>,
    /// Outcome summary, set once the aggregate instance replied.
    pub response: Option<PipelineResponse>,
    halted: bool,
    halt_reason: Option<HaltReason>,
    resolver: Option<IdentityResolver>,
}

impl Pipeline {
    pub(crate) fn new(
        command_kind: &'static str,
        aggregate_kind: &'static str,
        causation_id: Option<Uuid>,
        correlation_id: Option<Uuid>,
        metadata: Metadata,
        consistency: Consistency,
        returning: Returning,
        timeout: Timeout,
        retry_attempts: u32,
        resolver: IdentityResolver,
    ) -> Self {
        Self {
            command_kind,
            aggregate_kind,
            command_uuid: Uuid::new_v4(),
            causation_id,
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            metadata,
            consistency,
            returning,
            timeout,
            retry_attempts,
            identity: None,
            identity_prefix: None,
            stream_uuid: None,
            assigns: HashMap::new(),
            response: None,
            halted: false,
            halt_reason: None,
            resolver: Some(resolver),
        }
    }

    /// Stop the dispatch. The before pass short-circuits and the
    /// failure pass runs over the middleware that already executed.
    pub fn halt(&mut self, reason: HaltReason) {
        self.halted = true;
        self.halt_reason = Some(reason);
    }

    /// Whether a middleware has halted this dispatch.
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// The halt reason, if halted.
    pub fn halt_reason(&self) -> Option<&HaltReason> {
        self.halt_reason.as_ref()
    }

    /// Store a cross-middleware value.
    pub fn assign(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.assigns.insert(key.into(), value.into());
    }

    /// Read a value stored by an earlier middleware.
    pub fn assigned(&self, key: &str) -> Option<&Value> {
        self.assigns.get(key)
    }

    pub(crate) fn resolve_identity(&mut self) -> Result<(), ()> {
        let Some(resolver) = self.resolver.as_ref() else {
            return Err(());
        };
        let resolved = resolver()?;
        let stream_uuid = match &resolved.prefix {
            Some(prefix) => format!("{prefix}{}", resolved.identity),
            None => resolved.identity.clone(),
        };
        self.identity = Some(resolved.identity);
        self.identity_prefix = resolved.prefix;
        self.stream_uuid = Some(stream_uuid);
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("command_kind", &self.command_kind)
            .field("aggregate_kind", &self.aggregate_kind)
            .field("command_uuid", &self.command_uuid)
            .field("correlation_id", &self.correlation_id)
            .field("stream_uuid", &self.stream_uuid)
            .field("halted", &self.halted)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// A dispatch middleware: three synchronous hooks over the [`Pipeline`].
///
/// `before_dispatch` runs in registration order; `after_dispatch` and
/// `after_failure` run in reverse. All hooks default to no-ops so a
/// middleware implements only the passes it cares about.
pub trait Middleware: Send + Sync + 'static {
    /// Runs before the command reaches the aggregate instance.
    fn before_dispatch(&self, _pipeline: &mut Pipeline) {}

    /// Runs after a successful execution, in reverse order.
    fn after_dispatch(&self, _pipeline: &mut Pipeline) {}

    /// Runs after a halt or failed execution, in reverse order.
    fn after_failure(&self, _pipeline: &mut Pipeline) {}
}

/// Run the before pass over `chain` in order.
///
/// Returns how many middleware ran, so a halting dispatch can run its
/// failure pass over exactly that prefix.
pub(crate) fn run_before(chain: &[Arc<dyn Middleware>], pipeline: &mut Pipeline) -> usize {
    for (ran, middleware) in chain.iter().enumerate() {
        middleware.before_dispatch(pipeline);
        if pipeline.halted() {
            return ran + 1;
        }
    }
    chain.len()
}

/// Run the after pass over the first `ran` middleware, in reverse.
pub(crate) fn run_after(chain: &[Arc<dyn Middleware>], ran: usize, pipeline: &mut Pipeline) {
    for middleware in chain[..ran].iter().rev() {
        middleware.after_dispatch(pipeline);
    }
}

/// Run the failure pass over the first `ran` middleware, in reverse.
pub(crate) fn run_failure(chain: &[Arc<dyn Middleware>], ran: usize, pipeline: &mut Pipeline) {
    for middleware in chain[..ran].iter().rev() {
        middleware.after_failure(pipeline);
    }
}

/// Built-in middleware that resolves the aggregate identity.
///
/// Evaluates the routing entry's identity rule against the command,
/// applies the prefix, and populates `identity`, `identity_prefix`, and
/// `stream_uuid` on the pipeline so every later middleware sees a fully
/// populated record. Halts with
/// [`HaltReason::InvalidAggregateIdentity`] when the rule yields
/// nothing usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtraction;

impl Middleware for IdentityExtraction {
    fn before_dispatch(&self, pipeline: &mut Pipeline) {
        if pipeline.resolve_identity().is_err() {
            tracing::debug!(
                command_kind = pipeline.command_kind,
                aggregate_kind = pipeline.aggregate_kind,
                "identity rule produced no usable value"
            );
            pipeline.halt(HaltReason::InvalidAggregateIdentity);
        }
    }
}
