//! Top-level entry point that composes the router, event store,
//! registry, pub/sub bus, and consistency coordinator into a single
//! `Application` type, and implements the dispatch flow.
//!
//! Dispatch flow: route lookup, effective-settings merge, middleware
//! before pass, find-or-create of the aggregate instance, deadline-bound
//! request/reply, middleware after pass, consistency wait, and
//! projection to the requested reply shape.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::aggregate::{Aggregate, decode_event};
use crate::command::{
    Command, Consistency, DEFAULT_RETRY_ATTEMPTS, DispatchOpts, ErrorOf, Metadata, Returning,
    Timeout, short_type_name,
};
use crate::consistency::{
    ACK_TOPIC, Ack, ConsistencyCoordinator, ConsistencyGuarantee, SubscriberConsistency,
    SubscriberRegistry,
};
use crate::error::{BuildError, DispatchError};
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore};
use crate::instance::{
    ExecutionError, ExecutionRequest, InstanceConfig, InstanceHandle, spawn_instance,
};
use crate::pipeline::{
    HaltReason, IdentityExtraction, Middleware, Pipeline, PipelineResponse, ResolvedIdentity,
    run_after, run_before, run_failure,
};
use crate::pubsub::{LocalPubSub, PubSub, stream_topic};
use crate::registry::{ErasedHandle, InstanceFactory, InstanceKey, LocalRegistry, Registry};
use crate::router::{IdentityRule, Route, Router};

/// How many events a direct state read pulls from the store per batch.
const STATE_READ_BATCH: usize = 100;

/// The value returned when a dispatch requests
/// [`Returning::ExecutionResult`].
pub struct ExecutionResult<A: Aggregate> {
    /// The stream the command executed against.
    pub aggregate_uuid: String,
    /// Aggregate state after the command.
    pub aggregate_state: A,
    /// Aggregate version after the command.
    pub aggregate_version: u64,
    /// The events the command produced, in append order.
    pub events: Vec<A::Event>,
    /// The metadata the events were enriched with.
    pub metadata: Metadata,
    /// Inline handler reply, when the handler produced one.
    pub reply: Option<Value>,
}

impl<A: Aggregate> std::fmt::Debug for ExecutionResult<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("aggregate_uuid", &self.aggregate_uuid)
            .field("aggregate_version", &self.aggregate_version)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Successful dispatch reply, shaped by the effective
/// [`Returning`] mode.
pub enum Dispatched<A: Aggregate> {
    /// `Returning::None`: a bare acknowledgement.
    Ok,
    /// `Returning::AggregateState`.
    AggregateState(A),
    /// `Returning::AggregateVersion`.
    AggregateVersion(u64),
    /// `Returning::ExecutionResult`.
    ExecutionResult(ExecutionResult<A>),
}

impl<A: Aggregate> Dispatched<A> {
    /// The aggregate version, when the reply shape carries one.
    pub fn aggregate_version(&self) -> Option<u64> {
        match self {
            Dispatched::Ok | Dispatched::AggregateState(_) => None,
            Dispatched::AggregateVersion(version) => Some(*version),
            Dispatched::ExecutionResult(result) => Some(result.aggregate_version),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for Dispatched<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatched::Ok => f.write_str("Ok"),
            Dispatched::AggregateState(_) => f.write_str("AggregateState(..)"),
            Dispatched::AggregateVersion(version) => {
                write!(f, "AggregateVersion({version})")
            }
            Dispatched::ExecutionResult(result) => {
                write!(f, "ExecutionResult(version: {})", result.aggregate_version)
            }
        }
    }
}

struct AppInner {
    router: Router,
    event_store: Arc<dyn EventStore>,
    registry: Arc<dyn Registry>,
    pubsub: Arc<dyn PubSub>,
    coordinator: ConsistencyCoordinator,
    subscribers: SubscriberRegistry,
    snapshots: HashMap<&'static str, u64>,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Handle to a hosting runtime: router plus infrastructure.
///
/// `Clone + Send + Sync` -- cloning shares the underlying state, so one
/// application can be dispatched to from many tasks.
///
/// # Examples
///
/// ```no_run
/// # use commandry::{Application, Router};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let router = Router::new(); // .register::<OpenAccount>(...)
/// let app = Application::builder(router).build().await?;
/// // app.dispatch(OpenAccount { .. }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Create a builder around `router`.
    pub fn builder(router: Router) -> ApplicationBuilder {
        ApplicationBuilder {
            router,
            event_store: None,
            registry: None,
            pubsub: None,
            subscribers: SubscriberRegistry::default(),
            snapshots: HashMap::new(),
        }
    }

    /// Dispatch `command` with default options.
    pub async fn dispatch<C: Command>(
        &self,
        command: C,
    ) -> Result<Dispatched<C::Aggregate>, DispatchError<ErrorOf<C>>> {
        self.dispatch_with(command, DispatchOpts::default()).await
    }

    /// Dispatch `command` with explicit options, or a bare timeout via
    /// `Duration`/[`Timeout`].
    pub async fn dispatch_with<C: Command>(
        &self,
        command: C,
        opts: impl Into<DispatchOpts>,
    ) -> Result<Dispatched<C::Aggregate>, DispatchError<ErrorOf<C>>> {
        self.run_dispatch(command, opts.into()).await
    }

    /// Publish a subscriber acknowledgement on the ack topic.
    ///
    /// Downstream subscribers call this after processing a stream up to
    /// `version`, releasing any dispatch waiting on them.
    pub async fn ack(
        &self,
        subscriber: impl Into<String>,
        stream_uuid: impl Into<String>,
        version: u64,
    ) {
        let ack = Ack {
            subscriber: subscriber.into(),
            stream_uuid: stream_uuid.into(),
            version,
        };
        match serde_json::to_value(&ack) {
            Ok(message) => self.inner.pubsub.publish(ACK_TOPIC, message).await,
            Err(e) => tracing::warn!(error = %e, "failed to serialize ack"),
        }
    }

    /// Current state and version of the aggregate behind `stream_uuid`.
    ///
    /// Asks the live instance when one exists; otherwise folds the
    /// stream directly from the event store without spawning one.
    pub async fn aggregate_state<A: Aggregate>(
        &self,
        stream_uuid: &str,
    ) -> Result<(A, u64), EventStoreError> {
        let key = InstanceKey::new(A::KIND, stream_uuid);
        if let Some(erased) = self.inner.registry.whereis(&key).await
            && let Ok(handle) = erased.downcast::<InstanceHandle<A>>()
        {
            if let Some(result) = handle.state().await {
                return result;
            }
        }

        // No live instance: fold the stream here.
        let mut state = A::default();
        let mut version = 0u64;
        loop {
            let batch = match self
                .inner
                .event_store
                .read_stream_forward(stream_uuid, version + 1, STATE_READ_BATCH)
                .await
            {
                Ok(batch) => batch,
                Err(EventStoreError::StreamNotFound(_)) => break,
                Err(e) => return Err(e),
            };
            let batch_len = batch.len();
            for recorded in &batch {
                if let Some(event) = decode_event::<A>(recorded) {
                    state = state.apply(&event);
                }
                version = recorded.stream_version;
            }
            if batch_len < STATE_READ_BATCH {
                break;
            }
        }
        Ok((state, version))
    }

    /// Subscribe to the event notifications published for one stream.
    pub async fn subscribe_stream(&self, stream_uuid: &str) -> broadcast::Receiver<Value> {
        self.inner.pubsub.subscribe(&stream_topic(stream_uuid)).await
    }

    /// The event store this application executes against.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.inner.event_store
    }

    /// The pub/sub bus this application publishes on.
    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.inner.pubsub
    }

    async fn run_dispatch<C: Command>(
        &self,
        command: C,
        opts: DispatchOpts,
    ) -> Result<Dispatched<C::Aggregate>, DispatchError<ErrorOf<C>>> {
        let aggregate_kind = <C::Aggregate as Aggregate>::KIND;
        let inner = &self.inner;
        let Some(route) = inner.router.route::<C>() else {
            return Err(DispatchError::UnregisteredCommand(short_type_name::<C>()));
        };

        // Effective settings: per-call, then per-command, then router,
        // then system defaults.
        let defaults = inner.router.defaults();
        let consistency = opts
            .consistency
            .or_else(|| route.consistency.clone())
            .or_else(|| defaults.consistency.clone())
            .unwrap_or_default();
        let returning = opts
            .returning
            .or(route.returning)
            .or(defaults.returning)
            .unwrap_or_default();
        let timeout = opts
            .timeout
            .or(route.timeout)
            .or(defaults.timeout)
            .unwrap_or_default();
        let retry_attempts = opts
            .retry_attempts
            .or(route.retry_attempts)
            .or(defaults.retry_attempts)
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS);

        let command = Arc::new(command);
        let resolver = identity_resolver::<C>(command.clone(), route, &inner.router);

        let mut pipeline = Pipeline::new(
            short_type_name::<C>(),
            aggregate_kind,
            opts.causation_id,
            opts.correlation_id,
            opts.metadata,
            consistency,
            returning,
            timeout,
            retry_attempts,
            resolver,
        );
        tracing::debug!(
            command_kind = pipeline.command_kind,
            aggregate_kind = pipeline.aggregate_kind,
            command_uuid = %pipeline.command_uuid,
            "dispatching command"
        );

        let chain = &inner.middleware;
        let ran = run_before(chain, &mut pipeline);
        if pipeline.halted() {
            run_failure(chain, ran, &mut pipeline);
            return Err(halt_error(&pipeline));
        }

        let Some(stream_uuid) = pipeline.stream_uuid.clone() else {
            // Identity extraction did not run; treat as an identity
            // failure rather than executing against a nameless stream.
            run_failure(chain, ran, &mut pipeline);
            return Err(DispatchError::InvalidAggregateIdentity);
        };

        // Locate or spawn the instance. The registry guarantees at most
        // one live instance per key.
        let key = InstanceKey::new(aggregate_kind, stream_uuid.clone());
        let config = InstanceConfig {
            snapshot_every: inner.snapshots.get(aggregate_kind).copied(),
        };
        let handle = self.lookup_instance::<C>(&key, &stream_uuid, config).await;
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                pipeline.response = Some(PipelineResponse::Failed {
                    error: e.to_string(),
                });
                run_failure(chain, ran, &mut pipeline);
                return Err(e);
            }
        };

        let request = ExecutionRequest::<C::Aggregate> {
            command_uuid: pipeline.command_uuid,
            correlation_id: pipeline.correlation_id,
            metadata: pipeline.metadata.clone(),
            retry_attempts: pipeline.retry_attempts,
            handler: {
                let handler = route.handler.clone();
                let command = command.clone();
                Box::new(move |state| (*handler)(state, &command))
            },
            command: command.clone() as Arc<dyn Any + Send + Sync>,
            lifespan: route.lifespan.clone(),
        };

        // Submit; if the instance stopped before accepting, nothing was
        // executed, so re-routing to a fresh instance once is safe.
        let rx = 'submit: {
            let (tx, rx) = oneshot::channel();
            let request = match handle.execute(request, tx).await {
                Ok(()) => break 'submit rx,
                Err(request) => request,
            };

            inner.registry.evict(&key).await;
            if let Ok(handle) = self.lookup_instance::<C>(&key, &stream_uuid, config).await {
                let (tx, rx) = oneshot::channel();
                if handle.execute(request, tx).await.is_ok() {
                    break 'submit rx;
                }
            }

            pipeline.response = Some(PipelineResponse::Failed {
                error: "aggregate instance stopped".to_string(),
            });
            run_failure(chain, ran, &mut pipeline);
            return Err(DispatchError::AggregateStopped);
        };

        // Await the reply under the dispatch deadline. The instance is
        // never cancelled: an expired caller is released while the
        // in-flight command runs to completion.
        let reply = match pipeline.timeout {
            Timeout::Infinite => rx.await,
            Timeout::After(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(reply) => reply,
                Err(_elapsed) => {
                    pipeline.response = Some(PipelineResponse::Failed {
                        error: "dispatch deadline expired".to_string(),
                    });
                    run_failure(chain, ran, &mut pipeline);
                    return Err(DispatchError::ExecutionTimeout);
                }
            },
        };

        let execution = match reply {
            Ok(Ok(execution)) => execution,
            Ok(Err(error)) => {
                let error = match error {
                    ExecutionError::Domain(e) => DispatchError::Domain(e),
                    ExecutionError::TooManyAttempts => DispatchError::TooManyAttempts,
                    ExecutionError::Store(e) => DispatchError::Store(e),
                };
                pipeline.response = Some(PipelineResponse::Failed {
                    error: error.to_string(),
                });
                run_failure(chain, ran, &mut pipeline);
                return Err(error);
            }
            Err(_recv) => {
                pipeline.response = Some(PipelineResponse::Failed {
                    error: "aggregate instance stopped".to_string(),
                });
                run_failure(chain, ran, &mut pipeline);
                return Err(DispatchError::AggregateStopped);
            }
        };

        pipeline.response = Some(PipelineResponse::Executed {
            aggregate_version: execution.aggregate_version,
            event_count: execution.events.len(),
        });
        run_after(chain, ran, &mut pipeline);

        // Consistency wait: only after events actually landed.
        if !execution.events.is_empty() {
            let required = inner.subscribers.required(&pipeline.consistency);
            if !required.is_empty()
                && inner
                    .coordinator
                    .wait_for(
                        &stream_uuid,
                        execution.aggregate_version,
                        &required,
                        pipeline.timeout,
                    )
                    .await
                    .is_err()
            {
                return Err(DispatchError::ConsistencyTimeout);
            }
        }

        Ok(match pipeline.returning {
            Returning::None => Dispatched::Ok,
            Returning::AggregateState => Dispatched::AggregateState(execution.aggregate_state),
            Returning::AggregateVersion => {
                Dispatched::AggregateVersion(execution.aggregate_version)
            }
            Returning::ExecutionResult => Dispatched::ExecutionResult(ExecutionResult {
                aggregate_uuid: stream_uuid,
                aggregate_state: execution.aggregate_state,
                aggregate_version: execution.aggregate_version,
                events: execution.events,
                metadata: pipeline.metadata.clone(),
                reply: execution.reply,
            }),
        })
    }

    /// Find-or-create the instance for `key`, downcasting the erased
    /// handle back to its typed form.
    async fn lookup_instance<C: Command>(
        &self,
        key: &InstanceKey,
        stream_uuid: &str,
        config: InstanceConfig,
    ) -> Result<Arc<InstanceHandle<C::Aggregate>>, DispatchError<ErrorOf<C>>> {
        let factory = instance_factory::<C::Aggregate>(
            stream_uuid.to_owned(),
            self.inner.event_store.clone(),
            self.inner.pubsub.clone(),
            config,
        );
        let (erased, _created) = self.inner.registry.start_or_lookup(key.clone(), factory).await;
        erased.downcast::<InstanceHandle<C::Aggregate>>().map_err(|_| {
            DispatchError::Registry(format!(
                "handle for {}/{} is not an instance of {}",
                key.aggregate_kind,
                key.stream_uuid,
                short_type_name::<C::Aggregate>(),
            ))
        })
    }
}

/// Build the erased spawn closure the registry invokes on a miss.
fn instance_factory<A: Aggregate>(
    stream_uuid: String,
    store: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSub>,
    config: InstanceConfig,
) -> InstanceFactory {
    Box::new(move || {
        let handle = spawn_instance::<A>(stream_uuid, store, pubsub, config);
        let probe = handle.clone();
        (
            Arc::new(handle) as ErasedHandle,
            Box::new(move || probe.is_alive()),
        )
    })
}

/// Capture the identity rule and prefix over the concrete command so
/// the type-erased identity-extraction middleware can evaluate them.
fn identity_resolver<C: Command>(
    command: Arc<C>,
    route: &Route<C>,
    router: &Router,
) -> crate::pipeline::IdentityResolver {
    let aggregate_identity = router.identity_for(<C::Aggregate as Aggregate>::KIND);
    let rule = route.identity.clone().or_else(|| {
        aggregate_identity.map(|identity| IdentityRule::Field(identity.field.clone()))
    });
    let prefix = route
        .prefix
        .clone()
        .or_else(|| aggregate_identity.and_then(|identity| identity.prefix.clone()));

    Box::new(move || {
        let rule = rule.as_ref().ok_or(())?;
        let identity = match rule {
            IdentityRule::Field(field) => {
                let value = serde_json::to_value(&*command).map_err(|_| ())?;
                field_identity(&value, field)
            }
            IdentityRule::By(f) => f(&command).filter(|identity| !identity.is_empty()),
        }
        .ok_or(())?;
        Ok(ResolvedIdentity {
            identity,
            prefix: prefix.as_ref().map(|p| p.evaluate()),
        })
    })
}

/// Read a usable identity out of a serialized command field.
///
/// Non-empty strings pass through; integers are stringified; anything
/// else is an invalid identity.
fn field_identity(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn halt_error<E: std::error::Error + Send + Sync + 'static>(
    pipeline: &Pipeline,
) -> DispatchError<E> {
    match pipeline.halt_reason() {
        Some(HaltReason::InvalidAggregateIdentity) => DispatchError::InvalidAggregateIdentity,
        Some(HaltReason::InvalidConsistency(name)) => {
            DispatchError::InvalidConsistency(name.clone())
        }
        Some(HaltReason::Other(reason)) => DispatchError::Halted(reason.clone()),
        None => DispatchError::Halted("halted without a reason".to_string()),
    }
}

/// Builder for configuring an [`Application`].
///
/// Infrastructure left unset falls back to the in-process defaults:
/// [`InMemoryEventStore`], [`LocalRegistry`], and [`LocalPubSub`].
pub struct ApplicationBuilder {
    router: Router,
    event_store: Option<Arc<dyn EventStore>>,
    registry: Option<Arc<dyn Registry>>,
    pubsub: Option<Arc<dyn PubSub>>,
    subscribers: SubscriberRegistry,
    snapshots: HashMap<&'static str, u64>,
}

impl ApplicationBuilder {
    /// Use `store` as the event store.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Use `registry` as the process registry.
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `pubsub` as the pub/sub bus.
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Declare a downstream subscriber by name.
    ///
    /// Strong subscribers participate in `Consistency::Strong` waits
    /// and may be nominated explicitly; eventual subscribers are never
    /// waited on.
    pub fn subscriber(
        mut self,
        name: impl Into<String>,
        consistency: SubscriberConsistency,
    ) -> Self {
        self.subscribers.declare(name, consistency);
        self
    }

    /// Record a snapshot of `A` every `every` events.
    pub fn snapshot_every<A: Aggregate>(mut self, every: u64) -> Self {
        self.snapshots.insert(A::KIND, every);
        self
    }

    /// Validate the configuration and assemble the application.
    ///
    /// Spawns the consistency coordinator's ack listener.
    ///
    /// # Errors
    ///
    /// * [`BuildError::MissingIdentity`] when a route has no identity
    ///   rule and its aggregate no `identify` directive.
    /// * [`BuildError::UnknownSubscriber`] /
    ///   [`BuildError::EventualSubscriber`] when a route's default
    ///   consistency nominates an unusable subscriber.
    pub async fn build(self) -> Result<Application, BuildError> {
        for slot in self.router.slots() {
            if !slot.has_identity && self.router.identity_for(slot.aggregate_kind).is_none() {
                return Err(BuildError::MissingIdentity(
                    slot.command_kind,
                    slot.aggregate_kind,
                ));
            }
            if let Some(Consistency::Subscribers(names)) = &slot.default_consistency {
                for name in names {
                    match self.subscribers.declared(name) {
                        Some(SubscriberConsistency::Strong) => {}
                        Some(SubscriberConsistency::Eventual) => {
                            return Err(BuildError::EventualSubscriber {
                                command: slot.command_kind,
                                subscriber: name.clone(),
                            });
                        }
                        None => {
                            return Err(BuildError::UnknownSubscriber {
                                command: slot.command_kind,
                                subscriber: name.clone(),
                            });
                        }
                    }
                }
            }
        }

        let event_store = self
            .event_store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(LocalRegistry::new()));
        let pubsub = self.pubsub.unwrap_or_else(|| Arc::new(LocalPubSub::new()));

        // User middleware run first, then the built-ins.
        let mut middleware: Vec<Arc<dyn Middleware>> = self.router.user_middleware().to_vec();
        middleware.push(Arc::new(IdentityExtraction));
        middleware.push(Arc::new(ConsistencyGuarantee::new(self.subscribers.clone())));

        let coordinator = ConsistencyCoordinator::start(pubsub.clone()).await;

        Ok(Application {
            inner: Arc::new(AppInner {
                router: self.router,
                event_store,
                registry,
                pubsub,
                coordinator,
                subscribers: self.subscribers,
                snapshots: self.snapshots,
                middleware,
            }),
        })
    }
}
