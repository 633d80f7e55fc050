//! Aggregate instance runtime: the per-identity serialized execution loop.
//!
//! Each active `(aggregate_kind, stream_uuid)` pair owns one tokio task
//! that sequentially processes execution requests from an `mpsc`
//! mailbox. The task exclusively owns the aggregate state and version,
//! lazily rehydrates from the event store, and absorbs optimistic
//! concurrency conflicts with an internal retry loop.
//!
//! Public surface: [`InstanceHandle`] (cloneable async handle); the
//! spawn function is crate-internal and driven by the dispatcher via
//! the registry.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, decode_event, encode_event};
use crate::command::{Metadata, Produced};
use crate::event_store::{
    EventMetadata, EventStore, EventStoreError, ExpectedVersion, ProposedEvent, RecordedEvent,
    SnapshotData,
};
use crate::lifespan::{AggregateLifespan, Lifespan};
use crate::pubsub::{PubSub, stream_topic};

/// Mailbox capacity per instance. Senders past this many queued
/// requests apply backpressure on the dispatching callers.
const MAILBOX_CAPACITY: usize = 32;

/// How many events a single rehydration read pulls from the store.
const READ_BATCH_SIZE: usize = 100;

/// One command execution, as handed to the instance by the dispatcher.
///
/// The handler is an erased closure capturing the command and its
/// routing entry; the instance re-invokes it against refreshed state
/// after a version conflict, so it must stay deterministic.
pub(crate) struct ExecutionRequest<A: Aggregate> {
    /// UUID of this dispatch; stamped as `causation_id` on every event.
    pub command_uuid: Uuid,
    /// Correlation UUID stamped on every event.
    pub correlation_id: Uuid,
    /// Caller metadata merged onto every event.
    pub metadata: Metadata,
    /// Remaining optimistic-concurrency retries.
    pub retry_attempts: u32,
    /// The decision function: current state in, produced events out.
    pub handler: Box<dyn Fn(&A) -> Result<Produced<A::Event>, A::Error> + Send + Sync>,
    /// The command, type-erased for the lifespan's `after_command` hook.
    pub command: Arc<dyn Any + Send + Sync>,
    /// Lifespan policy consulted after the outcome.
    pub lifespan: Arc<dyn AggregateLifespan<A>>,
}

/// The richest form of a successful execution. The dispatcher projects
/// it down to whatever `Returning` shape the caller asked for.
#[derive(Clone)]
pub(crate) struct Execution<A: Aggregate> {
    pub aggregate_state: A,
    pub aggregate_version: u64,
    pub events: Vec<A::Event>,
    pub reply: Option<Value>,
}

// Manual `Debug`: `A::Event` carries no `Debug` bound, so the derive
// cannot print the event list.
impl<A: Aggregate> std::fmt::Debug for Execution<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("aggregate_version", &self.aggregate_version)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Execution failure, before the dispatcher maps it onto
/// [`DispatchError`](crate::DispatchError).
#[derive(Debug)]
pub(crate) enum ExecutionError<E> {
    /// The handler rejected the command. No events were appended.
    Domain(E),
    /// Version-conflict retries exhausted.
    TooManyAttempts,
    /// The store failed for a reason other than a version conflict.
    Store(EventStoreError),
}

pub(crate) type ExecutionReply<A> =
    Result<Execution<A>, ExecutionError<<A as Aggregate>::Error>>;

/// Messages sent from [`InstanceHandle`] to the instance loop.
pub(crate) enum InstanceMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        request: ExecutionRequest<A>,
        reply: oneshot::Sender<ExecutionReply<A>>,
    },
    /// Read the current state and version, rehydrating first if needed.
    GetState {
        reply: oneshot::Sender<Result<(A, u64), EventStoreError>>,
    },
}

/// Async handle to a running aggregate instance.
///
/// Lightweight, cloneable, and `Send + Sync`; communicates with the
/// instance task over a bounded channel.
pub(crate) struct InstanceHandle<A: Aggregate> {
    sender: mpsc::Sender<InstanceMessage<A>>,
}

// Manual `Clone` because `A` itself need not be `Clone`-constrained
// through the handle -- only the `Sender` is cloned.
impl<A: Aggregate> Clone for InstanceHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for InstanceHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("aggregate_kind", &A::KIND)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> InstanceHandle<A> {
    /// Submit an execution request.
    ///
    /// On acceptance returns the reply channel for the caller to await
    /// under its own deadline. If the instance has already stopped, the
    /// request is handed back so the dispatcher can re-route it to a
    /// freshly spawned instance -- safe precisely because nothing was
    /// accepted, so no append can be in flight for it.
    pub(crate) async fn execute(
        &self,
        request: ExecutionRequest<A>,
        reply: oneshot::Sender<ExecutionReply<A>>,
    ) -> Result<(), ExecutionRequest<A>> {
        match self.sender.send(InstanceMessage::Execute { request, reply }).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(InstanceMessage::Execute { request, .. })) => Err(request),
            Err(mpsc::error::SendError(_)) => unreachable!("send returns the sent message"),
        }
    }

    /// Read the current aggregate state and version.
    pub(crate) async fn state(&self) -> Option<Result<(A, u64), EventStoreError>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(InstanceMessage::GetState { reply: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Whether the instance task behind this handle is still running.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Per-instance configuration resolved by the application.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct InstanceConfig {
    /// Record a snapshot every this many events, when set.
    pub snapshot_every: Option<u64>,
}

/// Spawn a new instance task for `stream_uuid`.
pub(crate) fn spawn_instance<A: Aggregate>(
    stream_uuid: String,
    store: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSub>,
    config: InstanceConfig,
) -> InstanceHandle<A> {
    let (tx, rx) = mpsc::channel::<InstanceMessage<A>>(MAILBOX_CAPACITY);
    tokio::spawn(run_instance::<A>(stream_uuid, store, pubsub, config, rx));
    InstanceHandle { sender: tx }
}

/// The instance task: owned state plus its collaborators.
struct InstanceRuntime<A: Aggregate> {
    stream_uuid: String,
    store: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSub>,
    config: InstanceConfig,
    state: A,
    version: u64,
    snapshot_version: Option<u64>,
    rehydrated: bool,
}

/// Instance loop: process messages sequentially until the lifespan says
/// stop, the mailbox closes, or the idle deadline elapses.
async fn run_instance<A: Aggregate>(
    stream_uuid: String,
    store: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSub>,
    config: InstanceConfig,
    mut rx: mpsc::Receiver<InstanceMessage<A>>,
) {
    let mut runtime = InstanceRuntime::<A> {
        stream_uuid,
        store,
        pubsub,
        config,
        state: A::default(),
        version: 0,
        snapshot_version: None,
        rehydrated: false,
    };
    // No deadline until a lifespan decision arms one.
    let mut idle: Option<Duration> = None;

    loop {
        let msg = match idle {
            Some(deadline) => match tokio::time::timeout(deadline, rx.recv()).await {
                Ok(msg) => msg,
                Err(_elapsed) => {
                    tracing::info!(
                        aggregate_kind = A::KIND,
                        stream_uuid = %runtime.stream_uuid,
                        "instance idle, shutting down"
                    );
                    break;
                }
            },
            None => rx.recv().await,
        };

        match msg {
            Some(InstanceMessage::Execute { request, reply }) => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_kind = A::KIND,
                    stream_uuid = %runtime.stream_uuid,
                );
                let result = runtime.execute(&request).instrument(span).await;
                let decision = consult_lifespan(&request, &result);

                // If the receiver was dropped, the caller timed out or
                // went away; the outcome stands regardless.
                let _ = reply.send(result);

                match decision {
                    Some(Lifespan::Stop) => break,
                    Some(Lifespan::Hibernate) => {
                        runtime.release_transient();
                        idle = None;
                    }
                    Some(Lifespan::Timeout(duration)) => idle = Some(duration),
                    Some(Lifespan::Infinity) => idle = None,
                    // Infrastructure failures leave the timer untouched.
                    None => {}
                }
            }

            Some(InstanceMessage::GetState { reply }) => {
                let result = match runtime.ensure_rehydrated().await {
                    Ok(()) => Ok((runtime.state.clone(), runtime.version)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }

            // Channel closed: every handle dropped.
            None => break,
        }
    }
    // Loop exited: queued senders now observe a closed channel and the
    // dispatcher reports those commands as stopped.
}

/// Map an execution outcome onto a lifespan decision.
///
/// Events consult `after_event` per event with the last decision
/// winning; an event-less success consults `after_command`; a domain
/// rejection consults `after_error`. Infrastructure failures return
/// `None` and leave the previous idle deadline in place.
fn consult_lifespan<A: Aggregate>(
    request: &ExecutionRequest<A>,
    result: &ExecutionReply<A>,
) -> Option<Lifespan> {
    match result {
        Ok(execution) if execution.events.is_empty() => {
            let command: &dyn Any = request.command.as_ref();
            Some(request.lifespan.after_command(command))
        }
        Ok(execution) => execution
            .events
            .iter()
            .map(|event| request.lifespan.after_event(event))
            .last(),
        Err(ExecutionError::Domain(error)) => Some(request.lifespan.after_error(error)),
        Err(_) => None,
    }
}

impl<A: Aggregate> InstanceRuntime<A> {
    /// Execute one request: rehydrate if needed, decide, append, apply.
    async fn execute(&mut self, request: &ExecutionRequest<A>) -> ExecutionReply<A> {
        self.ensure_rehydrated()
            .await
            .map_err(ExecutionError::Store)?;

        let mut attempts = request.retry_attempts;
        loop {
            // 1. Decide: run the handler against current state.
            let produced = (request.handler)(&self.state).map_err(ExecutionError::Domain)?;
            let (events, reply) = produced.into_parts();

            // 2. No-op commands produce no events and touch no storage.
            if events.is_empty() {
                return Ok(Execution {
                    aggregate_state: self.state.clone(),
                    aggregate_version: self.version,
                    events,
                    reply,
                });
            }

            // 3. Enrich and append with the optimistic expectation.
            let metadata = EventMetadata {
                causation_id: Some(request.command_uuid),
                correlation_id: Some(request.correlation_id),
                custom: request.metadata.clone(),
            };
            let proposed = events
                .iter()
                .map(|event| encode_event::<A>(event, metadata.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(ExecutionError::Store)?;

            match self
                .store
                .append(
                    &self.stream_uuid,
                    ExpectedVersion::Exact(self.version),
                    proposed.clone(),
                )
                .await
            {
                Ok(new_version) => {
                    let base_version = new_version - events.len() as u64;
                    let mut state = std::mem::take(&mut self.state);
                    for event in &events {
                        state = state.apply(event);
                    }
                    self.state = state;
                    self.version = new_version;

                    tracing::info!(count = events.len(), "events appended");

                    self.notify_subscribers(proposed, base_version).await;
                    self.maybe_snapshot().await;

                    return Ok(Execution {
                        aggregate_state: self.state.clone(),
                        aggregate_version: self.version,
                        events,
                        reply,
                    });
                }

                Err(EventStoreError::WrongExpectedVersion { .. }) => {
                    // Zero budget fails on the first conflict.
                    if attempts == 0 {
                        return Err(ExecutionError::TooManyAttempts);
                    }
                    attempts -= 1;
                    tracing::debug!(
                        stream_uuid = %self.stream_uuid,
                        remaining = attempts,
                        "version conflict, catching up and retrying"
                    );
                    self.catch_up().await.map_err(ExecutionError::Store)?;
                }

                Err(other) => return Err(ExecutionError::Store(other)),
            }
        }
    }

    /// Lazily rebuild state: seed from a snapshot when one exists, then
    /// fold the stream tail.
    async fn ensure_rehydrated(&mut self) -> Result<(), EventStoreError> {
        if self.rehydrated {
            return Ok(());
        }

        match self.store.read_snapshot(&self.stream_uuid).await? {
            Some(snapshot) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => {
                    self.state = state;
                    self.version = snapshot.stream_version;
                    self.snapshot_version = Some(snapshot.stream_version);
                }
                Err(e) => {
                    // A snapshot that no longer deserializes is stale
                    // schema; replay the full stream instead.
                    tracing::warn!(
                        stream_uuid = %self.stream_uuid,
                        error = %e,
                        "discarding undecodable snapshot, replaying stream"
                    );
                }
            },
            None => {}
        }

        self.catch_up().await?;
        self.rehydrated = true;
        tracing::debug!(
            aggregate_kind = A::KIND,
            stream_uuid = %self.stream_uuid,
            version = self.version,
            "instance rehydrated"
        );
        Ok(())
    }

    /// Fold every event past the current version into the state.
    async fn catch_up(&mut self) -> Result<(), EventStoreError> {
        loop {
            let batch = match self
                .store
                .read_stream_forward(&self.stream_uuid, self.version + 1, READ_BATCH_SIZE)
                .await
            {
                Ok(batch) => batch,
                // A stream that does not exist yet is an empty stream.
                Err(EventStoreError::StreamNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            let batch_len = batch.len();

            for recorded in &batch {
                // Unknown event types are skipped but still advance the
                // version: the count tracks the stream, not this
                // binary's vocabulary.
                if let Some(event) = decode_event::<A>(recorded) {
                    self.state = std::mem::take(&mut self.state).apply(&event);
                }
                self.version = recorded.stream_version;
            }

            if batch_len < READ_BATCH_SIZE {
                return Ok(());
            }
        }
    }

    /// Publish the freshly recorded events on the stream topic.
    async fn notify_subscribers(&self, proposed: Vec<ProposedEvent>, base_version: u64) {
        let topic = stream_topic(&self.stream_uuid);
        for (offset, event) in proposed.into_iter().enumerate() {
            let recorded = RecordedEvent {
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                stream_version: base_version + offset as u64 + 1,
            };
            match serde_json::to_value(&recorded) {
                Ok(message) => self.pubsub.publish(&topic, message).await,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize event notification");
                }
            }
        }
    }

    /// Record a snapshot when the configured interval has elapsed.
    ///
    /// Snapshot failures are logged, never fatal: the stream stays the
    /// source of truth.
    async fn maybe_snapshot(&mut self) {
        let Some(every) = self.config.snapshot_every else {
            return;
        };
        let last = self.snapshot_version.unwrap_or(0);
        if self.version - last < every {
            return;
        }

        let state = match serde_json::to_value(&self.state) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    stream_uuid = %self.stream_uuid,
                    error = %e,
                    "failed to serialize snapshot state"
                );
                return;
            }
        };
        let snapshot = SnapshotData {
            stream_uuid: self.stream_uuid.clone(),
            stream_version: self.version,
            state,
        };
        match self.store.record_snapshot(snapshot).await {
            Ok(()) => {
                self.snapshot_version = Some(self.version);
                tracing::debug!(
                    stream_uuid = %self.stream_uuid,
                    version = self.version,
                    "snapshot recorded"
                );
            }
            Err(e) => {
                tracing::warn!(
                    stream_uuid = %self.stream_uuid,
                    error = %e,
                    "failed to record snapshot"
                );
            }
        }
    }

    /// Release transient buffers on hibernate. State and version stay.
    fn release_transient(&mut self) {
        // The runtime keeps no caches beyond the folded state itself;
        // hibernation currently just parks the loop with no deadline.
    }
}
