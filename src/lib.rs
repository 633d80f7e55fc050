//! Command-dispatch and aggregate-execution runtime for event-sourced
//! applications.
//!
//! `commandry` routes commands to per-identity aggregate instances,
//! rebuilds each aggregate by folding its event stream, executes the
//! command to produce new events, and appends them with
//! optimistic-concurrency retry. Dispatches flow through an ordered
//! middleware pipeline and can block until nominated downstream
//! subscribers acknowledge the produced events.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aggregate`] | Domain model: folds events into state |
//! | [`Command`] | An intention to change an aggregate, bound to its kind |
//! | [`CommandHandler`] | Pure decision function: state + command to events |
//! | [`Router`] | Immutable table: command kind to handler, identity, lifespan, defaults |
//! | [`Application`] | Hosting runtime: router + store + registry + pub/sub |
//! | [`Middleware`] | Before/after/failure hooks over the dispatch [`Pipeline`] |
//! | [`AggregateLifespan`] | Policy deciding when an instance terminates |
//! | [`EventStore`] | Append/read adapter the runtime executes against |
//!
//! # Quick Start
//!
//! ```no_run
//! use commandry::{Aggregate, Application, Command, Produced, Route, Router};
//! use serde::{Deserialize, Serialize};
//!
//! // 1. Define the aggregate and its events.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct BankAccount {
//!     opened: bool,
//!     balance: i64,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum BankAccountEvent {
//!     AccountOpened { initial_balance: i64 },
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum BankAccountError {
//!     #[error("account is already open")]
//!     AlreadyOpened,
//! }
//!
//! impl Aggregate for BankAccount {
//!     const KIND: &'static str = "bank-account";
//!     type Event = BankAccountEvent;
//!     type Error = BankAccountError;
//!
//!     fn apply(mut self, event: &BankAccountEvent) -> Self {
//!         match event {
//!             BankAccountEvent::AccountOpened { initial_balance } => {
//!                 self.opened = true;
//!                 self.balance = *initial_balance;
//!             }
//!         }
//!         self
//!     }
//! }
//!
//! // 2. Define a command addressed to the aggregate.
//! #[derive(Serialize)]
//! struct OpenAccount {
//!     account_number: String,
//!     initial_balance: i64,
//! }
//!
//! impl Command for OpenAccount {
//!     type Aggregate = BankAccount;
//! }
//!
//! // 3. Route it, build the application, dispatch.
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new().register::<OpenAccount>(
//!     Route::new(|state: &BankAccount, cmd: &OpenAccount| {
//!         if state.opened {
//!             return Err(BankAccountError::AlreadyOpened);
//!         }
//!         Ok(Produced::Events(vec![BankAccountEvent::AccountOpened {
//!             initial_balance: cmd.initial_balance,
//!         }]))
//!     })
//!     .identify_field("account_number")
//!     .prefix("bank-account-"),
//! )?;
//!
//! let app = Application::builder(router).build().await?;
//! app.dispatch(OpenAccount {
//!     account_number: "ACC1".into(),
//!     initial_balance: 100,
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Commands to the same identity are strictly serialized; commands to
//! different identities run in parallel. Version conflicts against the
//! event store are retried internally and never surface to callers.

mod aggregate;
pub use aggregate::Aggregate;
mod application;
pub use application::{Application, ApplicationBuilder, Dispatched, ExecutionResult};
mod command;
pub use command::{
    Command, CommandHandler, Consistency, DispatchOpts, ErrorOf, EventOf, Metadata, Produced,
    Returning, Timeout,
};
mod consistency;
pub use consistency::{ACK_TOPIC, Ack, ConsistencyGuarantee, SubscriberConsistency};
mod error;
pub use error::{BuildError, DispatchError, RouterError};
mod event_store;
pub use event_store::{
    EventMetadata, EventStore, EventStoreError, ExpectedVersion, InMemoryEventStore,
    ProposedEvent, RecordedEvent, SnapshotData,
};
mod instance;
mod lifespan;
pub use lifespan::{AggregateLifespan, DefaultLifespan, Lifespan};
mod pipeline;
pub use pipeline::{HaltReason, IdentityExtraction, Middleware, Pipeline, PipelineResponse};
mod pubsub;
pub use pubsub::{LocalPubSub, PubSub, stream_topic};
mod registry;
pub use registry::{
    AliveProbe, ErasedHandle, InstanceFactory, InstanceKey, LocalRegistry, Registry,
};
mod router;
pub use router::{Identify, Route, Router};
