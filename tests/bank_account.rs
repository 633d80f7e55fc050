//! End-to-end bank account scenarios against the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use commandry::{
    Aggregate, Application, Command, CommandHandler, Consistency, DispatchError, DispatchOpts,
    Dispatched, ErrorOf, EventOf, EventStore, EventStoreError, ExpectedVersion, Identify,
    InMemoryEventStore, Produced, ProposedEvent, RecordedEvent, Returning, Route, Router,
    SubscriberConsistency,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BankAccount {
    opened: bool,
    balance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum BankAccountEvent {
    AccountOpened { initial_balance: i64 },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

#[derive(Debug, thiserror::Error)]
enum BankAccountError {
    #[error("account is already open")]
    AlreadyOpened,
    #[error("account is not open")]
    NotOpened,
    #[error("insufficient funds")]
    InsufficientFunds,
}

impl Aggregate for BankAccount {
    const KIND: &'static str = "bank-account";

    type Event = BankAccountEvent;
    type Error = BankAccountError;

    fn apply(mut self, event: &Self::Event) -> Self {
        match event {
            BankAccountEvent::AccountOpened { initial_balance } => {
                self.opened = true;
                self.balance = *initial_balance;
            }
            BankAccountEvent::Deposited { amount } => self.balance += amount,
            BankAccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAccount {
    account_number: String,
    initial_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposit {
    account_number: String,
    amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Withdraw {
    account_number: String,
    amount: i64,
}

impl Command for OpenAccount {
    type Aggregate = BankAccount;
}

impl Command for Deposit {
    type Aggregate = BankAccount;
}

impl Command for Withdraw {
    type Aggregate = BankAccount;
}

struct BankAccountHandler;

impl CommandHandler<OpenAccount> for BankAccountHandler {
    fn handle(
        &self,
        state: &BankAccount,
        command: &OpenAccount,
    ) -> Result<Produced<EventOf<OpenAccount>>, ErrorOf<OpenAccount>> {
        if state.opened {
            return Err(BankAccountError::AlreadyOpened);
        }
        Ok(Produced::Events(vec![BankAccountEvent::AccountOpened {
            initial_balance: command.initial_balance,
        }]))
    }
}

impl CommandHandler<Deposit> for BankAccountHandler {
    fn handle(
        &self,
        state: &BankAccount,
        command: &Deposit,
    ) -> Result<Produced<EventOf<Deposit>>, ErrorOf<Deposit>> {
        if !state.opened {
            return Err(BankAccountError::NotOpened);
        }
        Ok(Produced::Events(vec![BankAccountEvent::Deposited {
            amount: command.amount,
        }]))
    }
}

impl CommandHandler<Withdraw> for BankAccountHandler {
    fn handle(
        &self,
        state: &BankAccount,
        command: &Withdraw,
    ) -> Result<Produced<EventOf<Withdraw>>, ErrorOf<Withdraw>> {
        if !state.opened {
            return Err(BankAccountError::NotOpened);
        }
        if state.balance < command.amount {
            return Err(BankAccountError::InsufficientFunds);
        }
        Ok(Produced::Events(vec![BankAccountEvent::Withdrawn {
            amount: command.amount,
        }]))
    }
}

fn bank_router() -> Router {
    Router::new()
        .register::<OpenAccount>(
            Route::new(BankAccountHandler)
                .identify_field("account_number")
                .prefix("bank-account-"),
        )
        .expect("register OpenAccount should succeed")
        .register::<Deposit>(
            Route::new(BankAccountHandler)
                .identify_field("account_number")
                .prefix("bank-account-"),
        )
        .expect("register Deposit should succeed")
        .register::<Withdraw>(
            Route::new(BankAccountHandler)
                .identify_field("account_number")
                .prefix("bank-account-"),
        )
        .expect("register Withdraw should succeed")
}

async fn bank_app_on(store: Arc<dyn EventStore>) -> Application {
    Application::builder(bank_router())
        .event_store(store)
        .build()
        .await
        .expect("build should succeed")
}

fn open(account: &str, initial_balance: i64) -> OpenAccount {
    OpenAccount {
        account_number: account.to_string(),
        initial_balance,
    }
}

fn deposit(account: &str, amount: i64) -> Deposit {
    Deposit {
        account_number: account.to_string(),
        amount,
    }
}

/// Event store decorator counting version conflicts, for observing the
/// retry loop from outside.
struct ConflictCountingStore {
    inner: InMemoryEventStore,
    conflicts: AtomicU32,
}

impl ConflictCountingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            conflicts: AtomicU32::new(0),
        }
    }

    fn conflicts(&self) -> u32 {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for ConflictCountingStore {
    async fn append(
        &self,
        stream_uuid: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, EventStoreError> {
        let result = self.inner.append(stream_uuid, expected_version, events).await;
        if matches!(result, Err(EventStoreError::WrongExpectedVersion { .. })) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: u64,
        batch_size: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.inner
            .read_stream_forward(stream_uuid, from_version, batch_size)
            .await
    }
}

#[tokio::test]
async fn open_account_appends_one_event() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = bank_app_on(store.clone()).await;

    let result = app
        .dispatch(open("ACC1", 100))
        .await
        .expect("dispatch should succeed");
    assert!(matches!(result, Dispatched::Ok));

    let events = store
        .read_stream_forward("bank-account-ACC1", 1, 100)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "AccountOpened");
    assert_eq!(events[0].stream_version, 1);
}

#[tokio::test]
async fn deposit_returns_execution_result() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = bank_app_on(store).await;
    app.dispatch(open("ACC1", 100))
        .await
        .expect("open should succeed");

    let result = app
        .dispatch_with(
            deposit("ACC1", 50),
            DispatchOpts::default().returning(Returning::ExecutionResult),
        )
        .await
        .expect("deposit should succeed");
    let Dispatched::ExecutionResult(result) = result else {
        panic!("expected ExecutionResult, got: {result:?}");
    };
    assert_eq!(result.aggregate_version, 2);
    assert_eq!(result.aggregate_uuid, "bank-account-ACC1");
    assert_eq!(
        result.events,
        vec![BankAccountEvent::Deposited { amount: 50 }]
    );
    assert_eq!(result.aggregate_state.balance, 150);
}

#[tokio::test]
async fn concurrent_deposits_to_same_identity_both_land() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = bank_app_on(store.clone()).await;
    app.dispatch(open("ACC1", 0))
        .await
        .expect("open should succeed");

    let (left, right) = tokio::join!(
        app.dispatch(deposit("ACC1", 10)),
        app.dispatch(deposit("ACC1", 10)),
    );
    left.expect("first deposit should succeed");
    right.expect("second deposit should succeed");

    let events = store
        .read_stream_forward("bank-account-ACC1", 1, 100)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 3, "open + exactly two deposits");
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == "Deposited")
            .count(),
        2
    );

    let (state, version) = app
        .aggregate_state::<BankAccount>("bank-account-ACC1")
        .await
        .expect("state should succeed");
    assert_eq!(version, 3);
    assert_eq!(state.balance, 20);
}

#[tokio::test]
async fn contending_runtimes_retry_and_converge() {
    // Two applications over one store model two runtime nodes: each has
    // its own instance for the same stream, so appends genuinely race.
    let store = Arc::new(ConflictCountingStore::new());
    let app_a = bank_app_on(store.clone()).await;
    let app_b = bank_app_on(store.clone()).await;

    app_a
        .dispatch(open("ACC1", 0))
        .await
        .expect("open should succeed");

    // app_b's instance rehydrates to version 1 and appends version 2;
    // app_a's instance still caches version 1, so its next append
    // conflicts, catches up, and retries.
    app_b
        .dispatch(deposit("ACC1", 10))
        .await
        .expect("deposit via app_b should succeed");
    app_a
        .dispatch(deposit("ACC1", 10))
        .await
        .expect("deposit via app_a should succeed after retry");

    assert!(
        store.conflicts() >= 1,
        "at least one version conflict should have been retried"
    );

    let (state, version) = app_a
        .aggregate_state::<BankAccount>("bank-account-ACC1")
        .await
        .expect("state should succeed");
    assert_eq!(version, 3);
    assert_eq!(state.balance, 20);
}

#[tokio::test]
async fn exhausted_retry_budget_surfaces_too_many_attempts() {
    let store = Arc::new(InMemoryEventStore::new());
    let app_a = bank_app_on(store.clone()).await;
    let app_b = bank_app_on(store.clone()).await;

    app_a
        .dispatch(open("ACC1", 0))
        .await
        .expect("open should succeed");
    app_b
        .dispatch(deposit("ACC1", 10))
        .await
        .expect("deposit via app_b should succeed");

    // app_a's instance is stale and gets no retries.
    let result = app_a
        .dispatch_with(
            deposit("ACC1", 10),
            DispatchOpts::default().retry_attempts(0),
        )
        .await;
    assert!(
        matches!(result, Err(DispatchError::TooManyAttempts)),
        "expected TooManyAttempts"
    );
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    #[derive(Serialize)]
    struct Unknown {}
    impl Command for Unknown {
        type Aggregate = BankAccount;
    }

    let app = bank_app_on(Arc::new(InMemoryEventStore::new())).await;
    let result = app.dispatch(Unknown {}).await;
    assert!(matches!(
        result,
        Err(DispatchError::UnregisteredCommand("Unknown"))
    ));
}

#[tokio::test]
async fn consistency_timeout_still_persists_events() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = Application::builder(bank_router())
        .event_store(store.clone())
        .subscriber("projection_x", SubscriberConsistency::Strong)
        .build()
        .await
        .expect("build should succeed");

    let result = app
        .dispatch_with(
            open("ACC1", 100),
            DispatchOpts::default()
                .consistency(Consistency::Subscribers(vec!["projection_x".into()]))
                .timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(result, Err(DispatchError::ConsistencyTimeout)));

    let events = store
        .read_stream_forward("bank-account-ACC1", 1, 100)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 1, "the append itself succeeded");
}

#[tokio::test]
async fn strong_consistency_returns_once_subscriber_acks() {
    let app = Application::builder(bank_router())
        .subscriber("ledger", SubscriberConsistency::Strong)
        .build()
        .await
        .expect("build should succeed");

    let mut notifications = app.subscribe_stream("bank-account-ACC1").await;
    let subscriber = {
        let app = app.clone();
        tokio::spawn(async move {
            while let Ok(event) = notifications.recv().await {
                let version = event["stream_version"]
                    .as_u64()
                    .expect("notification should carry a stream version");
                app.ack("ledger", "bank-account-ACC1", version).await;
            }
        })
    };

    app.dispatch_with(
        open("ACC1", 100),
        DispatchOpts::default()
            .consistency(Consistency::Strong)
            .timeout(Duration::from_secs(1)),
    )
    .await
    .expect("strong dispatch should succeed once acked");

    subscriber.abort();
}

#[tokio::test]
async fn identify_with_missing_field_fails_dispatch() {
    let router = Router::new()
        .register::<OpenAccount>(Route::new(BankAccountHandler))
        .expect("register should succeed")
        .identify::<BankAccount>(Identify::by_field("missing_field"))
        .expect("identify should succeed");
    let app = Application::builder(router)
        .build()
        .await
        .expect("build should succeed");

    let result = app.dispatch(open("ACC1", 100)).await;
    assert!(matches!(
        result,
        Err(DispatchError::InvalidAggregateIdentity)
    ));
}

#[tokio::test]
async fn rehydration_yields_same_state_as_uninterrupted_run() {
    let store = Arc::new(InMemoryEventStore::new());

    // Uninterrupted run on one application.
    let uninterrupted = bank_app_on(Arc::new(InMemoryEventStore::new())).await;
    uninterrupted
        .dispatch(open("ACC1", 100))
        .await
        .expect("open should succeed");
    uninterrupted
        .dispatch(deposit("ACC1", 50))
        .await
        .expect("deposit should succeed");
    uninterrupted
        .dispatch(Withdraw {
            account_number: "ACC1".into(),
            amount: 30,
        })
        .await
        .expect("withdraw should succeed");
    let (expected_state, expected_version) = uninterrupted
        .aggregate_state::<BankAccount>("bank-account-ACC1")
        .await
        .expect("state should succeed");

    // Same commands, stopping and resuming between each one.
    {
        let app = bank_app_on(store.clone()).await;
        app.dispatch(open("ACC1", 100))
            .await
            .expect("open should succeed");
    }
    {
        let app = bank_app_on(store.clone()).await;
        app.dispatch(deposit("ACC1", 50))
            .await
            .expect("deposit should succeed");
    }
    let app = bank_app_on(store.clone()).await;
    app.dispatch(Withdraw {
        account_number: "ACC1".into(),
        amount: 30,
    })
    .await
    .expect("withdraw should succeed");

    let (state, version) = app
        .aggregate_state::<BankAccount>("bank-account-ACC1")
        .await
        .expect("state should succeed");
    assert_eq!(state, expected_state);
    assert_eq!(version, expected_version);
}

#[tokio::test]
async fn events_carry_dispatch_causation_and_correlation() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = bank_app_on(store.clone()).await;

    let correlation = Uuid::new_v4();
    app.dispatch_with(
        open("ACC1", 100),
        DispatchOpts::default()
            .correlation_id(correlation)
            .metadata_entry("issued_by", "teller-7"),
    )
    .await
    .expect("open should succeed");
    app.dispatch_with(
        deposit("ACC1", 50),
        DispatchOpts::default().correlation_id(correlation),
    )
    .await
    .expect("deposit should succeed");

    let events = store
        .read_stream_forward("bank-account-ACC1", 1, 100)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 2);

    // Every event correlates to the business transaction; each event's
    // causation is its own dispatch, so the two causations differ.
    for event in &events {
        assert_eq!(event.metadata.correlation_id, Some(correlation));
        assert!(event.metadata.causation_id.is_some());
    }
    assert_ne!(
        events[0].metadata.causation_id,
        events[1].metadata.causation_id
    );
    assert_eq!(events[0].metadata.custom["issued_by"], "teller-7");
}

#[tokio::test]
async fn rejected_commands_leave_the_stream_untouched() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = bank_app_on(store.clone()).await;
    app.dispatch(open("ACC1", 10))
        .await
        .expect("open should succeed");

    let result = app
        .dispatch(Withdraw {
            account_number: "ACC1".into(),
            amount: 100,
        })
        .await;
    assert!(matches!(
        result,
        Err(DispatchError::Domain(BankAccountError::InsufficientFunds))
    ));

    let events = store
        .read_stream_forward("bank-account-ACC1", 1, 100)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 1, "the rejection appended nothing");
}

#[tokio::test]
async fn final_state_is_fold_of_all_dispatched_events() {
    let app = bank_app_on(Arc::new(InMemoryEventStore::new())).await;
    app.dispatch(open("ACC1", 0))
        .await
        .expect("open should succeed");

    let amounts = [5, 10, 15, 20];
    for amount in amounts {
        app.dispatch(deposit("ACC1", amount))
            .await
            .expect("deposit should succeed");
    }

    let (state, version) = app
        .aggregate_state::<BankAccount>("bank-account-ACC1")
        .await
        .expect("state should succeed");
    assert_eq!(version, 1 + amounts.len() as u64);
    assert_eq!(state.balance, amounts.iter().sum::<i64>());
}
