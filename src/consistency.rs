//! Consistency coordination: blocking dispatch until nominated
//! subscribers have acknowledged the appended events.
//!
//! Subscribers (projections, process managers -- external to this
//! crate) publish [`Ack`] messages on a dedicated pub/sub topic. The
//! coordinator folds them into a per-stream high-water mark per
//! subscriber and wakes any dispatch waiting on that stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::command::{Consistency, Timeout};
use crate::pipeline::{HaltReason, Middleware, Pipeline};
use crate::pubsub::PubSub;

/// Topic the coordinator listens on for subscriber acks.
pub const ACK_TOPIC: &str = "$acks";

/// A subscriber's acknowledgement that it has processed a stream up to
/// a version.
///
/// Acks are cumulative: acknowledging version `n` implies every version
/// below `n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Declared name of the acknowledging subscriber.
    pub subscriber: String,
    /// Stream the acknowledgement refers to.
    pub stream_uuid: String,
    /// Highest stream version the subscriber has processed.
    pub version: u64,
}

/// Consistency a subscriber declares when registered on the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberConsistency {
    /// The subscriber processes events at its own pace; dispatches never
    /// wait for it.
    Eventual,
    /// The subscriber participates in `Consistency::Strong` waits.
    Strong,
}

/// Declared subscribers of the hosting application, by name.
#[derive(Debug, Clone, Default)]
pub(crate) struct SubscriberRegistry {
    subscribers: HashMap<String, SubscriberConsistency>,
}

impl SubscriberRegistry {
    pub(crate) fn declare(&mut self, name: impl Into<String>, consistency: SubscriberConsistency) {
        self.subscribers.insert(name.into(), consistency);
    }

    pub(crate) fn declared(&self, name: &str) -> Option<SubscriberConsistency> {
        self.subscribers.get(name).copied()
    }

    /// Names of every subscriber declared strongly consistent.
    pub(crate) fn strong_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscribers
            .iter()
            .filter(|(_, c)| **c == SubscriberConsistency::Strong)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// The subscriber set a dispatch with `consistency` must wait for.
    ///
    /// Empty for `Eventual` (and for `Strong` with no strong
    /// subscribers declared), meaning no wait.
    pub(crate) fn required(&self, consistency: &Consistency) -> Vec<String> {
        match consistency {
            Consistency::Eventual => Vec::new(),
            Consistency::Strong => self.strong_names(),
            Consistency::Subscribers(names) => names.clone(),
        }
    }
}

/// Per-stream, per-subscriber acknowledgement high-water marks.
type AckMap = HashMap<String, HashMap<String, u64>>;

/// Tracks subscriber acknowledgements and parks dispatches until their
/// required subscribers catch up.
///
/// One coordinator per application; its listener task consumes the
/// [`ACK_TOPIC`] for the application's lifetime and is aborted when the
/// coordinator drops.
pub struct ConsistencyCoordinator {
    acks: Arc<Mutex<AckMap>>,
    notify: Arc<tokio::sync::Notify>,
    listener: tokio::task::JoinHandle<()>,
}

impl ConsistencyCoordinator {
    /// Subscribe to the ack topic on `pubsub` and start folding acks.
    pub(crate) async fn start(pubsub: Arc<dyn PubSub>) -> Self {
        let acks: Arc<Mutex<AckMap>> = Arc::new(Mutex::new(HashMap::new()));
        let notify = Arc::new(tokio::sync::Notify::new());

        let mut receiver = pubsub.subscribe(ACK_TOPIC).await;
        let listener = {
            let acks = acks.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => match serde_json::from_value::<Ack>(message) {
                            Ok(ack) => record(&acks, &notify, ack),
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding malformed ack");
                            }
                        },
                        // Lagging loses acks; affected waiters time out
                        // and the subscriber's next ack repairs the mark.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "ack listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            acks,
            notify,
            listener,
        }
    }

    /// Fold an ack directly, bypassing the pub/sub bus.
    ///
    /// Adapters embedding the runtime in the same process as their
    /// subscribers may call this instead of publishing.
    pub fn record_ack(&self, ack: Ack) {
        record(&self.acks, &self.notify, ack);
    }

    /// Last version `subscriber` acknowledged on `stream_uuid`, if any.
    pub fn acked_version(&self, subscriber: &str, stream_uuid: &str) -> Option<u64> {
        let acks = self.acks.lock().expect("ack map lock poisoned");
        acks.get(stream_uuid)
            .and_then(|per_subscriber| per_subscriber.get(subscriber))
            .copied()
    }

    /// Wait until every subscriber in `required` has acknowledged
    /// `stream_uuid` up to at least `version`.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when `timeout` elapses first. The appended
    /// events are unaffected; only the wait failed.
    pub(crate) async fn wait_for(
        &self,
        stream_uuid: &str,
        version: u64,
        required: &[String],
        timeout: Timeout,
    ) -> Result<(), ()> {
        if required.is_empty() {
            return Ok(());
        }
        let wait = self.wait_satisfied(stream_uuid, version, required);
        match timeout {
            Timeout::Infinite => {
                wait.await;
                Ok(())
            }
            Timeout::After(duration) => tokio::time::timeout(duration, wait)
                .await
                .map_err(|_elapsed| ()),
        }
    }

    async fn wait_satisfied(&self, stream_uuid: &str, version: u64, required: &[String]) {
        loop {
            // Register for wake-up before checking, so an ack landing
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            if self.satisfied(stream_uuid, version, required) {
                return;
            }
            notified.await;
        }
    }

    fn satisfied(&self, stream_uuid: &str, version: u64, required: &[String]) -> bool {
        let acks = self.acks.lock().expect("ack map lock poisoned");
        let Some(per_subscriber) = acks.get(stream_uuid) else {
            return false;
        };
        required
            .iter()
            .all(|name| per_subscriber.get(name).is_some_and(|acked| *acked >= version))
    }
}

impl Drop for ConsistencyCoordinator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for ConsistencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCoordinator").finish_non_exhaustive()
    }
}

fn record(acks: &Mutex<AckMap>, notify: &tokio::sync::Notify, ack: Ack) {
    {
        let mut acks = acks.lock().expect("ack map lock poisoned");
        let mark = acks
            .entry(ack.stream_uuid)
            .or_default()
            .entry(ack.subscriber)
            .or_insert(0);
        // Acks are cumulative; never move the mark backwards.
        *mark = (*mark).max(ack.version);
    }
    notify.notify_waiters();
}

/// Built-in middleware enforcing the consistency contract up-front.
///
/// Validates explicit subscriber nominations in `before_dispatch`:
/// naming an undeclared or eventual-only subscriber halts the dispatch,
/// because such a wait could never be satisfied. The wait itself runs
/// after the instance replies, driven by the dispatcher against the
/// coordinator.
pub struct ConsistencyGuarantee {
    subscribers: SubscriberRegistry,
}

impl ConsistencyGuarantee {
    pub(crate) fn new(subscribers: SubscriberRegistry) -> Self {
        Self { subscribers }
    }
}

impl Middleware for ConsistencyGuarantee {
    fn before_dispatch(&self, pipeline: &mut Pipeline) {
        if let Consistency::Subscribers(names) = &pipeline.consistency {
            for name in names {
                match self.subscribers.declared(name) {
                    Some(SubscriberConsistency::Strong) => {}
                    Some(SubscriberConsistency::Eventual) | None => {
                        pipeline.halt(HaltReason::InvalidConsistency(name.clone()));
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::{Metadata, Returning};
    use crate::pipeline::ResolvedIdentity;
    use crate::pubsub::LocalPubSub;

    fn registry_with(entries: &[(&str, SubscriberConsistency)]) -> SubscriberRegistry {
        let mut registry = SubscriberRegistry::default();
        for (name, consistency) in entries {
            registry.declare(*name, *consistency);
        }
        registry
    }

    #[test]
    fn required_set_per_consistency_mode() {
        let registry = registry_with(&[
            ("projection_a", SubscriberConsistency::Strong),
            ("projection_b", SubscriberConsistency::Eventual),
            ("projection_c", SubscriberConsistency::Strong),
        ]);

        assert!(registry.required(&Consistency::Eventual).is_empty());
        assert_eq!(
            registry.required(&Consistency::Strong),
            vec!["projection_a".to_string(), "projection_c".to_string()]
        );
        assert_eq!(
            registry.required(&Consistency::Subscribers(vec!["projection_a".into()])),
            vec!["projection_a".to_string()]
        );
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_acked() {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let coordinator = ConsistencyCoordinator::start(pubsub).await;

        coordinator.record_ack(Ack {
            subscriber: "projection_a".into(),
            stream_uuid: "s-1".into(),
            version: 3,
        });

        coordinator
            .wait_for(
                "s-1",
                3,
                &["projection_a".to_string()],
                Timeout::After(Duration::from_millis(50)),
            )
            .await
            .expect("wait should be satisfied by the recorded ack");
    }

    #[tokio::test]
    async fn wait_wakes_on_later_ack() {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let coordinator = Arc::new(ConsistencyCoordinator::start(pubsub.clone()).await);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for(
                        "s-1",
                        2,
                        &["projection_a".to_string()],
                        Timeout::After(Duration::from_secs(1)),
                    )
                    .await
            })
        };

        // Give the waiter a moment to park, then ack via the bus.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pubsub
            .publish(
                ACK_TOPIC,
                serde_json::to_value(Ack {
                    subscriber: "projection_a".into(),
                    stream_uuid: "s-1".into(),
                    version: 2,
                })
                .expect("ack should serialize"),
            )
            .await;

        waiter
            .await
            .expect("waiter should not panic")
            .expect("wait should be satisfied by the published ack");
    }

    #[tokio::test]
    async fn wait_times_out_when_subscriber_never_acks() {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let coordinator = ConsistencyCoordinator::start(pubsub).await;

        let result = coordinator
            .wait_for(
                "s-1",
                1,
                &["projection_x".to_string()],
                Timeout::After(Duration::from_millis(50)),
            )
            .await;
        assert!(result.is_err(), "wait must time out without acks");
    }

    #[tokio::test]
    async fn wait_requires_every_nominated_subscriber() {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let coordinator = ConsistencyCoordinator::start(pubsub).await;

        coordinator.record_ack(Ack {
            subscriber: "projection_a".into(),
            stream_uuid: "s-1".into(),
            version: 5,
        });

        let result = coordinator
            .wait_for(
                "s-1",
                1,
                &["projection_a".to_string(), "projection_b".to_string()],
                Timeout::After(Duration::from_millis(50)),
            )
            .await;
        assert!(result.is_err(), "one missing subscriber must block the wait");
    }

    #[tokio::test]
    async fn stale_ack_does_not_regress_mark() {
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let coordinator = ConsistencyCoordinator::start(pubsub).await;

        coordinator.record_ack(Ack {
            subscriber: "projection_a".into(),
            stream_uuid: "s-1".into(),
            version: 4,
        });
        coordinator.record_ack(Ack {
            subscriber: "projection_a".into(),
            stream_uuid: "s-1".into(),
            version: 2,
        });

        assert_eq!(coordinator.acked_version("projection_a", "s-1"), Some(4));
    }

    fn guarantee_pipeline(consistency: Consistency) -> Pipeline {
        Pipeline::new(
            "Deposit",
            "bank-account",
            None,
            None,
            Metadata::new(),
            consistency,
            Returning::None,
            Timeout::DEFAULT,
            10,
            Box::new(|| {
                Ok(ResolvedIdentity {
                    identity: "ACC1".into(),
                    prefix: None,
                })
            }),
        )
    }

    #[test]
    fn guarantee_allows_declared_strong_nomination() {
        let guarantee = ConsistencyGuarantee::new(registry_with(&[(
            "projection_a",
            SubscriberConsistency::Strong,
        )]));
        let mut pipeline =
            guarantee_pipeline(Consistency::Subscribers(vec!["projection_a".into()]));

        guarantee.before_dispatch(&mut pipeline);

        assert!(!pipeline.halted());
    }

    #[test]
    fn guarantee_halts_on_unknown_subscriber() {
        let guarantee = ConsistencyGuarantee::new(SubscriberRegistry::default());
        let mut pipeline =
            guarantee_pipeline(Consistency::Subscribers(vec!["projection_x".into()]));

        guarantee.before_dispatch(&mut pipeline);

        assert!(pipeline.halted());
        assert_eq!(
            pipeline.halt_reason(),
            Some(&HaltReason::InvalidConsistency("projection_x".into()))
        );
    }

    #[test]
    fn guarantee_halts_on_eventual_only_subscriber() {
        let guarantee = ConsistencyGuarantee::new(registry_with(&[(
            "projection_b",
            SubscriberConsistency::Eventual,
        )]));
        let mut pipeline =
            guarantee_pipeline(Consistency::Subscribers(vec!["projection_b".into()]));

        guarantee.before_dispatch(&mut pipeline);

        assert!(pipeline.halted());
    }

    #[test]
    fn guarantee_ignores_strong_and_eventual_modes() {
        let guarantee = ConsistencyGuarantee::new(SubscriberRegistry::default());

        let mut eventual = guarantee_pipeline(Consistency::Eventual);
        guarantee.before_dispatch(&mut eventual);
        assert!(!eventual.halted());

        // Strong with no declared subscribers degrades to no wait.
        let mut strong = guarantee_pipeline(Consistency::Strong);
        guarantee.before_dispatch(&mut strong);
        assert!(!strong.halted());
    }
}
