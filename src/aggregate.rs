//! Aggregate trait and the domain-event wire bridge.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::event_store::{EventMetadata, EventStoreError, ProposedEvent, RecordedEvent};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state; the
/// zero value comes from `Default` and the state is rebuilt by folding
/// recorded events through [`apply`](Aggregate::apply).
///
/// Command handling lives *outside* the aggregate, in
/// [`CommandHandler`](crate::CommandHandler) implementations bound by
/// the router -- the aggregate only knows how to evolve.
///
/// # Contract
///
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to an event,
///   returning the next state.
/// - `KIND` must be stable: it keys the instance registry and any
///   persisted snapshots.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate kind (e.g. "bank-account").
    const KIND: &'static str;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`): the `"type"` tag
    /// becomes the stored `event_type` and `"data"` the payload.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// Encode a domain event into a [`ProposedEvent`] ready for appending.
///
/// The adjacently tagged serialization yields an object like
/// `{"type": "Deposited", "data": {"amount": 50}}`; the `"type"` field
/// becomes `event_type` and `"data"` (absent for fieldless variants)
/// becomes the payload. A fresh UUID v4 event ID is assigned.
///
/// # Errors
///
/// Returns [`EventStoreError::Serialization`] if the event does not
/// serialize to a tagged object -- i.e. the event type does not follow
/// the crate's serde convention.
pub(crate) fn encode_event<A: Aggregate>(
    event: &A::Event,
    metadata: EventMetadata,
) -> Result<ProposedEvent, EventStoreError> {
    let value = serde_json::to_value(event)
        .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
    let object = value.as_object().ok_or_else(|| {
        EventStoreError::Serialization(format!(
            "event for aggregate '{}' must serialize to an adjacently tagged object",
            A::KIND
        ))
    })?;
    let event_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EventStoreError::Serialization(format!(
                "event for aggregate '{}' is missing its string 'type' tag",
                A::KIND
            ))
        })?
        .to_owned();

    // Data may be absent for fieldless variants.
    let data = object.get("data").cloned().unwrap_or(Value::Null);

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        data,
        metadata,
    })
}

/// Decode a recorded event back into the aggregate's domain event.
///
/// Reconstructs the tagged JSON object from the stored `event_type` and
/// payload. Returns `None` for unknown or malformed events so folds can
/// skip them, keeping rehydration forward compatible with event types
/// added after this binary was built.
pub(crate) fn decode_event<A: Aggregate>(recorded: &RecordedEvent) -> Option<A::Event> {
    let tagged = if recorded.data.is_null() {
        serde_json::json!({ "type": recorded.event_type })
    } else {
        serde_json::json!({
            "type": recorded.event_type,
            "data": recorded.data,
        })
    };

    serde_json::from_value::<A::Event>(tagged).ok()
}
