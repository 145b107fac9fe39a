//! Pending mutations - deferred actions awaiting network availability.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Add a product variant to the cart.
    CartAdd,
    /// A tracked user interaction (analytics).
    InteractionEvent,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CartAdd => write!(f, "cart_add"),
            Self::InteractionEvent => write!(f, "interaction_event"),
        }
    }
}

/// Body of `POST /cart/items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartAddPayload {
    /// Product variant being added.
    pub variant_id: u64,
    /// Number of units.
    pub quantity: u32,
}

/// One entry of `POST /user-interactions/batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPayload {
    /// Signed-in user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Product the interaction refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    /// Interaction type (e.g. `view`, `click`, `add_to_cart`).
    #[serde(rename = "type")]
    pub interaction_type: String,
    /// Free-form context attached by the caller.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl InteractionPayload {
    /// Create an interaction of the given type with no user, product or metadata.
    #[must_use]
    pub fn new(interaction_type: impl Into<String>) -> Self {
        Self {
            user_id: None,
            product_id: None,
            interaction_type: interaction_type.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach the user ID.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the product ID.
    #[must_use]
    pub fn with_product(mut self, product_id: u64) -> Self {
        self.product_id = Some(product_id);
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Kind-specific payload of a pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MutationPayload {
    /// Cart addition.
    CartAdd(CartAddPayload),
    /// Interaction event.
    InteractionEvent(InteractionPayload),
}

impl MutationPayload {
    /// The kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> MutationKind {
        match self {
            Self::CartAdd(_) => MutationKind::CartAdd,
            Self::InteractionEvent(_) => MutationKind::InteractionEvent,
        }
    }
}

/// A deferred action awaiting network availability.
///
/// The payload is fixed at construction. Only the attempt counter changes
/// after a record has been enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    id: RecordId,
    payload: MutationPayload,
    /// Milliseconds since the Unix epoch.
    enqueued_at: u64,
    #[serde(default)]
    attempts: u32,
}

impl PendingMutation {
    /// Create a new record stamped with the current time.
    #[must_use]
    pub fn new(payload: MutationPayload) -> Self {
        Self::at(payload, current_timestamp_ms())
    }

    /// Create a new record with an explicit enqueue timestamp.
    #[must_use]
    pub fn at(payload: MutationPayload, enqueued_at: u64) -> Self {
        Self {
            id: RecordId::new(),
            payload,
            enqueued_at,
            attempts: 0,
        }
    }

    /// Convenience constructor for a cart addition.
    #[must_use]
    pub fn cart_add(variant_id: u64, quantity: u32) -> Self {
        Self::new(MutationPayload::CartAdd(CartAddPayload {
            variant_id,
            quantity,
        }))
    }

    /// Convenience constructor for an interaction event.
    #[must_use]
    pub fn interaction(payload: InteractionPayload) -> Self {
        Self::new(MutationPayload::InteractionEvent(payload))
    }

    /// The record ID.
    #[must_use]
    pub const fn id(&self) -> RecordId {
        self.id
    }

    /// The record kind.
    #[must_use]
    pub const fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    /// The immutable payload.
    #[must_use]
    pub const fn payload(&self) -> &MutationPayload {
        &self.payload
    }

    /// Enqueue timestamp in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }

    /// Number of failed delivery attempts so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The cart payload, if this is a cart addition.
    #[must_use]
    pub const fn as_cart_add(&self) -> Option<&CartAddPayload> {
        match &self.payload {
            MutationPayload::CartAdd(p) => Some(p),
            MutationPayload::InteractionEvent(_) => None,
        }
    }

    /// The interaction payload, if this is an interaction event.
    #[must_use]
    pub const fn as_interaction(&self) -> Option<&InteractionPayload> {
        match &self.payload {
            MutationPayload::InteractionEvent(p) => Some(p),
            MutationPayload::CartAdd(_) => None,
        }
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| {
        // Timestamp will not exceed u64 max for millennia
        #[allow(clippy::cast_possible_truncation)]
        {
            d.as_millis() as u64
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_add_record() {
        let record = PendingMutation::cart_add(42, 1);
        assert_eq!(record.kind(), MutationKind::CartAdd);
        assert_eq!(record.attempts(), 0);
        assert!(record.enqueued_at() > 0);
        assert_eq!(
            record.as_cart_add(),
            Some(&CartAddPayload {
                variant_id: 42,
                quantity: 1
            })
        );
        assert!(record.as_interaction().is_none());
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = PendingMutation::cart_add(42, 1);
        let b = PendingMutation::cart_add(42, 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_record_attempt_only_touches_counter() {
        let mut record = PendingMutation::at(
            MutationPayload::CartAdd(CartAddPayload {
                variant_id: 7,
                quantity: 3,
            }),
            1000,
        );
        let before = record.payload().clone();
        record.record_attempt();
        record.record_attempt();
        assert_eq!(record.attempts(), 2);
        assert_eq!(record.payload(), &before);
        assert_eq!(record.enqueued_at(), 1000);
    }

    #[test]
    fn test_cart_payload_wire_format() {
        let json = serde_json::to_value(CartAddPayload {
            variant_id: 42,
            quantity: 1,
        })
        .expect("serialize");
        assert_eq!(json, serde_json::json!({"variant_id": 42, "quantity": 1}));
    }

    #[test]
    fn test_interaction_payload_wire_format() {
        let payload = InteractionPayload::new("view")
            .with_user("u-1")
            .with_product(99)
            .with_metadata(serde_json::json!({"source": "search"}));
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["type"], "view");
        assert_eq!(json["user_id"], "u-1");
        assert_eq!(json["product_id"], 99);
        assert_eq!(json["metadata"]["source"], "search");

        let bare = serde_json::to_value(InteractionPayload::new("click")).expect("serialize");
        assert!(bare.get("metadata").is_none());
        assert!(bare.get("user_id").is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let record = PendingMutation::cart_add(5, 2);
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["payload"]["kind"], "cart_add");
        assert_eq!(json["payload"]["data"]["variant_id"], 5);
        assert_eq!(json["attempts"], 0);

        let restored: PendingMutation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored, record);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MutationKind::CartAdd.to_string(), "cart_add");
        assert_eq!(MutationKind::InteractionEvent.to_string(), "interaction_event");
    }
}
