use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used to derive saga IDs from external trigger identifiers.
const TRIGGER_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4f8a_a7e5_2d0c_81b6_f3e9);

/// Unique identifier for a saga instance.
///
/// Wraps a UUID so saga IDs can't be mixed up with other UUID-based
/// identifiers (order IDs, claim keys, ...). IDs are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(Uuid);

impl SagaId {
    /// Creates a new random saga ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a stable saga ID from an external trigger identifier.
    ///
    /// A transport that redelivers the same "start saga" message yields the
    /// same ID, so the duplicate lands on the existing instance.
    pub fn from_trigger(trigger_id: &str) -> Self {
        Self(Uuid::new_v5(&TRIGGER_NAMESPACE, trigger_id.as_bytes()))
    }

    /// Creates a saga ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SagaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SagaId> for Uuid {
    fn from(id: SagaId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_id_new_creates_unique_ids() {
        let id1 = SagaId::new();
        let id2 = SagaId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn saga_id_from_trigger_is_stable() {
        let a = SagaId::from_trigger("order-42/fulfill");
        let b = SagaId::from_trigger("order-42/fulfill");
        let c = SagaId::from_trigger("order-43/fulfill");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn saga_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = SagaId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn saga_id_serializes_as_plain_uuid() {
        let id = SagaId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let deserialized: SagaId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }
}
