//! Memory entry management.
//!
//! A **memory entry** is the core unit of long-lived agent state. This
//! module owns the entry lifecycle: validation, tier routing, the
//! relationship graph, and similarity search.
//!
//! # Operations
//!
//! All entry operations are available on [`MemoryEngine`]:
//!
//! - [`store(entry)`](MemoryEngine::store)
//! - [`get(id)`](MemoryEngine::get)
//! - [`query(filter)`](MemoryEngine::query)
//! - [`search_similarity(vector, domain, k, threshold)`](MemoryEngine::search_similarity)
//! - [`relate(source, target, kind)`](MemoryEngine::relate)
//! - [`related(id, kind, max_depth)`](MemoryEngine::related)
//! - [`aggregate(service_id, domain, window)`](MemoryEngine::aggregate)
//! - [`apply_replicated(entry)`](MemoryEngine::apply_replicated) - the
//!   idempotent inbound-sync write path

mod engine;
pub mod types;

pub use engine::MemoryEngine;
pub use types::{
    MemoryAggregation, MemoryEntry, MemoryFilter, MemoryKind, NewMemoryEntry, RelationshipEdge,
};

use crate::error::{MembraneError, ValidationError};
use crate::tier::schema::{MAX_DOMAIN_LENGTH, MAX_IMPORTANCE, MAX_PAYLOAD_SIZE, MAX_TAGS, MAX_TAG_LENGTH};

/// Validates a [`NewMemoryEntry`] before storage.
///
/// # Rules
///
/// - `service_id`, `agent_id`, `domain`: non-empty; domain ≤ 100 chars
/// - `importance`: 0.0-10.0
/// - `payload`: serialized size ≤ 256 KB
/// - `tags`: ≤ 32 tags, each ≤ 100 chars
/// - `embedding`: dimension must match the configured dimension
pub(crate) fn validate_new_entry(
    entry: &NewMemoryEntry,
    dimension: usize,
) -> Result<(), MembraneError> {
    if entry.service_id.as_str().is_empty() {
        return Err(ValidationError::required_field("service_id").into());
    }

    if entry.agent_id.as_str().is_empty() {
        return Err(ValidationError::required_field("agent_id").into());
    }

    if entry.domain.is_empty() {
        return Err(ValidationError::required_field("domain").into());
    }

    if entry.domain.len() > MAX_DOMAIN_LENGTH {
        return Err(ValidationError::invalid_field(
            "domain",
            format!("exceeds max length of {} chars", MAX_DOMAIN_LENGTH),
        )
        .into());
    }

    if !(0.0..=MAX_IMPORTANCE).contains(&entry.importance) {
        return Err(ValidationError::invalid_field(
            "importance",
            format!("must be between 0.0 and {}, got {}", MAX_IMPORTANCE, entry.importance),
        )
        .into());
    }

    let payload_size = serde_json::to_vec(&entry.payload).map(|b| b.len()).unwrap_or(0);
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(ValidationError::payload_too_large(payload_size, MAX_PAYLOAD_SIZE).into());
    }

    if entry.tags.len() > MAX_TAGS {
        return Err(ValidationError::too_many_items("tags", entry.tags.len(), MAX_TAGS).into());
    }

    for tag in &entry.tags {
        if tag.len() > MAX_TAG_LENGTH {
            return Err(ValidationError::invalid_field(
                "tags",
                format!("tag '{}' exceeds max length of {} chars", tag, MAX_TAG_LENGTH),
            )
            .into());
        }
    }

    if let Some(ref embedding) = entry.embedding {
        if embedding.len() != dimension {
            return Err(ValidationError::dimension_mismatch(dimension, embedding.len()).into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentId, ServiceId};

    fn valid_entry() -> NewMemoryEntry {
        NewMemoryEntry {
            service_id: ServiceId::new("svc-a"),
            agent_id: AgentId::new("agent-1"),
            domain: "legal".into(),
            payload: serde_json::json!({"k": 1}),
            embedding: Some(vec![0.1; 384]),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_entry_passes() {
        assert!(validate_new_entry(&valid_entry(), 384).is_ok());
    }

    #[test]
    fn test_empty_service_rejected() {
        let mut entry = valid_entry();
        entry.service_id = ServiceId::new("");
        assert!(validate_new_entry(&entry, 384).unwrap_err().is_validation());
    }

    #[test]
    fn test_empty_agent_rejected() {
        let mut entry = valid_entry();
        entry.agent_id = AgentId::new("");
        assert!(validate_new_entry(&entry, 384).unwrap_err().is_validation());
    }

    #[test]
    fn test_empty_domain_rejected() {
        let mut entry = valid_entry();
        entry.domain = String::new();
        assert!(validate_new_entry(&entry, 384).unwrap_err().is_validation());
    }

    #[test]
    fn test_importance_out_of_range_rejected() {
        let mut entry = valid_entry();
        entry.importance = -0.1;
        assert!(validate_new_entry(&entry, 384).is_err());

        entry.importance = 10.1;
        assert!(validate_new_entry(&entry, 384).is_err());
    }

    #[test]
    fn test_importance_boundaries_pass() {
        let mut entry = valid_entry();
        entry.importance = 0.0;
        assert!(validate_new_entry(&entry, 384).is_ok());

        entry.importance = 10.0;
        assert!(validate_new_entry(&entry, 384).is_ok());
    }

    #[test]
    fn test_too_many_tags_rejected() {
        let mut entry = valid_entry();
        entry.tags = (0..MAX_TAGS + 1).map(|i| format!("tag-{}", i)).collect();
        assert!(validate_new_entry(&entry, 384).unwrap_err().is_validation());
    }

    #[test]
    fn test_tag_too_long_rejected() {
        let mut entry = valid_entry();
        entry.tags = ["x".repeat(MAX_TAG_LENGTH + 1)].into_iter().collect();
        assert!(validate_new_entry(&entry, 384).unwrap_err().is_validation());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut entry = valid_entry();
        entry.embedding = Some(vec![0.1; 768]);
        let err = validate_new_entry(&entry, 384).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_missing_embedding_is_fine() {
        let mut entry = valid_entry();
        entry.embedding = None;
        assert!(validate_new_entry(&entry, 384).is_ok());
    }
}
