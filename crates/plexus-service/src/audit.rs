//! Audit logging for graph write operations
//!
//! Every mutating orchestrator operation emits a structured audit event
//! naming the operation, the affected ids, and the resulting write
//! event. Events are logged at INFO level with the "audit" target so
//! security and compliance tooling can route them separately from
//! application logs. The audit channel is a side channel: it is never
//! required for a write to be considered successful.

use plexus_core::WriteEvent;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Audit events for graph mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// One entity created or merged
    EntityWritten {
        entity_set_id: Uuid,
        entity_key_id: Uuid,
        event: WriteEvent,
    },

    /// A bulk entity write completed
    EntitiesWritten {
        entity_set_id: Uuid,
        requested: usize,
        failed: usize,
        event: WriteEvent,
    },

    /// A bulk association write completed
    AssociationsWritten {
        entity_set_id: Uuid,
        requested: usize,
        failed: usize,
        event: WriteEvent,
    },

    /// An entity's properties were tombstoned and its adjacency removed
    EntityDeleted {
        entity_set_id: Uuid,
        entity_key_id: Uuid,
    },

    /// An association edge and its own properties were removed
    AssociationDeleted {
        entity_set_id: Uuid,
        edge_entity_key_id: Uuid,
    },
}

/// Log an audit event with structured fields.
///
/// The serialized event rides along for log aggregators; the prominent
/// fields are duplicated for filtering without JSON parsing.
pub fn audit_log(event: &AuditEvent) {
    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));

    match event {
        AuditEvent::EntityWritten {
            entity_set_id,
            entity_key_id,
            event,
        } => {
            info!(
                target: "audit",
                event = %event_json,
                entity_set_id = %entity_set_id,
                entity_key_id = %entity_key_id,
                version = event.version,
                num_updates = event.num_updates,
                "Entity written"
            );
        }
        AuditEvent::EntitiesWritten {
            entity_set_id,
            requested,
            failed,
            event,
        } => {
            info!(
                target: "audit",
                event = %event_json,
                entity_set_id = %entity_set_id,
                requested = requested,
                failed = failed,
                num_updates = event.num_updates,
                "Entities written"
            );
        }
        AuditEvent::AssociationsWritten {
            entity_set_id,
            requested,
            failed,
            event,
        } => {
            info!(
                target: "audit",
                event = %event_json,
                entity_set_id = %entity_set_id,
                requested = requested,
                failed = failed,
                num_updates = event.num_updates,
                "Associations written"
            );
        }
        AuditEvent::EntityDeleted {
            entity_set_id,
            entity_key_id,
        } => {
            info!(
                target: "audit",
                event = %event_json,
                entity_set_id = %entity_set_id,
                entity_key_id = %entity_key_id,
                "Entity deleted"
            );
        }
        AuditEvent::AssociationDeleted {
            entity_set_id,
            edge_entity_key_id,
        } => {
            info!(
                target: "audit",
                event = %event_json,
                entity_set_id = %entity_set_id,
                edge_entity_key_id = %edge_entity_key_id,
                "Association deleted"
            );
        }
    }
}
