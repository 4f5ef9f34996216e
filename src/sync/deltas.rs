//! Conflict resolution deltas.
//!
//! A delta is a pure function reducing (base collection, incoming
//! payloads) to a result collection, per-uuid and deterministic. The sync
//! engine emits the result into the payload manager under the matching
//! source.

use crate::payload::{Payload, PayloadCollection};
use tracing::warn;
use uuid::Uuid;

/// How one conflicting pair resolves. Left is the local/base copy, right
/// the incoming copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Ignore the incoming copy.
    KeepLeft,
    /// Accept the incoming copy.
    KeepRight,
    /// Keep local; duplicate the incoming copy under a fresh uuid with a
    /// `conflict_of` back-reference.
    KeepLeftDuplicateRight,
    /// Accept incoming on the canonical uuid; move the local copy to a
    /// `conflict_of` duplicate.
    KeepRightDuplicateLeft,
    /// Keep local content but union the reference arrays.
    KeepLeftMergeRefs,
}

/// Choose the strategy for a server sync conflict.
pub fn strategy_for_sync_conflict(local: &Payload, incoming: &Payload) -> ConflictStrategy {
    // A locally-errored copy is never overwritten; repair comes first.
    if local.error_decrypting || local.waiting_for_key {
        return ConflictStrategy::KeepLeft;
    }
    if local.content_type.is_singleton() {
        return ConflictStrategy::KeepLeft;
    }
    if local.deleted || incoming.deleted {
        return ConflictStrategy::KeepRight;
    }
    // Remote errored while local is healthy: the server copy takes the
    // canonical slot, local data survives in a duplicate.
    if incoming.error_decrypting || incoming.waiting_for_key {
        return ConflictStrategy::KeepRightDuplicateLeft;
    }

    match (local.content.as_decrypted(), incoming.content.as_decrypted()) {
        (Some(left), Some(right)) => {
            if left.equals_for_conflicts(right) {
                ConflictStrategy::KeepRight
            } else if left.differs_only_in_references(right) {
                ConflictStrategy::KeepLeftMergeRefs
            } else {
                // Content conflict: server wins the canonical uuid, local
                // edits move to the duplicate.
                ConflictStrategy::KeepRightDuplicateLeft
            }
        }
        _ => ConflictStrategy::KeepRight,
    }
}

/// Copy a payload to a fresh uuid with `conflict_of` pointing back at the
/// original. The duplicate has never been synced.
pub fn conflict_duplicate_of(payload: &Payload, original_uuid: Uuid) -> Payload {
    let now = chrono::Utc::now().timestamp_micros();
    let mut builder = payload
        .to_builder()
        .uuid(Uuid::new_v4())
        .updated_at(0)
        .dirty(true)
        .dirtied_at(Some(now))
        .last_sync_began(None)
        .last_sync_end(None)
        .items_key_id(payload.items_key_id)
        .enc_item_key(payload.enc_item_key.clone());

    if let Some(content) = payload.content.as_decrypted() {
        let mut content = content.clone();
        content.conflict_of = Some(original_uuid);
        builder = builder.decrypted_content(content);
    }
    builder.build()
}

fn accepted(incoming: &Payload) -> Payload {
    let now = chrono::Utc::now().timestamp_micros();
    incoming
        .to_builder()
        .dirty(false)
        .dirtied_at(None)
        .last_sync_end(Some(now))
        .build()
}

fn resolve_pair(
    local: &Payload,
    incoming: &Payload,
    strategy: ConflictStrategy,
    result: &mut PayloadCollection,
) {
    match strategy {
        ConflictStrategy::KeepLeft => {}
        ConflictStrategy::KeepRight => {
            result.set(accepted(incoming));
        }
        ConflictStrategy::KeepLeftDuplicateRight => {
            result.set(conflict_duplicate_of(incoming, local.uuid));
        }
        ConflictStrategy::KeepRightDuplicateLeft => {
            result.set(conflict_duplicate_of(local, local.uuid));
            result.set(accepted(incoming));
        }
        ConflictStrategy::KeepLeftMergeRefs => {
            let mut content = local
                .content
                .as_decrypted()
                .cloned()
                .unwrap_or_default();
            if let Some(incoming_content) = incoming.content.as_decrypted() {
                content.merge_references_from(incoming_content);
            }
            let now = chrono::Utc::now().timestamp_micros();
            result.set(
                local
                    .to_builder()
                    .decrypted_content(content)
                    .updated_at(incoming.updated_at)
                    .dirty(true)
                    .dirtied_at(Some(now))
                    .build(),
            );
        }
    }
}

/// Items downloaded during a normal sync round. A dirty local copy turns
/// the arrival into a conflict; otherwise the server copy is accepted.
pub fn delta_remote_retrieved(
    base: &PayloadCollection,
    apply: &[Payload],
) -> PayloadCollection {
    let mut result = PayloadCollection::new();
    for incoming in apply {
        match base.get(&incoming.uuid) {
            Some(local) if local.dirty => resolve_pair(
                local,
                incoming,
                strategy_for_sync_conflict(local, incoming),
                &mut result,
            ),
            _ => {
                result.set(accepted(incoming));
            }
        }
    }
    result
}

/// Server acknowledgements of uploads. Saved payloads carry metadata only;
/// content merges from the master copy. Items re-dirtied while the sync
/// was in flight stay dirty.
pub fn delta_remote_saved(base: &PayloadCollection, apply: &[Payload]) -> PayloadCollection {
    let now = chrono::Utc::now().timestamp_micros();
    let mut result = PayloadCollection::new();
    for incoming in apply {
        let local = base.get(&incoming.uuid);

        let content = if incoming.content.is_absent() {
            local.map(|l| l.content.clone()).unwrap_or_else(|| incoming.content.clone())
        } else {
            incoming.content.clone()
        };

        let redirtied = local
            .map(|l| match (l.dirtied_at, l.last_sync_began) {
                (Some(dirtied), Some(began)) => dirtied > began,
                _ => false,
            })
            .unwrap_or(false);

        result.set(
            incoming
                .to_builder()
                .content(content)
                .dirty(redirtied)
                .dirtied_at(if redirtied {
                    local.and_then(|l| l.dirtied_at)
                } else {
                    None
                })
                .last_sync_end(Some(now))
                .build(),
        );
    }
    result
}

/// Server-declared sync conflicts: resolve each against the local copy.
pub fn delta_remote_conflicts(
    base: &PayloadCollection,
    server_items: &[Payload],
) -> PayloadCollection {
    let mut result = PayloadCollection::new();
    for incoming in server_items {
        match base.get(&incoming.uuid) {
            Some(local) => resolve_pair(
                local,
                incoming,
                strategy_for_sync_conflict(local, incoming),
                &mut result,
            ),
            None => {
                result.set(accepted(incoming));
            }
        }
    }
    result
}

/// Server uuid collisions: the uploaded uuid belongs to someone else, so
/// the local item re-homes under a fresh uuid and the original local
/// record is dropped.
pub fn delta_uuid_conflicts(base: &PayloadCollection, uuids: &[Uuid]) -> PayloadCollection {
    let now = chrono::Utc::now().timestamp_micros();
    let mut result = PayloadCollection::new();
    for uuid in uuids {
        let Some(local) = base.get(uuid) else { continue };

        let rehomed = local
            .to_builder()
            .uuid(Uuid::new_v4())
            .updated_at(0)
            .dirty(true)
            .dirtied_at(Some(now))
            .last_sync_began(None)
            .last_sync_end(None)
            .build();
        result.set(rehomed);

        // Tombstone for the surrendered uuid; discardable, so the payload
        // manager drops it from the master collection.
        result.set(local.to_builder().deleted(true).dirty(false).build());
    }
    result
}

/// Server rejected these uploads outright. Each re-sources from the local
/// decrypted counterpart with `dirty=false`; a missing counterpart is
/// skipped.
pub fn delta_remote_rejected(base: &PayloadCollection, apply: &[Payload]) -> PayloadCollection {
    let now = chrono::Utc::now().timestamp_micros();
    let mut result = PayloadCollection::new();
    for incoming in apply {
        match base.get(&incoming.uuid) {
            Some(local) if local.is_decrypted() => {
                result.set(
                    local
                        .to_builder()
                        .dirty(false)
                        .dirtied_at(None)
                        .last_sync_end(Some(now))
                        .build(),
                );
            }
            _ => {
                warn!(uuid = %incoming.uuid, "rejected payload has no decrypted counterpart");
            }
        }
    }
    result
}

/// Full-state download during out-of-sync recovery. Locally differing
/// content is preserved as a conflict duplicate before the server copy is
/// accepted.
pub fn delta_out_of_sync(base: &PayloadCollection, apply: &[Payload]) -> PayloadCollection {
    let mut result = PayloadCollection::new();
    for incoming in apply {
        let Some(local) = base.get(&incoming.uuid) else {
            result.set(accepted(incoming));
            continue;
        };

        let differs = match (local.content.as_decrypted(), incoming.content.as_decrypted()) {
            (Some(left), Some(right)) => !left.equals_for_conflicts(right),
            _ => false,
        };
        if differs {
            result.set(conflict_duplicate_of(local, local.uuid));
        }
        result.set(accepted(incoming));
    }
    result
}

/// Backup import. A uuid collision never overwrites local data: the
/// imported copy always resolves `KeepLeftDuplicateRight`, landing as a
/// duplicate beside the existing item.
pub fn delta_file_import(base: &PayloadCollection, apply: &[Payload]) -> PayloadCollection {
    let now = chrono::Utc::now().timestamp_micros();
    let mut result = PayloadCollection::new();
    for incoming in apply {
        if let Some(local) = base.get(&incoming.uuid) {
            resolve_pair(
                local,
                incoming,
                ConflictStrategy::KeepLeftDuplicateRight,
                &mut result,
            );
        } else {
            result.set(
                incoming
                    .to_builder()
                    .updated_at(0)
                    .dirty(true)
                    .dirtied_at(Some(now))
                    .build(),
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ContentReference, ContentType, ItemContent, PayloadContent};

    fn note(uuid: Uuid, text: &str) -> Payload {
        Payload::builder(uuid, ContentType::Note)
            .decrypted_content(ItemContent {
                text: Some(text.to_string()),
                ..Default::default()
            })
            .updated_at(1_000)
            .build()
    }

    fn base_with(payloads: Vec<Payload>) -> PayloadCollection {
        PayloadCollection::from_payloads(payloads)
    }

    #[test]
    fn retrieved_accepts_clean_items() {
        let uuid = Uuid::new_v4();
        let base = base_with(vec![note(uuid, "local")]);
        let incoming = note(uuid, "server").to_builder().updated_at(2_000).build();

        let result = delta_remote_retrieved(&base, &[incoming]);
        let resolved = result.get(&uuid).unwrap();
        assert!(!resolved.dirty);
        assert_eq!(
            resolved.content.as_decrypted().unwrap().text.as_deref(),
            Some("server")
        );
    }

    #[test]
    fn retrieved_conflicts_with_dirty_local() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "local edits").to_builder().dirty(true).build();
        let base = base_with(vec![local]);
        let incoming = note(uuid, "server edits").to_builder().updated_at(2_000).build();

        let result = delta_remote_retrieved(&base, &[incoming]);
        assert_eq!(result.len(), 2);

        // Canonical uuid carries the server content.
        let canonical = result.get(&uuid).unwrap();
        assert_eq!(
            canonical.content.as_decrypted().unwrap().text.as_deref(),
            Some("server edits")
        );
        assert!(!canonical.dirty);

        // Local edits moved to a conflict duplicate.
        let duplicate = result
            .all()
            .find(|p| p.uuid != uuid)
            .expect("duplicate created");
        assert_eq!(
            duplicate.content.as_decrypted().unwrap().conflict_of,
            Some(uuid)
        );
        assert_eq!(
            duplicate.content.as_decrypted().unwrap().text.as_deref(),
            Some("local edits")
        );
        assert!(duplicate.dirty);
        assert!(duplicate.never_synced());
    }

    #[test]
    fn equal_content_accepts_server_copy() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "same").to_builder().dirty(true).build();
        let base = base_with(vec![local]);
        let incoming = note(uuid, "same").to_builder().updated_at(5_000).build();

        let result = delta_remote_retrieved(&base, &[incoming]);
        assert_eq!(result.len(), 1);
        let resolved = result.get(&uuid).unwrap();
        assert!(!resolved.dirty);
        assert_eq!(resolved.updated_at, 5_000);
    }

    #[test]
    fn reference_only_difference_merges() {
        let uuid = Uuid::new_v4();
        let target = Uuid::new_v4();

        let mut local_content = ItemContent {
            text: Some("same".to_string()),
            ..Default::default()
        };
        local_content.add_reference(ContentReference {
            uuid: target,
            content_type: ContentType::Tag,
        });
        let local = Payload::builder(uuid, ContentType::Note)
            .decrypted_content(local_content)
            .dirty(true)
            .build();

        let other_target = Uuid::new_v4();
        let mut incoming_content = ItemContent {
            text: Some("same".to_string()),
            ..Default::default()
        };
        incoming_content.add_reference(ContentReference {
            uuid: other_target,
            content_type: ContentType::Tag,
        });
        let incoming = Payload::builder(uuid, ContentType::Note)
            .decrypted_content(incoming_content)
            .updated_at(9_000)
            .build();

        let result = delta_remote_retrieved(&base_with(vec![local]), &[incoming]);
        assert_eq!(result.len(), 1);
        let merged = result.get(&uuid).unwrap();
        let refs = &merged.content.as_decrypted().unwrap().references;
        assert!(refs.iter().any(|r| r.uuid == target));
        assert!(refs.iter().any(|r| r.uuid == other_target));
        assert!(merged.dirty);
        assert_eq!(merged.updated_at, 9_000);
    }

    #[test]
    fn errored_local_keeps_left() {
        let uuid = Uuid::new_v4();
        let local = Payload::builder(uuid, ContentType::Note)
            .content(PayloadContent::Encrypted("004:a:b:c".to_string()))
            .error_decrypting(true)
            .dirty(true)
            .build();
        let incoming = note(uuid, "server");

        assert_eq!(
            strategy_for_sync_conflict(&local, &incoming),
            ConflictStrategy::KeepLeft
        );
        let result = delta_remote_retrieved(&base_with(vec![local]), &[incoming]);
        assert!(result.is_empty());
    }

    #[test]
    fn errored_incoming_duplicates_local() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "healthy").to_builder().dirty(true).build();
        let incoming = Payload::builder(uuid, ContentType::Note)
            .content(PayloadContent::Encrypted("004:x:y:z".to_string()))
            .error_decrypting(true)
            .build();

        assert_eq!(
            strategy_for_sync_conflict(&local, &incoming),
            ConflictStrategy::KeepRightDuplicateLeft
        );
    }

    #[test]
    fn deletion_on_either_side_accepts_incoming() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "text").to_builder().dirty(true).build();
        let incoming = note(uuid, "text")
            .to_builder()
            .deleted(true)
            .content(PayloadContent::Absent)
            .build();
        assert_eq!(
            strategy_for_sync_conflict(&local, &incoming),
            ConflictStrategy::KeepRight
        );
    }

    #[test]
    fn saved_merges_content_from_master() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "body")
            .to_builder()
            .dirty(true)
            .dirtied_at(Some(10))
            .last_sync_began(Some(20))
            .build();
        let base = base_with(vec![local]);

        let saved = Payload::builder(uuid, ContentType::Note)
            .updated_at(7_777)
            .build();

        let result = delta_remote_saved(&base, &[saved]);
        let merged = result.get(&uuid).unwrap();
        assert_eq!(
            merged.content.as_decrypted().unwrap().text.as_deref(),
            Some("body")
        );
        assert!(!merged.dirty);
        assert_eq!(merged.updated_at, 7_777);
        assert!(merged.last_sync_end.is_some());
    }

    #[test]
    fn saved_keeps_dirty_when_redirtied_mid_sync() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "body")
            .to_builder()
            .dirty(true)
            .dirtied_at(Some(30))
            .last_sync_began(Some(20))
            .build();
        let base = base_with(vec![local]);

        let saved = Payload::builder(uuid, ContentType::Note)
            .updated_at(7_777)
            .build();
        let result = delta_remote_saved(&base, &[saved]);
        assert!(result.get(&uuid).unwrap().dirty);
    }

    #[test]
    fn uuid_conflict_rehomes_local() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "mine").to_builder().dirty(true).build();
        let base = base_with(vec![local]);

        let result = delta_uuid_conflicts(&base, &[uuid]);
        assert_eq!(result.len(), 2);

        let tombstone = result.get(&uuid).unwrap();
        assert!(tombstone.deleted);
        assert!(!tombstone.dirty);

        let rehomed = result.all().find(|p| p.uuid != uuid).unwrap();
        assert!(rehomed.dirty);
        assert!(rehomed.never_synced());
        assert_eq!(
            rehomed.content.as_decrypted().unwrap().text.as_deref(),
            Some("mine")
        );
    }

    #[test]
    fn rejected_resources_from_local_counterpart() {
        let uuid = Uuid::new_v4();
        let local = note(uuid, "kept").to_builder().dirty(true).build();
        let base = base_with(vec![local]);
        let rejected = Payload::builder(uuid, ContentType::Note).build();

        let result = delta_remote_rejected(&base, &[rejected]);
        let resolved = result.get(&uuid).unwrap();
        assert!(!resolved.dirty);
        assert_eq!(
            resolved.content.as_decrypted().unwrap().text.as_deref(),
            Some("kept")
        );

        // No counterpart: skipped without panicking.
        let orphan = Payload::builder(Uuid::new_v4(), ContentType::Note).build();
        assert!(delta_remote_rejected(&base, &[orphan]).is_empty());
    }

    #[test]
    fn out_of_sync_duplicates_differing_content() {
        let uuid = Uuid::new_v4();
        let base = base_with(vec![note(uuid, "local divergent")]);
        let incoming = note(uuid, "server truth").to_builder().updated_at(8_000).build();

        let result = delta_out_of_sync(&base, &[incoming]);
        assert_eq!(result.len(), 2);
        assert!(result
            .all()
            .any(|p| p.content.as_decrypted().unwrap().conflict_of == Some(uuid)));
        assert_eq!(
            result
                .get(&uuid)
                .unwrap()
                .content
                .as_decrypted()
                .unwrap()
                .text
                .as_deref(),
            Some("server truth")
        );
    }

    #[test]
    fn file_import_never_overwrites() {
        let uuid = Uuid::new_v4();
        let base = base_with(vec![note(uuid, "existing")]);
        let imported = note(uuid, "from backup");

        let result = delta_file_import(&base, &[imported]);
        assert_eq!(result.len(), 1);
        let duplicate = result.all().next().unwrap();
        assert_ne!(duplicate.uuid, uuid);
        assert_eq!(
            duplicate.content.as_decrypted().unwrap().conflict_of,
            Some(uuid)
        );
        assert!(duplicate.dirty);

        // Fresh uuids import directly, marked dirty for upload.
        let fresh = note(Uuid::new_v4(), "new");
        let fresh_uuid = fresh.uuid;
        let result = delta_file_import(&base, &[fresh]);
        let inserted = result.get(&fresh_uuid).unwrap();
        assert!(inserted.dirty);
        assert!(inserted.never_synced());
    }
}
