/// Mutation processor: applies a client batch atomically.
///
/// A batch is validated up front and then applied inside a single
/// transaction. Per operation:
///
/// - **upsert** updates the row only if `updated_at <= base_updated_at`,
///   inserts it if it does not exist, and otherwise drops the operation as a
///   write conflict (server state wins, no changelog entry).
/// - **delete** removes the row; under [`DeletePolicy::Guarded`] it is
///   subject to the same timestamp gate as upsert.
///
/// Every operation that took effect gets the next global version and one
/// changelog entry attributed to the submitting client. The entity rows, the
/// changelog rows and the counter commit together or not at all. After a
/// commit that changed something, subscribers of the namespace are notified
/// once with the new current version.
use crate::config::DeletePolicy;
use crate::error::{SyncError, SyncResult};
use crate::storage::{SyncStore, WriteBatch};
use crate::subscriptions::Broadcaster;
use crate::types::{ConflictRef, EntityKey, MutationOp, MutationOutcome, Op};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Reject a batch containing any structurally invalid operation.
///
/// Runs before the transaction opens, so a rejected batch has no effect.
pub fn validate(mutations: &[MutationOp]) -> SyncResult<()> {
    for (index, op) in mutations.iter().enumerate() {
        if op.entity_type.trim().is_empty() {
            return Err(SyncError::InvalidMutation {
                index,
                reason: "missing type".to_string(),
            });
        }
        if op.id.trim().is_empty() {
            return Err(SyncError::InvalidMutation {
                index,
                reason: "missing id".to_string(),
            });
        }
    }
    Ok(())
}

/// Apply a validated batch in one transaction.
///
/// `now_ms` is the wall-clock timestamp stamped on rows written by this
/// batch. Any storage error rolls the whole batch back.
pub fn apply_batch(
    store: &SyncStore,
    namespace: &str,
    client_id: &str,
    mutations: &[MutationOp],
    delete_policy: DeletePolicy,
    now_ms: i64,
) -> SyncResult<MutationOutcome> {
    validate(mutations)?;

    store.write(|batch| {
        let mut applied = 0;
        let mut conflicts = Vec::new();

        for op in mutations {
            let key = EntityKey::new(namespace, &op.entity_type, &op.id);
            let took_effect = match op.op {
                Op::Upsert => apply_upsert(batch, &key, client_id, op, now_ms)?,
                Op::Delete => apply_delete(batch, &key, client_id, op, delete_policy)?,
            };
            if took_effect {
                applied += 1;
            } else if let Some(current) = batch.updated_at(&key)? {
                tracing::warn!(
                    "Write conflict on {} from {}: base {} < current {}, keeping server state",
                    key,
                    client_id,
                    op.base_updated_at,
                    current
                );
                conflicts.push(ConflictRef {
                    entity_type: op.entity_type.clone(),
                    id: op.id.clone(),
                });
            }
        }

        Ok(MutationOutcome {
            version: batch.current_version()?,
            applied,
            conflicts,
        })
    })
}

fn apply_upsert(
    batch: &mut WriteBatch<'_>,
    key: &EntityKey,
    client_id: &str,
    op: &MutationOp,
    now_ms: i64,
) -> SyncResult<bool> {
    let data = serde_json::to_string(op.data.as_ref().unwrap_or(&JsonValue::Null))?;

    let written = if batch.conditional_update(key, &data, now_ms, client_id, op.base_updated_at)? {
        true
    } else if batch.updated_at(key)?.is_none() {
        batch.insert(key, &data, now_ms, client_id)?;
        true
    } else {
        false
    };

    if written {
        batch.append_change(key, client_id, Op::Upsert, Some(&data))?;
    }
    Ok(written)
}

fn apply_delete(
    batch: &mut WriteBatch<'_>,
    key: &EntityKey,
    client_id: &str,
    op: &MutationOp,
    delete_policy: DeletePolicy,
) -> SyncResult<bool> {
    let guard = match delete_policy {
        DeletePolicy::Unconditional => None,
        DeletePolicy::Guarded => Some(op.base_updated_at),
    };

    let removed = batch.delete(key, guard)?;
    if removed {
        batch.append_change(key, client_id, Op::Delete, None)?;
    }
    Ok(removed)
}

/// Async front for [`apply_batch`] that also notifies subscribers.
#[derive(Debug, Clone)]
pub struct MutationProcessor {
    store: Arc<SyncStore>,
    broadcaster: Arc<Broadcaster>,
    delete_policy: DeletePolicy,
}

impl MutationProcessor {
    pub fn new(
        store: Arc<SyncStore>,
        broadcaster: Arc<Broadcaster>,
        delete_policy: DeletePolicy,
    ) -> Self {
        Self {
            store,
            broadcaster,
            delete_policy,
        }
    }

    /// Validate, apply and commit `mutations` for `namespace` on behalf of
    /// `client_id`.
    ///
    /// Conflicted operations are reported in the outcome, not as errors.
    pub async fn apply(
        &self,
        namespace: &str,
        client_id: &str,
        mutations: Vec<MutationOp>,
    ) -> SyncResult<MutationOutcome> {
        validate(&mutations)?;

        let ns = namespace.to_string();
        let client = client_id.to_string();
        let policy = self.delete_policy;
        let outcome = self
            .store
            .run(move |store| {
                apply_batch(
                    store,
                    &ns,
                    &client,
                    &mutations,
                    policy,
                    Utc::now().timestamp_millis(),
                )
            })
            .await?;

        tracing::debug!(
            "Applied batch from {} to {}: {} applied, {} conflicts, version {}",
            client_id,
            namespace,
            outcome.applied,
            outcome.conflicts.len(),
            outcome.version
        );

        if outcome.applied > 0 {
            self.broadcaster.notify(namespace, outcome.version);
        }

        Ok(outcome)
    }
}
