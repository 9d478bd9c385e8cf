//! Snapshot, restore, and rollback of workflow/plan/step state. Every
//! checkpoint's `state_blob` is hashed at write time, and `restore` recomputes
//! the hash to catch tampering or truncation before handing state back.

use crate::types::{new_id, Checkpoint, Id};
use chrono::Utc;
use log::info;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub enum CheckpointError {
    NotFound { entity_type: String, entity_id: Id },
    Corrupt { checkpoint_id: Id },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::NotFound { entity_type, entity_id } => {
                write!(f, "no checkpoint for {entity_type} {entity_id}")
            }
            CheckpointError::Corrupt { checkpoint_id } => {
                write!(f, "checkpoint {checkpoint_id} failed integrity verification")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

fn compute_integrity_hash(entity_type: &str, entity_id: &str, reason: &str, state_blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_bytes());
    hasher.update(entity_id.as_bytes());
    hasher.update(reason.as_bytes());
    hasher.update(state_blob);
    format!("{:x}", hasher.finalize())
}

/// Append-only store of `Checkpoint`s keyed by `(entity_type, entity_id)`.
/// Every checkpoint's `state_blob` is hashed at write time; `restore`
/// recomputes the hash and refuses to return a tampered or truncated blob.
pub struct CheckpointStore {
    checkpoints: RwLock<HashMap<(String, Id), Vec<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new checkpoint. `state_blob` is opaque to the store — callers
    /// serialize whatever a workflow/plan/step snapshot means for their type.
    pub async fn snapshot(
        &self,
        entity_type: impl Into<String>,
        entity_id: Id,
        state_blob: Vec<u8>,
        reason: impl Into<String>,
        trace_id: Id,
    ) -> Checkpoint {
        let entity_type = entity_type.into();
        let reason = reason.into();
        let integrity_hash = compute_integrity_hash(&entity_type, &entity_id, &reason, &state_blob);

        let checkpoint = Checkpoint {
            checkpoint_id: new_id(),
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
            state_blob,
            integrity_hash,
            reason,
            trace_id,
            created_at: Utc::now(),
        };

        info!(
            "checkpoint {} recorded for {} {}",
            checkpoint.checkpoint_id, entity_type, entity_id
        );

        self.checkpoints
            .write()
            .await
            .entry((entity_type, entity_id))
            .or_default()
            .push(checkpoint.clone());

        checkpoint
    }

    pub async fn latest(&self, entity_type: &str, entity_id: &str) -> Result<Checkpoint, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        checkpoints
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| CheckpointError::NotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            })
    }

    /// Verify and return the most recent checkpoint's state blob.
    pub async fn restore(&self, entity_type: &str, entity_id: &str) -> Result<Vec<u8>, CheckpointError> {
        let checkpoint = self.latest(entity_type, entity_id).await?;
        self.verify(&checkpoint)?;
        Ok(checkpoint.state_blob)
    }

    /// Roll back to the checkpoint immediately before the most recent one,
    /// discarding the most recent entry. Used when a step's post-execution
    /// state must be undone after a failed validation.
    pub async fn rollback(&self, entity_type: &str, entity_id: &str) -> Result<Vec<u8>, CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        let key = (entity_type.to_string(), entity_id.to_string());
        let history = checkpoints
            .get_mut(&key)
            .ok_or_else(|| CheckpointError::NotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            })?;

        if history.len() > 1 {
            history.pop();
        }

        let checkpoint = history.last().cloned().ok_or_else(|| CheckpointError::NotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        })?;
        self.verify(&checkpoint)?;
        Ok(checkpoint.state_blob)
    }

    fn verify(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let expected = compute_integrity_hash(
            &checkpoint.entity_type,
            &checkpoint.entity_id,
            &checkpoint.reason,
            &checkpoint.state_blob,
        );
        if expected != checkpoint.integrity_hash {
            return Err(CheckpointError::Corrupt {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
            });
        }
        Ok(())
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restore_returns_the_most_recent_snapshot() {
        let store = CheckpointStore::new();
        let entity_id = new_id();
        store
            .snapshot("plan", entity_id.clone(), b"v1".to_vec(), "initial", new_id())
            .await;
        store
            .snapshot("plan", entity_id.clone(), b"v2".to_vec(), "after step 1", new_id())
            .await;

        let restored = store.restore("plan", &entity_id).await.unwrap();
        assert_eq!(restored, b"v2".to_vec());
    }

    #[tokio::test]
    async fn rollback_discards_the_latest_and_returns_the_prior_snapshot() {
        let store = CheckpointStore::new();
        let entity_id = new_id();
        store
            .snapshot("plan", entity_id.clone(), b"v1".to_vec(), "initial", new_id())
            .await;
        store
            .snapshot("plan", entity_id.clone(), b"v2".to_vec(), "after step 1", new_id())
            .await;

        let rolled_back = store.rollback("plan", &entity_id).await.unwrap();
        assert_eq!(rolled_back, b"v1".to_vec());
    }

    #[tokio::test]
    async fn tampered_state_blob_fails_integrity_verification() {
        let store = CheckpointStore::new();
        let entity_id = new_id();
        store
            .snapshot("plan", entity_id.clone(), b"v1".to_vec(), "initial", new_id())
            .await;

        {
            let mut checkpoints = store.checkpoints.write().await;
            let history = checkpoints
                .get_mut(&("plan".to_string(), entity_id.clone()))
                .unwrap();
            history[0].state_blob = b"tampered".to_vec();
        }

        let result = store.restore("plan", &entity_id).await;
        assert!(matches!(result, Err(CheckpointError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let store = CheckpointStore::new();
        let result = store.restore("plan", "nonexistent").await;
        assert!(matches!(result, Err(CheckpointError::NotFound { .. })));
    }
}
