use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

/// Lifecycle of a server-side upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Accepted, background upload not started yet.
    Pending,
    /// Chunks are being pushed to the store.
    Uploading,
    /// Manifest written; the transfer is downloadable.
    Complete,
    /// Upload gave up; no manifest was written.
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn can_become(self, next: TransferState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Uploading)
                | (Self::Pending, Self::Failed)
                | (Self::Uploading, Self::Complete)
                | (Self::Uploading, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: String,
    pub file_name: String,
    pub state: TransferState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-process record of uploads started through this server.
///
/// Only uploads accepted by this process are tracked; transfers uploaded
/// elsewhere are still downloadable through their manifest.
#[derive(Default)]
pub struct TransferRegistry {
    records: RwLock<HashMap<String, TransferRecord>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted upload as `Pending`.
    pub fn register(&self, id: &str, file_name: &str) {
        let now = Utc::now();
        let record = TransferRecord {
            id: id.to_string(),
            file_name: file_name.to_string(),
            state: TransferState::Pending,
            total_chunks: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        if let Ok(mut records) = self.records.write() {
            records.insert(id.to_string(), record);
        }
    }

    pub fn mark_uploading(&self, id: &str) -> bool {
        self.transition(id, TransferState::Uploading, |_| {})
    }

    pub fn mark_complete(&self, id: &str, total_chunks: u64) -> bool {
        self.transition(id, TransferState::Complete, |record| {
            record.total_chunks = Some(total_chunks);
        })
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.transition(id, TransferState::Failed, |record| {
            record.error = Some(error);
        })
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        let records = self.records.read().ok()?;
        records.get(id).cloned()
    }

    /// Forget finished transfers whose last update is older than
    /// `retention`. Pending and uploading records are kept.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let (Some(cutoff), Ok(mut records)) = (cutoff, self.records.write()) else {
            return 0;
        };
        let before = records.len();
        records.retain(|_, record| !record.state.is_terminal() || record.updated_at > cutoff);
        before - records.len()
    }

    /// Apply a state change if the current state allows it.
    fn transition<F>(&self, id: &str, next: TransferState, update: F) -> bool
    where
        F: FnOnce(&mut TransferRecord),
    {
        let Ok(mut records) = self.records.write() else {
            return false;
        };
        let Some(record) = records.get_mut(id) else {
            warn!(transfer_id = id, "State change for unknown transfer");
            return false;
        };
        if !record.state.can_become(next) {
            warn!(
                transfer_id = id,
                "Rejected state change {:?} -> {:?}",
                record.state,
                next
            );
            return false;
        }
        record.state = next;
        record.updated_at = Utc::now();
        update(record);
        true
    }
}
