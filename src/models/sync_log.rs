//! Persisted queue of actions that push local changes of one object to the
//! remote store.

use super::obj_id::ObjId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncActionKind {
    /// Upload the whole version through a remote transaction.
    CompleteUpload,
    /// Remove the object remotely.
    DeleteObj,
    /// Remove one archived version remotely.
    DeleteArchivedVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    pub version: u64,
    pub kind: SyncActionKind,
    /// Present while the local write behind this action has not completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intention_num: Option<u64>,
}

impl SyncAction {
    pub fn is_runnable(&self) -> bool {
        self.intention_num.is_none()
    }
}

/// Checkpoint of an upload in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub transaction_id: String,
    pub header_sent: bool,
    pub seg_bytes_synced: u64,
    pub segs_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub obj_id: ObjId,
    /// Last issued intention number.
    pub counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<SyncAction>,
    #[serde(default)]
    pub backlog: Vec<SyncAction>,
    /// Only meaningful together with a `CompleteUpload` current action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<UploadProgress>,
}

impl SyncLog {
    pub fn new(obj_id: ObjId) -> Self {
        Self {
            obj_id,
            counter: 0,
            current_action: None,
            backlog: Vec::new(),
            progress: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_action.is_none() && self.backlog.is_empty()
    }

    /// Queue `kind` for `version` behind a fresh intention number.
    pub fn record_intention(&mut self, kind: SyncActionKind, version: u64) -> u64 {
        self.counter += 1;
        let num = self.counter;
        self.backlog.push(SyncAction {
            version,
            kind,
            intention_num: Some(num),
        });
        num
    }

    /// Clear the intention marker. Returns false if no entry carries `num`.
    pub fn activate(&mut self, num: u64) -> bool {
        match self
            .backlog
            .iter_mut()
            .find(|a| a.intention_num == Some(num))
        {
            Some(action) => {
                action.intention_num = None;
                true
            }
            None => false,
        }
    }

    /// Drop the still-pending entry carrying `num`.
    pub fn cancel_intention(&mut self, num: u64) -> bool {
        let before = self.backlog.len();
        self.backlog.retain(|a| a.intention_num != Some(num));
        self.backlog.len() != before
    }

    /// The action the driver should run next. When nothing is running, the
    /// oldest activated backlog entry becomes current. Entries still waiting
    /// on their local write stay queued.
    pub fn next_runnable(&mut self) -> Option<SyncAction> {
        if let Some(current) = &self.current_action {
            return Some(current.clone());
        }
        let index = self.backlog.iter().position(SyncAction::is_runnable)?;
        let action = self.backlog.remove(index);
        self.current_action = Some(action.clone());
        self.progress = None;
        Some(action)
    }

    pub fn finish_current(&mut self) {
        self.current_action = None;
        self.progress = None;
    }

    /// Versions the uploader still has to read from disk.
    pub fn pinned_versions(&self) -> Vec<u64> {
        self.current_action
            .iter()
            .chain(self.backlog.iter())
            .filter(|a| a.kind == SyncActionKind::CompleteUpload)
            .map(|a| a.version)
            .collect()
    }
}
