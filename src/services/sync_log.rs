//! Persistence of per-object sync logs.
//!
//! Every mutation runs under the object's lock and is written to disk before
//! it returns. A log that no longer holds any action is deleted, and the
//! object is handed to the garbage collector since the versions the log
//! pinned may have become collectible.

use super::{
    gc::GarbageCollector,
    obj_folders::{ObjFolders, read_json, remove_file_if_present, write_json_atomic},
    windowed_cache::WindowedCache,
};
use crate::{
    errors::StorageResult,
    models::{
        obj_id::ObjId,
        sync_log::{SyncActionKind, SyncLog},
    },
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::debug;

#[derive(Clone)]
pub struct SyncLogs {
    folders: Arc<ObjFolders>,
    gc: GarbageCollector,
    cache: Arc<WindowedCache<String, SyncLog>>,
}

impl SyncLogs {
    pub fn new(folders: Arc<ObjFolders>, gc: GarbageCollector, cache_window: Duration) -> Self {
        Self {
            folders,
            gc,
            cache: Arc::new(WindowedCache::new(cache_window)),
        }
    }

    /// Queue an action behind a fresh intention number. Must complete before
    /// the local write the action uploads or deletes is started.
    pub async fn record_intended_action(&self, id: &ObjId, kind: SyncActionKind, version: u64) -> StorageResult<u64> {
        let _guard = self.folders.lock(id).await;
        let mut log = self
            .read_locked(id)
            .await?
            .unwrap_or_else(|| SyncLog::new(id.clone()));
        let num = log.record_intention(kind, version);
        self.folders.ensure_folder(id).await?;
        self.store_locked(log).await?;
        debug!("recorded intention {} ({:?} of version {}) for `{}`", num, kind, version, id);
        Ok(num)
    }

    /// Mark the action behind `num` safe to run. Returns false when no
    /// queued action carries `num`.
    pub async fn activate(&self, id: &ObjId, num: u64) -> StorageResult<bool> {
        Ok(self.update(id, |log| log.activate(num)).await?.unwrap_or(false))
    }

    /// Drop the queued action behind `num`, whose local write failed.
    pub async fn cancel_intended_action(&self, id: &ObjId, num: u64) -> StorageResult<bool> {
        Ok(self
            .update(id, |log| log.cancel_intention(num))
            .await?
            .unwrap_or(false))
    }

    pub async fn load(&self, id: &ObjId) -> StorageResult<Option<SyncLog>> {
        let _guard = self.folders.lock(id).await;
        self.read_locked(id).await
    }

    /// Read-modify-write the log of `id`. `None` when there is no log.
    pub async fn update<R>(&self, id: &ObjId, f: impl FnOnce(&mut SyncLog) -> R) -> StorageResult<Option<R>> {
        let _guard = self.folders.lock(id).await;
        let Some(mut log) = self.read_locked(id).await? else {
            return Ok(None);
        };
        let res = f(&mut log);
        self.store_locked(log).await?;
        Ok(Some(res))
    }

    /// Object id recorded in the log file at `path`.
    pub async fn obj_id_in(path: &Path) -> StorageResult<Option<ObjId>> {
        let log: Option<SyncLog> = read_json(path).await?;
        Ok(log.map(|l| l.obj_id))
    }

    async fn read_locked(&self, id: &ObjId) -> StorageResult<Option<SyncLog>> {
        let key = id.folder_name();
        if let Some(log) = self.cache.get(&key) {
            return Ok(Some(log));
        }
        let log: Option<SyncLog> = read_json(&self.folders.sync_log_path(id)).await?;
        if let Some(log) = &log {
            self.cache.insert(key, log.clone());
        }
        Ok(log)
    }

    async fn store_locked(&self, log: SyncLog) -> StorageResult<()> {
        let key = log.obj_id.folder_name();
        let path = self.folders.sync_log_path(&log.obj_id);
        if log.is_empty() {
            self.cache.remove(&key);
            if remove_file_if_present(&path).await? {
                debug!("sync log of `{}` drained", log.obj_id);
                self.gc.schedule(&log.obj_id);
            }
            return Ok(());
        }
        write_json_atomic(&path, &log).await?;
        self.cache.insert(key, log);
        Ok(())
    }
}
