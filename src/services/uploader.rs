//! The sync driver: pushes queued local changes to the remote store.
//!
//! One driver runs per object at a time. It takes the object lock only for
//! each sync log step and each local read, never across a network call.

use super::{
    object_lock::ObjectLocks,
    object_store::ObjectVersionStore,
    remote::{RemoteStorage, TransactionParams},
    sync_log::SyncLogs,
};
use crate::{
    errors::{StorageError, StorageResult},
    models::{
        obj_id::ObjId,
        sync_log::{SyncAction, SyncActionKind, SyncLog, UploadProgress},
    },
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

struct UploaderInner {
    store: ObjectVersionStore,
    logs: SyncLogs,
    remote: Arc<dyn RemoteStorage>,
    drivers: ObjectLocks,
    /// Objects with a background driver, and whether it must run again
    /// because it was triggered while running.
    background: Mutex<HashMap<String, (ObjId, bool)>>,
    idle: Notify,
    chunk: u64,
}

impl UploaderInner {
    fn background(&self) -> MutexGuard<'_, HashMap<String, (ObjId, bool)>> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Uploader {
    inner: Arc<UploaderInner>,
}

impl Uploader {
    pub fn new(store: ObjectVersionStore, logs: SyncLogs, remote: Arc<dyn RemoteStorage>, upload_chunk: u64) -> Self {
        Self {
            inner: Arc::new(UploaderInner {
                store,
                logs,
                remote,
                drivers: ObjectLocks::new(),
                background: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                chunk: upload_chunk.max(1),
            }),
        }
    }

    pub fn logs(&self) -> &SyncLogs {
        &self.inner.logs
    }

    pub async fn record_intended_action(&self, id: &ObjId, kind: SyncActionKind, version: u64) -> StorageResult<u64> {
        self.inner.logs.record_intended_action(id, kind, version).await
    }

    /// Called once the local write behind `num` is durable. Starts the
    /// driver in the background.
    pub async fn activate_sync_action(&self, id: &ObjId, num: u64) -> StorageResult<()> {
        if !self.inner.logs.activate(id, num).await? {
            warn!("no queued action {} for `{}` to activate", num, id);
        }
        self.trigger(id);
        Ok(())
    }

    pub async fn cancel_intended_action(&self, id: &ObjId, num: u64) -> StorageResult<()> {
        if self.inner.logs.cancel_intended_action(id, num).await? {
            debug!("canceled intention {} of `{}`", num, id);
        }
        Ok(())
    }

    /// Run the driver for `id` in a background task. A trigger while that
    /// task runs makes it go once more.
    pub fn trigger(&self, id: &ObjId) {
        let key = id.folder_name();
        {
            let mut background = self.inner.background();
            if let Some((_, again)) = background.get_mut(&key) {
                *again = true;
                return;
            }
            background.insert(key.clone(), (id.clone(), false));
        }
        tokio::spawn(run_background(self.inner.clone(), key));
    }

    /// Resolve once no background driver is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.background().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Run the driver inline, returning once no runnable action is left or
    /// the first failure.
    pub async fn sync_now(&self, id: &ObjId) -> StorageResult<()> {
        drive(&self.inner, id).await
    }

    /// Restart the driver of every object that still holds a sync log.
    /// Returns the number of objects triggered.
    pub async fn resume_pending_syncs(&self) -> StorageResult<usize> {
        let mut resumed = 0;
        for folder in self.inner.store.folders().folders_with_sync_log().await? {
            let path = folder.join(super::obj_folders::SYNC_LOG_FILE);
            match SyncLogs::obj_id_in(&path).await {
                Ok(Some(id)) => {
                    self.trigger(&id);
                    resumed += 1;
                }
                Ok(None) => {}
                Err(err) => warn!("skipping unreadable sync log {}: {}", path.display(), err),
            }
        }
        if resumed > 0 {
            info!("resuming sync of {} objects", resumed);
        }
        Ok(resumed)
    }
}

async fn run_background(inner: Arc<UploaderInner>, key: String) {
    loop {
        let Some(id) = inner.background().get(&key).map(|(id, _)| id.clone()) else {
            break;
        };
        if let Err(err) = drive(&inner, &id).await {
            warn!("sync of `{}` stopped: {}", id, err);
        }
        let mut background = inner.background();
        match background.get_mut(&key) {
            Some((_, again)) if *again => *again = false,
            _ => {
                background.remove(&key);
                break;
            }
        }
    }
    if inner.background().is_empty() {
        inner.idle.notify_waiters();
    }
}

async fn drive(inner: &UploaderInner, id: &ObjId) -> StorageResult<()> {
    let _driver = inner.drivers.lock(&id.folder_name()).await;
    loop {
        let Some(action) = inner.logs.update(id, SyncLog::next_runnable).await?.flatten() else {
            return Ok(());
        };
        run_action(inner, id, &action).await?;
        inner.logs.update(id, SyncLog::finish_current).await?;
        debug!("synced {:?} of version {} for `{}`", action.kind, action.version, id);
    }
}

async fn run_action(inner: &UploaderInner, id: &ObjId, action: &SyncAction) -> StorageResult<()> {
    match action.kind {
        SyncActionKind::CompleteUpload => upload(inner, id, action.version).await,
        SyncActionKind::DeleteObj => inner.remote.delete_obj(id, None).await,
        SyncActionKind::DeleteArchivedVersion => inner.remote.delete_obj(id, Some(action.version)).await,
    }
}

async fn upload(inner: &UploaderInner, id: &ObjId, version: u64) -> StorageResult<()> {
    let saved = inner
        .logs
        .load(id)
        .await?
        .and_then(|log| log.progress);
    let mut progress = match saved {
        Some(progress) => {
            debug!(
                "resuming upload of version {} of `{}` at byte {}",
                version, id, progress.seg_bytes_synced
            );
            progress
        }
        None => {
            let segs_size = inner.store.get_segs_size(id, version, true).await?;
            let params = TransactionParams {
                version,
                is_new_obj: version == 1,
                segs_size,
            };
            let transaction_id = inner.remote.start_transaction(id, params).await?;
            let progress = UploadProgress {
                transaction_id,
                header_sent: false,
                seg_bytes_synced: 0,
                segs_size,
            };
            if let Err(err) = checkpoint(inner, id, &progress).await {
                return Err(abandon(inner, id, &progress, err).await);
            }
            progress
        }
    };

    if let Err(err) = send(inner, id, version, &mut progress).await {
        return Err(abandon(inner, id, &progress, err).await);
    }
    Ok(())
}

/// Cancel the remote transaction and forget its progress so the next run
/// starts a fresh one. Both steps are best-effort; `err` is handed back.
async fn abandon(inner: &UploaderInner, id: &ObjId, progress: &UploadProgress, err: StorageError) -> StorageError {
    if let Err(cancel_err) = inner
        .remote
        .cancel_transaction(id, &progress.transaction_id)
        .await
    {
        warn!(
            "canceling transaction {} of `{}` failed: {}",
            progress.transaction_id, id, cancel_err
        );
    }
    if let Err(reset_err) = inner.logs.update(id, |log| log.progress = None).await {
        warn!("resetting upload progress of `{}` failed: {}", id, reset_err);
    }
    err
}

async fn send(inner: &UploaderInner, id: &ObjId, version: u64, progress: &mut UploadProgress) -> StorageResult<()> {
    let txn = progress.transaction_id.clone();
    if !progress.header_sent {
        let header = inner.store.read_obj_header(id, version).await?;
        inner.remote.save_obj_header(id, &txn, header).await?;
        progress.header_sent = true;
        checkpoint(inner, id, progress).await?;
    }
    while progress.seg_bytes_synced < progress.segs_size {
        let start = progress.seg_bytes_synced;
        let end = (start + inner.chunk).min(progress.segs_size);
        let bytes = inner.store.read_obj_segments(id, version, start, end).await?;
        inner.remote.save_obj_segs(id, &txn, start, bytes).await?;
        progress.seg_bytes_synced = end;
        checkpoint(inner, id, progress).await?;
    }
    inner.remote.complete_transaction(id, &txn).await
}

async fn checkpoint(inner: &UploaderInner, id: &ObjId, progress: &UploadProgress) -> StorageResult<()> {
    let progress = progress.clone();
    inner.logs.update(id, move |log| log.progress = Some(progress)).await?;
    Ok(())
}
