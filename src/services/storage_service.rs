//! StorageService ties the version store, the uploader and the downloader
//! together into the surface the rest of the client works with.
//!
//! Local mutations are bracketed by the sync log: the intended remote action
//! is recorded before the write starts and activated once it is durable, so
//! a crash in between never uploads a version that was not fully written.

use super::{
    downloader::{Downloader, ObjInfo},
    gc::GarbageCollector,
    obj_folders::ObjFolders,
    object_store::ObjectVersionStore,
    remote::RemoteStorage,
    sync_log::SyncLogs,
    uploader::Uploader,
};
use crate::{
    config::EngineConfig,
    errors::{StorageError, StorageResult},
    models::{diff::DiffInfo, obj_id::ObjId, sync_log::SyncActionKind},
};
use bytes::Bytes;
use futures::Stream;
use std::{fmt, future::Future, io, sync::Arc};
use tokio::fs;
use tracing::{debug, info};

#[derive(Clone)]
pub struct StorageService {
    pub store: ObjectVersionStore,
    pub uploader: Uploader,
    pub downloader: Downloader,
}

impl StorageService {
    /// Wire the engine over `cfg.storage_dir`, creating it when missing.
    pub async fn open(cfg: &EngineConfig, remote: Arc<dyn RemoteStorage>) -> StorageResult<Self> {
        fs::create_dir_all(&cfg.storage_dir).await?;
        let folders = Arc::new(ObjFolders::new(&cfg.storage_dir, cfg.cache_window));
        let gc = GarbageCollector::new(folders.clone(), cfg.gc_delay);
        let logs = SyncLogs::new(folders.clone(), gc.clone(), cfg.cache_window);
        let store = ObjectVersionStore::new(folders, gc);
        let uploader = Uploader::new(store.clone(), logs, remote.clone(), cfg.upload_chunk);
        let downloader = Downloader::new(store.clone(), remote, cfg);
        info!("storage engine opened at {}", cfg.storage_dir.display());
        Ok(Self {
            store,
            uploader,
            downloader,
        })
    }

    /// The current version, from disk when cached, otherwise by starting a
    /// download.
    pub async fn get_obj(&self, id: &ObjId) -> StorageResult<ObjSource> {
        let version = match self.store.find_obj(id).await? {
            Some(status) if status.is_archived() => return Err(StorageError::ObjNotFound(id.clone())),
            Some(status) => status.current_version(),
            None => None,
        };
        let version = match version {
            Some(version) => version,
            None => self.downloader.start_obj_download(id, true, None).await?.0,
        };
        self.source(id, version).await
    }

    pub async fn get_obj_version(&self, id: &ObjId, version: u64) -> StorageResult<ObjSource> {
        if self.store.caching_progress_for(id, version).await?.is_none() {
            self.downloader
                .start_obj_download(id, false, Some(version))
                .await?;
        }
        self.source(id, version).await
    }

    pub async fn get_obj_info(&self, id: &ObjId, version: u64) -> StorageResult<ObjInfo> {
        self.downloader.get_obj_info(id, version).await
    }

    pub async fn save_obj<S>(&self, id: &ObjId, version: u64, header: Bytes, segs: S) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.with_sync_action(id, SyncActionKind::CompleteUpload, version, async move {
            self.store.save_obj(id, version, header, segs).await
        })
        .await
    }

    pub async fn save_diff(
        &self,
        id: &ObjId,
        version: u64,
        diff: DiffInfo,
        header: Bytes,
        new_segs: Option<Bytes>,
    ) -> StorageResult<()> {
        self.with_sync_action(id, SyncActionKind::CompleteUpload, version, async move {
            self.store.save_diff(id, version, diff, header, new_segs).await
        })
        .await
    }

    pub async fn remove_obj(&self, id: &ObjId) -> StorageResult<()> {
        let version = self
            .store
            .find_obj(id)
            .await?
            .and_then(|s| s.current_version())
            .unwrap_or_default();
        self.with_sync_action(id, SyncActionKind::DeleteObj, version, async move {
            self.store.remove_obj(id).await
        })
        .await
    }

    pub async fn remove_archived_obj_version(&self, id: &ObjId, version: u64) -> StorageResult<()> {
        self.with_sync_action(id, SyncActionKind::DeleteArchivedVersion, version, async move {
            self.store.remove_archived_obj_version(id, version).await
        })
        .await
    }

    pub async fn resume_pending_syncs(&self) -> StorageResult<usize> {
        self.uploader.resume_pending_syncs().await
    }

    pub async fn sync_now(&self, id: &ObjId) -> StorageResult<()> {
        self.uploader.sync_now(id).await
    }

    async fn with_sync_action(
        &self,
        id: &ObjId,
        kind: SyncActionKind,
        version: u64,
        write: impl Future<Output = StorageResult<()>>,
    ) -> StorageResult<()> {
        let num = self.uploader.record_intended_action(id, kind, version).await?;
        match write.await {
            Ok(()) => self.uploader.activate_sync_action(id, num).await,
            Err(err) => {
                debug!("local write for `{}` failed, dropping intention {}: {}", id, num, err);
                self.uploader.cancel_intended_action(id, num).await?;
                Err(err)
            }
        }
    }

    async fn source(&self, id: &ObjId, version: u64) -> StorageResult<ObjSource> {
        let header = self.store.read_obj_header(id, version).await?;
        let segs_size = self.store.get_segs_size(id, version, true).await?;
        Ok(ObjSource {
            id: id.clone(),
            version,
            header,
            segs_size,
            store: self.store.clone(),
            downloader: self.downloader.clone(),
        })
    }
}

/// One version of an object, readable by range. Bytes not yet on disk are
/// downloaded on demand.
pub struct ObjSource {
    id: ObjId,
    version: u64,
    header: Bytes,
    segs_size: u64,
    store: ObjectVersionStore,
    downloader: Downloader,
}

impl fmt::Debug for ObjSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjSource")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("header_len", &self.header.len())
            .field("segs_size", &self.segs_size)
            .finish_non_exhaustive()
    }
}

impl ObjSource {
    pub fn id(&self) -> &ObjId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn segs_size(&self) -> u64 {
        self.segs_size
    }

    pub async fn read_segs(&self, start: u64, end: u64) -> StorageResult<Bytes> {
        let end = end.min(self.segs_size);
        if start >= end {
            return Ok(Bytes::new());
        }
        self.downloader
            .ensure_bytes_are_on_disk(&self.id, self.version, start, end)
            .await?;
        self.store
            .read_obj_segments(&self.id, self.version, start, end)
            .await
    }

    pub async fn read_all(&self) -> StorageResult<Bytes> {
        self.read_segs(0, self.segs_size).await
    }
}
