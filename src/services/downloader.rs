//! Fetches missing segment bytes of object versions from the remote store.
//!
//! Downloads of one object version are serialized with their own lock, so
//! two readers asking for overlapping ranges never fetch the same bytes
//! twice.

use super::{object_lock::ObjectLocks, object_store::ObjectVersionStore, remote::RemoteStorage};
use crate::{
    config::EngineConfig,
    errors::{StorageError, StorageResult},
    models::{
        diff::DiffInfo,
        obj_id::ObjId,
        progress::CachingProgress,
        region::{Region, merge_regions, missing_regions_in, split_big_regions},
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjInfo {
    pub segs_size: u64,
    pub all_bytes_in_cache: bool,
    pub diff: Option<DiffInfo>,
}

#[derive(Clone)]
pub struct Downloader {
    store: ObjectVersionStore,
    remote: Arc<dyn RemoteStorage>,
    locks: ObjectLocks,
    min_chunk: u64,
    max_chunk: u64,
    initial_chunk: u64,
}

impl Downloader {
    pub fn new(store: ObjectVersionStore, remote: Arc<dyn RemoteStorage>, cfg: &EngineConfig) -> Self {
        Self {
            store,
            remote,
            locks: ObjectLocks::new(),
            min_chunk: cfg.download_min_chunk,
            max_chunk: cfg.download_max_chunk.max(cfg.download_min_chunk).max(1),
            initial_chunk: cfg.initial_download_chunk,
        }
    }

    /// Fetch the header of the current version, or of `archived_version`,
    /// and start caching it. Returns the version and its progress. Nothing
    /// is written locally when the remote lookup fails.
    pub async fn start_obj_download(
        &self,
        id: &ObjId,
        is_current: bool,
        archived_version: Option<u64>,
    ) -> StorageResult<(u64, CachingProgress)> {
        let (version, header, segs_size, first_segs) = if is_current {
            let obj = self.remote.get_current_obj(id, self.initial_chunk).await?;
            (obj.version, obj.header, obj.segs_size, obj.first_segs)
        } else {
            let version = archived_version.ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
            let obj = self.remote.get_obj_header(id, version).await?;
            (obj.version, obj.header, obj.segs_size, Bytes::new())
        };

        let _guard = self.locks.lock(&version_key(id, version)).await;
        if let Some(progress) = self.store.caching_progress_for(id, version).await? {
            return Ok((version, progress));
        }
        let mut progress = self
            .store
            .start_caching_obj(id, version, header, segs_size, is_current)
            .await?;
        let first_len = (first_segs.len() as u64).min(segs_size);
        if first_len > 0 {
            progress = self
                .store
                .cache_obj_segments(id, version, 0, first_segs.slice(..first_len as usize))
                .await?;
        }
        debug!("started download of version {} of `{}` ({} bytes)", version, id, segs_size);
        Ok((version, progress))
    }

    /// Make sure `[start, end)` of the version is on disk. Returns true once
    /// the whole version is cached.
    pub async fn ensure_bytes_are_on_disk(&self, id: &ObjId, version: u64, start: u64, end: u64) -> StorageResult<bool> {
        let _guard = self.locks.lock(&version_key(id, version)).await;
        let partial = match self.store.caching_progress_for(id, version).await? {
            None => {
                return Err(StorageError::VersionNotFound {
                    id: id.clone(),
                    version,
                });
            }
            Some(CachingProgress::Done { .. }) => return Ok(true),
            Some(CachingProgress::Partial(partial)) => partial,
        };

        let segs_size = partial.segs_size;
        let mut plan = Vec::new();
        for gap in missing_regions_in(start, end.min(segs_size), &partial.segs) {
            let widened_end = gap.end.max(gap.start + self.min_chunk).min(segs_size);
            for piece in missing_regions_in(gap.start, widened_end, &partial.segs) {
                merge_regions(&mut plan, piece);
            }
        }
        split_big_regions(&mut plan, self.max_chunk);

        let mut done = false;
        for region in plan {
            let bytes = self.fetch(id, version, region).await?;
            done = self
                .store
                .cache_obj_segments(id, version, region.start, bytes)
                .await?
                .is_done();
        }
        Ok(done)
    }

    pub async fn get_obj_info(&self, id: &ObjId, version: u64) -> StorageResult<ObjInfo> {
        let progress =
            self.store
                .caching_progress_for(id, version)
                .await?
                .ok_or_else(|| StorageError::VersionNotFound {
                    id: id.clone(),
                    version,
                })?;
        let diff = self.store.read_obj_diff(id, version).await?;
        Ok(ObjInfo {
            segs_size: progress.segs_size(),
            all_bytes_in_cache: progress.is_done(),
            diff,
        })
    }

    async fn fetch(&self, id: &ObjId, version: u64, region: Region) -> StorageResult<Bytes> {
        let bytes = self
            .remote
            .get_obj_segs(id, version, region.start, region.len())
            .await?;
        if bytes.len() as u64 != region.len() {
            return Err(StorageError::Remote(format!(
                "asked for {} bytes at {} of `{}` version {}, got {}",
                region.len(),
                region.start,
                id,
                version,
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

fn version_key(id: &ObjId, version: u64) -> String {
    format!("{}/{}", id.folder_name(), version)
}
