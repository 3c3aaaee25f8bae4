//! Durable store of object versions and their status records.
//!
//! Every public method takes the object's lock for its whole duration, so
//! status read-modify-write, diff base checks and caching progress updates
//! never interleave for one object.

use super::{
    gc::GarbageCollector,
    obj_folders::{ObjFolders, read_json, remove_file_if_present},
    version_file::{VersionFile, create_sized_file, write_all_bytes_file, write_diff_file, write_segs_at},
};
use crate::{
    errors::{StorageError, StorageResult},
    models::{
        diff::DiffInfo,
        obj_id::ObjId,
        progress::{CachingProgress, PartialSegs},
        region::{Region, missing_regions_in},
        status::ObjStatusInfo,
        sync_log::SyncLog,
    },
};
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, Stream, future::BoxFuture};
use std::{io, sync::Arc};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ObjectVersionStore {
    folders: Arc<ObjFolders>,
    gc: GarbageCollector,
}

impl ObjectVersionStore {
    pub fn new(folders: Arc<ObjFolders>, gc: GarbageCollector) -> Self {
        Self { folders, gc }
    }

    pub fn folders(&self) -> &Arc<ObjFolders> {
        &self.folders
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub async fn find_obj(&self, id: &ObjId) -> StorageResult<Option<ObjStatusInfo>> {
        let _guard = self.folders.lock(id).await;
        self.folders.read_status(id).await
    }

    pub async fn read_obj_header(&self, id: &ObjId, version: u64) -> StorageResult<Bytes> {
        let _guard = self.folders.lock(id).await;
        self.open_version(id, version).await?.read_header().await
    }

    /// Read `[start, end)` of the version's segment bytes, following diff
    /// sections into base versions. `end` is clipped to the version's size.
    pub async fn read_obj_segments(&self, id: &ObjId, version: u64, start: u64, end: u64) -> StorageResult<Bytes> {
        let _guard = self.folders.lock(id).await;
        let size = self.open_version(id, version).await?.segs_size();
        let end = end.min(size);
        if start >= end {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::with_capacity((end - start) as usize);
        self.read_segs_locked(id, version, start, end, &mut out).await?;
        Ok(out.freeze())
    }

    /// `count_base` selects the reconstructed size of a diff version over
    /// the new bytes stored in its own file.
    pub async fn get_segs_size(&self, id: &ObjId, version: u64, count_base: bool) -> StorageResult<u64> {
        let _guard = self.folders.lock(id).await;
        let file = self.open_version(id, version).await?;
        Ok(if count_base {
            file.segs_size()
        } else {
            file.local_segs_len()
        })
    }

    pub async fn read_obj_diff(&self, id: &ObjId, version: u64) -> StorageResult<Option<DiffInfo>> {
        let _guard = self.folders.lock(id).await;
        Ok(self.open_version(id, version).await?.diff().cloned())
    }

    /// Store a complete version and make it current.
    pub async fn save_obj<S>(&self, id: &ObjId, version: u64, header: Bytes, segs: S) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let _guard = self.folders.lock(id).await;
        let status = self.folders.read_status(id).await?;
        if version == 1 && status.is_some() {
            return Err(StorageError::ObjExists(id.clone()));
        }
        let mut status = status.unwrap_or_else(|| ObjStatusInfo::new(id.clone()));
        check_new_version(&status, version)?;

        self.folders.ensure_folder(id).await?;
        self.clear_orphan(id, version).await?;
        let written = write_all_bytes_file(&self.folders.version_path(id, version), &header, segs).await?;
        debug!("wrote version {} of `{}` ({} segment bytes)", version, id, written);

        let previous = status.set_current(version);
        self.folders.write_status(&status).await?;
        if previous.is_some() {
            self.gc.schedule(id);
        }
        Ok(())
    }

    /// Store a version as a diff over a base version already on disk, and
    /// make it current.
    pub async fn save_diff(
        &self,
        id: &ObjId,
        version: u64,
        diff: DiffInfo,
        header: Bytes,
        new_segs: Option<Bytes>,
    ) -> StorageResult<()> {
        let _guard = self.folders.lock(id).await;
        let mut status = self
            .folders
            .read_status(id)
            .await?
            .ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
        check_new_version(&status, version)?;

        let base = diff.base_version;
        if base == version {
            return Err(StorageError::InvalidDiff(format!("version {} names itself as base", version)));
        }
        if !status.knows_version(base) {
            return Err(StorageError::VersionNotFound {
                id: id.clone(),
                version: base,
            });
        }
        let new_segs = new_segs.unwrap_or_default();
        diff.validate(new_segs.len() as u64).map_err(StorageError::InvalidDiff)?;
        let base_file = self.open_version(id, base).await?;
        if self.folders.read_progress(id, base).await?.is_some() {
            return Err(StorageError::InvalidDiff(format!("base version {} is not fully cached", base)));
        }
        let base_size = base_file.segs_size();
        if diff.base_bytes_needed() > base_size {
            return Err(StorageError::InvalidDiff(format!(
                "sections reach past the {} bytes of base version {}",
                base_size, base
            )));
        }

        self.clear_orphan(id, version).await?;
        write_diff_file(&self.folders.version_path(id, version), &diff, &header, &new_segs).await?;

        status.add_diff_edge(version, base);
        let previous = status.set_current(version);
        self.folders.write_status(&status).await?;
        if previous.is_some_and(|p| p != base) {
            self.gc.schedule(id);
        }
        Ok(())
    }

    /// Mark the object removed. Its versions become garbage unless archived.
    pub async fn remove_obj(&self, id: &ObjId) -> StorageResult<()> {
        let _guard = self.folders.lock(id).await;
        let mut status = self
            .folders
            .read_status(id)
            .await?
            .filter(|s| !s.is_archived())
            .ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
        status.archive();
        self.folders.write_status(&status).await?;
        self.gc.schedule(id);
        Ok(())
    }

    /// Keep the current version around as an archived one. Returns its
    /// number.
    pub async fn archive_current_version(&self, id: &ObjId) -> StorageResult<u64> {
        let _guard = self.folders.lock(id).await;
        let mut status = self
            .folders
            .read_status(id)
            .await?
            .ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
        let current = status
            .current_version()
            .ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
        status.add_archived(current);
        self.folders.write_status(&status).await?;
        Ok(current)
    }

    pub async fn remove_archived_obj_version(&self, id: &ObjId, version: u64) -> StorageResult<()> {
        let _guard = self.folders.lock(id).await;
        let mut status = self
            .folders
            .read_status(id)
            .await?
            .ok_or_else(|| StorageError::ObjNotFound(id.clone()))?;
        if !status.remove_archived(version) {
            return Err(StorageError::VersionNotFound {
                id: id.clone(),
                version,
            });
        }
        self.folders.write_status(&status).await?;
        self.gc.schedule(id);
        Ok(())
    }

    /// Begin a partial download: a pre-sized file holding only the header,
    /// with an empty progress record.
    pub async fn start_caching_obj(
        &self,
        id: &ObjId,
        version: u64,
        header: Bytes,
        segs_size: u64,
        is_current: bool,
    ) -> StorageResult<CachingProgress> {
        let _guard = self.folders.lock(id).await;
        let mut status = self
            .folders
            .read_status(id)
            .await?
            .unwrap_or_else(|| ObjStatusInfo::new(id.clone()));
        if self.is_live(Some(&status), id, version).await? {
            return Err(StorageError::VersionExists {
                id: id.clone(),
                version,
            });
        }
        if is_current {
            if status.is_archived() {
                return Err(StorageError::ObjNotFound(id.clone()));
            }
            if status.current_version().is_some_and(|c| c >= version) {
                return Err(StorageError::VersionExists {
                    id: id.clone(),
                    version,
                });
            }
        }

        self.folders.ensure_folder(id).await?;
        self.clear_orphan(id, version).await?;
        // Progress goes first: a version file without progress reads as
        // fully cached.
        let partial = PartialSegs::empty(segs_size);
        if segs_size > 0 {
            self.folders.write_progress(id, version, &partial).await?;
        }
        if let Err(err) = create_sized_file(&self.folders.version_path(id, version), &header, segs_size).await {
            self.folders.remove_progress(id, version).await?;
            return Err(err);
        }

        let previous = if is_current {
            status.set_current(version)
        } else {
            status.add_archived(version);
            None
        };
        self.folders.write_status(&status).await?;
        if previous.is_some() {
            self.gc.schedule(id);
        }
        Ok(CachingProgress::settle(partial))
    }

    /// Write downloaded bytes at `offset` and record them in the progress.
    pub async fn cache_obj_segments(
        &self,
        id: &ObjId,
        version: u64,
        offset: u64,
        bytes: Bytes,
    ) -> StorageResult<CachingProgress> {
        let _guard = self.folders.lock(id).await;
        let file = self.open_version(id, version).await?;
        let Some(mut partial) = self.folders.read_progress(id, version).await? else {
            return Ok(CachingProgress::Done {
                segs_size: file.segs_size(),
            });
        };
        let end = offset + bytes.len() as u64;
        if end > partial.segs_size {
            return Err(StorageError::OutOfRange {
                start: offset,
                end,
                size: partial.segs_size,
            });
        }
        write_segs_at(&self.folders.version_path(id, version), file.segs_offset(), offset, &bytes).await?;

        partial.add(Region::new(offset, end));
        if partial.is_complete() {
            self.folders.remove_progress(id, version).await?;
            debug!("version {} of `{}` fully cached", version, id);
        } else {
            self.folders.write_progress(id, version, &partial).await?;
        }
        Ok(CachingProgress::settle(partial))
    }

    /// `None` when the version has no file on disk, or when neither the
    /// status nor a pending upload refers to it.
    pub async fn caching_progress_for(&self, id: &ObjId, version: u64) -> StorageResult<Option<CachingProgress>> {
        let _guard = self.folders.lock(id).await;
        self.caching_progress_locked(id, version).await
    }

    async fn caching_progress_locked(
        &self,
        id: &ObjId,
        version: u64,
    ) -> StorageResult<Option<CachingProgress>> {
        let status = self.folders.read_status(id).await?;
        if !self.is_live(status.as_ref(), id, version).await? || !self.folders.has_version_file(id, version).await? {
            return Ok(None);
        }
        if let Some(partial) = self.folders.read_progress(id, version).await? {
            return Ok(Some(CachingProgress::Partial(partial)));
        }
        let file = self.open_version(id, version).await?;
        Ok(Some(CachingProgress::Done {
            segs_size: file.segs_size(),
        }))
    }

    /// Whether the status or a pending upload refers to `version`.
    async fn is_live(&self, status: Option<&ObjStatusInfo>, id: &ObjId, version: u64) -> StorageResult<bool> {
        if status.is_some_and(|s| s.knows_version(version)) {
            return Ok(true);
        }
        let log: Option<SyncLog> = read_json(&self.folders.sync_log_path(id)).await?;
        Ok(log.is_some_and(|l| l.pinned_versions().contains(&version)))
    }

    /// Remove a file and progress record of `version` that a crash left
    /// behind before the status took the version in.
    async fn clear_orphan(&self, id: &ObjId, version: u64) -> StorageResult<()> {
        if remove_file_if_present(&self.folders.version_path(id, version)).await? {
            warn!("replaced orphaned file of version {} of `{}`", version, id);
        }
        self.folders.remove_progress(id, version).await
    }

    async fn open_version(&self, id: &ObjId, version: u64) -> StorageResult<VersionFile> {
        match VersionFile::open(&self.folders.version_path(id, version)).await {
            Err(StorageError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::VersionNotFound {
                    id: id.clone(),
                    version,
                })
            }
            res => res,
        }
    }

    fn read_segs_locked<'a>(
        &'a self,
        id: &'a ObjId,
        version: u64,
        start: u64,
        end: u64,
        out: &'a mut BytesMut,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let file = self.open_version(id, version).await?;
            let Some(diff) = file.diff().cloned() else {
                if let Some(partial) = self.folders.read_progress(id, version).await? {
                    if let Some(gap) = missing_regions_in(start, end, &partial.segs).first() {
                        return Err(StorageError::NotCached {
                            id: id.clone(),
                            version,
                            start: gap.start,
                            end: gap.end,
                        });
                    }
                }
                out.extend_from_slice(&file.read_local_segs(start, end).await?);
                return Ok(());
            };

            let mut pos = 0;
            for section in &diff.sections {
                let section_end = pos + section.len;
                let lo = start.max(pos);
                let hi = end.min(section_end);
                if lo < hi {
                    let from = section.offset + (lo - pos);
                    let to = from + (hi - lo);
                    if section.is_new {
                        out.extend_from_slice(&file.read_local_segs(from, to).await?);
                    } else {
                        self.read_segs_locked(id, diff.base_version, from, to, out).await?;
                    }
                }
                pos = section_end;
                if pos >= end {
                    break;
                }
            }
            Ok(())
        }
        .boxed()
    }
}

fn check_new_version(status: &ObjStatusInfo, version: u64) -> StorageResult<()> {
    let id = &status.obj_id;
    if status.is_archived() {
        return Err(StorageError::ObjNotFound(id.clone()));
    }
    if status.current_version().is_some_and(|c| c >= version) || status.knows_version(version) {
        return Err(StorageError::VersionExists {
            id: id.clone(),
            version,
        });
    }
    Ok(())
}
