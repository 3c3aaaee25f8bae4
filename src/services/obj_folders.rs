//! Object folders under the storage directory.
//!
//! Layout, per object: `<base>/<folder name>/` holding a `status` JSON file,
//! one file per retained version named by its number, a `<version>.progress`
//! JSON file per version still being downloaded, and a `sync-upload` JSON
//! file while local changes wait to be uploaded.

use super::{
    object_lock::{ObjectGuard, ObjectLocks},
    windowed_cache::WindowedCache,
};
use crate::{
    errors::{StorageResult, absent_if_not_found},
    models::{obj_id::ObjId, progress::PartialSegs, status::ObjStatusInfo},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const STATUS_FILE: &str = "status";
pub const SYNC_LOG_FILE: &str = "sync-upload";
pub const PROGRESS_SUFFIX: &str = ".progress";
/// Prefix of files being written, before they are renamed into place.
pub const TMP_PREFIX: &str = ".tmp-";

pub struct ObjFolders {
    base_path: PathBuf,
    locks: ObjectLocks,
    statuses: WindowedCache<String, ObjStatusInfo>,
    progress: WindowedCache<(String, u64), PartialSegs>,
}

impl ObjFolders {
    pub fn new(base_path: impl Into<PathBuf>, cache_window: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            locks: ObjectLocks::new(),
            statuses: WindowedCache::new(cache_window),
            progress: WindowedCache::new(cache_window),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn folder(&self, id: &ObjId) -> PathBuf {
        self.base_path.join(id.folder_name())
    }

    pub fn version_path(&self, id: &ObjId, version: u64) -> PathBuf {
        self.folder(id).join(version.to_string())
    }

    pub fn progress_path(&self, id: &ObjId, version: u64) -> PathBuf {
        self.folder(id).join(format!("{}{}", version, PROGRESS_SUFFIX))
    }

    pub fn status_path(&self, id: &ObjId) -> PathBuf {
        self.folder(id).join(STATUS_FILE)
    }

    pub fn sync_log_path(&self, id: &ObjId) -> PathBuf {
        self.folder(id).join(SYNC_LOG_FILE)
    }

    /// Serialize against every other operation on `id`.
    pub async fn lock(&self, id: &ObjId) -> ObjectGuard {
        self.locks.lock(&id.folder_name()).await
    }

    pub async fn ensure_folder(&self, id: &ObjId) -> StorageResult<PathBuf> {
        let folder = self.folder(id);
        fs::create_dir_all(&folder).await?;
        Ok(folder)
    }

    /// Status of `id`, from the cache or disk. Callers hold the object lock.
    pub async fn read_status(&self, id: &ObjId) -> StorageResult<Option<ObjStatusInfo>> {
        let key = id.folder_name();
        if let Some(status) = self.statuses.get(&key) {
            return Ok(Some(status));
        }
        let status: Option<ObjStatusInfo> = read_json(&self.status_path(id)).await?;
        if let Some(status) = &status {
            self.statuses.insert(key, status.clone());
        }
        Ok(status)
    }

    /// Persist and cache `status`. Callers hold the object lock.
    pub async fn write_status(&self, status: &ObjStatusInfo) -> StorageResult<()> {
        self.ensure_folder(&status.obj_id).await?;
        write_json_atomic(&self.status_path(&status.obj_id), status).await?;
        self.statuses
            .insert(status.obj_id.folder_name(), status.clone());
        Ok(())
    }

    pub async fn read_progress(&self, id: &ObjId, version: u64) -> StorageResult<Option<PartialSegs>> {
        let key = (id.folder_name(), version);
        if let Some(progress) = self.progress.get(&key) {
            return Ok(Some(progress));
        }
        let progress: Option<PartialSegs> = read_json(&self.progress_path(id, version)).await?;
        if let Some(progress) = &progress {
            self.progress.insert(key, progress.clone());
        }
        Ok(progress)
    }

    pub async fn write_progress(&self, id: &ObjId, version: u64, progress: &PartialSegs) -> StorageResult<()> {
        write_json_atomic(&self.progress_path(id, version), progress).await?;
        self.progress.insert((id.folder_name(), version), progress.clone());
        Ok(())
    }

    pub async fn remove_progress(&self, id: &ObjId, version: u64) -> StorageResult<()> {
        self.progress.remove(&(id.folder_name(), version));
        remove_file_if_present(&self.progress_path(id, version)).await?;
        Ok(())
    }

    pub async fn has_version_file(&self, id: &ObjId, version: u64) -> StorageResult<bool> {
        Ok(fs::try_exists(self.version_path(id, version)).await?)
    }

    /// Version numbers of files in the object's folder. A missing folder
    /// yields an empty list.
    pub async fn list_version_files(&self, id: &ObjId) -> StorageResult<Vec<u64>> {
        let Some(mut entries) = absent_if_not_found(fs::read_dir(self.folder(id)).await)? else {
            return Ok(Vec::new());
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(version) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Delete temporary files a crashed writer left in the object's folder.
    /// Callers hold the object lock, so no write is in flight.
    pub async fn remove_tmp_files(&self, id: &ObjId) -> StorageResult<usize> {
        let Some(mut entries) = absent_if_not_found(fs::read_dir(self.folder(id)).await)? else {
            return Ok(0);
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_tmp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TMP_PREFIX));
            if is_tmp && remove_file_if_present(&entry.path()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove the object's whole folder and forget cached state.
    pub async fn remove_folder(&self, id: &ObjId) -> StorageResult<()> {
        let name = id.folder_name();
        self.statuses.remove(&name);
        self.progress.remove_matching(|(folder, _)| *folder == name);
        if absent_if_not_found(fs::remove_dir_all(self.folder(id)).await)?.is_none() {
            debug!("folder of `{}` already gone", id);
        }
        Ok(())
    }

    /// Folders of objects holding a sync log.
    pub async fn folders_with_sync_log(&self) -> StorageResult<Vec<PathBuf>> {
        let Some(mut entries) = absent_if_not_found(fs::read_dir(&self.base_path).await)? else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let log = entry.path().join(SYNC_LOG_FILE);
            if fs::try_exists(&log).await? {
                found.push(entry.path());
            }
        }
        Ok(found)
    }
}

/// Read and parse a JSON file, `None` if it does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match absent_if_not_found(fs::read(path).await)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Write JSON to a temporary file in the same folder, then rename it over
/// `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("json path missing parent directory"))?;
    let tmp = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
    if let Err(err) = fs::write(&tmp, &bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

/// Delete a file, treating "already gone" as success.
pub async fn remove_file_if_present(path: &Path) -> StorageResult<bool> {
    Ok(absent_if_not_found(fs::remove_file(path).await)?.is_some())
}
