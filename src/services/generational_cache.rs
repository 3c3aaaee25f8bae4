//! Per-key cache folders that age through coarse time buckets.
//!
//! Folders live in one of `today`, `yesterday`, `week`, `month` and `older`.
//! A rotation moves whole buckets one level down when their last rotation is
//! old enough, so aging costs one rename per folder per level instead of
//! per-entry bookkeeping. Looking a key up moves its folder back to `today`.
//!
//! Content access holds the read side of a lock that rotation takes for
//! writing.

use super::{
    obj_folders::{SYNC_LOG_FILE, read_json, write_json_atomic},
    object_lock::ObjectLocks,
};
use crate::errors::{StorageError, StorageResult, absent_if_not_found};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::RwLock};
use tracing::{debug, info, warn};

pub const ROTATIONS_FILE: &str = "rotations.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    Today,
    Yesterday,
    Week,
    Month,
    Older,
}

impl Bucket {
    /// Youngest first.
    pub const ALL: [Bucket; 5] = [
        Bucket::Today,
        Bucket::Yesterday,
        Bucket::Week,
        Bucket::Month,
        Bucket::Older,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Today => "today",
            Bucket::Yesterday => "yesterday",
            Bucket::Week => "week",
            Bucket::Month => "month",
            Bucket::Older => "older",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// When each bucket last received a rotation, to the hour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationTimes {
    pub yesterday: DateTime<Utc>,
    pub week: DateTime<Utc>,
    pub month: DateTime<Utc>,
    pub older: DateTime<Utc>,
}

impl RotationTimes {
    pub fn all_at(at: DateTime<Utc>) -> Self {
        let at = to_hour(at);
        Self {
            yesterday: at,
            week: at,
            month: at,
            older: at,
        }
    }

    fn slot(&mut self, into: Bucket) -> Option<&mut DateTime<Utc>> {
        match into {
            Bucket::Yesterday => Some(&mut self.yesterday),
            Bucket::Week => Some(&mut self.week),
            Bucket::Month => Some(&mut self.month),
            Bucket::Older => Some(&mut self.older),
            Bucket::Today => None,
        }
    }
}

/// Rotation steps, applied oldest first so a folder drops at most one level
/// per rotation.
const STEPS: [(Bucket, Bucket, i64); 4] = [
    (Bucket::Month, Bucket::Older, 30 * 24),
    (Bucket::Week, Bucket::Month, 7 * 24),
    (Bucket::Yesterday, Bucket::Week, 24),
    (Bucket::Today, Bucket::Yesterday, 24),
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub steps: Vec<(Bucket, Bucket)>,
    pub moved: usize,
    pub kept: usize,
}

/// Decides whether the folder of a key may leave `today`.
pub type MoveFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct GenerationalCache {
    root: PathBuf,
    access: RwLock<()>,
    keys: ObjectLocks,
    can_move: Option<MoveFilter>,
}

impl GenerationalCache {
    /// Create the bucket folders and rotation record under `root` when
    /// missing.
    pub async fn open(root: impl Into<PathBuf>, can_move: Option<MoveFilter>) -> StorageResult<Self> {
        let root = root.into();
        for bucket in Bucket::ALL {
            fs::create_dir_all(root.join(bucket.dir_name())).await?;
        }
        let cache = Self {
            root,
            access: RwLock::new(()),
            keys: ObjectLocks::new(),
            can_move,
        };
        if read_json::<RotationTimes>(&cache.rotations_path()).await?.is_none() {
            cache.save_times(&RotationTimes::all_at(Utc::now())).await?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn get_or_make_folder(&self, key: &str) -> StorageResult<PathBuf> {
        check_key(key)?;
        let _access = self.access.read().await;
        let _key = self.keys.lock(key).await;
        if let Some(path) = self.find_and_promote(key).await? {
            return Ok(path);
        }
        let path = self.path_in(Bucket::Today, key);
        fs::create_dir_all(&path).await?;
        Ok(path)
    }

    pub async fn get_folder(&self, key: &str) -> StorageResult<PathBuf> {
        check_key(key)?;
        let _access = self.access.read().await;
        let _key = self.keys.lock(key).await;
        self.find_and_promote(key)
            .await?
            .ok_or_else(|| StorageError::FolderNotFound(key.to_string()))
    }

    /// Create a folder for `key` in `today`, failing if any bucket has one.
    pub async fn make_new_folder(&self, key: &str) -> StorageResult<PathBuf> {
        check_key(key)?;
        let _access = self.access.read().await;
        let _key = self.keys.lock(key).await;
        if self.find(key).await?.is_some() {
            return Err(StorageError::FolderExists(key.to_string()));
        }
        let path = self.path_in(Bucket::Today, key);
        match fs::create_dir(&path).await {
            Ok(()) => Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::FolderExists(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns false when there was no folder for `key`.
    pub async fn remove_folder(&self, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        let _access = self.access.read().await;
        let _key = self.keys.lock(key).await;
        let Some((_, path)) = self.find(key).await? else {
            return Ok(false);
        };
        Ok(absent_if_not_found(fs::remove_dir_all(&path).await)?.is_some())
    }

    pub async fn rotation_times(&self) -> StorageResult<RotationTimes> {
        Ok(read_json(&self.rotations_path())
            .await?
            .unwrap_or_else(|| RotationTimes::all_at(Utc::now())))
    }

    pub async fn set_rotation_times(&self, times: &RotationTimes) -> StorageResult<()> {
        let _maintenance = self.access.write().await;
        self.save_times(times).await
    }

    pub async fn rotate(&self) -> StorageResult<RotationReport> {
        self.rotate_at(Utc::now()).await
    }

    /// Apply every rotation step that is due at `now`.
    pub async fn rotate_at(&self, now: DateTime<Utc>) -> StorageResult<RotationReport> {
        let _maintenance = self.access.write().await;
        let mut times = self.rotation_times().await?;
        let mut report = RotationReport::default();

        for (from, into, hours) in STEPS {
            let Some(last) = times.slot(into) else {
                continue;
            };
            if now.signed_duration_since(*last) < TimeDelta::hours(hours) {
                continue;
            }
            *last = to_hour(now);
            let (moved, kept) = self.move_bucket(from, into).await?;
            report.steps.push((from, into));
            report.moved += moved;
            report.kept += kept;
        }

        if !report.steps.is_empty() {
            self.save_times(&times).await?;
            info!(
                "rotated {:?}: moved {} folders, kept {}",
                report.steps, report.moved, report.kept
            );
        }
        Ok(report)
    }

    fn path_in(&self, bucket: Bucket, key: &str) -> PathBuf {
        self.root.join(bucket.dir_name()).join(key)
    }

    fn rotations_path(&self) -> PathBuf {
        self.root.join(ROTATIONS_FILE)
    }

    async fn save_times(&self, times: &RotationTimes) -> StorageResult<()> {
        write_json_atomic(&self.rotations_path(), times).await
    }

    async fn find(&self, key: &str) -> StorageResult<Option<(Bucket, PathBuf)>> {
        for bucket in Bucket::ALL {
            let path = self.path_in(bucket, key);
            if fs::try_exists(&path).await? {
                return Ok(Some((bucket, path)));
            }
        }
        Ok(None)
    }

    async fn find_and_promote(&self, key: &str) -> StorageResult<Option<PathBuf>> {
        let Some((bucket, path)) = self.find(key).await? else {
            return Ok(None);
        };
        if bucket == Bucket::Today {
            return Ok(Some(path));
        }
        let today = self.path_in(Bucket::Today, key);
        fs::rename(&path, &today).await?;
        debug!("promoted `{}` from {} to today", key, bucket);
        Ok(Some(today))
    }

    /// Move every movable folder of `from` into `into`. Returns the moved
    /// and kept counts.
    async fn move_bucket(&self, from: Bucket, into: Bucket) -> StorageResult<(usize, usize)> {
        let mut entries = fs::read_dir(self.root.join(from.dir_name())).await?;
        let (mut moved, mut kept) = (0, 0);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str() else {
                warn!("skipping non UTF-8 entry {:?} in {}", name, from);
                kept += 1;
                continue;
            };
            // Pending uploads are read from this folder.
            if fs::try_exists(entry.path().join(SYNC_LOG_FILE)).await? {
                kept += 1;
                continue;
            }
            if from == Bucket::Today && self.can_move.as_ref().is_some_and(|f| !f(key)) {
                kept += 1;
                continue;
            }
            let target = self.path_in(into, key);
            if fs::try_exists(&target).await? {
                warn!("`{}` exists in both {} and {}, keeping the newer one", key, from, into);
                fs::remove_dir_all(&target).await?;
            }
            fs::rename(entry.path(), &target).await?;
            moved += 1;
        }
        Ok((moved, kept))
    }
}

fn to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}

fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` cannot name a cache folder", key),
        )));
    }
    Ok(())
}
