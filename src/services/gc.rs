//! Garbage collection of object versions nothing refers to anymore.
//!
//! Requests are coalesced into a pending set. A single worker task waits a
//! short, fixed delay so bursts of requests batch up, then collects one
//! object at a time until no requests are left.

use super::obj_folders::{ObjFolders, read_json, remove_file_if_present};
use crate::{
    errors::StorageResult,
    models::{obj_id::ObjId, sync_log::SyncLog},
};
use std::{
    collections::{BTreeSet, HashSet},
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub removed_versions: Vec<u64>,
    pub removed_tmp_files: usize,
    pub removed_folder: bool,
}

#[derive(Default)]
struct GcQueues {
    pending: HashSet<ObjId>,
    working: Vec<ObjId>,
    running: bool,
}

struct GcInner {
    folders: Arc<ObjFolders>,
    delay: Duration,
    queues: Mutex<GcQueues>,
    idle: Notify,
}

#[derive(Clone)]
pub struct GarbageCollector {
    inner: Arc<GcInner>,
}

impl GarbageCollector {
    pub fn new(folders: Arc<ObjFolders>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(GcInner {
                folders,
                delay,
                queues: Mutex::new(GcQueues::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Ask for `id` to be collected soon.
    pub fn schedule(&self, id: &ObjId) {
        let start_worker = {
            let mut queues = self.queues();
            queues.pending.insert(id.clone());
            !mem::replace(&mut queues.running, true)
        };
        if !start_worker {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_worker(self.inner.clone()));
            }
            Err(_) => {
                warn!("no runtime to collect `{}` in, leaving it pending", id);
                self.queues().running = false;
            }
        }
    }

    /// Collect `id` right away, under the object's lock.
    pub async fn collect_now(&self, id: &ObjId) -> StorageResult<CollectionReport> {
        collect(&self.inner.folders, id).await
    }

    /// Resolve once no collection is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.queues().running {
                return;
            }
            notified.await;
        }
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, GcQueues> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_worker(inner: Arc<GcInner>) {
    tokio::time::sleep(inner.delay).await;
    loop {
        let next = {
            let mut queues = inner.queues.lock().unwrap_or_else(PoisonError::into_inner);
            if queues.working.is_empty() {
                let pending = mem::take(&mut queues.pending);
                queues.working.extend(pending);
            }
            let next = queues.working.pop();
            if next.is_none() {
                queues.running = false;
            }
            next
        };
        let Some(id) = next else {
            inner.idle.notify_waiters();
            return;
        };
        match collect(&inner.folders, &id).await {
            Ok(report) if report.removed_folder => info!("removed folder of archived object `{}`", id),
            Ok(report) if !report.removed_versions.is_empty() => {
                debug!("removed versions {:?} of `{}`", report.removed_versions, id)
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => debug!("`{}` vanished during collection", id),
            Err(err) => error!("garbage collection of `{}` failed: {}", id, err),
        }
    }
}

async fn collect(folders: &ObjFolders, id: &ObjId) -> StorageResult<CollectionReport> {
    let _guard = folders.lock(id).await;
    let mut report = CollectionReport::default();

    let Some(mut status) = folders.read_status(id).await? else {
        return Ok(report);
    };
    let sync_log: Option<SyncLog> = read_json(&folders.sync_log_path(id)).await?;
    let pinned = sync_log
        .as_ref()
        .map(SyncLog::pinned_versions)
        .unwrap_or_default();
    let keep = status.non_garbage_versions(&pinned);

    // The sync log lives in the folder, so the folder outlives it.
    if status.is_archived() && keep.is_empty() && sync_log.is_none() {
        folders.remove_folder(id).await?;
        report.removed_folder = true;
        return Ok(report);
    }

    for version in folders.list_version_files(id).await? {
        if keep.contains(&version) {
            continue;
        }
        remove_file_if_present(&folders.version_path(id, version)).await?;
        folders.remove_progress(id, version).await?;
        report.removed_versions.push(version);
    }
    report.removed_tmp_files = folders.remove_tmp_files(id).await?;
    if report.removed_tmp_files > 0 {
        debug!("removed {} leftover temporary files of `{}`", report.removed_tmp_files, id);
    }

    let stale: BTreeSet<u64> = status
        .diff_to_base()
        .iter()
        .flat_map(|(&d, &b)| [d, b])
        .filter(|v| !keep.contains(v))
        .collect();
    if !stale.is_empty() {
        for version in stale {
            status.forget_version(version);
        }
        folders.write_status(&status).await?;
    }
    Ok(report)
}
