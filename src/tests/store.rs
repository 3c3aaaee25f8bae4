use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use crate::errors::StorageError;
use crate::models::diff::{DiffInfo, DiffSection};
use crate::models::obj_id::ObjId;
use crate::models::sync_log::{SyncActionKind, SyncLog};
use crate::services::gc::GarbageCollector;
use crate::services::obj_folders::{ObjFolders, write_json_atomic};
use crate::services::object_store::ObjectVersionStore;
use crate::services::version_file::write_all_bytes_file;
use crate::testutil::segs_stream;

const S: &[u8] = b"the quick brown fox";
const EXTRA: &[u8] = b"0123456789";

fn open_store(dir: &TempDir) -> ObjectVersionStore {
    let folders = Arc::new(ObjFolders::new(dir.path(), Duration::from_secs(60)));
    let gc = GarbageCollector::new(folders.clone(), Duration::from_millis(5));
    ObjectVersionStore::new(folders, gc)
}

fn append_diff(base_version: u64, base_len: u64, extra_len: u64) -> DiffInfo {
    DiffInfo {
        base_version,
        segs_size: base_len + extra_len,
        sections: vec![
            DiffSection::from_base(0, base_len),
            DiffSection::new_bytes(0, extra_len),
        ],
    }
}

async fn save_a(store: &ObjectVersionStore, id: &ObjId) {
    store
        .save_obj(id, 1, Bytes::from_static(b"h"), segs_stream(S))
        .await
        .unwrap();
}

async fn save_b(store: &ObjectVersionStore, id: &ObjId) {
    store
        .save_diff(
            id,
            2,
            append_diff(1, S.len() as u64, EXTRA.len() as u64),
            Bytes::from_static(b"h2"),
            Some(Bytes::from_static(EXTRA)),
        )
        .await
        .unwrap();
}

fn on_disk(store: &ObjectVersionStore, id: &ObjId, version: u64) -> bool {
    store.folders().version_path(id, version).exists()
}

#[tokio::test]
async fn saved_object_reads_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;

    let status = store.find_obj(&id).await.unwrap().unwrap();
    assert_eq!(status.current_version(), Some(1));
    assert_eq!(&store.read_obj_header(&id, 1).await.unwrap()[..], b"h");
    assert_eq!(
        &store.read_obj_segments(&id, 1, 0, S.len() as u64).await.unwrap()[..],
        S
    );
    assert_eq!(store.read_obj_diff(&id, 1).await.unwrap(), None);
    assert_eq!(store.get_segs_size(&id, 1, true).await.unwrap(), S.len() as u64);
}

#[tokio::test]
async fn diff_version_reconstructs_through_base() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;
    save_b(&store, &id).await;

    let total = (S.len() + EXTRA.len()) as u64;
    let expected = [S, EXTRA].concat();
    assert_eq!(&store.read_obj_segments(&id, 2, 0, total).await.unwrap()[..], &expected[..]);
    assert_eq!(&store.read_obj_header(&id, 2).await.unwrap()[..], b"h2");
    assert_eq!(store.get_segs_size(&id, 2, true).await.unwrap(), total);
    assert_eq!(store.get_segs_size(&id, 2, false).await.unwrap(), EXTRA.len() as u64);

    // Reads in uneven pieces, one of them straddling the section boundary.
    let mut pieced = Vec::new();
    for (start, end) in [(0, 7), (7, 21), (21, total)] {
        pieced.extend_from_slice(&store.read_obj_segments(&id, 2, start, end).await.unwrap());
    }
    assert_eq!(pieced, expected);

    let status = store.find_obj(&id).await.unwrap().unwrap();
    assert_eq!(status.current_version(), Some(2));
    assert_eq!(status.base_of(2), Some(1));
    assert_eq!(status.diffs_on(1), &[2]);
}

#[tokio::test]
async fn diff_needs_base_on_disk() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;

    let err = store
        .save_diff(&id, 3, append_diff(2, 4, 0), Bytes::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::VersionNotFound { version: 2, .. }));

    let mut bad_sum = append_diff(1, 4, 2);
    bad_sum.segs_size = 99;
    let err = store
        .save_diff(&id, 3, bad_sum, Bytes::new(), Some(Bytes::from_static(b"ab")))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidDiff(_)));
    assert!(!on_disk(&store, &id, 3));
}

#[tokio::test]
async fn removing_object_without_archives_drops_folder() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;
    save_b(&store, &id).await;

    store.remove_obj(&id).await.unwrap();
    store.gc().wait_idle().await;
    assert!(!store.folders().folder(&id).exists());
    assert!(store.find_obj(&id).await.unwrap().is_none());
    assert!(store.remove_obj(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn archived_diff_keeps_its_bases() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;
    save_b(&store, &id).await;
    let size_2 = (S.len() + EXTRA.len()) as u64;
    store
        .save_diff(&id, 3, append_diff(2, size_2, 1), Bytes::new(), Some(Bytes::from_static(b"!")))
        .await
        .unwrap();
    assert_eq!(store.archive_current_version(&id).await.unwrap(), 3);

    store.remove_obj(&id).await.unwrap();
    store.gc().wait_idle().await;
    for version in [1, 2, 3] {
        assert!(on_disk(&store, &id, version), "version {version} collected");
    }
    let status = store.find_obj(&id).await.unwrap().unwrap();
    assert!(status.is_archived());
    assert_eq!(status.archived_versions, vec![3]);

    store.remove_archived_obj_version(&id, 3).await.unwrap();
    store.gc().wait_idle().await;
    assert!(!store.folders().folder(&id).exists());
}

#[tokio::test]
async fn collection_keeps_only_reachable_versions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("g");
    save_a(&store, &id).await;
    store
        .save_obj(&id, 2, Bytes::new(), segs_stream(b"second"))
        .await
        .unwrap();
    store
        .save_diff(&id, 3, append_diff(2, 6, 0), Bytes::new(), None)
        .await
        .unwrap();
    store.archive_current_version(&id).await.unwrap();
    store
        .save_obj(&id, 4, Bytes::new(), segs_stream(b"fourth"))
        .await
        .unwrap();
    store.gc().wait_idle().await;

    assert_eq!(store.folders().list_version_files(&id).await.unwrap(), vec![2, 3, 4]);

    store.remove_archived_obj_version(&id, 3).await.unwrap();
    store.gc().wait_idle().await;
    assert_eq!(store.folders().list_version_files(&id).await.unwrap(), vec![4]);
    let status = store.find_obj(&id).await.unwrap().unwrap();
    assert!(status.diff_to_base().is_empty());
    assert!(status.base_to_diff().is_empty());

    let err = store.remove_archived_obj_version(&id, 3).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionNotFound { version: 3, .. }));
}

#[tokio::test]
async fn pending_upload_pins_version() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("p");
    save_a(&store, &id).await;

    let mut log = SyncLog::new(id.clone());
    let num = log.record_intention(SyncActionKind::CompleteUpload, 1);
    log.activate(num);
    write_json_atomic(&store.folders().sync_log_path(&id), &log).await.unwrap();

    store
        .save_obj(&id, 2, Bytes::new(), segs_stream(b"two"))
        .await
        .unwrap();
    store.gc().wait_idle().await;
    assert!(on_disk(&store, &id, 1));

    store.remove_obj(&id).await.unwrap();
    store.gc().wait_idle().await;
    assert!(store.folders().folder(&id).exists());
    assert_eq!(store.folders().list_version_files(&id).await.unwrap(), vec![1]);

    tokio::fs::remove_file(store.folders().sync_log_path(&id)).await.unwrap();
    let report = store.gc().collect_now(&id).await.unwrap();
    assert!(report.removed_folder);
}

#[tokio::test]
async fn file_left_before_status_write_is_replaced() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = ObjId::new("x");
    save_a(&store, &id).await;

    // A crash after the rename of version 2 but before its status write,
    // with a temporary file from another interrupted write beside it.
    let stale = store.folders().version_path(&id, 2);
    write_all_bytes_file(&stale, b"stale", segs_stream(b"junk")).await.unwrap();
    let tmp = store.folders().folder(&id).join(".tmp-interrupted");
    tokio::fs::write(&tmp, b"partial").await.unwrap();
    assert_eq!(store.caching_progress_for(&id, 2).await.unwrap(), None);

    store
        .save_obj(&id, 2, Bytes::from_static(b"h2"), segs_stream(b"two"))
        .await
        .unwrap();
    assert_eq!(&store.read_obj_header(&id, 2).await.unwrap()[..], b"h2");
    assert_eq!(&store.read_obj_segments(&id, 2, 0, 3).await.unwrap()[..], b"two");

    store.gc().wait_idle().await;
    assert!(!tmp.exists());
    assert_eq!(store.folders().list_version_files(&id).await.unwrap(), vec![2]);
}

#[tokio::test]
async fn collecting_unknown_object_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let report = store.gc().collect_now(&ObjId::new("nobody")).await.unwrap();
    assert!(report.removed_versions.is_empty());
    assert!(!report.removed_folder);
}
