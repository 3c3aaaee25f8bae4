use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};

use crate::config::EngineConfig;
use crate::errors::{StorageError, StorageResult};
use crate::models::obj_id::ObjId;
use crate::services::remote::{RemoteObjHeader, RemoteObjVersion, RemoteStorage, TransactionParams};
use crate::services::storage_service::StorageService;

/// Calls seen by `MemoryRemote`, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCall {
    GetCurrent { first_segs_len: u64 },
    GetHeader { version: u64 },
    GetSegs { version: u64, start: u64, len: u64 },
    Start { version: u64, txn: String },
    SaveHeader { txn: String },
    SaveSegs { txn: String, offset: u64, len: u64 },
    Complete { txn: String },
    Cancel { txn: String },
    Delete { version: Option<u64> },
}

struct StoredVersion {
    header: Bytes,
    segs: Vec<u8>,
}

struct OpenTxn {
    obj: String,
    version: u64,
    header: Option<Bytes>,
    segs: Vec<u8>,
}

#[derive(Default)]
struct RemoteState {
    objs: HashMap<String, BTreeMap<u64, StoredVersion>>,
    txns: HashMap<String, OpenTxn>,
    calls: Vec<RemoteCall>,
    fail_segs_from: Option<u64>,
    after_start: Option<Arc<dyn Fn() + Send + Sync>>,
    offline: bool,
    next_txn: u64,
}

/// In-memory remote object service for testing. Records every call and can
/// be told to fail.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_version(&self, id: &ObjId, version: u64, header: &[u8], segs: &[u8]) {
        self.state().objs.entry(id.folder_name()).or_default().insert(
            version,
            StoredVersion {
                header: Bytes::copy_from_slice(header),
                segs: segs.to_vec(),
            },
        );
    }

    /// Header and segments of a version, once uploaded.
    pub fn version(&self, id: &ObjId, version: u64) -> Option<(Bytes, Vec<u8>)> {
        self.state()
            .objs
            .get(&id.folder_name())
            .and_then(|versions| versions.get(&version))
            .map(|v| (v.header.clone(), v.segs.clone()))
    }

    pub fn has_obj(&self, id: &ObjId) -> bool {
        self.state().objs.contains_key(&id.folder_name())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make segment uploads at or past `offset` fail.
    pub fn fail_segs_from(&self, offset: Option<u64>) {
        self.state().fail_segs_from = offset;
    }

    /// Run `hook` each time a transaction has been opened.
    pub fn after_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state().after_start = Some(Arc::new(hook));
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn open_transactions(&self) -> usize {
        self.state().txns.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    fn open_transaction(&self, id: &ObjId, params: TransactionParams) -> StorageResult<String> {
        let mut state = self.state();
        let obj = id.folder_name();
        let txn = format!("txn-{}", state.next_txn);
        state.calls.push(RemoteCall::Start {
            version: params.version,
            txn: txn.clone(),
        });
        if state.offline {
            return Err(StorageError::Remote("offline".into()));
        }
        if state.txns.values().any(|t| t.obj == obj) {
            return Err(StorageError::ConcurrentTransaction(id.clone()));
        }
        state.next_txn += 1;
        state.txns.insert(
            txn.clone(),
            OpenTxn {
                obj,
                version: params.version,
                header: None,
                segs: vec![0; params.segs_size as usize],
            },
        );
        Ok(txn)
    }

    fn call(&self, call: RemoteCall) -> StorageResult<std::sync::MutexGuard<'_, RemoteState>> {
        let mut state = self.state();
        state.calls.push(call);
        if state.offline {
            return Err(StorageError::Remote("offline".into()));
        }
        Ok(state)
    }
}

fn not_found(id: &ObjId) -> StorageError {
    StorageError::ObjNotFound(id.clone())
}

fn unknown_txn(txn: &str) -> StorageError {
    StorageError::Remote(format!("unknown transaction {txn}"))
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn get_current_obj(&self, id: &ObjId, first_segs_len: u64) -> StorageResult<RemoteObjVersion> {
        let state = self.call(RemoteCall::GetCurrent { first_segs_len })?;
        let (version, stored) = state
            .objs
            .get(&id.folder_name())
            .and_then(|versions| versions.iter().next_back())
            .ok_or_else(|| not_found(id))?;
        let first = (first_segs_len as usize).min(stored.segs.len());
        Ok(RemoteObjVersion {
            version: *version,
            header: stored.header.clone(),
            segs_size: stored.segs.len() as u64,
            first_segs: Bytes::copy_from_slice(&stored.segs[..first]),
        })
    }

    async fn get_obj_header(&self, id: &ObjId, version: u64) -> StorageResult<RemoteObjHeader> {
        let state = self.call(RemoteCall::GetHeader { version })?;
        let stored = state
            .objs
            .get(&id.folder_name())
            .and_then(|versions| versions.get(&version))
            .ok_or_else(|| not_found(id))?;
        Ok(RemoteObjHeader {
            version,
            header: stored.header.clone(),
            segs_size: stored.segs.len() as u64,
        })
    }

    async fn get_obj_segs(&self, id: &ObjId, version: u64, start: u64, len: u64) -> StorageResult<Bytes> {
        let state = self.call(RemoteCall::GetSegs { version, start, len })?;
        let stored = state
            .objs
            .get(&id.folder_name())
            .and_then(|versions| versions.get(&version))
            .ok_or_else(|| not_found(id))?;
        let start = (start as usize).min(stored.segs.len());
        let end = (start + len as usize).min(stored.segs.len());
        Ok(Bytes::copy_from_slice(&stored.segs[start..end]))
    }

    async fn start_transaction(&self, id: &ObjId, params: TransactionParams) -> StorageResult<String> {
        let txn = self.open_transaction(id, params)?;
        let hook = self.state().after_start.clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(txn)
    }

    async fn save_obj_header(&self, _id: &ObjId, txn: &str, header: Bytes) -> StorageResult<()> {
        let mut state = self.call(RemoteCall::SaveHeader { txn: txn.into() })?;
        let open = state.txns.get_mut(txn).ok_or_else(|| unknown_txn(txn))?;
        open.header = Some(header);
        Ok(())
    }

    async fn save_obj_segs(&self, _id: &ObjId, txn: &str, offset: u64, bytes: Bytes) -> StorageResult<()> {
        let mut state = self.call(RemoteCall::SaveSegs {
            txn: txn.into(),
            offset,
            len: bytes.len() as u64,
        })?;
        if state.fail_segs_from.is_some_and(|from| offset >= from) {
            return Err(StorageError::Remote(format!("injected failure at {offset}")));
        }
        let open = state.txns.get_mut(txn).ok_or_else(|| unknown_txn(txn))?;
        let start = offset as usize;
        let end = start + bytes.len();
        if end > open.segs.len() {
            return Err(StorageError::Remote(format!("write past end of {txn}")));
        }
        open.segs[start..end].copy_from_slice(&bytes);
        Ok(())
    }

    async fn complete_transaction(&self, _id: &ObjId, txn: &str) -> StorageResult<()> {
        let mut state = self.call(RemoteCall::Complete { txn: txn.into() })?;
        let open = state.txns.remove(txn).ok_or_else(|| unknown_txn(txn))?;
        let header = open.header.ok_or_else(|| StorageError::Remote(format!("{txn} has no header")))?;
        state.objs.entry(open.obj).or_default().insert(
            open.version,
            StoredVersion {
                header,
                segs: open.segs,
            },
        );
        Ok(())
    }

    async fn cancel_transaction(&self, _id: &ObjId, txn: &str) -> StorageResult<()> {
        let mut state = self.call(RemoteCall::Cancel { txn: txn.into() })?;
        state.txns.remove(txn);
        Ok(())
    }

    async fn delete_obj(&self, id: &ObjId, version: Option<u64>) -> StorageResult<()> {
        let mut state = self.call(RemoteCall::Delete { version })?;
        let obj = id.folder_name();
        match version {
            None => {
                state.objs.remove(&obj);
            }
            Some(version) => {
                if let Some(versions) = state.objs.get_mut(&obj) {
                    versions.remove(&version);
                }
            }
        }
        Ok(())
    }
}

/// Engine settings sized for tests: short delays and tiny chunks.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        storage_dir: dir.to_path_buf(),
        gc_delay: Duration::from_millis(5),
        cache_window: Duration::from_secs(60),
        download_min_chunk: 16,
        download_max_chunk: 1 << 20,
        initial_download_chunk: 0,
        upload_chunk: 4,
    }
}

pub async fn test_service(dir: &Path, remote: &Arc<MemoryRemote>) -> StorageService {
    let remote: Arc<dyn RemoteStorage> = remote.clone();
    StorageService::open(&test_config(dir), remote)
        .await
        .expect("failed to open test service")
}

/// Segment bytes as a stream of small chunks.
pub fn segs_stream(bytes: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<io::Result<Bytes>> = bytes
        .chunks(3)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}
