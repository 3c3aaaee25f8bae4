//! Interface to the remote object service.
//!
//! The engine never talks to the network itself. Whatever transport the
//! application uses is plugged in behind `RemoteStorage`.

use crate::{errors::StorageResult, models::obj_id::ObjId};
use async_trait::async_trait;
use bytes::Bytes;

/// Header of a version as the remote reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObjHeader {
    pub version: u64,
    pub header: Bytes,
    pub segs_size: u64,
}

/// The current version's header plus the first segment bytes, fetched in
/// one round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObjVersion {
    pub version: u64,
    pub header: Bytes,
    pub segs_size: u64,
    pub first_segs: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionParams {
    pub version: u64,
    pub is_new_obj: bool,
    pub segs_size: u64,
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn get_current_obj(&self, id: &ObjId, first_segs_len: u64) -> StorageResult<RemoteObjVersion>;

    async fn get_obj_header(&self, id: &ObjId, version: u64) -> StorageResult<RemoteObjHeader>;

    async fn get_obj_segs(&self, id: &ObjId, version: u64, start: u64, len: u64) -> StorageResult<Bytes>;

    /// Open an upload transaction, returning its id. Fails with
    /// `ConcurrentTransaction` while another one is open for `id`.
    async fn start_transaction(&self, id: &ObjId, params: TransactionParams) -> StorageResult<String>;

    async fn save_obj_header(&self, id: &ObjId, txn: &str, header: Bytes) -> StorageResult<()>;

    async fn save_obj_segs(&self, id: &ObjId, txn: &str, offset: u64, bytes: Bytes) -> StorageResult<()>;

    async fn complete_transaction(&self, id: &ObjId, txn: &str) -> StorageResult<()>;

    async fn cancel_transaction(&self, id: &ObjId, txn: &str) -> StorageResult<()>;

    /// Delete the whole object, or only one archived version of it.
    async fn delete_obj(&self, id: &ObjId, version: Option<u64>) -> StorageResult<()>;
}
