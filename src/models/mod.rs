//! Data types of the object cache.
//!
//! These are the records the engine keeps per object (status, sync log,
//! download progress), the diff description stored in diff version files, and
//! the pure region algebra used for partial downloads. All JSON records use
//! camelCase field names through `serde`.

pub mod diff;
pub mod obj_id;
pub mod progress;
pub mod region;
pub mod status;
pub mod sync_log;
pub mod version_graph;
