pub mod downloader;
pub mod gc;
pub mod generational_cache;
pub mod obj_folders;
pub mod object_lock;
pub mod object_store;
pub mod remote;
pub mod storage_service;
pub mod sync_log;
pub mod uploader;
pub mod version_file;
pub mod windowed_cache;
