use anyhow::{Context, Result};
use object_cache::{
    config::{Command, EngineConfig},
    models::{obj_id::ObjId, sync_log::SyncLog},
    services::{
        gc::GarbageCollector,
        generational_cache::GenerationalCache,
        obj_folders::{ObjFolders, read_json},
    },
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = EngineConfig::from_env_and_args()?;
    tracing::debug!("Running {:?} with config: {:?}", command, cfg);

    let folders = Arc::new(ObjFolders::new(&cfg.storage_dir, cfg.cache_window));

    match command {
        Command::Status { obj } => {
            let id = obj_id(obj);
            let status = folders
                .read_status(&id)
                .await
                .with_context(|| format!("reading status of `{}`", id))?;
            match status {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => println!("no status recorded for `{}`", id),
            }
        }
        Command::Gc { obj } => {
            let id = obj_id(obj);
            let gc = GarbageCollector::new(folders.clone(), cfg.gc_delay);
            let report = gc
                .collect_now(&id)
                .await
                .with_context(|| format!("collecting `{}`", id))?;
            if report.removed_folder {
                println!("removed folder of `{}`", id);
            } else {
                println!("removed versions {:?} of `{}`", report.removed_versions, id);
            }
        }
        Command::SyncLog { obj } => {
            let id = obj_id(obj);
            let log: Option<SyncLog> = read_json(&folders.sync_log_path(&id))
                .await
                .with_context(|| format!("reading sync log of `{}`", id))?;
            match log {
                Some(log) => println!("{}", serde_json::to_string_pretty(&log)?),
                None => println!("nothing pending for `{}`", id),
            }
        }
        Command::Rotate { cache_dir } => {
            let cache = GenerationalCache::open(&cache_dir, None)
                .await
                .with_context(|| format!("opening cache at {}", cache_dir.display()))?;
            let report = cache.rotate().await?;
            println!(
                "applied {} rotation steps, moved {} folders, kept {}",
                report.steps.len(),
                report.moved,
                report.kept
            );
        }
    }

    Ok(())
}

fn obj_id(obj: Option<String>) -> ObjId {
    obj.map(ObjId::new).unwrap_or(ObjId::Root)
}
