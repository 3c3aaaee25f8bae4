use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Engine configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage_dir: PathBuf,
    /// Pause before a garbage collection pass, so bursts batch up.
    pub gc_delay: Duration,
    /// Idle time after which cached status, progress and sync log records
    /// are dropped from memory.
    pub cache_window: Duration,
    pub download_min_chunk: u64,
    pub download_max_chunk: u64,
    /// Segment bytes fetched together with the header of a new download.
    pub initial_download_chunk: u64,
    pub upload_chunk: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/objects"),
            gc_delay: Duration::from_millis(500),
            cache_window: Duration::from_secs(5 * 60),
            download_min_chunk: 64 * 1024,
            download_max_chunk: 4 * 1024 * 1024,
            initial_download_chunk: 64 * 1024,
            upload_chunk: 1024 * 1024,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Maintenance tool for an object cache directory")]
pub struct Args {
    /// Directory holding object folders (overrides OBJECT_CACHE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Delay before garbage collection in milliseconds (overrides OBJECT_CACHE_GC_DELAY_MS)
    #[arg(long)]
    pub gc_delay_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the status record of an object
    Status {
        /// Object id; the root object when omitted
        #[arg(long)]
        obj: Option<String>,
    },
    /// Collect garbage versions of an object now
    Gc {
        #[arg(long)]
        obj: Option<String>,
    },
    /// Print the pending sync log of an object
    SyncLog {
        #[arg(long)]
        obj: Option<String>,
    },
    /// Run one rotation of a generational cache directory
    Rotate {
        #[arg(long)]
        cache_dir: PathBuf,
    },
}

impl EngineConfig {
    /// Parse environment variables + CLI args into EngineConfig and the
    /// command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_storage = env::var("OBJECT_CACHE_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_dir);
        let env_gc_delay = env_number("OBJECT_CACHE_GC_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.gc_delay);
        let cache_window = env_number("OBJECT_CACHE_WINDOW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_window);
        let upload_chunk = env_number("OBJECT_CACHE_UPLOAD_CHUNK")?.unwrap_or(defaults.upload_chunk);

        // --- Merge ---
        let cfg = Self {
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            gc_delay: args.gc_delay_ms.map(Duration::from_millis).unwrap_or(env_gc_delay),
            cache_window,
            upload_chunk,
            ..defaults
        };

        Ok((cfg, args.command))
    }
}

fn env_number<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
