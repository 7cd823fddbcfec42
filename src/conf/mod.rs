use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::fs;

pub use self::sandbox::*;

mod sandbox;

#[derive(Debug, Deserialize)]
pub struct GavelConfig {
    /// Base url of the dispatcher, e.g. `http://dispatcher:9000`.
    pub server_url: String,

    /// Shared secret presented during the authorization handshake.
    pub key: String,

    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,

    /// Persistent content-addressed testdata store.
    #[serde(default = "default_data_store")]
    pub data_store: PathBuf,

    /// Compiled binary cache. Emptied on startup.
    #[serde(default = "default_binary_cache_store")]
    pub binary_cache_store: PathBuf,

    /// Soft byte cap of the binary cache.
    #[serde(default = "default_binary_cache_max_size")]
    pub binary_cache_max_size: u64,

    /// Number of task consumers announced to the dispatcher.
    #[serde(default = "default_task_consuming_threads")]
    pub task_consuming_threads: usize,

    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// One directory per task slot, ideally each a tmpfs mount.
    pub task_working_directories: Vec<PathBuf>,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,

    #[serde(default = "default_download_retry")]
    pub download_retry: usize,

    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub cpu_affinity: CpuAffinityConfig,
}

#[inline]
fn default_root_path() -> PathBuf {
    "/gavel".into()
}

#[inline]
fn default_data_store() -> PathBuf {
    default_root_path().join("testdata")
}

#[inline]
fn default_binary_cache_store() -> PathBuf {
    default_root_path().join("binaries")
}

#[inline]
fn default_binary_cache_max_size() -> u64 {
    512 * 1024 * 1024
}

#[inline]
fn default_task_consuming_threads() -> usize {
    2
}

#[inline]
fn default_max_concurrent_downloads() -> usize {
    8
}

#[inline]
fn default_max_concurrent_tasks() -> usize {
    2
}

#[inline]
fn default_rpc_timeout_ms() -> u64 {
    10_000
}

#[inline]
fn default_download_timeout_ms() -> u64 {
    30_000
}

#[inline]
fn default_download_retry() -> usize {
    3
}

#[derive(Debug)]
pub struct GavelPaths {
    pub root: PathBuf,
    pub temp: PathBuf,
    pub testdata: PathBuf,
    pub binaries: PathBuf,
}

impl GavelPaths {
    pub async fn new_temp_directory(&self) -> Result<PathBuf> {
        let path = self.temp.join(nano_id::base62::<12>());
        fs::create_dir_all(&path).await.context("Error creating the temp directory")?;
        Ok(path)
    }
}

pub static CONFIG: Lazy<GavelConfig> = Lazy::new(|| {
    config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(config::Environment::with_prefix("GAVEL").separator("__"))
        .build()
        .expect("Failed to load the config")
        .try_deserialize()
        .expect("Failed to parse the config")
});

pub static PATHS: Lazy<GavelPaths> = Lazy::new(|| GavelPaths {
    root: CONFIG.root_path.clone(),
    temp: CONFIG.root_path.join("temp"),
    testdata: CONFIG.data_store.clone(),
    binaries: CONFIG.binary_cache_store.clone(),
});
