use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// A one-shot description of the host, reported to the dispatcher right
/// after authorization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub logical_cpus: usize,
    pub physical_cpus: usize,
    pub memory_bytes: u64,
}

pub async fn gather_system_info() -> Result<SystemInfo> {
    let uname = nix::sys::utsname::uname().context("Error reading uname")?;

    Ok(SystemInfo {
        hostname: uname.nodename().to_string_lossy().into_owned(),
        os: read_os_release().await.unwrap_or_else(|| "linux".to_string()),
        kernel: uname.release().to_string_lossy().into_owned(),
        logical_cpus: num_cpus::get(),
        physical_cpus: num_cpus::get_physical(),
        memory_bytes: read_total_memory().await.unwrap_or(0),
    })
}

async fn read_os_release() -> Option<String> {
    let content = fs::read_to_string("/etc/os-release").await.ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|name| name.trim_matches('"').to_string())
}

async fn read_total_memory() -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").await.ok()?;
    let line = content.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
