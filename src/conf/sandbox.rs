use std::{collections::HashMap, path::PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SandboxConfig {
    /// The isolation primitive. It accepts a json request on stdin and
    /// prints a json report on stdout.
    #[serde(default = "default_runner_path")]
    pub runner_path: String,

    pub rootfs: PathBuf,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub environments: HashMap<String, String>,
}

#[inline]
fn default_runner_path() -> String {
    "gavel-sandbox".to_string()
}

#[inline]
fn default_user() -> String {
    "nobody".to_string()
}

#[inline]
fn default_hostname() -> String {
    "gavel".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct CpuAffinityConfig {
    #[serde(default)]
    pub compiler: Option<Vec<u32>>,

    #[serde(default)]
    pub user_program: Option<Vec<u32>>,

    #[serde(default)]
    pub interactor: Option<Vec<u32>>,

    #[serde(default)]
    pub checker: Option<Vec<u32>>,
}
