use std::{collections::HashMap, os::unix::io::RawFd, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::conf;

/// Which cpu set from the config a run is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityKind {
    Compiler,
    UserProgram,
    Interactor,
    Checker,
}

impl AffinityKind {
    pub fn cpus(&self) -> Option<&'static Vec<u32>> {
        let affinity = &conf::CONFIG.cpu_affinity;
        match self {
            Self::Compiler => affinity.compiler.as_ref(),
            Self::UserProgram => affinity.user_program.as_ref(),
            Self::Interactor => affinity.interactor.as_ref(),
            Self::Checker => affinity.checker.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SandboxCommand {
    /// Argv of an executable reachable inside the rootfs.
    Executable(Vec<String>),

    /// An inline shell script. The invoker writes it into a fresh temp
    /// directory mounted as `/tmp` inside and runs it via `sh`.
    Script(String),
}

#[derive(Debug, Clone)]
pub enum Redirection {
    /// An outside path, opened by the primitive before entering the rootfs.
    File(PathBuf),

    /// An inherited file descriptor, remapped onto the stream.
    Fd(RawFd),
}

#[derive(Debug, Clone)]
pub struct MountParams {
    pub from: PathBuf,
    pub to: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxParams {
    pub command: SandboxCommand,

    pub stdin: Option<Redirection>,
    pub stdout: Option<Redirection>,
    pub stderr: Option<Redirection>,

    pub mounts: Vec<MountParams>,

    /// Working directory inside the rootfs.
    pub cwd: PathBuf,

    pub time_limit_ms: u64,
    pub memory_limit_kib: u64,

    /// Defaults to the memory limit.
    pub stack_size_kib: Option<u64>,

    pub max_processes: u32,

    pub environments: HashMap<String, String>,

    pub affinity: AffinityKind,

    /// Descriptors whose close-on-exec flag is cleared across the spawn and
    /// restored immediately after, so the primitive inherits them.
    pub preserved_fds: Vec<RawFd>,
}

impl SandboxParams {
    pub fn new(command: SandboxCommand, affinity: AffinityKind) -> Self {
        Self {
            command,
            stdin: None,
            stdout: None,
            stderr: None,
            mounts: vec![],
            cwd: "/sandbox/working".into(),
            time_limit_ms: 0,
            memory_limit_kib: 0,
            stack_size_kib: None,
            max_processes: 1,
            environments: HashMap::new(),
            affinity,
            preserved_fds: vec![],
        }
    }
}

/// The json request consumed by the isolation primitive on stdin.
#[derive(Debug, Serialize)]
pub(super) struct RunnerRequest {
    pub rootfs: PathBuf,
    pub user: String,
    pub hostname: String,
    pub cwd: PathBuf,
    pub command: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<StreamTarget>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StreamTarget>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<StreamTarget>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountRequest>,

    pub limits: LimitsRequest,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environments: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(super) enum StreamTarget {
    File { path: PathBuf },
    Fd { fd: RawFd },
}

#[derive(Debug, Serialize)]
pub(super) struct MountRequest {
    pub from: PathBuf,
    pub to: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(super) struct LimitsRequest {
    pub time_ms: u64,
    pub memory_kib: u64,
    pub stack_kib: u64,
    pub pids: u32,
}

/// Report printed by the primitive on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub exit_code: i64,
    pub wall_time_ns: u64,
    pub peak_memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "OK")]
    Ok,

    #[serde(rename = "TIME_LIMIT_EXCEEDED")]
    TimeLimitExceeded,

    #[serde(rename = "MEMORY_LIMIT_EXCEEDED")]
    MemoryLimitExceeded,

    #[serde(rename = "OUTPUT_LIMIT_EXCEEDED")]
    OutputLimitExceeded,

    #[serde(rename = "RUNTIME_ERROR")]
    RuntimeError,

    #[serde(rename = "CANCELLED")]
    Cancelled,

    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ExecutionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        }
    }
}
