use std::{
    fs::Permissions,
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context, Result};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    fs,
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::oneshot,
};
use tracing::{info, instrument, warn};
use triggered::Listener;

pub use self::entities::*;
use crate::{conf, shared::Cancelled};

mod entities;

const SCRIPT_FILENAME: &str = "script.sh";

/// Runs a sandboxed process to completion. The listener stops the sandbox
/// and surfaces [`Cancelled`] when it fires.
pub async fn run(params: SandboxParams, abort: Listener) -> Result<ExecutionReport> {
    let sandbox = start(params, abort).await?;
    sandbox.wait_for_stop().await
}

/// Starts a sandboxed process without waiting for it, for dual-process
/// interactive runs.
#[instrument(skip_all)]
pub async fn start(params: SandboxParams, abort: Listener) -> Result<RunningSandbox> {
    let mut params = params;

    let script_directory = match &params.command {
        SandboxCommand::Executable(_) => None,
        SandboxCommand::Script(script) => {
            let directory = conf::PATHS.new_temp_directory().await?;
            fs::write(directory.join(SCRIPT_FILENAME), script)
                .await
                .context("Error writing the inline script")?;
            params.mounts.push(MountParams {
                from: directory.clone(),
                to: "/tmp".into(),
                read_only: false,
            });
            Some(directory)
        }
    };

    prepare_mounts(&params.mounts).await.context("Error preparing the mounts")?;

    let request = build_request(&params)?;
    let request = serde_json::to_vec(&request).context("Error serializing the request")?;

    // The primitive inherits every descriptor whose close-on-exec flag is
    // clear at spawn time. Restore the flags right after so the descriptors
    // do not leak into unrelated children.
    clear_cloexec(&params.preserved_fds)?;
    let spawn_result = Command::new(&conf::CONFIG.sandbox.runner_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    restore_cloexec(&params.preserved_fds)?;

    let mut child = spawn_result.context("Error spawning the sandbox runner process")?;
    let pid = child.id().context("The sandbox runner process has no pid")? as i32;

    {
        let mut stdin = child.stdin.take().context("The sandbox runner process has no stdin")?;
        stdin.write_all(&request).await.context("Error writing the request")?;
        stdin.shutdown().await.context("Error closing the request stream")?;
    }

    let (finish_tx, finish_rx) = oneshot::channel();
    tokio::spawn({
        let abort = abort.clone();
        async move {
            tokio::select! {
                _ = finish_rx => {}
                _ = abort => {
                    _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
                    info!(pid, "Sent SIGTERM to the sandbox runner");
                }
            }
        }
    });

    Ok(RunningSandbox { child, pid, abort, finish_tx: Some(finish_tx), script_directory })
}

pub struct RunningSandbox {
    child: Child,
    pid: i32,
    abort: Listener,
    finish_tx: Option<oneshot::Sender<()>>,
    script_directory: Option<PathBuf>,
}

impl RunningSandbox {
    /// Asks the primitive to tear the sandboxed process down. The report is
    /// still collected through [`Self::wait_for_stop`].
    pub fn stop(&self) {
        _ = signal::kill(Pid::from_raw(self.pid), Signal::SIGTERM);
    }

    pub async fn wait_for_stop(mut self) -> Result<ExecutionReport> {
        let output = self
            .child
            .wait_with_output()
            .await
            .context("Error waiting for the sandbox runner process");

        if let Some(finish_tx) = self.finish_tx.take() {
            _ = finish_tx.send(());
        }

        if let Some(directory) = &self.script_directory {
            if let Err(err) = fs::remove_dir_all(directory).await {
                warn!(directory = %directory.display(), "Error removing script directory: {err:#}");
            }
        }

        if self.abort.is_triggered() {
            bail!(Cancelled);
        }

        let output = output?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr);
            bail!("The sandbox runner failed: {}", message.chars().take(1024).collect::<String>());
        }

        serde_json::from_slice(&output.stdout).context("Error deserializing the sandbox report")
    }
}

fn build_request(params: &SandboxParams) -> Result<RunnerRequest> {
    let sandbox = &conf::CONFIG.sandbox;

    let command = match &params.command {
        SandboxCommand::Executable(argv) => argv.clone(),
        SandboxCommand::Script(_) => {
            vec!["/bin/sh".to_string(), format!("/tmp/{SCRIPT_FILENAME}")]
        }
    };

    let mut environments = sandbox.environments.clone();
    environments.extend(params.environments.clone());

    Ok(RunnerRequest {
        rootfs: sandbox.rootfs.clone(),
        user: sandbox.user.clone(),
        hostname: sandbox.hostname.clone(),
        cwd: params.cwd.clone(),
        command,
        stdin: params.stdin.as_ref().map(convert_redirection),
        stdout: params.stdout.as_ref().map(convert_redirection),
        stderr: params.stderr.as_ref().map(convert_redirection),
        mounts: params.mounts.iter().map(convert_mount).collect(),
        limits: LimitsRequest {
            time_ms: params.time_limit_ms,
            memory_kib: params.memory_limit_kib,
            stack_kib: params.stack_size_kib.unwrap_or(params.memory_limit_kib),
            pids: params.max_processes,
        },
        cpuset: params
            .affinity
            .cpus()
            .map(|cpus| cpus.iter().map(|cpu| cpu.to_string()).collect::<Vec<_>>().join(",")),
        environments,
    })
}

fn convert_redirection(redirection: &Redirection) -> StreamTarget {
    match redirection {
        Redirection::File(path) => StreamTarget::File { path: path.clone() },
        Redirection::Fd(fd) => StreamTarget::Fd { fd: *fd },
    }
}

fn convert_mount(mount: &MountParams) -> MountRequest {
    MountRequest {
        from: mount.from.clone(),
        to: mount.to.clone(),
        options: mount.read_only.then(|| vec!["ro".to_string()]),
    }
}

/// Makes sure every inside mount point exists under the rootfs, and that the
/// sandboxed user can access the outside path iff the mount is writable.
async fn prepare_mounts(mounts: &[MountParams]) -> Result<()> {
    for mount in mounts {
        {
            let relative = mount.to.strip_prefix("/").unwrap_or(&mount.to);
            let inside = conf::CONFIG.sandbox.rootfs.join(relative);
            if fs::metadata(&inside).await.is_err() {
                fs::create_dir_all(&inside)
                    .await
                    .with_context(|| format!("Error creating {}", inside.display()))?;
            }
        }

        let mode = if mount.read_only { 0o755 } else { 0o777 };
        set_tree_permissions(&mount.from, mode)
            .await
            .with_context(|| format!("Error setting permissions on {}", mount.from.display()))?;
    }

    Ok(())
}

async fn set_tree_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path).await?;
    fs::set_permissions(path, Permissions::from_mode(mode)).await?;

    if metadata.is_dir() {
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                Box::pin(set_tree_permissions(&entry.path(), mode)).await?;
            } else {
                fs::set_permissions(entry.path(), Permissions::from_mode(mode)).await?;
            }
        }
    }

    Ok(())
}

fn clear_cloexec(fds: &[i32]) -> Result<()> {
    for fd in fds {
        let flags = fcntl(*fd, FcntlArg::F_GETFD).context("Error reading the fd flags")?;
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.remove(FdFlag::FD_CLOEXEC);
        fcntl(*fd, FcntlArg::F_SETFD(flags)).context("Error clearing close-on-exec")?;
    }

    Ok(())
}

fn restore_cloexec(fds: &[i32]) -> Result<()> {
    for fd in fds {
        let flags = fcntl(*fd, FcntlArg::F_GETFD).context("Error reading the fd flags")?;
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.insert(FdFlag::FD_CLOEXEC);
        fcntl(*fd, FcntlArg::F_SETFD(flags)).context("Error restoring close-on-exec")?;
    }

    Ok(())
}
