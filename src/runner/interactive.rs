use std::{
    ffi::CString,
    os::unix::io::RawFd,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use nix::{
    sys::memfd::{memfd_create, MemFdCreateFlag},
    unistd,
};
use tokio::fs;

use super::{CaseRun, RunnerContext};
use crate::{
    checker::{parse_checker_message, ParsedScore},
    entities::{
        InteractorInterface, OmittableString, TestcaseResult, TestcaseStatus,
    },
    languages::{Language, BINARY_MOUNT, WORKING_MOUNT},
    sandbox::{
        self, AffinityKind, ExecutionStatus, MountParams, Redirection, SandboxCommand,
        SandboxParams,
    },
    shared,
    slots::Slot,
};

const INPUT_FILENAME: &str = "input";
const USER_STDERR_FILENAME: &str = "user-stderr.txt";
const INTERACTOR_STDERR_FILENAME: &str = "interactor-stderr.txt";

const INTERFACE_ENV: &str = "INTERACTOR_INTERFACE";
const SHM_FD_ENV: &str = "INTERACTOR_SHM_FD";

/// A descriptor shared between the slot disposer and the happy path: both
/// may close it, whoever comes first wins.
#[derive(Clone)]
struct GuardedFd(Arc<Mutex<Option<RawFd>>>);

impl GuardedFd {
    fn new(fd: RawFd) -> Self {
        Self(Arc::new(Mutex::new(Some(fd))))
    }

    fn register(slot: &Slot, fd: RawFd) -> Self {
        let guard = Self::new(fd);
        slot.defer({
            let guard = guard.clone();
            move || guard.close()
        });
        guard
    }

    fn raw(&self) -> Result<RawFd> {
        self.0.lock().unwrap().as_ref().copied().context("The descriptor is already closed")
    }

    fn close(&self) {
        if let Some(fd) = self.0.lock().unwrap().take() {
            _ = unistd::close(fd);
        }
    }
}

/// Runs the user program and the interactor as two concurrently started
/// sandboxes wired together with pipes (and optionally shared memory), then
/// grades from the interactor's stderr message.
pub async fn run_interactive_testcase(
    ctx: &RunnerContext<'_>,
    case: &CaseRun<'_>,
) -> Result<TestcaseResult> {
    let binary = ctx.binary.context("The user program has not been compiled")?;
    let interactor_binary =
        ctx.interactor_binary.context("The interactor has not been compiled")?;
    let language = Language::from_tag(&ctx.task.content.language)
        .context("Unsupported submission language")?;
    let interactor = ctx.task.plan.interactor.as_ref().context("The plan has no interactor")?;
    let interactor_language = Language::from_tag(&interactor.language)
        .context("Unsupported interactor language")?;
    let input = case.input.context("An interactive testcase requires an input file")?;

    ctx.slots
        .run_queued(|slot| async move {
            let working_directory = slot.directory.join("working");
            fs::create_dir_all(&working_directory).await?;

            let input_path = working_directory.join(INPUT_FILENAME);
            ctx.materialize(input, &input_path).await?;

            let user_stderr_path = slot.directory.join(USER_STDERR_FILENAME);
            let interactor_stderr_path = slot.directory.join(INTERACTOR_STDERR_FILENAME);

            // interactor stdout -> user stdin, user stdout -> interactor stdin
            let (user_stdin, interactor_stdout) =
                unistd::pipe().context("Error creating the downstream pipe")?;
            let (interactor_stdin, user_stdout) =
                unistd::pipe().context("Error creating the upstream pipe")?;
            let pipe_fds: Vec<GuardedFd> =
                [user_stdin, interactor_stdout, interactor_stdin, user_stdout]
                    .into_iter()
                    .map(|fd| GuardedFd::register(&slot, fd))
                    .collect();

            let shared_memory = match interactor.interface {
                InteractorInterface::Stdio => None,
                InteractorInterface::Shm => {
                    let size_mib = interactor.shared_memory_size.unwrap_or(4);
                    let name = CString::new("gavel-interactive-shm").unwrap();
                    let fd = memfd_create(&name, MemFdCreateFlag::empty())
                        .context("Error creating the shared memory object")?;
                    unistd::ftruncate(fd, (size_mib * 1024 * 1024) as i64)
                        .context("Error sizing the shared memory object")?;
                    Some(GuardedFd::register(&slot, fd))
                }
            };

            let mut environments = std::collections::HashMap::new();
            environments
                .insert(INTERFACE_ENV.to_string(), interactor.interface.name().to_string());
            if let Some(shm) = &shared_memory {
                environments.insert(SHM_FD_ENV.to_string(), shm.raw()?.to_string());
            }

            let user_params = {
                let mut params = SandboxParams::new(
                    SandboxCommand::Executable(
                        language.run_command(&ctx.task.content.compile_and_run_options),
                    ),
                    AffinityKind::UserProgram,
                );
                params.stdin = Some(Redirection::Fd(user_stdin));
                params.stdout = Some(Redirection::Fd(user_stdout));
                params.stderr = Some(Redirection::File(user_stderr_path.clone()));
                params.mounts = vec![
                    MountParams {
                        from: binary.directory.clone(),
                        to: BINARY_MOUNT.into(),
                        read_only: true,
                    },
                    MountParams {
                        from: working_directory.clone(),
                        to: WORKING_MOUNT.into(),
                        read_only: false,
                    },
                ];
                params.cwd = WORKING_MOUNT.into();
                params.time_limit_ms = case.limits.time_ms;
                params.memory_limit_kib = case.limits.memory_mib * 1024;
                params.max_processes = language.run_process_limit();
                params.environments = environments.clone();
                params.preserved_fds = vec![user_stdin, user_stdout];
                if let Some(shm) = &shared_memory {
                    params.preserved_fds.push(shm.raw()?);
                }
                params
            };

            let interactor_params = {
                let mut params = SandboxParams::new(
                    SandboxCommand::Executable(
                        interactor_language.run_command(&interactor.compile_and_run_options),
                    ),
                    AffinityKind::Interactor,
                );
                params.stdin = Some(Redirection::Fd(interactor_stdin));
                params.stdout = Some(Redirection::Fd(interactor_stdout));
                params.stderr = Some(Redirection::File(interactor_stderr_path.clone()));
                params.mounts = vec![
                    MountParams {
                        from: interactor_binary.directory.clone(),
                        to: BINARY_MOUNT.into(),
                        read_only: true,
                    },
                    MountParams {
                        from: working_directory.clone(),
                        to: WORKING_MOUNT.into(),
                        read_only: false,
                    },
                ];
                params.cwd = WORKING_MOUNT.into();
                // The interactor must be allowed to outlive a slow user
                // program up to its own budget.
                params.time_limit_ms =
                    case.limits.time_ms.max(interactor.time_limit.unwrap_or(0));
                params.memory_limit_kib =
                    interactor.memory_limit.unwrap_or(case.limits.memory_mib) * 1024;
                params.max_processes = interactor_language.run_process_limit();
                params.environments = environments;
                params.preserved_fds = vec![interactor_stdin, interactor_stdout];
                if let Some(shm) = &shared_memory {
                    params.preserved_fds.push(shm.raw()?);
                }
                params
            };

            let (user_sandbox, interactor_sandbox) = tokio::try_join!(
                sandbox::start(user_params, ctx.abort.clone()),
                sandbox::start(interactor_params, ctx.abort.clone()),
            )?;

            // Both children inherited their ends; drop the parent copies so
            // pipe closure propagates.
            for fd in &pipe_fds {
                fd.close();
            }

            let interactor_result = interactor_sandbox.wait_for_stop().await;
            user_sandbox.stop();
            let user_result = user_sandbox.wait_for_stop().await;

            let interactor_report = interactor_result?;
            let user_report = user_result?;

            let interactor_message =
                shared::file::read_preview(&interactor_stderr_path, 4096).await?.data;

            let mut result = TestcaseResult {
                time_ms: Some(user_report.wall_time_ns / 1_000_000),
                memory_kib: Some(user_report.peak_memory_bytes / 1024),
                input: Some(
                    shared::file::read_preview(&input_path, ctx.display.data_display as usize)
                        .await?,
                ),
                user_error: Some(
                    shared::file::read_preview(
                        &user_stderr_path,
                        ctx.display.stderr_display as usize,
                    )
                    .await?,
                ),
                ..Default::default()
            };

            if matches!(interactor_report.status, ExecutionStatus::TimeLimitExceeded)
                || matches!(user_report.status, ExecutionStatus::TimeLimitExceeded)
            {
                result.status = TestcaseStatus::TimeLimitExceeded;
                return Ok(result);
            }

            if !matches!(
                interactor_report.status,
                ExecutionStatus::Ok | ExecutionStatus::Cancelled
            ) {
                result.status = TestcaseStatus::JudgementFailed;
                result.system_message = Some(
                    format!(
                        "The interactor did not finish normally: {}: {interactor_message}",
                        interactor_report.status.name()
                    )
                    .into(),
                );
                return Ok(result);
            }

            match user_report.status {
                ExecutionStatus::OutputLimitExceeded => {
                    result.status = TestcaseStatus::OutputLimitExceeded;
                    return Ok(result);
                }
                ExecutionStatus::MemoryLimitExceeded => {
                    result.status = TestcaseStatus::MemoryLimitExceeded;
                    return Ok(result);
                }
                ExecutionStatus::RuntimeError => {
                    result.status = TestcaseStatus::RuntimeError;
                    return Ok(result);
                }
                ExecutionStatus::Ok | ExecutionStatus::Cancelled => {}
                status => {
                    bail!("The user sandbox reported an unexpected status: {}", status.name());
                }
            }

            match parse_checker_message(&interactor_message) {
                ParsedScore::Score(score) => {
                    result.score = score;
                    result.status = match score {
                        100 => TestcaseStatus::Accepted,
                        0 => TestcaseStatus::WrongAnswer,
                        _ => TestcaseStatus::PartiallyCorrect,
                    };
                    result.checker_message = Some(OmittableString::clip(
                        interactor_message,
                        ctx.display.stderr_display as usize,
                    ));
                }
                ParsedScore::Failed { message } => {
                    result.status = TestcaseStatus::JudgementFailed;
                    result.system_message = Some(OmittableString::clip(
                        message,
                        ctx.display.stderr_display as usize,
                    ));
                }
            }

            Ok(result)
        })
        .await
}
