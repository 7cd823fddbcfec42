use anyhow::{bail, Context, Result};
use tokio::fs;

use super::{CaseRun, RunnerContext};
use crate::{
    checker::{self, CheckRequest, CheckerOutcome},
    entities::{CheckerConfig, OmittableString, TestcaseResult, TestcaseStatus},
    languages::{Language, BINARY_MOUNT, WORKING_MOUNT},
    sandbox::{
        self, AffinityKind, ExecutionStatus, MountParams, Redirection, SandboxCommand,
        SandboxParams,
    },
    shared,
};

const DEFAULT_INPUT_FILENAME: &str = "input";
const DEFAULT_OUTPUT_FILENAME: &str = "user_out";
const ANSWER_FILENAME: &str = "answer.txt";
const STDERR_FILENAME: &str = "stderr.txt";

/// Runs the compiled user program once against one testcase and grades the
/// produced output with the configured checker.
pub async fn run_batch_testcase(
    ctx: &RunnerContext<'_>,
    case: &CaseRun<'_>,
) -> Result<TestcaseResult> {
    let binary = ctx.binary.context("The user program has not been compiled")?;
    let language = Language::from_tag(&ctx.task.content.language)
        .context("Unsupported submission language")?;
    let plan = &ctx.task.plan;

    let input_filename = plan
        .file_io
        .as_ref()
        .map(|io| io.input_filename.as_str())
        .unwrap_or(DEFAULT_INPUT_FILENAME);
    let output_filename = plan
        .file_io
        .as_ref()
        .map(|io| io.output_filename.as_str())
        .unwrap_or(DEFAULT_OUTPUT_FILENAME);

    let input = case.input.context("A batch testcase requires an input file")?;
    let answer = case.answer.context("A batch testcase requires an answer file")?;

    ctx.slots
        .run_queued(|slot| async move {
            let working_directory = slot.directory.join("working");
            fs::create_dir_all(&working_directory).await?;

            let input_path = working_directory.join(input_filename);
            let output_path = working_directory.join(output_filename);
            let stderr_path = slot.directory.join(STDERR_FILENAME);

            ctx.materialize(input, &input_path).await?;
            let input_size = fs::metadata(&input_path).await?.len();

            let params = {
                let mut params = SandboxParams::new(
                    SandboxCommand::Executable(
                        language.run_command(&ctx.task.content.compile_and_run_options),
                    ),
                    AffinityKind::UserProgram,
                );
                if plan.file_io.is_none() {
                    params.stdin = Some(Redirection::File(input_path.clone()));
                    params.stdout = Some(Redirection::File(output_path.clone()));
                }
                params.stderr = Some(Redirection::File(stderr_path.clone()));
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
                params
            };

            let report = sandbox::run(params, ctx.abort.clone()).await?;

            let mut result = TestcaseResult {
                time_ms: Some(report.wall_time_ns / 1_000_000),
                memory_kib: Some(report.peak_memory_bytes / 1024),
                input: Some(
                    shared::file::read_preview(&input_path, ctx.display.data_display as usize)
                        .await?,
                ),
                user_error: Some(
                    shared::file::read_preview(&stderr_path, ctx.display.stderr_display as usize)
                        .await?,
                ),
                ..Default::default()
            };

            let produced = shared::file::directory_size(&working_directory)
                .await?
                .saturating_sub(input_size);
            if produced > ctx.display.output_size {
                result.status = TestcaseStatus::OutputLimitExceeded;
                return Ok(result);
            }

            result.user_output = Some(
                shared::file::read_preview(&output_path, ctx.display.data_display as usize)
                    .await?,
            );

            match report.status {
                ExecutionStatus::Ok if report.exit_code == 0 => {}
                ExecutionStatus::Ok => {
                    result.status = TestcaseStatus::RuntimeError;
                    result.system_message = Some(
                        format!("The program exited with code {}", report.exit_code).into(),
                    );
                    return Ok(result);
                }
                ExecutionStatus::TimeLimitExceeded => {
                    result.status = TestcaseStatus::TimeLimitExceeded;
                    return Ok(result);
                }
                ExecutionStatus::MemoryLimitExceeded => {
                    result.status = TestcaseStatus::MemoryLimitExceeded;
                    return Ok(result);
                }
                ExecutionStatus::OutputLimitExceeded => {
                    result.status = TestcaseStatus::OutputLimitExceeded;
                    return Ok(result);
                }
                ExecutionStatus::RuntimeError => {
                    result.status = TestcaseStatus::RuntimeError;
                    return Ok(result);
                }
                status => {
                    bail!("The sandbox reported an unexpected status: {}", status.name());
                }
            }

            if fs::metadata(&output_path).await.is_err() {
                result.status = TestcaseStatus::FileError;
                result.system_message =
                    Some(format!("The program did not produce {output_filename}").into());
                return Ok(result);
            }

            let answer_path = slot.directory.join(ANSWER_FILENAME);
            ctx.materialize(answer, &answer_path).await?;
            result.output = Some(
                shared::file::read_preview(&answer_path, ctx.display.data_display as usize)
                    .await?,
            );

            let checker_config = plan.checker.as_ref().context("The plan carries no checker")?;

            // The program may have rewritten its input; custom checkers
            // receive a pristine copy.
            if matches!(checker_config, CheckerConfig::Custom(_)) {
                ctx.materialize(input, &input_path).await?;
            }

            let outcome = checker::check(CheckRequest {
                checker: checker_config,
                checker_binary: ctx.checker_binary,
                slot: &slot,
                input_path: &input_path,
                output_path: &output_path,
                answer_path: &answer_path,
                user_code: &ctx.task.content.code,
                abort: ctx.abort.clone(),
            })
            .await?;

            apply_checker_outcome(&mut result, outcome, ctx.display.stderr_display as usize);
            Ok(result)
        })
        .await
}

pub(super) fn apply_checker_outcome(
    result: &mut TestcaseResult,
    outcome: CheckerOutcome,
    message_limit: usize,
) {
    match outcome {
        CheckerOutcome::Scored { score, message } => {
            result.score = score;
            result.status = match score {
                100 => TestcaseStatus::Accepted,
                0 => TestcaseStatus::WrongAnswer,
                _ => TestcaseStatus::PartiallyCorrect,
            };
            result.checker_message = Some(OmittableString::clip(message, message_limit));
        }
        CheckerOutcome::Failed { message } => {
            result.status = TestcaseStatus::JudgementFailed;
            result.score = 0;
            result.system_message = Some(OmittableString::clip(message, message_limit));
        }
    }
}
