use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;

use super::{outcome_from_message, CheckRequest, CheckerOutcome};
use crate::{
    compile::BinaryArtifact,
    entities::{CheckerInterface, CustomCheckerConfig},
    languages::{Language, BINARY_MOUNT, WORKING_MOUNT},
    sandbox::{
        self, AffinityKind, ExecutionStatus, MountParams, Redirection, SandboxCommand,
        SandboxParams,
    },
    shared,
};

const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;
const DEFAULT_MEMORY_LIMIT_KIB: u64 = 512 * 1024;

const INPUT_FILENAME: &str = "input";
const OUTPUT_FILENAME: &str = "user_out";
const ANSWER_FILENAME: &str = "answer";
const CODE_FILENAME: &str = "code";
const SCORE_FILENAME: &str = "score.txt";
const MESSAGE_FILENAME: &str = "message.txt";
const DOMJUDGE_MESSAGE_FILENAME: &str = "judgemessage.txt";

#[inline]
fn inside(filename: &str) -> String {
    format!("{WORKING_MOUNT}/{filename}")
}

/// Runs a compiled custom checker against one testcase, mapping its argv,
/// stdio and result files per interface flavor.
pub(super) async fn run_custom_checker(
    request: &CheckRequest<'_>,
    config: &CustomCheckerConfig,
    binary: &Arc<BinaryArtifact>,
) -> Result<CheckerOutcome> {
    let language = Language::from_tag(&config.language)
        .with_context(|| format!("Unsupported checker language: {}", config.language))?;

    let checker_directory = request.slot.directory.join("checker");
    fs::create_dir_all(&checker_directory).await?;

    fs::copy(request.input_path, checker_directory.join(INPUT_FILENAME))
        .await
        .context("Error copying the input file")?;
    fs::copy(request.output_path, checker_directory.join(OUTPUT_FILENAME))
        .await
        .context("Error copying the user output file")?;
    fs::copy(request.answer_path, checker_directory.join(ANSWER_FILENAME))
        .await
        .context("Error copying the answer file")?;
    if matches!(config.interface, CheckerInterface::Legacy) {
        fs::write(checker_directory.join(CODE_FILENAME), request.user_code)
            .await
            .context("Error writing the code file")?;
    }

    let stdout_path = request.slot.directory.join("checker-stdout.txt");
    let stderr_path = request.slot.directory.join("checker-stderr.txt");

    let mut argv = language.run_command(&config.compile_and_run_options);
    let mut stdin = None;
    match config.interface {
        CheckerInterface::Testlib => {
            argv.extend([
                inside(INPUT_FILENAME),
                inside(OUTPUT_FILENAME),
                inside(ANSWER_FILENAME),
            ]);
        }
        CheckerInterface::Legacy => {
            // The legacy flavor discovers its files by convention in the
            // working directory, including the user's source code.
        }
        CheckerInterface::Lemon => {
            argv.extend([
                inside(INPUT_FILENAME),
                inside(OUTPUT_FILENAME),
                inside(ANSWER_FILENAME),
                "100".to_string(),
                inside(SCORE_FILENAME),
                inside(MESSAGE_FILENAME),
            ]);
        }
        CheckerInterface::Hustoj => {
            argv.extend([
                inside(INPUT_FILENAME),
                inside(ANSWER_FILENAME),
                inside(OUTPUT_FILENAME),
            ]);
        }
        CheckerInterface::Qduoj => {
            argv.extend([inside(INPUT_FILENAME), inside(OUTPUT_FILENAME)]);
            stdin = Some(Redirection::File(checker_directory.join(INPUT_FILENAME)));
        }
        CheckerInterface::Domjudge => {
            argv.extend([
                inside(INPUT_FILENAME),
                inside(ANSWER_FILENAME),
                WORKING_MOUNT.to_string(),
            ]);
            stdin = Some(Redirection::File(checker_directory.join(OUTPUT_FILENAME)));
        }
    }

    let params = {
        let mut params =
            SandboxParams::new(SandboxCommand::Executable(argv), AffinityKind::Checker);
        params.stdin = stdin;
        params.stdout = Some(Redirection::File(stdout_path.clone()));
        params.stderr = Some(Redirection::File(stderr_path.clone()));
        params.mounts = vec![
            MountParams { from: binary.directory.clone(), to: BINARY_MOUNT.into(), read_only: true },
            MountParams {
                from: checker_directory.clone(),
                to: WORKING_MOUNT.into(),
                read_only: false,
            },
        ];
        params.cwd = WORKING_MOUNT.into();
        params.time_limit_ms = config.time_limit.unwrap_or(DEFAULT_TIME_LIMIT_MS);
        params.memory_limit_kib =
            config.memory_limit.map(|mib| mib * 1024).unwrap_or(DEFAULT_MEMORY_LIMIT_KIB);
        params.max_processes = language.run_process_limit();
        params
    };

    let report = sandbox::run(params, request.abort.clone()).await?;
    if !matches!(report.status, ExecutionStatus::Ok) {
        return Ok(CheckerOutcome::Failed {
            message: format!("The checker did not finish normally: {}", report.status.name()),
        });
    }

    let read_message = |path: std::path::PathBuf| async move {
        anyhow::Ok(shared::file::read_preview(&path, 4096).await?.data)
    };

    match config.interface {
        CheckerInterface::Testlib => {
            let message = read_message(stderr_path).await?;
            Ok(outcome_from_message(message))
        }
        CheckerInterface::Legacy => {
            let score_text = read_message(stdout_path).await?;
            let message = read_message(stderr_path).await?;
            Ok(score_outcome(&score_text, message))
        }
        CheckerInterface::Lemon => {
            let score_text = read_message(checker_directory.join(SCORE_FILENAME)).await?;
            let message = read_message(checker_directory.join(MESSAGE_FILENAME)).await?;
            Ok(score_outcome(&score_text, message))
        }
        CheckerInterface::Hustoj => {
            let score = if report.exit_code == 0 { 100 } else { 0 };
            Ok(CheckerOutcome::Scored { score, message: String::new() })
        }
        CheckerInterface::Qduoj => {
            let message = read_message(stderr_path).await?;
            match report.exit_code {
                0 => Ok(CheckerOutcome::Scored { score: 100, message }),
                1 => Ok(CheckerOutcome::Scored { score: 0, message }),
                code => Ok(CheckerOutcome::Failed {
                    message: format!("The checker exited with code {code}: {message}"),
                }),
            }
        }
        CheckerInterface::Domjudge => {
            let message =
                read_message(checker_directory.join(DOMJUDGE_MESSAGE_FILENAME)).await?;
            match report.exit_code {
                42 => Ok(CheckerOutcome::Scored { score: 100, message }),
                43 => Ok(CheckerOutcome::Scored { score: 0, message }),
                code => Ok(CheckerOutcome::Failed {
                    message: format!("The checker exited with code {code}: {message}"),
                }),
            }
        }
    }
}

fn score_outcome(score_text: &str, message: String) -> CheckerOutcome {
    match score_text.trim().parse::<i64>() {
        Ok(score) if (0..=100).contains(&score) => {
            CheckerOutcome::Scored { score: score as u32, message }
        }
        Ok(score) => {
            CheckerOutcome::Failed { message: format!("The reported score {score} is out of range") }
        }
        Err(_) => CheckerOutcome::Failed {
            message: format!(
                "Couldn't parse the checker's score: {}",
                score_text.trim().chars().take(256).collect::<String>()
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::score_outcome;
    use crate::checker::CheckerOutcome;

    #[test]
    fn test_score_outcome() {
        assert!(matches!(
            score_outcome("73", String::new()),
            CheckerOutcome::Scored { score: 73, .. }
        ));
        assert!(matches!(
            score_outcome(" 100\n", String::new()),
            CheckerOutcome::Scored { score: 100, .. }
        ));
        assert!(matches!(score_outcome("101", String::new()), CheckerOutcome::Failed { .. }));
        assert!(matches!(score_outcome("abc", String::new()), CheckerOutcome::Failed { .. }));
    }
}
