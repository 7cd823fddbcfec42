use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::{fs, task::spawn_blocking};
use zip::result::ZipError;

use super::{batch::apply_checker_outcome, CaseRun, RunnerContext};
use crate::{
    checker::{self, CheckRequest},
    entities::{TestcaseResult, TestcaseStatus},
    shared,
};

const INPUT_FILENAME: &str = "input";
const OUTPUT_FILENAME: &str = "user_out";
const ANSWER_FILENAME: &str = "answer.txt";

enum Extraction {
    Missing,
    Oversize { size: u64 },
    Extracted,
}

/// Grades one answer file pulled out of the user's submitted archive. No
/// user program runs; an oversize archived entry is rejected before any
/// extraction happens.
pub async fn run_submit_answer_testcase(
    ctx: &RunnerContext<'_>,
    case: &CaseRun<'_>,
) -> Result<TestcaseResult> {
    let entry_name =
        case.archive_entry.clone().context("The testcase names no answer file to extract")?;
    let answer = case.answer.context("A submit-answer testcase requires an answer file")?;
    let archive_path = {
        let content_id = ctx
            .task
            .content
            .submitted_file
            .as_ref()
            .context("The submission carries no archive")?;
        ctx.testdata.path_of(content_id)
    };

    let display_limit = ctx.display.data_display_for_submit_answer as usize;

    ctx.slots
        .run_queued(|slot| async move {
            let working_directory = slot.directory.join("working");
            fs::create_dir_all(&working_directory).await?;

            let output_path = working_directory.join(OUTPUT_FILENAME);

            let mut result = TestcaseResult::default();

            // Unzip lazily: the wanted entry alone is inspected and, when its
            // uncompressed size passes the gate, extracted into this run's
            // unique directory.
            let extraction = {
                let archive_path = archive_path.clone();
                let output_path = output_path.clone();
                let size_limit = ctx.display.output_size;
                spawn_blocking(move || extract_entry(archive_path, entry_name, output_path, size_limit))
                    .await
                    .context("The extraction task died")??
            };

            match extraction {
                Extraction::Missing => {
                    result.status = TestcaseStatus::FileError;
                    result.system_message =
                        Some("The submitted archive has no such file".to_string().into());
                    return Ok(result);
                }
                Extraction::Oversize { size } => {
                    result.status = TestcaseStatus::OutputLimitExceeded;
                    result.system_message = Some(
                        format!("The archived file is {size} bytes, exceeding the output limit")
                            .into(),
                    );
                    return Ok(result);
                }
                Extraction::Extracted => {}
            }

            let input_path = working_directory.join(INPUT_FILENAME);
            match case.input {
                Some(input) => ctx.materialize(input, &input_path).await?,
                // Custom checkers always receive an input argument.
                None => fs::write(&input_path, b"").await?,
            }

            let answer_path = slot.directory.join(ANSWER_FILENAME);
            ctx.materialize(answer, &answer_path).await?;

            result.input =
                Some(shared::file::read_preview(&input_path, display_limit).await?);
            result.output =
                Some(shared::file::read_preview(&answer_path, display_limit).await?);
            result.user_output =
                Some(shared::file::read_preview(&output_path, display_limit).await?);

            let checker_config =
                ctx.task.plan.checker.as_ref().context("The plan carries no checker")?;
            let outcome = checker::check(CheckRequest {
                checker: checker_config,
                checker_binary: ctx.checker_binary,
                slot: &slot,
                input_path: &input_path,
                output_path: &output_path,
                answer_path: &answer_path,
                user_code: "",
                abort: ctx.abort.clone(),
            })
            .await?;

            apply_checker_outcome(&mut result, outcome, ctx.display.stderr_display as usize);
            Ok(result)
        })
        .await
}

fn extract_entry(
    archive_path: PathBuf,
    entry_name: String,
    target: PathBuf,
    size_limit: u64,
) -> Result<Extraction> {
    let file =
        std::fs::File::open(&archive_path).context("Error opening the submitted archive")?;
    let mut archive =
        zip::ZipArchive::new(file).context("Error reading the submitted archive")?;

    let mut entry = match archive.by_name(&entry_name) {
        Err(ZipError::FileNotFound) => return Ok(Extraction::Missing),
        Err(err) => return Err(err).context("Error locating the archived file"),
        Ok(entry) => entry,
    };

    let size = entry.size();
    if size > size_limit {
        return Ok(Extraction::Oversize { size });
    }

    let mut output = std::fs::File::create(&target).context("Error creating the output file")?;
    std::io::copy(&mut entry, &mut output).context("Error extracting the archived file")?;
    Ok(Extraction::Extracted)
}
