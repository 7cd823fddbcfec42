use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use tokio::fs;
use triggered::Listener;

pub use self::{batch::run_batch_testcase, interactive::run_interactive_testcase,
    submit_answer::run_submit_answer_testcase};
use crate::{
    compile::BinaryArtifact,
    entities::{EffectiveLimits, ProblemType, SubmissionTask, TestcaseResult},
    exchange::ServerSideLimits,
    slots::TaskSlots,
    testdata::TestdataStore,
};

mod batch;
mod interactive;
mod submit_answer;

/// Everything a testcase run needs besides the testcase itself. Owned by the
/// orchestrator for the lifetime of one submission.
pub struct RunnerContext<'a> {
    pub task: &'a SubmissionTask,
    pub slots: &'a TaskSlots,
    pub testdata: &'a TestdataStore,
    pub display: &'a ServerSideLimits,

    /// The compiled user program; absent for submit-answer.
    pub binary: Option<&'a Arc<BinaryArtifact>>,

    pub checker_binary: Option<&'a Arc<BinaryArtifact>>,
    pub interactor_binary: Option<&'a Arc<BinaryArtifact>>,

    pub abort: Listener,
}

/// Where the bytes of an input or answer file come from.
#[derive(Debug, Clone, Copy)]
pub enum CaseSource<'a> {
    /// A logical filename resolved through the testdata manifest.
    Testdata(&'a str),

    /// Inline bytes of an in-statement sample.
    Inline(&'a str),
}

/// One testcase run, resolved down to data sources and effective limits.
pub struct CaseRun<'a> {
    pub limits: EffectiveLimits,
    pub input: Option<CaseSource<'a>>,
    pub answer: Option<CaseSource<'a>>,

    /// Submit-answer: the wanted entry inside the submitted archive.
    pub archive_entry: Option<String>,
}

pub async fn run_testcase(
    ctx: &RunnerContext<'_>,
    case: &CaseRun<'_>,
) -> Result<TestcaseResult> {
    match ctx.task.problem_type {
        ProblemType::Batch => run_batch_testcase(ctx, case).await,
        ProblemType::Interactive => run_interactive_testcase(ctx, case).await,
        ProblemType::SubmitAnswer => run_submit_answer_testcase(ctx, case).await,
    }
}

impl RunnerContext<'_> {
    /// Copies or writes a case data source to `target`.
    async fn materialize(&self, source: CaseSource<'_>, target: &Path) -> Result<()> {
        match source {
            CaseSource::Inline(data) => {
                fs::write(target, data).await.context("Error writing the inline data")?;
            }
            CaseSource::Testdata(filename) => {
                let content_id = match self.task.testdata.get(filename) {
                    None => bail!("The testdata manifest has no entry for {filename}"),
                    Some(content_id) => content_id,
                };
                fs::copy(self.testdata.path_of(content_id), target)
                    .await
                    .with_context(|| format!("Error copying the testdata file {filename}"))?;
            }
        }

        Ok(())
    }
}
