use std::{
    collections::HashSet,
    fmt::{self, Display},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{future::BoxFuture, FutureExt};
use indexmap::IndexMap;
use tokio::fs;
use tracing::{debug, error, instrument};
use triggered::Listener;

pub use self::hash::HashContext;
use crate::{
    compile::{BinaryArtifact, CompileOutcome, CompileService, CompileTask, ExtraSource},
    entities::{
        CheckerConfig, CompileProgress, EffectiveLimits, OmittableString, ProblemType,
        ProgressSnapshot, ProgressType, SubmissionStatus, SubmissionTask, SubtaskProgress,
        TestcaseRef, TestcaseResult,
    },
    exchange::{DispatcherHandle, DispatcherLost, ServerSideLimits},
    languages::Language,
    runner::{self, CaseRun, CaseSource, RunnerContext},
    scoring::{self, CaseGrade, CaseRef, PlanDriver, PlanVerdict},
    shared::{self, debounce::Debouncer},
    slots::TaskSlots,
    testdata::TestdataStore,
};

mod hash;

const ERROR_MESSAGE_LIMIT: usize = 8 * 1024;

/// The process-wide services a submission runs against, constructed once
/// after authorization and shared by every consumer.
pub struct JudgeServices {
    pub slots: Arc<TaskSlots>,
    pub compiler: Arc<CompileService>,
    pub testdata: Arc<TestdataStore>,
    pub dispatcher: DispatcherHandle,
    pub limits: ServerSideLimits,
}

/// Debounced progress sink bound to one task. Intermediate snapshots
/// coalesce on a ~100 ms trailing edge; terminal snapshots bypass the delay.
pub struct ProgressReporter {
    debouncer: Debouncer<ProgressSnapshot>,
}

impl ProgressReporter {
    pub fn new(
        sink: impl Fn(ProgressSnapshot) -> BoxFuture<'static, ()> + Send + 'static,
    ) -> Self {
        Self { debouncer: Debouncer::new(Duration::from_millis(100), sink) }
    }

    pub fn push(&self, snapshot: ProgressSnapshot) {
        self.debouncer.push(snapshot);
    }

    pub async fn finish(&self, snapshot: ProgressSnapshot) {
        self.debouncer.flush(snapshot).await;
    }
}

/// An invalid judging plan, missing testdata reference or broken
/// checker/interactor configuration. Terminal for the submission, but the
/// worker itself is healthy.
#[derive(Debug)]
pub struct ConfigurationFault(pub String);

impl Display for ConfigurationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigurationFault {}

/// Drives one submission: validate, fetch, compile, run the plan, report.
/// Every terminal outcome except cancellation and a lost dispatcher is
/// reported as a `Finished` snapshot and returned as `Ok`.
#[instrument(skip_all, fields(task_id = task.id))]
pub async fn judge_submission(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
    reporter: &ProgressReporter,
) -> Result<()> {
    match run_pipeline(services, task, abort, reporter).await {
        Ok(()) => Ok(()),
        Err(err) if shared::is_cancelled(&err) => Err(err),
        Err(err) if err.chain().any(|cause| cause.is::<DispatcherLost>()) => Err(err),
        Err(err) => {
            let configuration = err.chain().any(|cause| cause.is::<ConfigurationFault>());
            let status = if configuration {
                SubmissionStatus::ConfigurationError
            } else {
                error!("Error judging the submission: {err:#}");
                SubmissionStatus::SystemError
            };

            let mut snapshot = ProgressSnapshot::new(ProgressType::Finished);
            snapshot.status = Some(status);
            snapshot.score = Some(0);
            snapshot.message =
                Some(OmittableString::clip(format!("{err:#}"), ERROR_MESSAGE_LIMIT));
            reporter.finish(snapshot).await;
            Ok(())
        }
    }
}

async fn run_pipeline(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
    reporter: &ProgressReporter,
) -> Result<()> {
    reporter.push(ProgressSnapshot::new(ProgressType::Preparing));

    validate_task(task)?;

    fetch_referenced_testdata(services, task, abort.clone()).await?;

    reporter.push(ProgressSnapshot::new(ProgressType::Compiling));

    let mut checker_binary = None;
    let mut interactor_binary = None;
    let mut user_binary = None;
    let mut compile_progress = None;

    match task.problem_type {
        ProblemType::Batch => {
            checker_binary = compile_custom_checker(services, task, abort.clone()).await?;
            let outcome = compile_user_program(services, task, abort.clone()).await?;
            let progress = outcome.progress();
            match outcome {
                CompileOutcome::Success(binary) => {
                    debug!(extra_info = ?binary.extra_info, "Compiled the user program");
                    compile_progress = Some(progress);
                    user_binary = Some(binary);
                }
                CompileOutcome::Failure { .. } => {
                    return finish_compile_error(reporter, progress).await;
                }
            }
        }
        ProblemType::Interactive => {
            interactor_binary = Some(compile_interactor(services, task, abort.clone()).await?);
            let outcome = compile_user_program(services, task, abort.clone()).await?;
            let progress = outcome.progress();
            match outcome {
                CompileOutcome::Success(binary) => {
                    debug!(extra_info = ?binary.extra_info, "Compiled the user program");
                    compile_progress = Some(progress);
                    user_binary = Some(binary);
                }
                CompileOutcome::Failure { .. } => {
                    return finish_compile_error(reporter, progress).await;
                }
            }
        }
        ProblemType::SubmitAnswer => {
            // The checker compiles while the submitted archive downloads.
            let (binary, ()) = tokio::try_join!(
                compile_custom_checker(services, task, abort.clone()),
                fetch_submitted_archive(services, task, abort.clone()),
            )?;
            checker_binary = binary;
        }
    }

    let sample_count = task.samples.as_ref().map(Vec::len).unwrap_or(0);
    let samples_active = task.plan.run_samples
        && sample_count > 0
        && !task.content.skip_samples
        && !matches!(task.problem_type, ProblemType::SubmitAnswer);

    let state = JudgeState::new(task, compile_progress, samples_active.then_some(sample_count))?;
    reporter.push(state.snapshot(ProgressType::Running));

    let driver = Driver {
        task,
        state: &state,
        reporter,
        runner_ctx: RunnerContext {
            task,
            slots: &services.slots,
            testdata: &services.testdata,
            display: &services.limits,
            binary: user_binary.as_ref(),
            checker_binary: checker_binary.as_ref(),
            interactor_binary: interactor_binary.as_ref(),
            abort: abort.clone(),
        },
        hash_ctx: HashContext {
            checker: task.plan.checker.as_ref(),
            checker_binary: checker_binary.as_ref(),
            interactor: task.plan.interactor.as_ref(),
            interactor_binary: interactor_binary.as_ref(),
        },
    };

    let verdict = scoring::execute_plan(
        &task.plan,
        task.problem_type,
        if samples_active { sample_count } else { 0 },
        task.content.skip_samples,
        &driver,
    )
    .await?;

    reporter.finish(state.final_snapshot(&verdict)).await;
    Ok(())
}

async fn finish_compile_error(
    reporter: &ProgressReporter,
    compile: CompileProgress,
) -> Result<()> {
    let mut snapshot = ProgressSnapshot::new(ProgressType::Finished);
    snapshot.status = Some(SubmissionStatus::CompilationError);
    snapshot.score = Some(0);
    snapshot.compile = Some(compile);
    reporter.finish(snapshot).await;
    Ok(())
}

fn configuration_error(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigurationFault(message.into()))
}

fn manifest_entry<'a>(task: &'a SubmissionTask, filename: &str) -> Result<&'a str> {
    match task.testdata.get(filename) {
        None => Err(configuration_error(format!(
            "The testdata manifest has no entry for {filename}"
        ))),
        Some(content_id) => Ok(content_id),
    }
}

fn validate_task(task: &SubmissionTask) -> Result<()> {
    let plan = &task.plan;

    if plan.subtasks.is_empty() {
        return Err(configuration_error("The judging plan has no subtasks"));
    }

    scoring::distribute_weights(&plan.subtasks.iter().map(|s| s.points).collect::<Vec<_>>())
        .map_err(|err| configuration_error(format!("{err:#}")))?;
    scoring::topological_order(&plan.subtasks)
        .map_err(|err| configuration_error(format!("{err:#}")))?;

    for (index, subtask) in plan.subtasks.iter().enumerate() {
        if subtask.testcases.is_empty() {
            return Err(configuration_error(format!("Subtask {index} has no testcases")));
        }
        scoring::distribute_weights(&subtask.testcases.iter().map(|t| t.points).collect::<Vec<_>>())
            .map_err(|err| configuration_error(format!("{err:#}")))?;

        for (case_index, testcase) in subtask.testcases.iter().enumerate() {
            let position = format!("testcase {case_index} of subtask {index}");

            match task.problem_type {
                ProblemType::Batch => {
                    if testcase.input_file.is_none() || testcase.output_file.is_none() {
                        return Err(configuration_error(format!(
                            "The {position} must name an input and an output file"
                        )));
                    }
                }
                ProblemType::Interactive => {
                    if testcase.input_file.is_none() {
                        return Err(configuration_error(format!(
                            "The {position} must name an input file"
                        )));
                    }
                }
                ProblemType::SubmitAnswer => {
                    if testcase.output_file.is_none() {
                        return Err(configuration_error(format!(
                            "The {position} must name an answer file"
                        )));
                    }
                }
            }

            for filename in [&testcase.input_file, &testcase.output_file].into_iter().flatten() {
                manifest_entry(task, filename)?;
            }

            if !matches!(task.problem_type, ProblemType::SubmitAnswer) {
                let limits = EffectiveLimits::resolve(plan, subtask, testcase);
                if limits.time_ms == 0 || limits.memory_mib == 0 {
                    return Err(configuration_error(format!(
                        "The {position} has no positive time or memory limit"
                    )));
                }
            }
        }
    }

    match task.problem_type {
        ProblemType::Batch | ProblemType::SubmitAnswer => {
            let checker = plan
                .checker
                .as_ref()
                .ok_or_else(|| configuration_error("The judging plan carries no checker"))?;
            crate::checker::validate_checker(checker)
                .map_err(|err| configuration_error(format!("{err:#}")))?;
            if let CheckerConfig::Custom(config) = checker {
                manifest_entry(task, &config.filename)?;
            }
        }
        ProblemType::Interactive => {
            let interactor = plan
                .interactor
                .as_ref()
                .ok_or_else(|| configuration_error("The judging plan carries no interactor"))?;
            if Language::from_tag(&interactor.language).is_none() {
                return Err(configuration_error(format!(
                    "Unsupported interactor language: {}",
                    interactor.language
                )));
            }
            manifest_entry(task, &interactor.filename)?;
        }
    }

    if matches!(task.problem_type, ProblemType::SubmitAnswer)
        && task.content.submitted_file.is_none()
    {
        return Err(configuration_error("The submission carries no answer archive"));
    }

    if !matches!(task.problem_type, ProblemType::SubmitAnswer)
        && Language::from_tag(&task.content.language).is_none()
    {
        return Err(configuration_error(format!(
            "Unsupported submission language: {}",
            task.content.language
        )));
    }

    for files in plan.extra_source_files.values() {
        for filename in files.values() {
            manifest_entry(task, filename)?;
        }
    }

    Ok(())
}

/// Downloads every manifest file the plan references: testcase data, the
/// checker and interactor sources and the extra source files. The submitted
/// archive of a submit-answer task is fetched later, in parallel with the
/// checker compile.
async fn fetch_referenced_testdata(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
) -> Result<()> {
    let mut wanted: HashSet<String> = HashSet::new();

    for subtask in &task.plan.subtasks {
        for testcase in &subtask.testcases {
            for filename in [&testcase.input_file, &testcase.output_file].into_iter().flatten() {
                wanted.insert(manifest_entry(task, filename)?.to_string());
            }
        }
    }

    if let Some(CheckerConfig::Custom(config)) = &task.plan.checker {
        wanted.insert(manifest_entry(task, &config.filename)?.to_string());
    }
    if let Some(interactor) = &task.plan.interactor {
        wanted.insert(manifest_entry(task, &interactor.filename)?.to_string());
    }
    for files in task.plan.extra_source_files.values() {
        for filename in files.values() {
            wanted.insert(manifest_entry(task, filename)?.to_string());
        }
    }

    download_content(services, wanted.into_iter().collect(), abort).await
}

async fn fetch_submitted_archive(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
) -> Result<()> {
    let content_id =
        task.content.submitted_file.clone().context("The submission carries no archive")?;
    download_content(services, vec![content_id], abort).await
}

async fn download_content(
    services: &JudgeServices,
    content_ids: Vec<String>,
    abort: Listener,
) -> Result<()> {
    let missing = services.testdata.missing(content_ids.iter()).await;
    if missing.is_empty() {
        return Ok(());
    }

    let urls = services.dispatcher.request_files(missing.clone()).await?;
    let files: Vec<(String, String)> = missing.into_iter().zip(urls).collect();
    services.testdata.download_all(&files, abort).await
}

fn extra_sources_for(
    services: &JudgeServices,
    task: &SubmissionTask,
    language: Language,
) -> Result<Vec<ExtraSource>> {
    let mut sources = vec![];
    if let Some(files) = task.plan.extra_source_files.get(language.tag()) {
        for (destination, filename) in files {
            let content_id = manifest_entry(task, filename)?.to_string();
            let path = services.testdata.path_of(&content_id);
            sources.push(ExtraSource { filename: destination.clone(), content_id, path });
        }
    }
    Ok(sources)
}

async fn compile_user_program(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
) -> Result<CompileOutcome> {
    let language = Language::from_tag(&task.content.language)
        .context("Unsupported submission language")?;

    let compile_task = CompileTask {
        language,
        code: task.content.code.clone(),
        options: task.content.compile_and_run_options.clone(),
        extra_sources: extra_sources_for(services, task, language)?,
    };

    services
        .compiler
        .compile(compile_task, services.limits.compiler_message as usize, abort)
        .await
}

async fn compile_custom_checker(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
) -> Result<Option<Arc<BinaryArtifact>>> {
    let config = match &task.plan.checker {
        Some(CheckerConfig::Custom(config)) => config,
        _ => return Ok(None),
    };

    let language = Language::from_tag(&config.language).context("Unsupported checker language")?;
    let content_id = manifest_entry(task, &config.filename)?.to_string();
    let code = fs::read_to_string(services.testdata.path_of(&content_id))
        .await
        .context("Error reading the checker source")?;

    let compile_task = CompileTask {
        language,
        code,
        options: config.compile_and_run_options.clone(),
        extra_sources: extra_sources_for(services, task, language)?,
    };

    match services
        .compiler
        .compile(compile_task, services.limits.compiler_message as usize, abort)
        .await?
    {
        CompileOutcome::Success(binary) => Ok(Some(binary)),
        CompileOutcome::Failure { message } => Err(configuration_error(format!(
            "Error compiling the checker: {}",
            message.data
        ))),
    }
}

async fn compile_interactor(
    services: &JudgeServices,
    task: &SubmissionTask,
    abort: Listener,
) -> Result<Arc<BinaryArtifact>> {
    let config = task.plan.interactor.as_ref().context("The plan has no interactor")?;
    let language =
        Language::from_tag(&config.language).context("Unsupported interactor language")?;
    let content_id = manifest_entry(task, &config.filename)?.to_string();
    let code = fs::read_to_string(services.testdata.path_of(&content_id))
        .await
        .context("Error reading the interactor source")?;

    let compile_task = CompileTask {
        language,
        code,
        options: config.compile_and_run_options.clone(),
        extra_sources: extra_sources_for(services, task, language)?,
    };

    match services
        .compiler
        .compile(compile_task, services.limits.compiler_message as usize, abort)
        .await?
    {
        CompileOutcome::Success(binary) => Ok(binary),
        CompileOutcome::Failure { message } => Err(configuration_error(format!(
            "Error compiling the interactor: {}",
            message.data
        ))),
    }
}

/// Shared progress matrix of one running submission. Cells move waiting →
/// running → finished (or straight to skipped); finished results are stored
/// once, keyed by testcase hash.
struct JudgeState {
    compile: Option<CompileProgress>,
    full_scores: Vec<f64>,
    matrix: Mutex<Matrix>,
}

struct Matrix {
    samples: Option<Vec<TestcaseRef>>,
    subtasks: Vec<Vec<TestcaseRef>>,
    results: IndexMap<String, TestcaseResult>,
}

impl JudgeState {
    fn new(
        task: &SubmissionTask,
        compile: Option<CompileProgress>,
        sample_count: Option<usize>,
    ) -> Result<Self> {
        let full_scores = scoring::distribute_weights(
            &task.plan.subtasks.iter().map(|s| s.points).collect::<Vec<_>>(),
        )?;

        Ok(Self {
            compile,
            full_scores,
            matrix: Mutex::new(Matrix {
                samples: sample_count.map(|count| vec![TestcaseRef::Waiting; count]),
                subtasks: task
                    .plan
                    .subtasks
                    .iter()
                    .map(|subtask| vec![TestcaseRef::Waiting; subtask.testcases.len()])
                    .collect(),
                results: IndexMap::new(),
            }),
        })
    }

    fn set_cell(&self, case: CaseRef, cell: TestcaseRef) {
        let mut matrix = self.matrix.lock().unwrap();
        match case {
            CaseRef::Sample { index } => {
                if let Some(samples) = matrix.samples.as_mut() {
                    samples[index] = cell;
                }
            }
            CaseRef::Subtask { subtask, testcase } => {
                matrix.subtasks[subtask][testcase] = cell;
            }
        }
    }

    fn insert_result(&self, testcase_hash: String, result: TestcaseResult) {
        self.matrix.lock().unwrap().results.insert(testcase_hash, result);
    }

    fn snapshot(&self, progress_type: ProgressType) -> ProgressSnapshot {
        let matrix = self.matrix.lock().unwrap();

        let mut snapshot = ProgressSnapshot::new(progress_type);
        snapshot.compile = self.compile.clone();
        snapshot.testcase_results = matrix.results.clone();
        snapshot.samples = matrix.samples.clone();
        snapshot.subtasks = Some(
            matrix
                .subtasks
                .iter()
                .zip(&self.full_scores)
                .map(|(testcases, full_score)| SubtaskProgress {
                    score: None,
                    full_score: *full_score,
                    testcases: testcases.clone(),
                })
                .collect(),
        );
        snapshot
    }

    fn final_snapshot(&self, verdict: &PlanVerdict) -> ProgressSnapshot {
        let mut snapshot = self.snapshot(ProgressType::Finished);
        snapshot.status = Some(verdict.status);
        snapshot.score = Some(verdict.score);
        if let Some(subtasks) = snapshot.subtasks.as_mut() {
            for (progress, score) in subtasks.iter_mut().zip(&verdict.subtask_scores) {
                progress.score = Some(*score);
            }
        }
        snapshot
    }
}

struct Driver<'a> {
    task: &'a SubmissionTask,
    state: &'a JudgeState,
    reporter: &'a ProgressReporter,
    runner_ctx: RunnerContext<'a>,
    hash_ctx: HashContext<'a>,
}

impl Driver<'_> {
    fn resolve_case(
        &self,
        case: CaseRef,
        limits: EffectiveLimits,
    ) -> Result<(CaseRun<'_>, Option<String>, Option<String>)> {
        match case {
            CaseRef::Sample { index } => {
                let sample = self
                    .task
                    .samples
                    .as_ref()
                    .and_then(|samples| samples.get(index))
                    .context("The sample index is out of range")?;
                Ok((
                    CaseRun {
                        limits,
                        input: Some(CaseSource::Inline(&sample.input)),
                        answer: Some(CaseSource::Inline(&sample.output)),
                        archive_entry: None,
                    },
                    Some(shared::sha256_hex(&sample.input)),
                    Some(shared::sha256_hex(&sample.output)),
                ))
            }
            CaseRef::Subtask { subtask, testcase } => {
                let testcase = &self.task.plan.subtasks[subtask].testcases[testcase];

                let input_digest = testcase
                    .input_file
                    .as_deref()
                    .map(|filename| manifest_entry(self.task, filename).map(str::to_string))
                    .transpose()?;
                let output_digest = testcase
                    .output_file
                    .as_deref()
                    .map(|filename| manifest_entry(self.task, filename).map(str::to_string))
                    .transpose()?;

                let archive_entry = match self.task.problem_type {
                    ProblemType::SubmitAnswer => testcase
                        .user_output_filename
                        .clone()
                        .or_else(|| testcase.output_file.clone()),
                    _ => None,
                };

                Ok((
                    CaseRun {
                        limits,
                        input: testcase.input_file.as_deref().map(CaseSource::Testdata),
                        answer: testcase.output_file.as_deref().map(CaseSource::Testdata),
                        archive_entry,
                    },
                    input_digest,
                    output_digest,
                ))
            }
        }
    }
}

impl PlanDriver for Driver<'_> {
    fn run_case<'a>(
        &'a self,
        case: CaseRef,
        limits: EffectiveLimits,
        _weight: f64,
    ) -> BoxFuture<'a, Result<CaseGrade>> {
        async move {
            self.state.set_cell(case, TestcaseRef::Running);
            self.reporter.push(self.state.snapshot(ProgressType::Running));

            let (case_run, input_digest, output_digest) = self.resolve_case(case, limits)?;
            let result = runner::run_testcase(&self.runner_ctx, &case_run).await?;

            let testcase_hash = hash::testcase_hash(
                limits,
                input_digest.as_deref(),
                output_digest.as_deref(),
                &self.hash_ctx,
            )?;

            let grade = CaseGrade { status: result.status, score: result.score };
            self.state.insert_result(testcase_hash.clone(), result);
            self.state.set_cell(case, TestcaseRef::Finished { testcase_hash });
            self.reporter.push(self.state.snapshot(ProgressType::Running));

            Ok(grade)
        }
        .boxed()
    }

    fn skip_case(&self, case: CaseRef) {
        self.state.set_cell(case, TestcaseRef::Skipped);
        self.reporter.push(self.state.snapshot(ProgressType::Running));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;

    use super::validate_task;
    use crate::entities::{
        CheckerConfig, JudgingPlan, ProblemType, ScoringType, SubmissionContent, SubmissionTask,
        Subtask, Testcase,
    };

    fn batch_task() -> SubmissionTask {
        SubmissionTask {
            id: "t1".to_string(),
            problem_type: ProblemType::Batch,
            plan: JudgingPlan {
                time_limit: Some(1000),
                memory_limit: Some(256),
                run_samples: false,
                subtasks: vec![Subtask {
                    time_limit: None,
                    memory_limit: None,
                    scoring_type: ScoringType::Sum,
                    points: None,
                    dependencies: vec![],
                    testcases: vec![Testcase {
                        input_file: Some("1.in".to_string()),
                        output_file: Some("1.out".to_string()),
                        user_output_filename: None,
                        time_limit: None,
                        memory_limit: None,
                        points: None,
                    }],
                }],
                checker: Some(CheckerConfig::Lines { case_sensitive: true }),
                interactor: None,
                file_io: None,
                extra_source_files: HashMap::new(),
            },
            samples: None,
            testdata: HashMap::from([
                ("1.in".to_string(), "a".repeat(64)),
                ("1.out".to_string(), "b".repeat(64)),
            ]),
            content: SubmissionContent {
                language: "cpp".to_string(),
                code: "int main() {}".to_string(),
                compile_and_run_options: Value::Null,
                submitted_file: None,
                skip_samples: false,
            },
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_batch() {
        assert!(validate_task(&batch_task()).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_manifest_entry() {
        let mut task = batch_task();
        task.testdata.remove("1.out");
        assert!(validate_task(&task).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut task = batch_task();
        task.plan.time_limit = None;
        assert!(validate_task(&task).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_checker() {
        let mut task = batch_task();
        task.plan.checker = None;
        assert!(validate_task(&task).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_language() {
        let mut task = batch_task();
        task.content.language = "cobol".to_string();
        assert!(validate_task(&task).is_err());
    }

    #[test]
    fn test_validate_rejects_cyclic_dependencies() {
        let mut task = batch_task();
        task.plan.subtasks[0].dependencies = vec![0];
        assert!(validate_task(&task).is_err());
    }
}
