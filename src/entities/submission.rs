use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A judging job delivered by the dispatcher. Created on receipt and dropped
/// once the terminal progress report has been acknowledged.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionTask {
    pub id: String,

    #[serde(rename = "type")]
    pub problem_type: ProblemType,

    pub plan: JudgingPlan,

    /// In-statement samples, judged before the subtasks when `run_samples` is
    /// set. They carry no weight.
    #[serde(default)]
    pub samples: Option<Vec<SampleData>>,

    /// Logical filename -> content id (the sha-256 of the file).
    #[serde(default)]
    pub testdata: HashMap<String, String>,

    pub content: SubmissionContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemType {
    Batch,
    Interactive,
    SubmitAnswer,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleData {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionContent {
    pub language: String,

    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub compile_and_run_options: Value,

    /// Content id of the submitted archive, submit-answer only.
    #[serde(default)]
    pub submitted_file: Option<String>,

    #[serde(default)]
    pub skip_samples: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgingPlan {
    /// Milliseconds.
    #[serde(default)]
    pub time_limit: Option<u64>,

    /// MiB.
    #[serde(default)]
    pub memory_limit: Option<u64>,

    #[serde(default)]
    pub run_samples: bool,

    pub subtasks: Vec<Subtask>,

    /// Batch and submit-answer.
    #[serde(default)]
    pub checker: Option<CheckerConfig>,

    /// Interactive only.
    #[serde(default)]
    pub interactor: Option<InteractorConfig>,

    /// When present the user program reads and writes the named files in its
    /// working directory instead of stdin/stdout. Batch only.
    #[serde(default)]
    pub file_io: Option<FileIoConfig>,

    /// Language tag -> destination filename -> logical testdata filename.
    #[serde(default)]
    pub extra_source_files: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIoConfig {
    pub input_filename: String,
    pub output_filename: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    #[serde(default)]
    pub time_limit: Option<u64>,

    #[serde(default)]
    pub memory_limit: Option<u64>,

    pub scoring_type: ScoringType,

    /// Weight among the subtasks. Auto-distributed when absent.
    #[serde(default)]
    pub points: Option<f64>,

    /// Indices of prerequisite subtasks.
    #[serde(default)]
    pub dependencies: Vec<usize>,

    pub testcases: Vec<Testcase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ScoringType {
    Sum,
    GroupMin,
    GroupMul,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    /// Batch and interactive; optional for submit-answer.
    #[serde(default)]
    pub input_file: Option<String>,

    /// Batch and submit-answer.
    #[serde(default)]
    pub output_file: Option<String>,

    /// Filename inside the submitted archive, submit-answer only. Defaults
    /// to `output_file`.
    #[serde(default)]
    pub user_output_filename: Option<String>,

    #[serde(default)]
    pub time_limit: Option<u64>,

    #[serde(default)]
    pub memory_limit: Option<u64>,

    #[serde(default)]
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CheckerConfig {
    Integers,

    #[serde(rename_all = "camelCase")]
    Floats { precision: u32 },

    #[serde(rename_all = "camelCase")]
    Lines { case_sensitive: bool },

    Binary,

    Custom(CustomCheckerConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCheckerConfig {
    pub interface: CheckerInterface,

    /// Logical testdata filename of the checker source.
    pub filename: String,

    pub language: String,

    #[serde(default)]
    pub compile_and_run_options: Value,

    #[serde(default)]
    pub time_limit: Option<u64>,

    #[serde(default)]
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerInterface {
    Testlib,
    Legacy,
    Lemon,
    Hustoj,
    Qduoj,
    Domjudge,
}

impl CheckerInterface {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Testlib => "testlib",
            Self::Legacy => "legacy",
            Self::Lemon => "lemon",
            Self::Hustoj => "hustoj",
            Self::Qduoj => "qduoj",
            Self::Domjudge => "domjudge",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractorConfig {
    pub interface: InteractorInterface,

    /// MiB, `shm` interface only.
    #[serde(default)]
    pub shared_memory_size: Option<u64>,

    /// Logical testdata filename of the interactor source.
    pub filename: String,

    pub language: String,

    #[serde(default)]
    pub compile_and_run_options: Value,

    #[serde(default)]
    pub time_limit: Option<u64>,

    #[serde(default)]
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractorInterface {
    Stdio,
    Shm,
}

impl InteractorInterface {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Shm => "shm",
        }
    }
}

/// Effective limits of one testcase run: `testcase ∨ subtask ∨ plan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveLimits {
    pub time_ms: u64,
    pub memory_mib: u64,
}

impl EffectiveLimits {
    pub fn resolve(plan: &JudgingPlan, subtask: &Subtask, testcase: &Testcase) -> Self {
        Self {
            time_ms: testcase
                .time_limit
                .or(subtask.time_limit)
                .or(plan.time_limit)
                .unwrap_or_default(),
            memory_mib: testcase
                .memory_limit
                .or(subtask.memory_limit)
                .or(plan.memory_limit)
                .unwrap_or_default(),
        }
    }
}
