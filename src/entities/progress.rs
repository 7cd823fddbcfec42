use indexmap::IndexMap;
use serde::{ser::SerializeMap, Serialize, Serializer};

use super::{OmittableString, SubmissionStatus, TestcaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressType {
    Preparing,
    Compiling,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileProgress {
    pub success: bool,
    pub message: OmittableString,
}

/// One cell of the progress matrix. Serialized as `{"waiting": true}`,
/// `{"running": true}`, `{"testcaseHash": "..."}` or `{}` for a skipped cell,
/// matching what the dispatcher expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestcaseRef {
    Waiting,
    Running,
    Finished { testcase_hash: String },
    Skipped,
}

impl Serialize for TestcaseRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Waiting => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("waiting", &true)?;
                map.end()
            }
            Self::Running => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("running", &true)?;
                map.end()
            }
            Self::Finished { testcase_hash } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("testcaseHash", testcase_hash)?;
                map.end()
            }
            Self::Skipped => serializer.serialize_map(Some(0))?.end(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    pub full_score: f64,

    pub testcases: Vec<TestcaseRef>,
}

/// A point-in-time view of a submission, pushed to the dispatcher. Finished
/// testcases are stored once in `testcase_results` under their testcase hash
/// and referenced from the matrix cells, letting the dispatcher dedupe equal
/// results across retries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub progress_type: ProgressType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubmissionStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileProgress>,

    /// Terminal configuration or system error, user-visible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<OmittableString>,

    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub testcase_results: IndexMap<String, TestcaseResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<TestcaseRef>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<SubtaskProgress>>,
}

impl ProgressSnapshot {
    pub fn new(progress_type: ProgressType) -> Self {
        Self {
            progress_type,
            status: None,
            score: None,
            compile: None,
            message: None,
            testcase_results: IndexMap::new(),
            samples: None,
            subtasks: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TestcaseRef;

    #[test]
    fn test_testcase_ref_serialization() {
        assert_eq!(serde_json::to_string(&TestcaseRef::Waiting).unwrap(), r#"{"waiting":true}"#);
        assert_eq!(serde_json::to_string(&TestcaseRef::Running).unwrap(), r#"{"running":true}"#);
        assert_eq!(
            serde_json::to_string(&TestcaseRef::Finished { testcase_hash: "abc".to_string() })
                .unwrap(),
            r#"{"testcaseHash":"abc"}"#
        );
        assert_eq!(serde_json::to_string(&TestcaseRef::Skipped).unwrap(), "{}");
    }
}
