use serde::{Deserialize, Serialize};

/// Outcome of one testcase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TestcaseStatus {
    Accepted,
    WrongAnswer,
    PartiallyCorrect,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    FileError,
    JudgementFailed,
}

/// Terminal status of a whole submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SubmissionStatus {
    Accepted,
    WrongAnswer,
    PartiallyCorrect,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    FileError,
    JudgementFailed,
    CompilationError,
    ConfigurationError,
    SystemError,
    Canceled,
}

impl From<TestcaseStatus> for SubmissionStatus {
    fn from(status: TestcaseStatus) -> Self {
        match status {
            TestcaseStatus::Accepted => Self::Accepted,
            TestcaseStatus::WrongAnswer => Self::WrongAnswer,
            TestcaseStatus::PartiallyCorrect => Self::PartiallyCorrect,
            TestcaseStatus::TimeLimitExceeded => Self::TimeLimitExceeded,
            TestcaseStatus::MemoryLimitExceeded => Self::MemoryLimitExceeded,
            TestcaseStatus::OutputLimitExceeded => Self::OutputLimitExceeded,
            TestcaseStatus::RuntimeError => Self::RuntimeError,
            TestcaseStatus::FileError => Self::FileError,
            TestcaseStatus::JudgementFailed => Self::JudgementFailed,
        }
    }
}

/// A possibly-clipped user-visible string. The prefix is preserved and the
/// number of clipped bytes is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OmittableString {
    pub data: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub omitted_bytes: usize,
}

#[inline]
fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl OmittableString {
    pub fn clip(text: impl Into<String>, limit: usize) -> Self {
        let text = text.into();
        if text.len() <= limit {
            return Self { data: text, omitted_bytes: 0 };
        }

        // Clip on a char boundary so the prefix stays valid utf-8.
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }

        Self { omitted_bytes: text.len() - end, data: text[..end].to_string() }
    }
}

impl From<String> for OmittableString {
    fn from(data: String) -> Self {
        Self { data, omitted_bytes: 0 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseResult {
    pub status: TestcaseStatus,

    /// In `[0, 100]`.
    pub score: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<OmittableString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OmittableString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_output: Option<OmittableString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_error: Option<OmittableString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker_message: Option<OmittableString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<OmittableString>,
}

impl Default for TestcaseStatus {
    fn default() -> Self {
        Self::JudgementFailed
    }
}

impl TestcaseResult {
    pub fn new(status: TestcaseStatus, score: u32) -> Self {
        Self { status, score, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::OmittableString;

    #[test]
    fn test_clip_short() {
        let clipped = OmittableString::clip("hello", 16);
        assert_eq!(clipped.data, "hello");
        assert_eq!(clipped.omitted_bytes, 0);
    }

    #[test]
    fn test_clip_long() {
        let clipped = OmittableString::clip("hello world", 5);
        assert_eq!(clipped.data, "hello");
        assert_eq!(clipped.omitted_bytes, 6);
    }

    #[test]
    fn test_clip_char_boundary() {
        // "测" occupies bytes 0..3, clipping at 4 must back off to 3.
        let clipped = OmittableString::clip("测试", 4);
        assert_eq!(clipped.data, "测");
        assert_eq!(clipped.omitted_bytes, 3);
    }
}
