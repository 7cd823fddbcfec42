use std::{path::Path, sync::Arc};

use anyhow::{bail, Result};
use triggered::Listener;

pub use self::{
    builtin::{run_builtin_checker, BuiltinChecker},
    message::{parse_checker_message, ParsedScore},
};
use crate::{
    compile::BinaryArtifact,
    entities::{CheckerConfig, CustomCheckerConfig},
    languages::Language,
    slots::Slot,
};

mod builtin;
mod custom;
mod message;

/// Grade of one user output.
#[derive(Debug, Clone)]
pub enum CheckerOutcome {
    Scored { score: u32, message: String },
    Failed { message: String },
}

/// Rejects invalid checker configurations before anything is compiled.
pub fn validate_checker(checker: &CheckerConfig) -> Result<()> {
    match checker {
        CheckerConfig::Floats { precision } => {
            if *precision > 18 {
                bail!("The float checker precision {precision} is out of range");
            }
        }
        CheckerConfig::Custom(config) => validate_custom_checker(config)?,
        _ => {}
    }

    Ok(())
}

fn validate_custom_checker(config: &CustomCheckerConfig) -> Result<()> {
    let language = match Language::from_tag(&config.language) {
        None => bail!("Unsupported checker language: {}", config.language),
        Some(language) => language,
    };

    if matches!(config.interface, crate::entities::CheckerInterface::Testlib)
        && !language.is_cpp_family()
    {
        bail!("The testlib checker interface requires a C++ checker");
    }

    Ok(())
}

pub struct CheckRequest<'a> {
    pub checker: &'a CheckerConfig,

    /// Compiled custom checker; `None` for the built-in family.
    pub checker_binary: Option<&'a Arc<BinaryArtifact>>,

    pub slot: &'a Slot,

    pub input_path: &'a Path,
    pub output_path: &'a Path,
    pub answer_path: &'a Path,

    /// The user's source code, handed to `legacy` checkers.
    pub user_code: &'a str,

    pub abort: Listener,
}

/// Dispatches to the built-in or custom checker and reduces the result to a
/// score or a judgement failure.
pub async fn check(request: CheckRequest<'_>) -> Result<CheckerOutcome> {
    match request.checker {
        CheckerConfig::Integers => {
            builtin_outcome(BuiltinChecker::Integers, &request).await
        }
        CheckerConfig::Floats { precision } => {
            builtin_outcome(BuiltinChecker::Floats { precision: *precision }, &request).await
        }
        CheckerConfig::Lines { case_sensitive } => {
            builtin_outcome(BuiltinChecker::Lines { case_sensitive: *case_sensitive }, &request)
                .await
        }
        CheckerConfig::Binary => builtin_outcome(BuiltinChecker::Binary, &request).await,
        CheckerConfig::Custom(config) => {
            let binary = match request.checker_binary {
                None => bail!("The custom checker has not been compiled"),
                Some(binary) => binary,
            };
            custom::run_custom_checker(&request, config, binary).await
        }
    }
}

async fn builtin_outcome(
    kind: BuiltinChecker,
    request: &CheckRequest<'_>,
) -> Result<CheckerOutcome> {
    let message = run_builtin_checker(kind, request.output_path, request.answer_path).await?;
    Ok(outcome_from_message(message))
}

fn outcome_from_message(message: String) -> CheckerOutcome {
    match parse_checker_message(&message) {
        ParsedScore::Score(score) => CheckerOutcome::Scored { score, message },
        ParsedScore::Failed { message } => CheckerOutcome::Failed { message },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::validate_checker;
    use crate::entities::{CheckerConfig, CheckerInterface, CustomCheckerConfig};

    fn custom(interface: CheckerInterface, language: &str) -> CheckerConfig {
        CheckerConfig::Custom(CustomCheckerConfig {
            interface,
            filename: "checker.cpp".to_string(),
            language: language.to_string(),
            compile_and_run_options: Value::Null,
            time_limit: None,
            memory_limit: None,
        })
    }

    #[test]
    fn test_testlib_requires_cpp() {
        assert!(validate_checker(&custom(CheckerInterface::Testlib, "cpp")).is_ok());
        assert!(validate_checker(&custom(CheckerInterface::Testlib, "python")).is_err());
        assert!(validate_checker(&custom(CheckerInterface::Legacy, "python")).is_ok());
    }

    #[test]
    fn test_unknown_language_rejected() {
        assert!(validate_checker(&custom(CheckerInterface::Lemon, "cobol")).is_err());
    }

    #[test]
    fn test_float_precision_bounds() {
        assert!(validate_checker(&CheckerConfig::Floats { precision: 6 }).is_ok());
        assert!(validate_checker(&CheckerConfig::Floats { precision: 40 }).is_err());
    }
}
