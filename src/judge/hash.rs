use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::{
    compile::BinaryArtifact,
    entities::{CheckerConfig, EffectiveLimits, InteractorConfig},
    shared,
};

/// Stable metadata of the grading side of a testcase. Custom checkers are
/// identified by their compile-task hash rather than their filename, so a
/// renamed but byte-identical checker still dedupes.
pub struct HashContext<'a> {
    pub checker: Option<&'a CheckerConfig>,
    pub checker_binary: Option<&'a Arc<BinaryArtifact>>,
    pub interactor: Option<&'a InteractorConfig>,
    pub interactor_binary: Option<&'a Arc<BinaryArtifact>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum CheckerIdentity<'a> {
    Builtin(&'a CheckerConfig),

    #[serde(rename_all = "camelCase")]
    Custom {
        interface: &'static str,
        language: &'a str,
        options: &'a Value,
        compile_hash: &'a str,
        time_limit: Option<u64>,
        memory_limit: Option<u64>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InteractorIdentity<'a> {
    interface: &'static str,
    shared_memory_size: Option<u64>,
    language: &'a str,
    options: &'a Value,
    compile_hash: &'a str,
    time_limit: Option<u64>,
    memory_limit: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestcaseIdentity<'a> {
    limits: EffectiveLimits,
    input: Option<&'a str>,
    output: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    checker: Option<CheckerIdentity<'a>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    interactor: Option<InteractorIdentity<'a>>,
}

/// Hashes the equivalence class of one testcase execution: effective limits,
/// data content digests and the grading metadata. Equal hashes let the
/// dispatcher reuse results across retried submissions.
pub fn testcase_hash(
    limits: EffectiveLimits,
    input_digest: Option<&str>,
    output_digest: Option<&str>,
    ctx: &HashContext<'_>,
) -> Result<String> {
    let checker = match ctx.checker {
        None => None,
        Some(CheckerConfig::Custom(config)) => {
            let binary =
                ctx.checker_binary.context("The custom checker has no compiled binary")?;
            Some(CheckerIdentity::Custom {
                interface: config.interface.name(),
                language: &config.language,
                options: &config.compile_and_run_options,
                compile_hash: &binary.task_hash,
                time_limit: config.time_limit,
                memory_limit: config.memory_limit,
            })
        }
        Some(config) => Some(CheckerIdentity::Builtin(config)),
    };

    let interactor = match ctx.interactor {
        None => None,
        Some(config) => {
            let binary =
                ctx.interactor_binary.context("The interactor has no compiled binary")?;
            Some(InteractorIdentity {
                interface: config.interface.name(),
                shared_memory_size: config.shared_memory_size,
                language: &config.language,
                options: &config.compile_and_run_options,
                compile_hash: &binary.task_hash,
                time_limit: config.time_limit,
                memory_limit: config.memory_limit,
            })
        }
    };

    let identity =
        TestcaseIdentity { limits, input: input_digest, output: output_digest, checker, interactor };
    Ok(shared::sha256_hex(
        serde_json::to_vec(&identity).context("Error serializing the testcase identity")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::{testcase_hash, HashContext};
    use crate::entities::{CheckerConfig, EffectiveLimits};

    fn context(checker: Option<&CheckerConfig>) -> HashContext<'_> {
        HashContext { checker, checker_binary: None, interactor: None, interactor_binary: None }
    }

    #[test]
    fn test_equal_inputs_equal_hashes() {
        let limits = EffectiveLimits { time_ms: 1000, memory_mib: 256 };
        let checker = CheckerConfig::Lines { case_sensitive: true };

        let a = testcase_hash(limits, Some("abc"), Some("def"), &context(Some(&checker))).unwrap();
        let b = testcase_hash(limits, Some("abc"), Some("def"), &context(Some(&checker))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_limits_change_the_hash() {
        let checker = CheckerConfig::Binary;
        let a = testcase_hash(
            EffectiveLimits { time_ms: 1000, memory_mib: 256 },
            Some("abc"),
            None,
            &context(Some(&checker)),
        )
        .unwrap();
        let b = testcase_hash(
            EffectiveLimits { time_ms: 2000, memory_mib: 256 },
            Some("abc"),
            None,
            &context(Some(&checker)),
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_checker_metadata_changes_the_hash() {
        let limits = EffectiveLimits { time_ms: 1000, memory_mib: 256 };
        let a = testcase_hash(
            limits,
            Some("abc"),
            Some("def"),
            &context(Some(&CheckerConfig::Lines { case_sensitive: true })),
        )
        .unwrap();
        let b = testcase_hash(
            limits,
            Some("abc"),
            Some("def"),
            &context(Some(&CheckerConfig::Lines { case_sensitive: false })),
        )
        .unwrap();
        assert_ne!(a, b);
    }
}
