use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Result};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, instrument};
use triggered::Listener;
use uuid::Uuid;

pub use self::cache::{BinaryArtifact, BinaryCache};
use crate::{
    conf,
    entities::{CompileProgress, OmittableString},
    languages::{Language, BINARY_MOUNT, EXTRA_INFO_FILENAME, SOURCE_MOUNT, WORKING_MOUNT},
    sandbox::{
        self, AffinityKind, ExecutionStatus, MountParams, Redirection, SandboxCommand,
        SandboxParams,
    },
    shared::{self, Cancelled},
    slots::TaskSlots,
};

mod cache;

/// An extra file compiled alongside the main source, e.g. a grader or a
/// bundled header. The content id participates in the task identity.
#[derive(Debug, Clone)]
pub struct ExtraSource {
    pub filename: String,
    pub content_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CompileTask {
    pub language: Language,
    pub code: String,
    pub options: Value,
    pub extra_sources: Vec<ExtraSource>,
}

#[derive(Serialize)]
struct TaskIdentity<'a> {
    language: &'static str,
    code: &'a str,
    options: &'a Value,
    extra_sources: Vec<(&'a str, &'a str)>,
}

impl CompileTask {
    /// Content hash identifying the equivalence class of this compile.
    pub fn cache_key(&self) -> String {
        let mut extra_sources: Vec<_> = self
            .extra_sources
            .iter()
            .map(|source| (source.filename.as_str(), source.content_id.as_str()))
            .collect();
        extra_sources.sort();

        let identity = TaskIdentity {
            language: self.language.tag(),
            code: &self.code,
            options: &self.options,
            extra_sources,
        };
        shared::sha256_hex(serde_json::to_vec(&identity).expect("Error serializing the identity"))
    }
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Success(Arc<BinaryArtifact>),
    Failure { message: OmittableString },
}

impl CompileOutcome {
    pub fn progress(&self) -> CompileProgress {
        match self {
            Self::Success(artifact) => {
                CompileProgress { success: true, message: artifact.message.clone() }
            }
            Self::Failure { message } => {
                CompileProgress { success: false, message: message.clone() }
            }
        }
    }
}

type SharedCompile = Shared<BoxFuture<'static, Result<CompileOutcome, String>>>;

/// Deduplicating front of the binary cache. At most one compile per task
/// hash is in flight; concurrent callers subscribe to it and every caller
/// receives an independently-referenced outcome.
pub struct CompileService {
    cache: Arc<BinaryCache>,
    slots: Arc<TaskSlots>,
    inflight: Arc<Mutex<HashMap<String, SharedCompile>>>,
}

impl CompileService {
    pub fn new(slots: Arc<TaskSlots>) -> Self {
        Self {
            cache: Arc::new(BinaryCache::new(conf::CONFIG.binary_cache_max_size)),
            slots,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[instrument(skip_all, fields(language = task.language.tag()))]
    pub async fn compile(
        &self,
        task: CompileTask,
        message_limit: usize,
        abort: Listener,
    ) -> Result<CompileOutcome> {
        let key = task.cache_key();

        if let Some(artifact) = self.cache.get(&key) {
            debug!(task_hash = key, "Compile cache hit");
            return Ok(CompileOutcome::Success(artifact));
        }

        let shared = {
            let mut inflight = self.inflight.lock().unwrap();

            // A concurrent compile may have completed between the cache miss
            // and taking the lock.
            if let Some(artifact) = self.cache.get(&key) {
                return Ok(CompileOutcome::Success(artifact));
            }

            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    // The compile is detached from any subscriber so a
                    // canceled submission does not starve the others.
                    let join_handle = tokio::spawn({
                        let cache = self.cache.clone();
                        let slots = self.slots.clone();
                        let inflight = self.inflight.clone();
                        let key = key.clone();
                        async move {
                            let result = run_compile(cache, slots, task, message_limit)
                                .await
                                .map_err(|err| format!("{err:#}"));
                            inflight.lock().unwrap().remove(&key);
                            result
                        }
                    });

                    let shared: SharedCompile = async move {
                        match join_handle.await {
                            Ok(result) => result,
                            Err(err) => Err(format!("The compile task died: {err:#}")),
                        }
                    }
                    .boxed()
                    .shared();

                    inflight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        tokio::select! {
            _ = abort => bail!(Cancelled),
            result = shared => match result {
                Ok(outcome) => Ok(outcome),
                Err(message) => bail!("Error running the compile: {message}"),
            },
        }
    }
}

async fn run_compile(
    cache: Arc<BinaryCache>,
    slots: Arc<TaskSlots>,
    task: CompileTask,
    message_limit: usize,
) -> Result<CompileOutcome> {
    // The compile itself is never canceled; keep the trigger alive so the
    // listener stays quiet.
    let (_trigger, listener) = triggered::trigger();
    let key = task.cache_key();

    slots
        .run_queued(|slot| async move {
            let source_directory = slot.directory.join("source");
            let output_directory = slot.directory.join("binary");
            let working_directory = slot.directory.join("working");
            let message_path = slot.directory.join("message.txt");
            for directory in [&source_directory, &output_directory, &working_directory] {
                fs::create_dir_all(directory).await?;
            }

            fs::write(source_directory.join(task.language.source_filename()), &task.code)
                .await
                .context("Error writing the source file")?;
            for source in &task.extra_sources {
                fs::copy(&source.path, source_directory.join(&source.filename))
                    .await
                    .with_context(|| {
                        format!("Error copying the extra source {}", source.filename)
                    })?;
            }

            let (time_limit_ms, memory_limit_kib) = task.language.compile_limits();
            let params = {
                let mut params = SandboxParams::new(
                    SandboxCommand::Script(task.language.compile_script(&task.options)),
                    AffinityKind::Compiler,
                );
                params.stdout = Some(Redirection::File(message_path.clone()));
                params.mounts = vec![
                    MountParams {
                        from: source_directory,
                        to: SOURCE_MOUNT.into(),
                        read_only: true,
                    },
                    MountParams {
                        from: output_directory.clone(),
                        to: BINARY_MOUNT.into(),
                        read_only: false,
                    },
                    MountParams {
                        from: working_directory,
                        to: WORKING_MOUNT.into(),
                        read_only: false,
                    },
                ];
                params.cwd = WORKING_MOUNT.into();
                params.time_limit_ms = time_limit_ms;
                params.memory_limit_kib = memory_limit_kib;
                params.max_processes = 32;
                params
            };

            let report = sandbox::run(params, listener).await?;
            let message = shared::file::read_preview(&message_path, message_limit).await?;

            if !matches!(report.status, ExecutionStatus::Ok) {
                return Ok(CompileOutcome::Failure {
                    message: OmittableString {
                        data: format!("{}\n{}", report.status.name(), message.data),
                        omitted_bytes: message.omitted_bytes,
                    },
                });
            }

            if report.exit_code != 0 {
                return Ok(CompileOutcome::Failure { message });
            }

            let extra_info = {
                let path = output_directory.join(EXTRA_INFO_FILENAME);
                match fs::read_to_string(&path).await {
                    Err(_) => None,
                    Ok(content) => {
                        fs::remove_file(&path).await?;
                        Some(content.trim().to_string())
                    }
                }
            };

            let size = shared::file::directory_size(&output_directory).await?;
            let size_limit =
                task.language.binary_size_limit().min(conf::CONFIG.binary_cache_max_size);
            if size > size_limit {
                return Ok(CompileOutcome::Failure {
                    message: OmittableString {
                        data: format!(
                            "The compiled binary is too large: {size} bytes exceeds the \
                             {size_limit} bytes limit\n{}",
                            message.data
                        ),
                        omitted_bytes: message.omitted_bytes,
                    },
                });
            }

            let directory = conf::PATHS.binaries.join(Uuid::new_v4().to_string());
            shared::file::copy_directory(&output_directory, &directory)
                .await
                .context("Error copying the binary into the cache store")?;

            let artifact = Arc::new(BinaryArtifact {
                task_hash: key.clone(),
                message,
                directory,
                size,
                extra_info,
            });
            cache.insert(key, artifact.clone());

            Ok(CompileOutcome::Success(artifact))
        })
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CompileTask, ExtraSource};
    use crate::languages::Language;

    fn make_task(code: &str, extra: Vec<ExtraSource>) -> CompileTask {
        CompileTask {
            language: Language::Cpp,
            code: code.to_string(),
            options: json!({"std": "c++17"}),
            extra_sources: extra,
        }
    }

    #[test]
    fn test_cache_key_is_stable() {
        let a = make_task("int main() {}", vec![]);
        let b = make_task("int main() {}", vec![]);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_depends_on_code_and_options() {
        let a = make_task("int main() {}", vec![]);
        let b = make_task("int main() { return 1; }", vec![]);
        assert_ne!(a.cache_key(), b.cache_key());

        let mut c = make_task("int main() {}", vec![]);
        c.options = json!({"std": "c++20"});
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_cache_key_ignores_extra_source_order() {
        let first = ExtraSource {
            filename: "a.h".to_string(),
            content_id: "1".repeat(64),
            path: "/store/a".into(),
        };
        let second = ExtraSource {
            filename: "b.h".to_string(),
            content_id: "2".repeat(64),
            path: "/store/b".into(),
        };

        let a = make_task("int main() {}", vec![first.clone(), second.clone()]);
        let b = make_task("int main() {}", vec![second, first]);
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
