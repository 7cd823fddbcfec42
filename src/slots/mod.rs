use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::shared;

/// Bounds concurrent testcase executions to the configured working
/// directories. Acquisitions are served in fifo order; a permit and its
/// directory are returned on every exit path, including cancellation.
pub struct TaskSlots {
    semaphore: Semaphore,
    directories: Mutex<Vec<PathBuf>>,
}

/// An exclusively held working directory plus a disposer collecting cleanup
/// closures (pipe ends, shared memory) to run when the lease ends.
pub struct Slot {
    pub directory: PathBuf,
    disposer: Disposer,
}

impl Slot {
    /// Registers a cleanup closure, run unconditionally when the slot is
    /// released.
    pub fn defer(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.disposer.defer(cleanup);
    }
}

#[derive(Default)]
struct Disposer {
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Disposer {
    fn defer(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().unwrap().push(Box::new(cleanup));
    }

    fn dispose(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock().unwrap());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
    }
}

impl TaskSlots {
    pub fn new(directories: Vec<PathBuf>, max_concurrent_tasks: usize) -> Self {
        let permits = directories.len().min(max_concurrent_tasks).max(1);
        Self { semaphore: Semaphore::new(permits), directories: Mutex::new(directories) }
    }

    /// Waits for a permit and a free working directory, empties the
    /// directory and runs `task` with the slot.
    pub async fn run_queued<F, Fut, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(Arc<Slot>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let _permit = self.semaphore.acquire().await.context("The slot semaphore was closed")?;

        let directory = self
            .directories
            .lock()
            .unwrap()
            .pop()
            .context("No working directory available despite a granted permit")?;

        let result = async {
            shared::file::empty_directory(&directory)
                .await
                .context("Error emptying the working directory")?;

            let slot =
                Arc::new(Slot { directory: directory.clone(), disposer: Disposer::default() });
            let result = task(slot.clone()).await;
            slot.disposer.dispose();
            result
        }
        .await;

        if let Err(err) = &result {
            warn!(directory = %directory.display(), "Slot task returned an error: {err:#}");
        }
        self.directories.lock().unwrap().push(directory);

        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use anyhow::bail;
    use tokio::fs;

    use super::TaskSlots;

    fn make_slots(count: usize, max_concurrent: usize) -> (tempfile::TempDir, TaskSlots) {
        let root = tempfile::tempdir().unwrap();
        let directories = (0..count)
            .map(|i| {
                let path = root.path().join(format!("slot-{i}"));
                std::fs::create_dir_all(&path).unwrap();
                path
            })
            .collect();
        (root, TaskSlots::new(directories, max_concurrent))
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let (_root, slots) = make_slots(4, 2);
        let slots = Arc::new(slots);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let slots = slots.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    slots
                        .run_queued(|_slot| async {
                            let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(current, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_slot_is_emptied() {
        let (_root, slots) = make_slots(1, 1);

        slots
            .run_queued(|slot| async move {
                fs::write(slot.directory.join("leftover.txt"), "junk").await.unwrap();
                Ok(())
            })
            .await
            .unwrap();

        slots
            .run_queued(|slot| async move {
                assert!(fs::metadata(slot.directory.join("leftover.txt")).await.is_err());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disposer_runs_on_error() {
        let (_root, slots) = make_slots(1, 1);
        let disposed = Arc::new(AtomicUsize::new(0));

        let result: anyhow::Result<()> = slots
            .run_queued(|slot| {
                let disposed = disposed.clone();
                async move {
                    slot.defer(move || {
                        disposed.fetch_add(1, Ordering::SeqCst);
                    });
                    bail!("boom")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        // The directory must be back in rotation.
        slots.run_queued(|_slot| async { Ok(()) }).await.unwrap();
    }
}
