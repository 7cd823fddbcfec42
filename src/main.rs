use std::{
    fs,
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::runtime;
use tokio_graceful_shutdown::{errors::SubsystemError, Toplevel};
use tracing::{error, info, warn};

mod checker;
mod compile;
mod conf;
mod entities;
mod exchange;
mod judge;
mod languages;
mod runner;
mod sandbox;
mod scoring;
mod shared;
mod slots;
mod testdata;
mod worker;

/// Exit code asking the outer supervisor to respawn the worker.
const RESTART_EXIT_CODE: i32 = 100;

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .compact()
            .with_line_number(true)
            .with_max_level(tracing::Level::DEBUG)
            .finish(),
    )
    .expect("Failed to initialize the logger");

    info!(
        "Starting with {} task consumers over {} working directories",
        conf::CONFIG.task_consuming_threads,
        conf::CONFIG.task_working_directories.len()
    );
    if conf::CONFIG.task_working_directories.is_empty() {
        panic!("At least one task working directory must be configured");
    }

    info!("Preparing directories under {}", conf::PATHS.root.display());
    {
        // The binary cache does not survive restarts: stale artifacts from a
        // dead process would never be refcounted again.
        if fs::metadata(&conf::PATHS.binaries).is_ok() {
            fs::remove_dir_all(&conf::PATHS.binaries)
                .expect("Error emptying the binary cache store");
        }

        for path in [&conf::PATHS.root, &conf::PATHS.temp, &conf::PATHS.testdata, &conf::PATHS.binaries]
        {
            fs::create_dir_all(path)
                .unwrap_or_else(|err| panic!("Error creating {}: {err}", path.display()));
        }

        for path in &conf::CONFIG.task_working_directories {
            fs::create_dir_all(path)
                .unwrap_or_else(|err| panic!("Error creating {}: {err}", path.display()));
        }
    }

    let restart = Arc::new(AtomicBool::new(false));

    info!("Initializing the runtime");
    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Error building the tokio runtime");

    let result = runtime.block_on({
        let restart = restart.clone();
        async move {
            Toplevel::new()
                .start("worker", move |handle| async move {
                    let connection = exchange::http::connect().await?;
                    worker::worker_main(handle, connection, restart).await
                })
                .catch_signals()
                .handle_shutdown_requests(Duration::from_secs(10))
                .await
        }
    });

    if restart.load(Ordering::SeqCst) {
        warn!("Exiting for a supervisor restart");
        exit(RESTART_EXIT_CODE);
    }

    if let Err(err) = result {
        error!("The worker encountered fatal issue(s):");
        for error in err.get_subsystem_errors() {
            match error {
                SubsystemError::Failed(name, err) => {
                    error!("Subsystem '{}' failed: {:?}", name, err);
                }
                SubsystemError::Cancelled(name) => {
                    error!("Subsystem '{}' was cancelled", name);
                }
                SubsystemError::Panicked(name) => {
                    error!("Subsystem '{}' panicked", name);
                }
            }
        }
        exit(1);
    }
}
