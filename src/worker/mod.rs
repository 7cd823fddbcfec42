use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, error, info, instrument, warn};

pub use self::cancellation::CancellationRegistry;
use crate::{
    compile::CompileService,
    conf,
    entities::SubmissionTask,
    exchange::{
        ClientMessage, DispatcherConnection, DispatcherHandle, DispatcherLost, ServerMessage,
    },
    judge::{self, JudgeServices, ProgressReporter},
    shared,
    slots::TaskSlots,
    testdata::TestdataStore,
};

mod cancellation;

type TaskDelivery = (Box<SubmissionTask>, oneshot::Sender<()>);

/// Runs the task consumers against an authorized dispatcher connection. When
/// the connection dies, everything in flight is canceled and `restart` is
/// raised so the process restarts from a clean slate.
pub async fn worker_main(
    handle: SubsystemHandle,
    mut connection: DispatcherConnection,
    restart: Arc<AtomicBool>,
) -> Result<()> {
    let limits = match connection.incoming.recv().await {
        Some(ServerMessage::Authorized { name, limits }) => {
            info!(name, "The dispatcher accepted this worker");
            limits
        }
        Some(ServerMessage::AuthFailed) => bail!("The dispatcher rejected the key"),
        _ => bail!("The dispatcher closed the connection during the handshake"),
    };

    let dispatcher = DispatcherHandle::new(connection.outgoing.clone());
    dispatcher.announce_system_info().await?;
    dispatcher.send(ClientMessage::Ready).await?;

    let slots = Arc::new(TaskSlots::new(
        conf::CONFIG.task_working_directories.clone(),
        conf::CONFIG.max_concurrent_tasks,
    ));
    let services = Arc::new(JudgeServices {
        compiler: Arc::new(CompileService::new(slots.clone())),
        slots,
        testdata: Arc::new(TestdataStore::new(
            conf::PATHS.testdata.clone(),
            shared::http::build_http_client(),
        )),
        dispatcher: dispatcher.clone(),
        limits,
    });
    let registry = Arc::new(CancellationRegistry::new());

    let mut queues: Vec<mpsc::Sender<TaskDelivery>> = vec![];
    for index in 0..conf::CONFIG.task_consuming_threads {
        let (queue_tx, queue_rx) = mpsc::channel::<TaskDelivery>(1);
        queues.push(queue_tx);

        let services = services.clone();
        let registry = registry.clone();
        let dispatcher = dispatcher.clone();
        let restart = restart.clone();
        handle.start(&format!("consumer-{index}"), move |handle| {
            consumer_main(handle, index, queue_rx, services, registry, dispatcher, restart)
        });
    }

    loop {
        tokio::select! {
            _ = handle.on_shutdown_requested() => return Ok(()),
            message = connection.incoming.recv() => match message {
                None => {
                    warn!("The dispatcher connection was closed, restarting");
                    registry.cancel_all();
                    restart.store(true, Ordering::SeqCst);
                    bail!(DispatcherLost);
                }
                Some(ServerMessage::Cancel { task_id }) => {
                    info!(task_id, "Canceling a task");
                    registry.cancel(&task_id);
                }
                Some(ServerMessage::Task { thread_index, task, ack }) => {
                    match queues.get(thread_index) {
                        None => warn!(thread_index, "Got a task for an unknown consumer"),
                        Some(queue) => {
                            if queue.try_send((task, ack)).is_err() {
                                // The dispatcher assigned a task to a busy
                                // consumer; dropping the ack makes it retry.
                                warn!(thread_index, "The consumer is busy, dropping the task");
                            }
                        }
                    }
                }
                Some(other) => {
                    warn!("Unexpected dispatcher message: {other:?}");
                }
            }
        }
    }
}

#[instrument(skip_all, fields(consumer = index))]
async fn consumer_main(
    handle: SubsystemHandle,
    index: usize,
    mut queue_rx: mpsc::Receiver<TaskDelivery>,
    services: Arc<JudgeServices>,
    registry: Arc<CancellationRegistry>,
    dispatcher: DispatcherHandle,
    restart: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if dispatcher.send(ClientMessage::Consume { thread_index: index }).await.is_err() {
            // The outgoing channel died with the connection; the router is
            // already restarting the process.
            return Ok(());
        }

        let (task, ack) = tokio::select! {
            _ = handle.on_shutdown_requested() => return Ok(()),
            delivery = queue_rx.recv() => match delivery {
                None => return Ok(()),
                Some(delivery) => delivery,
            },
        };

        debug!(task_id = task.id, "Judging a task");
        let abort = registry.register(&task.id);

        let reporter = ProgressReporter::new({
            let dispatcher = dispatcher.clone();
            let task_id = task.id.clone();
            move |snapshot| {
                let dispatcher = dispatcher.clone();
                let task_id = task_id.clone();
                async move {
                    if let Err(err) = dispatcher.send_progress(task_id, snapshot).await {
                        debug!("Error reporting progress: {err:#}");
                    }
                }
                .boxed()
            }
        });

        let result = judge::judge_submission(&services, &task, abort, &reporter).await;
        registry.deregister(&task.id);

        match result {
            Ok(()) => {}
            Err(err) if shared::is_cancelled(&err) => {
                info!(task_id = task.id, "The task was canceled");
            }
            Err(err) if err.chain().any(|cause| cause.is::<DispatcherLost>()) => {
                warn!(task_id = task.id, "The dispatcher stopped answering, restarting");
                registry.cancel_all();
                restart.store(true, Ordering::SeqCst);
                return Err(err);
            }
            Err(err) => {
                error!(task_id = task.id, "Error judging the task: {err:#}");
            }
        }

        // A lost ack is fine: the dispatcher redelivers the task and equal
        // testcase hashes let it reuse the results.
        if ack.send(()).is_err() {
            warn!(task_id = task.id, "Could not acknowledge the task");
        }
    }
}
