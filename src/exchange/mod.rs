use std::{
    fmt::{self, Display},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

pub use self::info::{gather_system_info, SystemInfo};
use crate::{conf, entities::ProgressSnapshot};

pub mod http;
mod info;

/// Byte caps the dispatcher imposes on user-visible payloads, delivered with
/// the authorization handshake.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSideLimits {
    pub compiler_message: u64,
    pub output_size: u64,
    pub data_display: u64,
    pub data_display_for_submit_answer: u64,
    pub stderr_display: u64,
}

impl Default for ServerSideLimits {
    fn default() -> Self {
        Self {
            compiler_message: 256 * 1024,
            output_size: 100 * 1024 * 1024,
            data_display: 1024,
            data_display_for_submit_answer: 16 * 1024,
            stderr_display: 5 * 1024,
        }
    }
}

/// Messages flowing to the dispatcher. The transport adapter serializes them
/// at its boundary; in-process they carry reply channels directly.
#[derive(Debug)]
pub enum ClientMessage {
    Ready,

    /// A consumer announces it is free to take a task.
    Consume { thread_index: usize },

    Progress { task_id: String, snapshot: ProgressSnapshot },

    RequestFiles { content_ids: Vec<String>, reply: oneshot::Sender<Vec<String>> },

    SystemInfo { info: SystemInfo },
}

/// Messages flowing from the dispatcher.
#[derive(Debug)]
pub enum ServerMessage {
    Authorized { name: String, limits: ServerSideLimits },

    AuthFailed,

    Task {
        thread_index: usize,
        task: Box<crate::entities::SubmissionTask>,
        /// One-shot acknowledgment; a dropped or duplicate ack is discarded
        /// by the dispatcher, which will redeliver the task.
        ack: oneshot::Sender<()>,
    },

    Cancel { task_id: String },
}

/// The long-lived bidirectional channel to the dispatcher, as handed to the
/// worker loop. The network transport behind it is an adapter detail.
pub struct DispatcherConnection {
    pub incoming: mpsc::Receiver<ServerMessage>,
    pub outgoing: mpsc::Sender<ClientMessage>,
}

/// Raised when the dispatcher stops answering; the worker cancels everything
/// and restarts the process.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherLost;

impl Display for DispatcherLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The connection to the dispatcher was lost")
    }
}

impl std::error::Error for DispatcherLost {}

/// Cloneable sending side of the dispatcher channel.
#[derive(Clone)]
pub struct DispatcherHandle {
    outgoing: mpsc::Sender<ClientMessage>,
}

impl DispatcherHandle {
    pub fn new(outgoing: mpsc::Sender<ClientMessage>) -> Self {
        Self { outgoing }
    }

    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.outgoing.send(message).await.is_err() {
            bail!(DispatcherLost);
        }
        Ok(())
    }

    /// Resolves content ids to download urls. An unanswered rpc within the
    /// configured timeout means the dispatcher is dead.
    pub async fn request_files(&self, content_ids: Vec<String>) -> Result<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ClientMessage::RequestFiles { content_ids: content_ids.clone(), reply: reply_tx })
            .await?;

        let urls = match timeout(Duration::from_millis(conf::CONFIG.rpc_timeout_ms), reply_rx)
            .await
        {
            Err(_) | Ok(Err(_)) => bail!(DispatcherLost),
            Ok(Ok(urls)) => urls,
        };

        if urls.len() != content_ids.len() {
            bail!(
                "The dispatcher returned {} urls for {} content ids",
                urls.len(),
                content_ids.len()
            );
        }
        Ok(urls)
    }

    pub async fn send_progress(&self, task_id: String, snapshot: ProgressSnapshot) -> Result<()> {
        self.send(ClientMessage::Progress { task_id, snapshot }).await
    }

    pub async fn announce_system_info(&self) -> Result<()> {
        let info = gather_system_info().await.context("Error gathering the system info")?;
        self.send(ClientMessage::SystemInfo { info }).await
    }
}
