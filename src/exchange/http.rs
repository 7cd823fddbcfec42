use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{ClientMessage, DispatcherConnection, ServerMessage, ServerSideLimits};
use crate::{conf, entities::SubmissionTask, shared};

const CHANNEL_CAPACITY: usize = 64;
const POLL_FAILURE_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizedBody {
    name: String,
    token: String,
    limits: ServerSideLimits,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Task { thread_index: usize, task: Box<SubmissionTask>, ack_id: String },

    #[serde(rename_all = "camelCase")]
    Cancel { task_id: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileUrlsBody {
    urls: Vec<String>,
}

/// Establishes the dispatcher channel over http long-polling: one poll loop
/// pulling server events, one push loop delivering client messages. The
/// worker loop only ever sees the message-oriented contract.
pub async fn connect() -> Result<DispatcherConnection> {
    let client = shared::http::build_http_client();
    let base = conf::CONFIG.server_url.trim_end_matches('/').to_string();

    let (incoming_tx, incoming_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);

    let response = client
        .post(format!("{base}/api/judge/authorize"))
        .json(&serde_json::json!({ "key": conf::CONFIG.key }))
        .timeout(Duration::from_millis(conf::CONFIG.rpc_timeout_ms))
        .send()
        .await
        .context("Error reaching the dispatcher")?;

    if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        incoming_tx.try_send(ServerMessage::AuthFailed).ok();
        return Ok(DispatcherConnection { incoming: incoming_rx, outgoing: outgoing_tx });
    }

    let body: AuthorizedBody = response
        .error_for_status()
        .context("The authorization failed")?
        .json()
        .await
        .context("Error parsing the authorization response")?;
    info!(name = body.name, "Authorized by the dispatcher");

    incoming_tx
        .try_send(ServerMessage::Authorized { name: body.name, limits: body.limits })
        .ok();

    tokio::spawn(poll_loop(client.clone(), base.clone(), body.token.clone(), incoming_tx));
    tokio::spawn(push_loop(client, base, body.token, outgoing_rx));

    Ok(DispatcherConnection { incoming: incoming_rx, outgoing: outgoing_tx })
}

/// Pulls server events until the dispatcher stops answering. Dropping the
/// incoming sender closes the channel, which the worker loop treats as a
/// lost dispatcher.
async fn poll_loop(
    client: Client,
    base: String,
    token: String,
    incoming_tx: mpsc::Sender<ServerMessage>,
) {
    let mut consecutive_failures = 0usize;

    loop {
        let response = client
            .get(format!("{base}/api/judge/poll"))
            .bearer_auth(&token)
            .timeout(Duration::from_millis(
                conf::CONFIG.rpc_timeout_ms + 30_000,
            ))
            .send()
            .await;

        let events: Vec<ServerEvent> = match async {
            anyhow::Ok(response?.error_for_status()?.json().await?)
        }
        .await
        {
            Err(err) => {
                consecutive_failures += 1;
                warn!(consecutive_failures, "Error polling the dispatcher: {err:#}");
                if consecutive_failures >= POLL_FAILURE_LIMIT {
                    error!("Giving up on the dispatcher");
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            Ok(events) => {
                consecutive_failures = 0;
                events
            }
        };

        for event in events {
            let message = match event {
                ServerEvent::Cancel { task_id } => ServerMessage::Cancel { task_id },
                ServerEvent::Task { thread_index, task, ack_id } => {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    tokio::spawn({
                        let client = client.clone();
                        let base = base.clone();
                        let token = token.clone();
                        async move {
                            if ack_rx.await.is_err() {
                                return;
                            }
                            let result = client
                                .post(format!("{base}/api/judge/ack"))
                                .bearer_auth(&token)
                                .json(&serde_json::json!({ "ackId": ack_id }))
                                .send()
                                .await
                                .and_then(|response| response.error_for_status());
                            if let Err(err) = result {
                                // The dispatcher redelivers unacknowledged
                                // tasks, nothing else to do.
                                warn!("Error delivering the ack: {err:#}");
                            }
                        }
                    });
                    ServerMessage::Task { thread_index, task, ack: ack_tx }
                }
            };

            if incoming_tx.send(message).await.is_err() {
                return;
            }
        }
    }
}

async fn push_loop(
    client: Client,
    base: String,
    token: String,
    mut outgoing_rx: mpsc::Receiver<ClientMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        let result = match message {
            ClientMessage::Ready => post(&client, &base, &token, "ready", serde_json::json!({}))
                .await
                .map(|_| ()),
            ClientMessage::Consume { thread_index } => {
                post(
                    &client,
                    &base,
                    &token,
                    "consume",
                    serde_json::json!({ "threadIndex": thread_index }),
                )
                .await
                .map(|_| ())
            }
            ClientMessage::Progress { task_id, snapshot } => {
                post(
                    &client,
                    &base,
                    &token,
                    "progress",
                    serde_json::json!({ "taskId": task_id, "progress": snapshot }),
                )
                .await
                .map(|_| ())
            }
            ClientMessage::SystemInfo { info } => {
                post(&client, &base, &token, "system-info", serde_json::json!({ "info": info }))
                    .await
                    .map(|_| ())
            }
            ClientMessage::RequestFiles { content_ids, reply } => {
                match post(
                    &client,
                    &base,
                    &token,
                    "files",
                    serde_json::json!({ "contentIds": content_ids }),
                )
                .await
                {
                    Err(err) => Err(err),
                    Ok(response) => match response.json::<FileUrlsBody>().await {
                        Err(err) => Err(err.into()),
                        Ok(body) => {
                            // A dropped reply means the requester timed out.
                            _ = reply.send(body.urls);
                            Ok(())
                        }
                    },
                }
            }
        };

        if let Err(err) = result {
            debug!("Error delivering a client message: {err:#}");
        }
    }
}

async fn post(
    client: &Client,
    base: &str,
    token: &str,
    endpoint: &str,
    body: serde_json::Value,
) -> Result<reqwest::Response> {
    let response = client
        .post(format!("{base}/api/judge/{endpoint}"))
        .bearer_auth(token)
        .json(&body)
        .timeout(Duration::from_millis(conf::CONFIG.rpc_timeout_ms))
        .send()
        .await?;

    match response.error_for_status() {
        Err(err) => bail!(err),
        Ok(response) => Ok(response),
    }
}
