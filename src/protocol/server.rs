//! The store service: the only process that opens the task database.
//!
//! Each TCP connection gets a reader task that decodes frames into [`Request`]s.
//! Decoded requests travel over one mpsc queue to a single dispatcher task that
//! owns the storage handle, so requests are executed strictly one after another.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::frame::{read_frame, write_json, FrameError};
use super::message::{AddTaskData, Request, Response};
use crate::error::{QueueError, Result};
use crate::schedule::types::{LogQuery, NewTask, TaskStatus};
use crate::storage::{InsertOutcome, LogStorage, TaskStorage, UpdateOutcome};

const DISPATCH_QUEUE_SIZE: usize = 1024;

struct Job {
    request: Request,
    reply: oneshot::Sender<Response>,
}

pub struct StoreService<S> {
    storage: Arc<S>,
}

impl<S> StoreService<S>
where
    S: TaskStorage + LogStorage,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Executes one request against storage.
    pub async fn handle(&self, request: Request) -> Result<Value> {
        match request {
            Request::InitializeStore {} => {
                self.storage.initialize().await?;
                Ok(json!(true))
            }
            Request::AddTask {
                task_id,
                task_type,
                payload,
                depends_on,
            } => {
                let task = NewTask {
                    task_id,
                    task_type,
                    payload,
                    depends_on,
                };
                match self.storage.create(&task).await? {
                    InsertOutcome::Inserted => {
                        info!(task_id = %task.task_id, task_type = %task.task_type, "Task added");
                        Ok(serde_json::to_value(AddTaskData { task_id: task.task_id })?)
                    }
                    InsertOutcome::Duplicate => Err(QueueError::DuplicateTask(task.task_id)),
                }
            }
            Request::ClaimTask {} => {
                let claimed = self.storage.claim_next().await?;
                if let Some(task) = &claimed {
                    info!(task_id = %task.task_id, task_type = %task.task_type, "Task claimed");
                }
                Ok(serde_json::to_value(claimed)?)
            }
            Request::UpdateTaskProgress {
                task_id,
                progress,
                partial_result,
            } => {
                let progress = progress.min(100) as u8;
                let outcome = self
                    .storage
                    .update_progress(&task_id, progress, partial_result.as_ref())
                    .await?;
                acknowledge(task_id, outcome, TaskStatus::Processing)
            }
            Request::UpdateTaskStatus {
                task_id,
                status,
                result,
            } => {
                let outcome = self
                    .storage
                    .update_status(&task_id, status, result.as_ref())
                    .await?;
                if outcome == UpdateOutcome::Applied {
                    info!(task_id = %task_id, status = %status, "Task status updated");
                }
                acknowledge(task_id, outcome, status)
            }
            Request::GetTask { task_id } => Ok(serde_json::to_value(self.storage.get(&task_id).await?)?),
            Request::FindDependentTask { parent_task_id } => Ok(serde_json::to_value(
                self.storage.find_dependent(&parent_task_id).await?,
            )?),
            Request::ListDependentTasks { parent_task_id } => Ok(serde_json::to_value(
                self.storage.list_dependents(&parent_task_id).await?,
            )?),
            Request::ListTasks {} => Ok(serde_json::to_value(self.storage.list().await?)?),
            Request::AnyActiveTasks {} => Ok(json!(self.storage.any_active().await?)),
            Request::AppendLog {
                source,
                level,
                message,
            } => {
                self.storage.append(&source, level, &message).await?;
                Ok(json!(true))
            }
            Request::QueryLogs {
                levels,
                sources,
                limit,
            } => {
                let query = LogQuery {
                    levels,
                    sources,
                    limit,
                };
                Ok(serde_json::to_value(self.storage.query(&query).await?)?)
            }
        }
    }

    async fn respond(&self, request: Request) -> Response {
        let action = request.action();
        match self.handle(request).await {
            Ok(data) => Response::Success { data },
            Err(e) => {
                match &e {
                    QueueError::StoreUnavailable(_) => error!(action = action.as_str(), "Request failed: {}", e),
                    _ => debug!(action = action.as_str(), "Request rejected: {}", e),
                }
                Response::error(&e)
            }
        }
    }

    /// Serves connections until `shutdown` resolves, then stops accepting,
    /// closes the open connections and lets the dispatcher drain its queue.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (jobs, mut queue) = mpsc::channel::<Job>(DISPATCH_QUEUE_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatcher = tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                let response = self.respond(job.request).await;
                // the connection may be gone already; nothing to do then
                let _ = job.reply.send(response);
            }
            debug!("Dispatcher drained");
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        tokio::spawn(handle_connection(stream, jobs.clone(), stop_rx.clone()));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                },
            }
        }

        let _ = stop_tx.send(true);
        drop(jobs);
        if let Err(e) = dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }
        Ok(())
    }
}

fn acknowledge(task_id: String, outcome: UpdateOutcome, to: TaskStatus) -> Result<Value> {
    match outcome {
        UpdateOutcome::Applied => Ok(json!(true)),
        UpdateOutcome::Missing => Err(QueueError::TaskNotFound(task_id)),
        UpdateOutcome::Rejected { current } => Err(QueueError::InvalidTransition {
            task_id,
            from: current,
            to,
        }),
    }
}

async fn handle_connection(stream: TcpStream, jobs: mpsc::Sender<Job>, mut stop: watch::Receiver<bool>) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = stop.changed() => break,
        };

        let (response, keep_open) = match frame {
            Ok(body) => match Request::parse(&body) {
                Ok(request) => (dispatch(&jobs, request).await, true),
                Err(e) => {
                    warn!("Rejected request: {}", e);
                    (Response::error(&e), true)
                }
            },
            // the rest of an oversized frame can't be skipped reliably
            Err(FrameError::FrameTooLarge(size)) => {
                warn!(size, "Oversized frame, closing connection");
                let e = QueueError::from(FrameError::FrameTooLarge(size));
                (Response::error(&e), false)
            }
            Err(FrameError::ConnectionClosed) => break,
            Err(FrameError::Io(e)) => {
                debug!("Connection read failed: {}", e);
                break;
            }
        };

        if let Err(e) = write_json(&mut writer, &response).await {
            debug!("Connection write failed: {}", e);
            break;
        }
        if !keep_open {
            break;
        }
    }
}

async fn dispatch(jobs: &mpsc::Sender<Job>, request: Request) -> Response {
    let (reply, response) = oneshot::channel();
    if jobs.send(Job { request, reply }).await.is_err() {
        return Response::error(&QueueError::StoreUnavailable("store is shutting down".to_string()));
    }
    response.await.unwrap_or_else(|_| {
        Response::error(&QueueError::StoreUnavailable("request dropped during shutdown".to_string()))
    })
}
