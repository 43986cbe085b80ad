//! Cloneable handle for sending tasks through the job socket

use tokio::sync::{mpsc, oneshot, watch};

use crate::metrics::ChannelStats;
use crate::protocol::{Response, TaskRequest};
use crate::session::{
    ChannelError, ChannelState, RequestHandlers, SendOutcome, StreamHandler, TaskEvent,
};

use super::websocket::Command;

/// Handle passed to every component that needs to send tasks
#[derive(Clone)]
pub struct TaskClient {
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ChannelState>,
}

impl TaskClient {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        status_rx: watch::Receiver<ChannelState>,
    ) -> Self {
        Self {
            commands,
            status_rx,
        }
    }

    /// Current channel state
    pub fn status(&self) -> ChannelState {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to channel state changes
    pub fn status_watch(&self) -> watch::Receiver<ChannelState> {
        self.status_rx.clone()
    }

    /// Wait until the session is established
    pub async fn wait_ready(&self) -> Result<(), ChannelError> {
        let mut status = self.status_rx.clone();
        loop {
            match &*status.borrow_and_update() {
                ChannelState::Ready => return Ok(()),
                ChannelState::Closed => {
                    return Err(ChannelError::Closed("session never became ready".to_string()));
                }
                _ => {}
            }
            if status.changed().await.is_err() {
                return Err(ChannelError::Closed("job socket task ended".to_string()));
            }
        }
    }

    /// Send a task and stream every frame addressed to it
    pub async fn send_task(&self, request: TaskRequest) -> Result<TaskResponses, ChannelError> {
        let (handler, events) = StreamHandler::new();
        let outcome = self
            .submit(request, Some(RequestHandlers::new(handler)))
            .await?;
        Ok(TaskResponses { outcome, events })
    }

    /// Send a task with explicit callbacks
    pub async fn send_with(
        &self,
        request: TaskRequest,
        handlers: RequestHandlers,
    ) -> Result<SendOutcome, ChannelError> {
        self.submit(request, Some(handlers)).await
    }

    /// Send a task without registering for its responses
    pub async fn send_detached(&self, request: TaskRequest) -> Result<SendOutcome, ChannelError> {
        self.submit(request, None).await
    }

    /// Snapshot of the channel counters
    pub async fn stats(&self) -> Option<ChannelStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Close the connection; later sends fail with `Closed`
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn submit(
        &self,
        request: TaskRequest,
        handlers: Option<RequestHandlers>,
    ) -> Result<SendOutcome, ChannelError> {
        let label = request.label();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                request,
                handlers,
                reply,
            })
            .map_err(|_| ChannelError::Closed(label.clone()))?;
        rx.await.map_err(|_| ChannelError::Closed(label))?
    }
}

/// Frames for one request, ending after its terminal frame
pub struct TaskResponses {
    outcome: SendOutcome,
    events: mpsc::UnboundedReceiver<TaskEvent>,
}

impl TaskResponses {
    /// Whether the request went out immediately or was queued
    pub fn outcome(&self) -> SendOutcome {
        self.outcome
    }

    /// Next frame; `None` once the terminal frame was delivered or the
    /// connection closed
    pub async fn next(&mut self) -> Option<Result<Response, ChannelError>> {
        match self.events.recv().await? {
            TaskEvent::Response(response) => Some(Ok(response)),
            TaskEvent::Expired(request_id) => Some(Err(ChannelError::Expired(request_id))),
        }
    }

    /// Drain the stream and return the last frame received
    pub async fn finish(mut self) -> Result<Response, ChannelError> {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event?);
        }
        last.ok_or_else(|| {
            ChannelError::Closed("connection closed before a response arrived".to_string())
        })
    }
}
