//! Callbacks invoked by the session channel
//!
//! Channel-level defaults cover control frames and uncorrelated pushes.
//! Each request can carry its own result callback and override any of the
//! control handlers for frames that reference it.

use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{ControlKind, RequestId, Response};

/// Handler for ERROR/notification/warning frames
///
/// `Break` consumes the frame. `Continue` hands it on to the request's result
/// callback, or to the receive handler when the frame is uncorrelated.
pub type ControlHandler = Box<dyn FnMut(&Response) -> ControlFlow<()> + Send>;

/// Handler for frames that match no pending request
pub type ReceiveHandler = Box<dyn FnMut(&Response) + Send>;

/// One-shot user-visible alert
pub type AlertHandler = Box<dyn FnMut(&str) + Send>;

/// Receives every result frame for one request
pub trait ResponseHandler: Send {
    fn on_response(&mut self, response: &Response);

    /// Called when the request is dropped without a terminal frame
    fn on_expired(&mut self, _request_id: RequestId) {}
}

impl<F> ResponseHandler for F
where
    F: FnMut(&Response) + Send,
{
    fn on_response(&mut self, response: &Response) {
        self(response)
    }
}

/// Item yielded to stream-based consumers
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Response(Response),
    Expired(RequestId),
}

/// Forwards frames into an unbounded channel
pub struct StreamHandler {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl StreamHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseHandler for StreamHandler {
    fn on_response(&mut self, response: &Response) {
        // Receiver gone means the caller stopped listening
        let _ = self.tx.send(TaskEvent::Response(response.clone()));
    }

    fn on_expired(&mut self, request_id: RequestId) {
        let _ = self.tx.send(TaskEvent::Expired(request_id));
    }
}

/// Callbacks attached to a single request
pub struct RequestHandlers {
    pub(crate) on_result: Box<dyn ResponseHandler>,
    on_error: Option<ControlHandler>,
    on_notification: Option<ControlHandler>,
    on_warning: Option<ControlHandler>,
}

impl RequestHandlers {
    pub fn new(on_result: impl ResponseHandler + 'static) -> Self {
        Self {
            on_result: Box::new(on_result),
            on_error: None,
            on_notification: None,
            on_warning: None,
        }
    }

    /// Build handlers from a plain closure
    pub fn callback(on_result: impl FnMut(&Response) + Send + 'static) -> Self {
        Self::new(on_result)
    }

    /// Override the channel's ERROR handler for this request
    pub fn on_error(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Override the channel's notification handler for this request
    pub fn on_notification(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_notification = Some(Box::new(handler));
        self
    }

    /// Override the channel's warning handler for this request
    pub fn on_warning(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_warning = Some(Box::new(handler));
        self
    }

    pub(crate) fn control_override(&mut self, kind: ControlKind) -> Option<&mut ControlHandler> {
        match kind {
            ControlKind::Error => self.on_error.as_mut(),
            ControlKind::Notification => self.on_notification.as_mut(),
            ControlKind::Warning => self.on_warning.as_mut(),
            ControlKind::Initialize => None,
        }
    }
}

/// Channel-level handlers
pub struct ChannelHandlers {
    on_error: ControlHandler,
    on_notification: ControlHandler,
    on_warning: ControlHandler,
    on_receive: ReceiveHandler,
    on_close_warning: AlertHandler,
}

impl ChannelHandlers {
    pub fn with_error_handler(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_error = Box::new(handler);
        self
    }

    pub fn with_notification_handler(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_notification = Box::new(handler);
        self
    }

    pub fn with_warning_handler(
        mut self,
        handler: impl FnMut(&Response) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        self.on_warning = Box::new(handler);
        self
    }

    /// Handler for uncorrelated frames and server pushes
    pub fn with_receive_handler(mut self, handler: impl FnMut(&Response) + Send + 'static) -> Self {
        self.on_receive = Box::new(handler);
        self
    }

    /// Alert shown the first time a task is sent on a closed channel
    pub fn with_close_warning(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_close_warning = Box::new(handler);
        self
    }

    pub(crate) fn control(&mut self, kind: ControlKind) -> Option<&mut ControlHandler> {
        match kind {
            ControlKind::Error => Some(&mut self.on_error),
            ControlKind::Notification => Some(&mut self.on_notification),
            ControlKind::Warning => Some(&mut self.on_warning),
            ControlKind::Initialize => None,
        }
    }

    pub(crate) fn receive(&mut self, response: &Response) {
        (self.on_receive)(response)
    }

    pub(crate) fn close_warning(&mut self, message: &str) {
        (self.on_close_warning)(message)
    }
}

impl Default for ChannelHandlers {
    fn default() -> Self {
        Self {
            on_error: Box::new(|response: &Response| {
                error!(
                    "Server error (request {:?}): {}",
                    response.request_id,
                    response.message().unwrap_or("<no message>")
                );
                if let Some(traceback) = response.get("traceback").and_then(|v| v.as_str()) {
                    error!("Server traceback:\n{}", traceback);
                }
                ControlFlow::Break(())
            }),
            on_notification: Box::new(|response: &Response| {
                info!("Notification: {}", response.message().unwrap_or_default());
                ControlFlow::Break(())
            }),
            on_warning: Box::new(|response: &Response| {
                warn!("Server warning: {}", response.message().unwrap_or_default());
                ControlFlow::Break(())
            }),
            on_receive: Box::new(|response: &Response| {
                debug!(
                    "Unsolicited frame {} (request {:?})",
                    response.kind, response.request_id
                );
            }),
            on_close_warning: Box::new(|message: &str| warn!("{}", message)),
        }
    }
}
