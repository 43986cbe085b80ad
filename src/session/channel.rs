//! Session channel: request correlation over one job socket
//!
//! The channel owns the session identity, request id allocation, the pending
//! request table and the pre-session send queue. It performs no IO itself:
//! outbound frames are pushed onto an unbounded sender and the transport
//! feeds inbound text back through [`SessionChannel::handle_text`]. A single
//! owner drives it, so queue drain never interleaves with new sends.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SessionSettings;
use crate::metrics::ChannelStats;
use crate::protocol::{
    ControlFrame, ControlKind, OutboundFrame, ProtocolError, RequestId, Response, ServerFrame,
    SessionInit, TaskId, TaskRequest, TerminalPolicy,
};

use super::handlers::{ChannelHandlers, RequestHandlers};
use super::id_allocator::{MAX_REQUEST_ID, RequestIdAllocator};
use super::request_table::{PendingEntry, PendingTable, QueuedTask, SendQueue};

const CLOSED_WARNING: &str = "Websocket to server was disconnected, could not send task";

/// Connection lifecycle as seen by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport still opening
    Connecting,
    /// Transport open, waiting for `initialize`
    Open,
    /// Session established; sends go out immediately
    Ready,
    /// Transport closed; terminal
    Closed,
}

impl ChannelState {
    /// Sends are queued rather than transmitted
    pub fn is_pending(&self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

/// Authenticated session identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
}

/// What `send_task` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted with this request id
    Sent(RequestId),
    /// Held until the session is ready, at this queue position
    Queued(usize),
}

/// Tunables for one channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub terminal_policy: TerminalPolicy,
    pub request_timeout: Option<Duration>,
    pub max_request_id: RequestId,
}

impl ChannelOptions {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            terminal_policy: settings.terminal_policy,
            request_timeout: settings.request_timeout(),
            max_request_id: MAX_REQUEST_ID,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            terminal_policy: TerminalPolicy::default(),
            request_timeout: None,
            max_request_id: MAX_REQUEST_ID,
        }
    }
}

/// Error types for session channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[source] ProtocolError),
    #[error("Channel is closed, could not send {0}")]
    Closed(String),
    #[error("No free request id: {0} requests outstanding")]
    IdSpaceExhausted(usize),
    #[error("Failed to decode frame: {0}")]
    Decode(#[source] ProtocolError),
    #[error("Failed to encode request: {0}")]
    Encode(#[source] ProtocolError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request {0} expired before a terminal frame arrived")]
    Expired(RequestId),
}

/// Client side of one job socket session
pub struct SessionChannel {
    state: ChannelState,
    session: Option<Session>,
    ids: RequestIdAllocator,
    pending: PendingTable,
    queue: SendQueue,
    close_warned: bool,
    handlers: ChannelHandlers,
    options: ChannelOptions,
    outbound: mpsc::UnboundedSender<String>,
    stats: ChannelStats,
}

impl SessionChannel {
    /// Create a channel in the `Connecting` state
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        handlers: ChannelHandlers,
        options: ChannelOptions,
    ) -> Self {
        Self {
            state: ChannelState::Connecting,
            session: None,
            ids: RequestIdAllocator::with_max(options.max_request_id),
            pending: PendingTable::new(),
            queue: SendQueue::new(),
            close_warned: false,
            handlers,
            options,
            outbound,
            stats: ChannelStats::default(),
        }
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a request id currently has a pending entry
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains(request_id)
    }

    pub fn stats(&self) -> ChannelStats {
        let mut stats = self.stats.clone();
        stats.pending = self.pending.len();
        stats.queued = self.queue.len();
        stats
    }

    /// Transport open event
    pub fn handle_open(&mut self) {
        if self.state != ChannelState::Connecting {
            debug!("Ignoring open event in state {:?}", self.state);
            return;
        }
        self.state = ChannelState::Open;
        self.stats.opened_at = Some(Utc::now());
        info!("Connected to server, waiting for session");
    }

    /// Transport close event; the channel never leaves `Closed`
    pub fn handle_close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.stats.closed_at = Some(Utc::now());

        // No more frames can arrive, so outstanding handlers are released
        let abandoned = self.pending.clear();
        let unsent = self.queue.take_all().len();
        if abandoned > 0 || unsent > 0 {
            warn!(
                "Connection to server lost with {} pending and {} unsent requests",
                abandoned, unsent
            );
        } else {
            info!("Connection to server lost");
        }
        self.refresh_depths();
    }

    /// Send a task, or queue it until the session is ready
    ///
    /// Requests without handlers are fire-and-forget: they never create a
    /// pending entry, so any frame referencing them is treated as unsolicited.
    pub fn send_task(
        &mut self,
        request: TaskRequest,
        handlers: Option<RequestHandlers>,
    ) -> Result<SendOutcome, ChannelError> {
        request.validate().map_err(ChannelError::InvalidRequest)?;

        match self.state {
            ChannelState::Ready => self.transmit(request, handlers).map(SendOutcome::Sent),
            ChannelState::Connecting | ChannelState::Open => {
                debug!("Stored task {} in queue", request.label());
                let position = self.queue.push(QueuedTask { request, handlers });
                self.stats.record_queued();
                self.refresh_depths();
                Ok(SendOutcome::Queued(position))
            }
            ChannelState::Closed => {
                let label = request.label();
                warn!("Attempted to send {} but connection is closed", label);
                self.stats.record_closed_send();
                if !self.close_warned {
                    self.close_warned = true;
                    self.handlers.close_warning(CLOSED_WARNING);
                }
                Err(ChannelError::Closed(label))
            }
        }
    }

    /// Stamp, register and write one request
    fn transmit(
        &mut self,
        request: TaskRequest,
        handlers: Option<RequestHandlers>,
    ) -> Result<RequestId, ChannelError> {
        let Some(session) = self.session.as_ref() else {
            return Err(ChannelError::Transport(
                "transmit attempted without a session".to_string(),
            ));
        };

        let pending = &self.pending;
        let request_id = self
            .ids
            .allocate(pending.len(), |id| pending.contains(id))
            .ok_or(ChannelError::IdSpaceExhausted(self.pending.len()))?;

        let label = request.label();
        let frame = OutboundFrame::stamp(
            request,
            TaskId {
                user_id: session.user_id.clone(),
                session_id: session.session_id.clone(),
                request_id,
            },
        );
        let text = frame.to_json().map_err(ChannelError::Encode)?;

        if let Some(handlers) = handlers {
            self.pending.insert(
                request_id,
                PendingEntry {
                    handlers,
                    label: label.clone(),
                    sent_at: Instant::now(),
                },
            );
        }

        if self.outbound.send(text).is_err() {
            self.pending.remove(request_id);
            error!("Outbound writer is gone, closing channel");
            self.handle_close();
            return Err(ChannelError::Transport(format!(
                "outbound writer dropped while sending {}",
                label
            )));
        }

        debug!("Sent {} as request {}", label, request_id);
        self.stats.record_sent();
        self.refresh_depths();
        Ok(request_id)
    }

    /// Decode and dispatch one inbound text frame
    ///
    /// Decode failures are logged and counted; the frame is dropped and the
    /// channel keeps running.
    pub fn handle_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.stats.record_received();
        match ServerFrame::parse(text) {
            Ok(frame) => {
                self.handle_frame(frame);
                Ok(())
            }
            Err(e) => {
                error!("Dropping undecodable frame: {} ({})", e, text);
                self.stats.record_decode_failure();
                Err(ChannelError::Decode(e))
            }
        }
    }

    /// Dispatch one decoded frame
    pub fn handle_frame(&mut self, frame: ServerFrame) {
        let response = match frame {
            ServerFrame::Control(ControlFrame::Initialize(init)) => {
                self.initialize(init);
                return;
            }
            ServerFrame::Control(control) => {
                let kind = control.kind();
                let response = match control {
                    ControlFrame::Error(response)
                    | ControlFrame::Notification(response)
                    | ControlFrame::Warning(response) => response,
                    ControlFrame::Initialize(_) => return,
                };
                if kind == ControlKind::Error {
                    self.stats.record_server_error();
                }
                match self.dispatch_control(kind, response) {
                    Some(response) => response,
                    None => return,
                }
            }
            ServerFrame::Result(response) => response,
        };

        self.deliver(response);
    }

    /// Establish the session and flush the queue in FIFO order
    fn initialize(&mut self, init: SessionInit) {
        if let Some(session) = &self.session {
            warn!(
                "Ignoring repeated initialize for session {} (already {})",
                init.session_id, session.session_id
            );
            return;
        }
        if self.state == ChannelState::Closed {
            warn!("Ignoring initialize on a closed channel");
            return;
        }

        info!(
            "Session established: user {} session {}",
            init.user_id, init.session_id
        );
        self.session = Some(Session {
            user_id: init.user_id,
            session_id: init.session_id,
        });
        if self.stats.opened_at.is_none() {
            self.stats.opened_at = Some(Utc::now());
        }
        self.stats.ready_at = Some(Utc::now());
        self.state = ChannelState::Ready;
        if let Some(secs) = self.stats.handshake_secs() {
            debug!("Session ready {:.3}s after connect", secs);
        }

        let queued = self.queue.take_all();
        if !queued.is_empty() {
            info!("Sending {} queued tasks", queued.len());
        }
        let mut queued = queued.into_iter();
        while let Some(task) = queued.next() {
            debug!("Sending task {} from queue", task.request.label());
            if let Err(e) = self.transmit(task.request, task.handlers) {
                error!("Failed to send queued task: {}", e);
                if self.state == ChannelState::Closed {
                    let dropped = queued.len();
                    if dropped > 0 {
                        warn!("Dropped {} queued tasks after the channel closed", dropped);
                    }
                    break;
                }
            }
        }
        self.refresh_depths();
    }

    /// Run the per-request override or the channel default for a control frame
    ///
    /// Returns the frame when the handler lets it continue to result delivery.
    fn dispatch_control(&mut self, kind: ControlKind, response: Response) -> Option<Response> {
        let handler = response
            .request_id
            .and_then(|request_id| self.pending.get_mut(request_id))
            .and_then(|entry| entry.handlers.control_override(kind));

        let flow = match handler {
            Some(handler) => handler(&response),
            None => match self.handlers.control(kind) {
                Some(handler) => handler(&response),
                None => ControlFlow::Continue(()),
            },
        };

        match flow {
            ControlFlow::Break(()) => {
                debug!("{} frame consumed (request {:?})", kind, response.request_id);
                None
            }
            ControlFlow::Continue(()) => Some(response),
        }
    }

    /// Hand a frame to its request's callback, or to the receive handler
    fn deliver(&mut self, response: Response) {
        let Some(request_id) = response.request_id else {
            self.stats.record_orphan();
            self.handlers.receive(&response);
            return;
        };

        let Some(entry) = self.pending.get_mut(request_id) else {
            debug!("No pending request {} for {} frame", request_id, response.kind);
            self.stats.record_orphan();
            self.handlers.receive(&response);
            return;
        };

        entry.handlers.on_result.on_response(&response);

        if response.is_terminal(self.options.terminal_policy) {
            if let Some(entry) = self.pending.remove(request_id) {
                debug!(
                    "Request {} ({}) finished after {:?}",
                    request_id,
                    entry.label,
                    entry.sent_at.elapsed()
                );
            }
            self.refresh_depths();
        }
    }

    /// Drop pending entries older than the configured request timeout
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<RequestId> {
        let Some(timeout) = self.options.request_timeout else {
            return Vec::new();
        };

        let expired = self.pending.drain_expired(now, timeout);
        if expired.is_empty() {
            return Vec::new();
        }

        let mut request_ids = Vec::with_capacity(expired.len());
        for (request_id, mut entry) in expired {
            warn!(
                "Request {} ({}) expired after {:?} without a terminal frame",
                request_id, entry.label, timeout
            );
            entry.handlers.on_result.on_expired(request_id);
            request_ids.push(request_id);
        }
        self.stats.record_expired(request_ids.len());
        self.refresh_depths();
        request_ids
    }

    fn refresh_depths(&mut self) {
        let (pending, queued) = (self.pending.len(), self.queue.len());
        self.stats.set_depths(pending, queued);
    }
}
