//! Job socket transport
//!
//! One spawned task owns the [`SessionChannel`] and the websocket. Clients
//! talk to it through [`TaskClient`], so the pending table, send queue and
//! id counter are only ever touched from that task.

use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::metrics::ChannelStats;
use crate::protocol::TaskRequest;
use crate::session::{
    ChannelError, ChannelHandlers, ChannelOptions, ChannelState, RequestHandlers, SendOutcome,
    SessionChannel,
};

use super::client::TaskClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Requests from client handles to the socket task
pub(crate) enum Command {
    Send {
        request: TaskRequest,
        handlers: Option<RequestHandlers>,
        reply: oneshot::Sender<Result<SendOutcome, ChannelError>>,
    },
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
    Shutdown,
}

/// Error types for the websocket transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("Timed out connecting to {0}")]
    Timeout(String),
}

/// Connection settings for the job socket
#[derive(Debug, Clone)]
pub struct JobSocketOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub max_connect_attempts: u32,
    pub connect_backoff: Duration,
    pub sweep_interval: Duration,
    pub channel: ChannelOptions,
}

impl JobSocketOptions {
    pub fn from_config(config: &Config) -> Self {
        Self::from_parts(&config.server, ChannelOptions::from_settings(&config.session))
            .with_sweep_interval(Duration::from_millis(config.session.sweep_interval_ms))
    }

    fn from_parts(server: &ServerConfig, channel: ChannelOptions) -> Self {
        Self {
            url: server.job_url(),
            connect_timeout: Duration::from_secs(server.connect_timeout_seconds),
            max_connect_attempts: server.max_connect_attempts,
            connect_backoff: Duration::from_millis(server.connect_backoff_ms),
            sweep_interval: Duration::from_secs(1),
            channel,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Spawns and drives the job socket task
pub struct JobSocket;

impl JobSocket {
    /// Start connecting in the background and return a client handle
    ///
    /// The handle is usable immediately: tasks sent before the session is
    /// established are queued and go out once the server initializes it.
    pub fn spawn(
        options: JobSocketOptions,
        handlers: ChannelHandlers,
    ) -> (TaskClient, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let channel = SessionChannel::new(outbound_tx, handlers, options.channel.clone());
        let driver = Driver {
            channel,
            commands: command_rx,
            outbound: outbound_rx,
            status_tx,
            options,
        };

        let handle = tokio::spawn(driver.run());
        (TaskClient::new(command_tx, status_rx), handle)
    }

    /// Spawn using the application configuration
    pub fn from_config(config: &Config, handlers: ChannelHandlers) -> (TaskClient, JoinHandle<()>) {
        Self::spawn(JobSocketOptions::from_config(config), handlers)
    }
}

struct Driver {
    channel: SessionChannel,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedReceiver<String>,
    status_tx: watch::Sender<ChannelState>,
    options: JobSocketOptions,
}

/// Why the connected loop ended
enum Exit {
    Closed,
    Shutdown,
    ClientsGone,
}

impl Driver {
    async fn run(mut self) {
        let options = self.options.clone();
        let connect = connect_with_retry(&options);
        tokio::pin!(connect);

        let ws = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(ws) => break Some(ws),
                    Err(e) => {
                        error!("{}", e);
                        break None;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => {
                        info!("Shutdown requested while connecting");
                        break None;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All clients dropped while connecting");
                        return;
                    }
                },
            }
        };

        let exit = match ws {
            Some(ws) => {
                self.channel.handle_open();
                self.publish_state();
                self.run_connected(ws).await
            }
            None => Exit::Closed,
        };

        self.channel.handle_close();
        self.publish_state();

        if !matches!(exit, Exit::ClientsGone) {
            self.serve_closed().await;
        }
        debug!("Job socket task finished");
    }

    async fn run_connected(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();
        let period = self.options.sweep_interval.max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sweeping = self.options.channel.request_timeout.is_some();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => {
                        info!("Shutdown requested, closing job socket");
                        self.flush(&mut sink).await;
                        if let Err(e) = sink.close().await {
                            warn!("Error closing job socket: {}", e);
                        }
                        return Exit::Shutdown;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All clients dropped, closing job socket");
                        self.flush(&mut sink).await;
                        let _ = sink.close().await;
                        return Exit::ClientsGone;
                    }
                },
                Some(text) = self.outbound.recv() => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("Failed to write to job socket: {}", e);
                        return Exit::Closed;
                    }
                }
                message = stream.next() => {
                    if !self.handle_message(message) {
                        return Exit::Closed;
                    }
                }
                _ = sweep.tick(), if sweeping => {
                    self.channel.sweep_expired(Instant::now());
                }
            }
        }
    }

    /// Returns false once the connection is gone
    fn handle_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> bool {
        match message {
            Some(Ok(Message::Text(text))) => {
                debug!("Received frame: {}", text);
                // Decode failures are already logged by the channel
                let _ = self.channel.handle_text(&text);
                self.publish_state();
                true
            }
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => {
                    let _ = self.channel.handle_text(&text);
                    self.publish_state();
                    true
                }
                Err(e) => {
                    error!("Dropping non UTF-8 binary frame: {}", e);
                    true
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                debug!("Received ping/pong");
                true
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Server closed job socket: {:?}", frame);
                false
            }
            Some(Ok(Message::Frame(_))) => true,
            Some(Err(e)) => {
                error!("Job socket error: {}", e);
                false
            }
            None => {
                info!("Job socket stream ended");
                false
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                request,
                handlers,
                reply,
            } => {
                let result = self.channel.send_task(request, handlers);
                // Caller may have stopped waiting
                let _ = reply.send(result);
                self.publish_state();
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.channel.stats());
            }
            Command::Shutdown => {}
        }
    }

    /// Write any frames the channel produced but the loop has not sent yet
    async fn flush(&mut self, sink: &mut SplitSink<WsStream, Message>) {
        while let Ok(text) = self.outbound.try_recv() {
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("Failed to flush frame before close: {}", e);
                break;
            }
        }
    }

    /// Answer commands on a closed channel until every client is gone
    async fn serve_closed(&mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle_command(command);
        }
    }

    fn publish_state(&self) {
        let state = self.channel.state().clone();
        self.status_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// Connect with exponential backoff, giving up after the configured attempts
async fn connect_with_retry(options: &JobSocketOptions) -> Result<WsStream, TransportError> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(options.connect_backoff)
        .with_max_interval(options.connect_backoff * 8)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    backoff::future::retry(policy, || {
        attempt += 1;
        let attempt = attempt;
        async move {
            match connect_once(&options.url, options.connect_timeout).await {
                Ok(ws) => {
                    info!("Connected to job socket at {}", options.url);
                    Ok(ws)
                }
                Err(e) if attempt >= options.max_connect_attempts => {
                    error!(
                        "Giving up on {} after {} attempts",
                        options.url, attempt
                    );
                    Err(backoff::Error::permanent(e))
                }
                Err(e) => {
                    warn!("Connect attempt {} failed: {}", attempt, e);
                    Err(backoff::Error::transient(e))
                }
            }
        }
    })
    .await
}

async fn connect_once(url: &str, timeout: Duration) -> Result<WsStream, TransportError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(TransportError::Timeout(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.server.url = "ws://example.org:9000/".to_string();
        config.server.job_path = "/job".to_string();
        config.session.request_timeout_ms = 2500;
        config.session.sweep_interval_ms = 250;

        let options = JobSocketOptions::from_config(&config);
        assert_eq!(options.url, "ws://example.org:9000/job");
        assert_eq!(options.sweep_interval, Duration::from_millis(250));
        assert_eq!(
            options.channel.request_timeout,
            Some(Duration::from_millis(2500))
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_closes_channel() {
        let mut config = Config::default();
        // Port 9 (discard) is almost never listening locally
        config.server.url = "ws://127.0.0.1:9".to_string();
        config.server.max_connect_attempts = 1;
        config.server.connect_timeout_seconds = 2;

        let (client, handle) = JobSocket::from_config(&config, ChannelHandlers::default());
        let result = client.wait_ready().await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));

        let send = client.send_detached(TaskRequest::new("m", "t")).await;
        assert!(matches!(send, Err(ChannelError::Closed(_))));

        drop(client);
        handle.await.unwrap();
    }
}
