//! Session controller: owns the socket lifecycle and the reconnect loop.
//!
//! ```text
//! Idle -> Connecting -> Active -> ClosedByPeer -> (delay) -> Connecting ...
//!              |                 \-> ClosedByUser -> Idle
//!              \-> Failed -> (delay) -> Connecting ...
//! ```
//!
//! Capture, sender, receiver and playback only run while `Active`; every
//! exit from `Active` tears all four down before the next transition.

pub mod receiver;
pub mod sender;
pub mod transport;

pub use receiver::{Dispatcher, ReceiverExit, ReceiverStats};
pub use sender::{SenderOptions, SenderStats};
pub use transport::{probe, Endpoint, ProbeOutcome, WsStream};

use crate::audio::{AudioBackend, OutboundQueue};
use crate::config::ClientConfig;
use crate::error::{DuplexError, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for the connection tasks after cancellation.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    ClosedByPeer,
    ClosedByUser,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// First handshake frame on the current connection.
    Ready,
    /// A text fragment, in arrival order. Fragments are not utterance-aligned.
    Text(String),
    Reconnecting { attempt: u32, delay: Duration },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Connections that reached `Active`.
    pub connections: u32,
    pub failed_attempts: u32,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// How one active connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    ByUser,
    ByPeer(DuplexError),
}

impl ConnectionEnd {
    /// The receiver only stops on its own when the peer side is gone. A
    /// transport error text was already logged by the receiver.
    fn from_receiver(exit: &ReceiverExit) -> Self {
        match exit {
            ReceiverExit::Cancelled => ConnectionEnd::ByUser,
            ReceiverExit::PeerClosed(_) => ConnectionEnd::ByPeer(DuplexError::PeerClosed),
        }
    }
}

/// Entry point: builds sessions against a configured audio backend.
pub struct DuplexClient {
    config: ClientConfig,
    backend: Arc<dyn AudioBackend>,
}

impl DuplexClient {
    pub fn new(config: ClientConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self { config, backend }
    }

    /// Start a session in the background. Must be called inside a Tokio runtime.
    pub fn start(&self, endpoint: Endpoint) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let controller = SessionController {
            endpoint,
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            cancel: cancel.clone(),
            state: state_tx,
            events: events_tx,
            retry_count: 0,
            summary: SessionSummary::default(),
        };
        let task = tokio::spawn(async move {
            // The controller, and every device it holds, is gone before this fires.
            let result = controller.run().await;
            done_tx.send_replace(true);
            result
        });

        let handle = SessionHandle {
            cancel,
            state: state_rx,
            done: done_rx,
            task: Mutex::new(Some(task)),
        };
        (handle, events_rx)
    }
}

/// Handle to a running session. Dropping it stops the session.
pub struct SessionHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    /// Flips to `true` once the controller has released everything.
    done: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<Result<SessionSummary>>>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Stop the session and wait until every device and socket is released.
    ///
    /// Idempotent. Also waits when another caller is already joined on the
    /// session through [`SessionHandle::wait`].
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(Ok(summary)) => log::debug!("Session finished: {:?}", summary),
                Ok(Err(e)) => log::warn!("Session ended with error: {}", e),
                Err(e) => log::error!("Session task failed: {}", e),
            },
            None => self.finished().await,
        }
    }

    /// Wait for the session to end on its own (user stop elsewhere or retries exhausted).
    ///
    /// Only the first caller gets the result; later callers wait for the
    /// session to finish and get `None`.
    pub async fn wait(&self) -> Option<Result<SessionSummary>> {
        let Some(task) = self.task.lock().await.take() else {
            self.finished().await;
            return None;
        };
        match task.await {
            Ok(result) => Some(result),
            Err(e) => {
                log::error!("Session task failed: {}", e);
                None
            }
        }
    }
}

impl SessionHandle {
    async fn finished(&self) {
        let mut done = self.done.clone();
        // An aborted task drops the sender without flipping it, which also ends the wait.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionController {
    endpoint: Endpoint,
    config: ClientConfig,
    backend: Arc<dyn AudioBackend>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Consecutive failed attempts since the last successful connect.
    retry_count: u32,
    summary: SessionSummary,
}

impl SessionController {
    async fn run(mut self) -> Result<SessionSummary> {
        log::info!("🔌 Session starting for {}", self.endpoint);

        let result = loop {
            if self.cancel.is_cancelled() {
                self.transition(SessionState::ClosedByUser);
                break Ok(());
            }

            self.transition(SessionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transition(SessionState::ClosedByUser);
                    break Ok(());
                }
                connected = transport::connect(&self.endpoint, &self.config) => connected,
            };

            match connected {
                Ok(stream) => {
                    log::info!("✅ Connected to {}", self.endpoint.url().host_str().unwrap_or("?"));
                    self.retry_count = 0;
                    self.summary.connections += 1;
                    self.transition(SessionState::Active);

                    match self.run_connection(stream).await {
                        ConnectionEnd::ByUser => {
                            self.transition(SessionState::ClosedByUser);
                            break Ok(());
                        }
                        ConnectionEnd::ByPeer(reason) => {
                            log::warn!("⚠️ Connection lost: {}", reason);
                            self.transition(SessionState::ClosedByPeer);
                        }
                    }
                }
                Err(e) => {
                    self.retry_count += 1;
                    self.summary.failed_attempts += 1;
                    log::warn!(
                        "⏳ Service not ready yet (attempt {}): {}",
                        self.retry_count,
                        e
                    );
                    self.transition(SessionState::Failed);

                    if !e.is_recoverable() {
                        log::error!("Not retrying: {}", e);
                        break Err(e);
                    }
                    if !self.config.retry.allows_retry(self.retry_count) {
                        log::error!("Giving up after {} failed attempts", self.retry_count);
                        break Err(DuplexError::RetriesExhausted(self.retry_count));
                    }
                }
            }

            let delay = self.config.retry.delay;
            log::info!(
                "Retrying in {:.1}s (attempt {})",
                delay.as_secs_f32(),
                self.retry_count + 1
            );
            self.emit(SessionEvent::Reconnecting {
                attempt: self.retry_count + 1,
                delay,
            });
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transition(SessionState::ClosedByUser);
                    break Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if result.is_ok() {
            self.transition(SessionState::Idle);
        }
        log::info!(
            "Session ended: {} connections, {} failed attempts",
            self.summary.connections,
            self.summary.failed_attempts
        );
        result.map(|()| self.summary)
    }

    /// Run capture, sender, receiver and playback for one live connection.
    async fn run_connection(&mut self, stream: WsStream) -> ConnectionEnd {
        let format = self.config.format;
        let connection = self.cancel.child_token();
        let (write, read) = stream.split();
        let (producer, consumer) = OutboundQueue::with_capacity(self.config.queue_capacity).split();

        let capture = match self.backend.open_capture(&format, producer) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Capture unavailable, continuing receive-only: {}", e);
                None
            }
        };
        let playback = match self.backend.open_playback(&format) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::warn!("Playback unavailable, inbound audio will be discarded: {}", e);
                None
            }
        };

        let options = SenderOptions {
            poll_interval: self.config.sender_poll_interval,
            send_handshake: self.config.send_handshake,
        };
        let mut sender = tokio::spawn(sender::run_sender(
            write,
            consumer,
            options,
            connection.clone(),
        ));
        let dispatcher = Dispatcher::new(playback, self.events.clone());
        let mut receiver = tokio::spawn(receiver::run_receiver(read, dispatcher, connection.clone()));

        let mut sender_done = None;
        let mut receiver_done = None;
        let end = tokio::select! {
            _ = self.cancel.cancelled() => ConnectionEnd::ByUser,
            result = &mut sender => {
                let end = match &result {
                    Ok(Err(e)) => ConnectionEnd::ByPeer(DuplexError::SendFailure(e.to_string())),
                    _ => ConnectionEnd::ByPeer(DuplexError::PeerClosed),
                };
                sender_done = Some(result);
                end
            }
            result = &mut receiver => {
                let end = match &result {
                    Ok((exit, _)) => ConnectionEnd::from_receiver(exit),
                    Err(_) => ConnectionEnd::ByPeer(DuplexError::PeerClosed),
                };
                receiver_done = Some(result);
                end
            }
        };

        // A close observed after the user asked to stop is still a user stop.
        let end = if self.cancel.is_cancelled() {
            ConnectionEnd::ByUser
        } else {
            end
        };

        // Stop intake first, then the socket tasks, then the devices.
        connection.cancel();
        if let Some(capture) = capture {
            capture.close();
        }

        let sender_result = match sender_done {
            Some(result) => Some(result),
            None => await_task("sender", &mut sender).await,
        };
        let receiver_result = match receiver_done {
            Some(result) => Some(result),
            None => await_task("receiver", &mut receiver).await,
        };

        if let Some(Ok(Ok(stats))) = sender_result {
            self.summary.frames_sent += stats.frames_sent;
        }
        if let Some(Ok((_, stats))) = receiver_result {
            self.summary.frames_received += stats.frames;
        }

        end
    }

    fn transition(&self, next: SessionState) {
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        log::debug!("Session: {} -> {}", previous, next);
        self.state.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Join a connection task, aborting it if it overruns the teardown budget.
async fn await_task<T>(
    name: &str,
    task: &mut JoinHandle<T>,
) -> Option<std::result::Result<T, tokio::task::JoinError>> {
    match tokio::time::timeout(TEARDOWN_TIMEOUT, &mut *task).await {
        Ok(result) => Some(result),
        Err(_) => {
            log::warn!("{} did not stop within {:?}, aborting", name, TEARDOWN_TIMEOUT);
            task.abort();
            let _ = (&mut *task).await;
            None
        }
    }
}
