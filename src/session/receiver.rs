use super::SessionEvent;
use crate::audio::{AudioBlock, PlaybackSink};
use crate::error::DuplexError;
use crate::protocol::{self, Frame, FrameKind};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    pub frames: u64,
    pub audio_frames: u64,
    pub text_frames: u64,
    pub handshakes: u64,
    pub malformed: u64,
    pub undecodable_text: u64,
    pub playback_errors: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Closed,
}

/// Why the receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverExit {
    /// Close frame, end of stream or transport error.
    PeerClosed(Option<String>),
    Cancelled,
}

/// Routes decoded frames to playback, the text stream and the ready signal.
///
/// One dispatcher lives for exactly one connection, so the ready signal fires
/// at most once per connection.
pub struct Dispatcher {
    playback: Option<Box<dyn PlaybackSink>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    handshake_seen: bool,
    stats: ReceiverStats,
}

impl Dispatcher {
    pub fn new(
        playback: Option<Box<dyn PlaybackSink>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            playback,
            events,
            handshake_seen: false,
            stats: ReceiverStats::default(),
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn dispatch_message(&mut self, message: Message) -> Dispatch {
        match message {
            Message::Binary(data) => {
                if let Err(e) = self.dispatch_bytes(data.as_slice()) {
                    self.record_failure(&e);
                    log::warn!("Dropping message: {}", e);
                }
                Dispatch::Continue
            }
            Message::Text(text) => {
                self.stats.ignored += 1;
                log::info!("Ignoring text control message: {}", text.as_str());
                Dispatch::Continue
            }
            Message::Close(frame) => {
                log::info!("⚠️ Connection closed by server: {:?}", frame);
                Dispatch::Closed
            }
            Message::Ping(_) | Message::Pong(_) => {
                log::trace!("Receiver: ping/pong");
                Dispatch::Continue
            }
            other => {
                self.stats.ignored += 1;
                log::debug!("Receiver: ignoring raw frame {:?}", other);
                Dispatch::Continue
            }
        }
    }

    /// Decode and route one binary message.
    ///
    /// Errors only describe the dropped unit; the connection stays usable.
    pub fn dispatch_bytes(&mut self, bytes: &[u8]) -> Result<(), DuplexError> {
        let frame = protocol::decode(bytes)?;
        self.dispatch_frame(frame)
    }

    pub fn dispatch_frame(&mut self, frame: Frame) -> Result<(), DuplexError> {
        self.stats.frames += 1;
        match frame.kind {
            FrameKind::Handshake => {
                self.stats.handshakes += 1;
                if self.handshake_seen {
                    log::debug!("Receiver: repeated handshake ignored");
                } else {
                    self.handshake_seen = true;
                    log::info!("🤝 Handshake received (status: {:?})", frame.handshake_status());
                    self.emit(SessionEvent::Ready);
                }
            }
            FrameKind::Audio => {
                self.stats.audio_frames += 1;
                let block = AudioBlock::from_le_bytes(&frame.payload);
                log::trace!("Receiver: audio frame ({} samples)", block.len());
                if let Some(playback) = self.playback.as_mut() {
                    playback.write(block.samples())?;
                }
            }
            FrameKind::Text => {
                let text = String::from_utf8(frame.payload)?;
                self.stats.text_frames += 1;
                self.emit(SessionEvent::Text(text));
            }
            FrameKind::Unknown(kind) => {
                self.stats.ignored += 1;
                log::debug!(
                    "Receiver: ignoring frame of unknown kind {:#04x} ({} bytes)",
                    kind,
                    frame.payload.len()
                );
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, error: &DuplexError) {
        match error {
            DuplexError::MalformedFrame(_) => self.stats.malformed += 1,
            DuplexError::Decode(_) => self.stats.undecodable_text += 1,
            DuplexError::Device(_) => self.stats.playback_errors += 1,
            _ => {}
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; the session keeps running.
        let _ = self.events.send(event);
    }
}

/// Read messages until the peer closes or `cancel` fires.
///
/// The dispatcher (and its playback device) is dropped when the loop ends.
pub async fn run_receiver<R, E>(
    mut stream: R,
    mut dispatcher: Dispatcher,
    cancel: CancellationToken,
) -> (ReceiverExit, ReceiverStats)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    log::info!("🔊 Receiver active");

    let exit = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break ReceiverExit::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                if dispatcher.dispatch_message(message) == Dispatch::Closed {
                    break ReceiverExit::PeerClosed(None);
                }
            }
            Some(Err(e)) => {
                log::warn!("Receive error: {}", e);
                break ReceiverExit::PeerClosed(Some(e.to_string()));
            }
            None => {
                log::info!("⚠️ Connection stream ended");
                break ReceiverExit::PeerClosed(None);
            }
        }
    };

    let stats = dispatcher.stats();
    log::info!(
        "Receiver stopped: {} frames ({} audio, {} text)",
        stats.frames,
        stats.audio_frames,
        stats.text_frames
    );
    (exit, stats)
}
