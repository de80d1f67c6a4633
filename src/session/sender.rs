use crate::audio::BlockConsumer;
use crate::error::DuplexError;
use crate::protocol::{Frame, FrameKind};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub poll_interval: Duration,
    pub send_handshake: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

/// Drain the outbound queue onto the socket until cancelled or the write fails.
///
/// Frames are never retried; a failed write ends the loop and is reported as
/// `SendFailure` so the controller can reconnect the whole session.
pub async fn run_sender<S>(
    mut sink: S,
    queue: BlockConsumer,
    options: SenderOptions,
    cancel: CancellationToken,
) -> Result<SenderStats, DuplexError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut stats = SenderStats::default();
    log::info!("🎙️  Sender active");

    if options.send_handshake {
        let frame = Frame::handshake();
        if let Err(e) = sink.send(Message::Binary(frame.encode().into())).await {
            queue.close();
            return Err(DuplexError::SendFailure(e.to_string()));
        }
        log::debug!("Sender: handshake sent");
    }

    let mut last_dropped = queue.dropped();

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }

        let Some(block) = queue.pop() else {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(options.poll_interval) => continue,
            }
        };

        let bytes = crate::protocol::encode(FrameKind::Audio, &block.to_le_bytes());
        queue.recycle(block);
        let len = bytes.len();
        log::trace!("Sender: audio frame {} ({} bytes)", stats.frames_sent + 1, len);

        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
            log::warn!("⚠️ Connection closed during send: {}", e);
            break Err(DuplexError::SendFailure(e.to_string()));
        }
        stats.frames_sent += 1;
        stats.bytes_sent += len as u64;

        let dropped = queue.dropped();
        if dropped > last_dropped {
            log::warn!(
                "Sender: outbound queue overflowed, {} blocks dropped so far",
                dropped
            );
            last_dropped = dropped;
        }
    };

    let discarded = queue.close();
    if discarded > 0 {
        log::debug!("Sender: discarded {} unsent blocks", discarded);
    }

    if result.is_ok() {
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => log::debug!("Sender: socket closed"),
            Ok(Err(e)) => log::debug!("Sender: close failed: {}", e),
            Err(_) => log::debug!("Sender: close timed out"),
        }
    }

    log::info!(
        "Sender stopped after {} frames ({} bytes)",
        stats.frames_sent,
        stats.bytes_sent
    );
    result.map(|()| stats)
}
