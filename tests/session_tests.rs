//! End-to-end session tests against an in-process WebSocket server.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use voice_duplex::audio::{AudioBlock, MockAudioBackend};
use voice_duplex::config::RetryPolicy;
use voice_duplex::protocol::{Frame, FrameKind};
use voice_duplex::session::{self, ProbeOutcome};
use voice_duplex::{ClientConfig, DuplexClient, Endpoint, SessionEvent, SessionState};

type ServerSocket = WebSocketStream<TcpStream>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections forever, handing each one to `handler` with its index.
async fn serve<F, Fut>(handler: F) -> (Endpoint, JoinHandle<()>)
where
    F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let accepted = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let index = accepted.fetch_add(1, Ordering::SeqCst);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    handler(index, ws).await;
                }
            });
        }
    });

    let endpoint = Endpoint::parse(&format!("ws://{}/api/chat", addr)).unwrap();
    (endpoint, task)
}

/// Read until the client goes away.
async fn hold_open(ws: &mut ServerSocket) {
    while let Some(Ok(message)) = ws.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn send_frame(ws: &mut ServerSocket, bytes: Vec<u8>) {
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        sender_poll_interval: Duration::from_millis(1),
        retry: RetryPolicy {
            delay: Duration::from_millis(50),
            max_attempts: None,
        },
        ..ClientConfig::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream ended")
}

/// Skip events until one matches, returning everything seen on the way.
async fn events_until(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_peer_close_triggers_reconnect() {
    let delay = Duration::from_millis(250);
    // When the server closed connection 0, then when connection 1 arrived.
    let timeline = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let server_timeline = Arc::clone(&timeline);
    let (endpoint, _server) = serve(move |index, mut ws| {
        let timeline = Arc::clone(&server_timeline);
        async move {
            if index == 1 {
                timeline.lock().unwrap().push(Instant::now());
            }
            send_frame(&mut ws, Frame::handshake().encode()).await;
            if index == 0 {
                send_frame(&mut ws, Frame::text("hi").encode()).await;
                timeline.lock().unwrap().push(Instant::now());
                let _ = ws.close(None).await;
            }
            hold_open(&mut ws).await;
        }
    })
    .await;

    let mut config = test_config();
    config.retry.delay = delay;
    let backend = MockAudioBackend::new();
    let client = DuplexClient::new(config, Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);

    let mut ready_count = 0;
    let seen = events_until(&mut events, |event| {
        if *event == SessionEvent::Ready {
            ready_count += 1;
        }
        ready_count == 2
    })
    .await;

    assert_eq!(
        seen,
        vec![
            SessionEvent::StateChanged(SessionState::Connecting),
            SessionEvent::StateChanged(SessionState::Active),
            SessionEvent::Ready,
            SessionEvent::Text("hi".to_string()),
            SessionEvent::StateChanged(SessionState::ClosedByPeer),
            SessionEvent::Reconnecting { attempt: 1, delay },
            SessionEvent::StateChanged(SessionState::Connecting),
            SessionEvent::StateChanged(SessionState::Active),
            SessionEvent::Ready,
        ]
    );
    assert_eq!(backend.total_opened(), 4);

    let timeline = timeline.lock().unwrap().clone();
    assert_eq!(timeline.len(), 2);
    let gap = timeline[1] - timeline[0];
    assert!(gap >= delay, "reconnected after {:?}, expected at least {:?}", gap, delay);

    handle.stop().await;
    assert_eq!(handle.state(), SessionState::Idle);
    assert_eq!(backend.open_devices(), 0);
}

#[test_log::test(tokio::test)]
async fn test_captured_blocks_arrive_in_order() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (endpoint, _server) = serve(move |_, mut ws| {
        let frames_tx = frames_tx.clone();
        async move {
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(data) => {
                        let _ = frames_tx.send(data.as_slice().to_vec());
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    })
    .await;

    let blocks = (1..=3i16).map(|tag| AudioBlock::new(vec![tag; 1024])).collect();
    let backend = MockAudioBackend::new().with_capture_blocks(blocks);
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, _events) = client.start(endpoint);

    let mut received = Vec::new();
    while received.len() < 3 {
        let frame = tokio::time::timeout(EVENT_TIMEOUT, frames_rx.recv())
            .await
            .expect("server did not receive audio")
            .unwrap();
        received.push(frame);
    }

    for (index, frame) in received.iter().enumerate() {
        assert_eq!(frame.len(), 2049);
        let decoded = Frame::decode(frame).unwrap();
        assert_eq!(decoded.kind, FrameKind::Audio);
        let tag = index as i16 + 1;
        assert_eq!(AudioBlock::from_le_bytes(&decoded.payload).samples()[0], tag);
    }

    // Live capture after the scripted blocks keeps flowing.
    assert!(backend.capture(AudioBlock::new(vec![9; 4])));
    let frame = tokio::time::timeout(EVENT_TIMEOUT, frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, vec![0x01, 9, 0, 9, 0, 9, 0, 9, 0]);

    handle.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_inbound_audio_and_text_routed() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, Frame::handshake().encode()).await;
        send_frame(&mut ws, Frame::audio(&AudioBlock::new(vec![1, 2])).encode()).await;
        send_frame(&mut ws, Frame::text("Hello").encode()).await;
        send_frame(&mut ws, Frame::audio(&AudioBlock::new(vec![3, 4])).encode()).await;
        send_frame(&mut ws, vec![0x02, 0xff, 0xfe]).await;
        send_frame(&mut ws, vec![0x07, 0x01]).await;
        send_frame(&mut ws, Frame::text(" there").encode()).await;
        hold_open(&mut ws).await;
    })
    .await;

    let backend = MockAudioBackend::new();
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);

    let seen = events_until(&mut events, |event| {
        *event == SessionEvent::Text(" there".to_string())
    })
    .await;
    let texts: Vec<&SessionEvent> = seen
        .iter()
        .filter(|event| matches!(event, SessionEvent::Text(_)))
        .collect();
    assert_eq!(
        texts,
        vec![
            &SessionEvent::Text("Hello".to_string()),
            &SessionEvent::Text(" there".to_string()),
        ]
    );
    assert_eq!(backend.played(), vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(handle.state(), SessionState::Active);

    handle.stop().await;
    assert_eq!(backend.open_devices(), 0);
}

#[test_log::test(tokio::test)]
async fn test_stop_is_idempotent_and_releases_everything() {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();
    let (endpoint, _server) = serve(move |_, mut ws| {
        let closed_tx = closed_tx.clone();
        async move {
            send_frame(&mut ws, Frame::handshake().encode()).await;
            hold_open(&mut ws).await;
            let _ = closed_tx.send(());
        }
    })
    .await;

    let backend = MockAudioBackend::new();
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);

    events_until(&mut events, |event| *event == SessionEvent::Ready).await;
    assert!(backend.is_capturing());
    assert_eq!(backend.open_devices(), 2);

    handle.stop().await;
    handle.stop().await;

    assert_eq!(handle.state(), SessionState::Idle);
    assert!(!backend.is_capturing());
    assert_eq!(backend.open_devices(), 0);
    assert!(!backend.capture(AudioBlock::new(vec![1])));

    tokio::time::timeout(EVENT_TIMEOUT, closed_rx.recv())
        .await
        .expect("server never saw the socket close");

    let rest = events_until(&mut events, |event| {
        *event == SessionEvent::StateChanged(SessionState::Idle)
    })
    .await;
    assert_eq!(
        rest,
        vec![
            SessionEvent::StateChanged(SessionState::ClosedByUser),
            SessionEvent::StateChanged(SessionState::Idle),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_stop_waits_while_another_task_is_waiting() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, Frame::handshake().encode()).await;
        hold_open(&mut ws).await;
    })
    .await;

    let backend = MockAudioBackend::new();
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);
    let handle = Arc::new(handle);
    events_until(&mut events, |event| *event == SessionEvent::Ready).await;
    assert_eq!(backend.open_devices(), 2);

    let waiter = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move { handle.wait().await }
    });
    // Let the waiter take the session task first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(EVENT_TIMEOUT, handle.stop())
        .await
        .expect("stop did not return");
    assert_eq!(backend.open_devices(), 0);
    assert!(!backend.is_capturing());
    assert_eq!(handle.state(), SessionState::Idle);

    let result = tokio::time::timeout(EVENT_TIMEOUT, waiter)
        .await
        .unwrap()
        .unwrap();
    let summary = result.expect("waiter owns the result").unwrap();
    assert_eq!(summary.connections, 1);

    // Later callers of either kind return once the session is over.
    assert!(handle.wait().await.is_none());
    handle.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_missing_microphone_runs_receive_only() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, Frame::handshake().encode()).await;
        send_frame(&mut ws, Frame::text("listening").encode()).await;
        hold_open(&mut ws).await;
    })
    .await;

    let backend = MockAudioBackend::new().with_capture_failure("no microphone");
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);

    events_until(&mut events, |event| {
        *event == SessionEvent::Text("listening".to_string())
    })
    .await;
    assert_eq!(handle.state(), SessionState::Active);
    assert!(!backend.is_capturing());

    handle.stop().await;
    assert_eq!(backend.open_devices(), 0);
}

#[test_log::test(tokio::test)]
async fn test_dropping_handle_stops_session() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, Frame::handshake().encode()).await;
        hold_open(&mut ws).await;
    })
    .await;

    let backend = MockAudioBackend::new();
    let client = DuplexClient::new(test_config(), Arc::new(backend.clone()));
    let (handle, mut events) = client.start(endpoint);
    events_until(&mut events, |event| *event == SessionEvent::Ready).await;

    drop(handle);
    events_until(&mut events, |event| {
        *event == SessionEvent::StateChanged(SessionState::Idle)
    })
    .await;
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while backend.open_devices() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("devices still open after drop");
}

#[test_log::test(tokio::test)]
async fn test_probe_reports_handshake() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, vec![0x00, 0x01]).await;
        hold_open(&mut ws).await;
    })
    .await;

    let outcome = session::probe(&endpoint, &test_config(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(outcome, ProbeOutcome::Ready { status: Some(1) });
}

#[test_log::test(tokio::test)]
async fn test_probe_reports_non_handshake_reply() {
    let (endpoint, _server) = serve(|_, mut ws| async move {
        send_frame(&mut ws, Frame::text("busy").encode()).await;
        hold_open(&mut ws).await;
    })
    .await;

    let outcome = session::probe(&endpoint, &test_config(), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!outcome.is_ready());
    assert!(matches!(outcome, ProbeOutcome::Unexpected(_)));
}
