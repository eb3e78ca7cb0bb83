//! End-to-end broadcast tests
//!
//! Peers are in-memory channel pairs, so these run the real read/write loops,
//! dispatch task and shutdown sequence without a network.

use std::sync::{Arc, Mutex};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{Sink, SinkExt, StreamExt};
use tokio::time::{sleep, timeout};

use planthub_broadcast::broadcast::Broadcaster;
use planthub_broadcast::config::Settings;
use planthub_broadcast::connection_manager::{CloseReason, OverflowPolicy, SessionState};
use planthub_broadcast::error::StreamError;
use planthub_broadcast::session::{AdmissionError, Session};
use planthub_broadcast::websocket::{ChatMessage, Frame, MessageCodec};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.websocket.heartbeat_interval = 0;
    settings.websocket.idle_timeout = 0;
    settings.shutdown.drain_timeout = 1;
    settings.shutdown.loop_exit_timeout_ms = 200;
    settings
}

/// The test's side of one connection
struct Peer {
    session: Session,
    to_server: mpsc::UnboundedSender<Result<Frame, StreamError>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl Peer {
    fn connect(broadcaster: &Broadcaster, name: &str) -> Self {
        let (to_server, inbound) = mpsc::unbounded();
        let (outbound, from_server) = mpsc::unbounded::<Frame>();
        let outbound = outbound.sink_map_err(|e| StreamError::new(e.to_string()));

        let session = broadcaster
            .admit(name, inbound, outbound)
            .expect("admission should succeed");

        Self {
            session,
            to_server,
            from_server,
        }
    }

    fn say(&self, sender: &str, body: &str) {
        let raw = format!(r#"{{"sender":"{}","body":"{}"}}"#, sender, body);
        self.send_raw(&raw);
    }

    fn send_raw(&self, raw: &str) {
        self.to_server
            .unbounded_send(Ok(Frame::Text(raw.into())))
            .expect("session inbound should be open");
    }

    async fn next_frame(&mut self) -> Frame {
        timeout(RECV_TIMEOUT, self.from_server.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound stream ended")
    }

    async fn next_message(&mut self) -> ChatMessage {
        match self.next_frame().await {
            Frame::Text(text) => MessageCodec::new(usize::MAX)
                .decode(text.as_bytes())
                .expect("server frames are valid messages"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_message_reaches_every_peer_including_sender() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");
    let mut bob = Peer::connect(&broadcaster, "bob");

    alice.say("alice", "hi");

    let expected = ChatMessage::new("alice", "hi");
    assert_eq!(alice.next_message().await, expected);
    assert_eq!(bob.next_message().await, expected);

    // Every peer receives the same encoded bytes
    let direct = broadcaster.broadcast(&ChatMessage::new("server", "welcome"));
    assert_eq!(direct.targeted, 2);
    let (a, b) = (alice.next_frame().await, bob.next_frame().await);
    assert_eq!(a, b);
    assert_eq!(
        a,
        Frame::Text(MessageCodec::encode(&ChatMessage::new("server", "welcome")))
    );

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_legacy_field_names_are_accepted() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");

    alice.send_raw(r#"{"User":"alice","Message":"old client"}"#);
    assert_eq!(
        alice.next_message().await,
        ChatMessage::new("alice", "old client")
    );

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_malformed_frame_does_not_close_session() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");

    alice.send_raw("this is not json");
    alice.send_raw(r#"{"sender":"alice"}"#);
    alice.say("alice", "still here");

    assert_eq!(
        alice.next_message().await,
        ChatMessage::new("alice", "still here")
    );

    let handle = alice.session.handle().clone();
    assert_eq!(handle.decode_errors(), 2);
    assert_eq!(handle.state(), SessionState::Open);
    assert!(broadcaster.connection_manager().contains(handle.id));

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_peer_close_unregisters_connection() {
    let broadcaster = Broadcaster::start(&test_settings());
    let alice = Peer::connect(&broadcaster, "alice");
    let mut bob = Peer::connect(&broadcaster, "bob");
    assert_eq!(broadcaster.connection_manager().len(), 2);

    let Peer {
        session,
        to_server,
        from_server,
    } = alice;
    drop(to_server);

    let summary = timeout(RECV_TIMEOUT, session.join())
        .await
        .expect("session should finish after the peer leaves");
    assert_eq!(summary.reason, CloseReason::PeerClosed);
    assert_eq!(summary.display_name, "alice");
    assert_eq!(broadcaster.connection_manager().len(), 1);
    drop(from_server);

    // Later broadcasts only target the remaining peer
    bob.say("bob", "anyone?");
    assert_eq!(bob.next_message().await, ChatMessage::new("bob", "anyone?"));
    assert_eq!(broadcaster.stats().connections.total_connections, 1);

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_read_error_closes_only_that_session() {
    let broadcaster = Broadcaster::start(&test_settings());
    let alice = Peer::connect(&broadcaster, "alice");
    let mut bob = Peer::connect(&broadcaster, "bob");

    alice
        .to_server
        .unbounded_send(Err(StreamError::new("connection reset")))
        .unwrap();

    let summary = timeout(RECV_TIMEOUT, alice.session.join()).await.unwrap();
    assert_eq!(summary.reason, CloseReason::ReadError);

    bob.say("bob", "ok");
    assert_eq!(bob.next_message().await, ChatMessage::new("bob", "ok"));

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_every_peer_sees_the_same_order() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");
    let mut bob = Peer::connect(&broadcaster, "bob");
    let mut carol = Peer::connect(&broadcaster, "carol");

    for i in 0..20 {
        alice.say("alice", &format!("a{}", i));
        bob.say("bob", &format!("b{}", i));
    }

    let mut seen = Vec::new();
    for peer in [&mut alice, &mut bob, &mut carol] {
        let mut messages = Vec::new();
        for _ in 0..40 {
            messages.push(peer.next_message().await);
        }
        seen.push(messages);
    }

    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);

    // Each sender's messages keep their relative order
    let from_alice: Vec<_> = seen[0]
        .iter()
        .filter(|m| m.sender() == "alice")
        .map(|m| m.body().to_string())
        .collect();
    let expected: Vec<_> = (0..20).map(|i| format!("a{}", i)).collect();
    assert_eq!(from_alice, expected);

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_saturated_peer_is_degraded_without_blocking_others() {
    let mut settings = test_settings();
    settings.broadcast.queue_capacity = 2;
    settings.broadcast.overflow_policy = OverflowPolicy::DropOldest;
    settings.broadcast.overflow_close_threshold = 0;
    let broadcaster = Broadcaster::start(&settings);

    let mut alice = Peer::connect(&broadcaster, "alice");

    // A peer whose transport never accepts more than one frame
    let (_to_slow, slow_inbound) = mpsc::unbounded::<Result<Frame, StreamError>>();
    let (slow_outbound, _slow_rx) = mpsc::channel::<Frame>(0);
    let slow = broadcaster
        .admit(
            "slow",
            slow_inbound,
            slow_outbound.sink_map_err(|e| StreamError::new(e.to_string())),
        )
        .unwrap();

    // Alice reads every frame as it arrives, so only the slow peer overflows
    let mut dropped = 0;
    for i in 0..10 {
        let report = broadcaster.broadcast(&ChatMessage::new("server", format!("m{}", i)));
        assert_eq!(report.targeted, 2);
        dropped += report.dropped;
        assert_eq!(alice.next_message().await.body(), format!("m{}", i));
    }

    let alice_handle = alice.session.handle();
    assert!(!alice_handle.is_degraded());
    assert_eq!(alice_handle.frames_dropped(), 0);

    // At most two frames ever leave the slow queue, the rest overflow a queue of two
    assert!(slow.handle().is_degraded());
    assert!(slow.handle().frames_dropped() >= 6);
    assert_eq!(dropped as u64, slow.handle().frames_dropped());
    assert_eq!(slow.handle().state(), SessionState::Open);

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_persistently_slow_peer_is_closed() {
    let mut settings = test_settings();
    settings.broadcast.queue_capacity = 1;
    settings.broadcast.overflow_close_threshold = 3;
    let broadcaster = Broadcaster::start(&settings);

    let mut alice = Peer::connect(&broadcaster, "alice");

    let (_to_slow, slow_inbound) = mpsc::unbounded::<Result<Frame, StreamError>>();
    let (slow_outbound, _slow_rx) = mpsc::channel::<Frame>(0);
    let slow = broadcaster
        .admit(
            "slow",
            slow_inbound,
            slow_outbound.sink_map_err(|e| StreamError::new(e.to_string())),
        )
        .unwrap();

    // The slow transport holds at most one frame in flight and one buffered;
    // alice drains every round so only the slow peer overflows
    let mut forced = 0;
    for i in 0..8 {
        forced += broadcaster
            .broadcast(&ChatMessage::new("server", format!("m{}", i)))
            .forced_closures;
        assert_eq!(alice.next_message().await.body(), format!("m{}", i));
    }
    assert_eq!(forced, 1);

    let summary = timeout(RECV_TIMEOUT, slow.join()).await.unwrap();
    assert_eq!(summary.reason, CloseReason::SlowConsumer);
    assert_eq!(broadcaster.connection_manager().len(), 1);
    assert_eq!(broadcaster.stats().dispatcher.forced_closures, 1);

    // The healthy peer keeps its session
    alice.say("alice", "after");
    assert_eq!(alice.next_message().await.body(), "after");

    broadcaster.shutdown("test").await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_rejects_admission() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");
    let mut bob = Peer::connect(&broadcaster, "bob");

    let alice_handle = alice.session.handle().clone();

    let result = broadcaster.shutdown("test").await;
    assert!(result.success);
    assert_eq!(result.connections_signalled, 2);
    assert_eq!(result.connections_remaining, 0);
    assert!(broadcaster.connection_manager().is_empty());
    assert_eq!(alice_handle.state(), SessionState::Closed);
    assert_eq!(alice_handle.close_reason(), Some(CloseReason::Shutdown));

    // Server-initiated closes say goodbye
    assert_eq!(alice.next_frame().await, Frame::Close);
    assert_eq!(bob.next_frame().await, Frame::Close);

    let (_tx, inbound) = mpsc::unbounded::<Result<Frame, StreamError>>();
    let (outbound, _rx) = mpsc::unbounded::<Frame>();
    let rejected = broadcaster.admit(
        "late",
        inbound,
        outbound.sink_map_err(|e| StreamError::new(e.to_string())),
    );
    assert!(matches!(rejected, Err(AdmissionError::ShuttingDown)));
    assert!(broadcaster.is_shutting_down());
    assert!(!broadcaster.is_poisoned());
}

#[tokio::test]
async fn test_shutdown_flushes_queued_frames() {
    let broadcaster = Broadcaster::start(&test_settings());
    let mut alice = Peer::connect(&broadcaster, "alice");

    for i in 0..5 {
        broadcaster.broadcast(&ChatMessage::new("server", format!("m{}", i)));
    }
    broadcaster.shutdown("test").await;

    for i in 0..5 {
        assert_eq!(alice.next_message().await.body(), format!("m{}", i));
    }
    assert_eq!(alice.next_frame().await, Frame::Close);
}

#[tokio::test(start_paused = true)]
async fn test_idle_peer_is_closed() {
    let mut settings = test_settings();
    settings.websocket.idle_timeout = 5;
    let broadcaster = Broadcaster::start(&settings);

    let mut alice = Peer::connect(&broadcaster, "alice");
    let summary = alice.session.join().await;

    assert_eq!(summary.reason, CloseReason::IdleTimeout);
    assert_eq!(
        timeout(RECV_TIMEOUT, alice.from_server.next()).await.unwrap(),
        Some(Frame::Close)
    );

    broadcaster.shutdown("test").await;
}

#[derive(Default)]
struct GateState {
    permits: usize,
    waker: Option<Waker>,
}

/// A transport that accepts one frame per permit granted by the test
struct GatedSink {
    frames: mpsc::UnboundedSender<Frame>,
    gate: Arc<Mutex<GateState>>,
}

impl GatedSink {
    fn new() -> (Self, Arc<Mutex<GateState>>, mpsc::UnboundedReceiver<Frame>) {
        let (frames, rx) = mpsc::unbounded();
        let gate = Arc::new(Mutex::new(GateState::default()));
        (
            Self {
                frames,
                gate: gate.clone(),
            },
            gate,
            rx,
        )
    }
}

fn grant(gate: &Mutex<GateState>, permits: usize) {
    let mut state = gate.lock().unwrap();
    state.permits += permits;
    if let Some(waker) = state.waker.take() {
        waker.wake();
    }
}

impl Sink<Frame> for GatedSink {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        let mut state = self.gate.lock().unwrap();
        if state.permits == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        state.permits -= 1;
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), StreamError> {
        self.frames
            .unbounded_send(frame)
            .map_err(|e| StreamError::new(e.to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_shutdown_keeps_frame_held_by_blocked_writer() {
    let broadcaster = Arc::new(Broadcaster::start(&test_settings()));

    let (_to_server, inbound) = mpsc::unbounded::<Result<Frame, StreamError>>();
    let (outbound, gate, mut from_server) = GatedSink::new();
    grant(&gate, 1);
    let session = broadcaster.admit("alice", inbound, outbound).unwrap();

    for i in 0..3 {
        broadcaster.broadcast(&ChatMessage::new("server", format!("m{}", i)));
    }
    // m0 goes out on the only permit; the writer then waits for room holding m1
    sleep(Duration::from_millis(50)).await;
    assert_eq!(session.handle().frames_sent(), 1);

    let stopping = tokio::spawn({
        let broadcaster = broadcaster.clone();
        async move { broadcaster.shutdown("test").await }
    });
    sleep(Duration::from_millis(50)).await;
    grant(&gate, 16);

    let result = timeout(RECV_TIMEOUT, stopping).await.unwrap().unwrap();
    assert_eq!(result.connections_remaining, 0);

    let codec = MessageCodec::new(usize::MAX);
    for i in 0..3 {
        match timeout(RECV_TIMEOUT, from_server.next()).await.unwrap() {
            Some(Frame::Text(text)) => {
                assert_eq!(codec.decode(text.as_bytes()).unwrap().body(), format!("m{}", i))
            }
            other => panic!("expected m{}, got {:?}", i, other),
        }
    }
    assert_eq!(
        timeout(RECV_TIMEOUT, from_server.next()).await.unwrap(),
        Some(Frame::Close)
    );

    let summary = session.join().await;
    assert_eq!(summary.reason, CloseReason::Shutdown);
    assert_eq!(summary.frames_sent, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_close_racing_shutdown_cleans_up_once() {
    for _ in 0..20 {
        let broadcaster = Broadcaster::start(&test_settings());
        let Peer {
            session,
            to_server,
            mut from_server,
        } = Peer::connect(&broadcaster, "alice");
        let handle = session.handle().clone();

        let closer = tokio::spawn(async move { drop(to_server) });
        let (result, closed) = tokio::join!(broadcaster.shutdown("test"), closer);
        closed.unwrap();

        let summary = timeout(RECV_TIMEOUT, session.join()).await.unwrap();
        assert!(matches!(
            summary.reason,
            CloseReason::PeerClosed | CloseReason::Shutdown
        ));
        assert_eq!(handle.close_reason(), Some(summary.reason));
        assert!(!handle.close(CloseReason::Shutdown));
        assert_eq!(handle.state(), SessionState::Closed);

        assert_eq!(result.connections_remaining, 0);
        assert!(broadcaster.connection_manager().is_empty());
        assert!(broadcaster.connection_manager().unregister(handle.id).is_none());

        // A goodbye is sent once, and only when the server ended the session
        let mut closes = 0;
        while let Some(frame) = timeout(RECV_TIMEOUT, from_server.next()).await.unwrap() {
            if frame == Frame::Close {
                closes += 1;
            }
        }
        let expected = usize::from(summary.reason == CloseReason::Shutdown);
        assert_eq!(closes, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_broadcasts_reach_every_peer_in_one_order() {
    let mut settings = test_settings();
    settings.broadcast.queue_capacity = 4096;
    let broadcaster = Arc::new(Broadcaster::start(&settings));

    let mut peers: Vec<_> = (0..8)
        .map(|i| Peer::connect(&broadcaster, &format!("peer{}", i)))
        .collect();

    let senders: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|side| {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    broadcaster.broadcast(&ChatMessage::new(side, format!("{}", i)));
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let mut seen = Vec::new();
    for peer in peers.iter_mut() {
        let mut messages = Vec::with_capacity(1000);
        for _ in 0..1000 {
            messages.push(peer.next_message().await);
        }
        seen.push(messages);
    }

    for messages in &seen[1..] {
        assert_eq!(messages, &seen[0]);
    }
    for side in ["left", "right"] {
        let bodies: Vec<_> = seen[0]
            .iter()
            .filter(|m| m.sender() == side)
            .map(|m| m.body().to_string())
            .collect();
        let expected: Vec<_> = (0..500).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
    }

    broadcaster.shutdown("test").await;
}
