//! Readiness-gated messaging over a [`RealtimeTransport`].
//!
//! Until the backend is ready, sends and listener registrations are
//! queued instead of touching the transport. When the tracker reports
//! ready the channel connects the transport, replays queued sends in
//! order, attaches queued listeners in order, and from then on applies
//! everything directly. The queues are drained once and never refilled.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::readiness::{ReadinessTracker, ReadySubscription};
use crate::transport::{Listener, RealtimeTransport};

/// A send issued before readiness. The payload is frozen as JSON text so
/// later changes to the caller's value cannot leak into the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSend {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct QueuedListener {
    pub channel: String,
    pub listener: Listener,
}

enum ChannelState {
    Buffering {
        outbound: VecDeque<QueuedSend>,
        listeners: Vec<QueuedListener>,
    },
    Live,
    Closed,
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    state: Mutex<ChannelState>,
    subscription: Mutex<Option<ReadySubscription>>,
}

impl Inner {
    /// Connect, replay sends, attach listeners. Runs once, under the state lock,
    /// so no send can slip in between the replay and going live.
    fn drain(&self) {
        let mut state = self.state.lock();
        let (outbound, listeners) = match std::mem::replace(&mut *state, ChannelState::Live) {
            ChannelState::Buffering {
                outbound,
                listeners,
            } => (outbound, listeners),
            other => {
                *state = other;
                return;
            }
        };

        if let Err(err) = self.transport.connect() {
            *state = ChannelState::Closed;
            self.transport.disconnect();
            warn!(
                target = "harbor::channel",
                error = %err,
                dropped_sends = outbound.len(),
                dropped_listeners = listeners.len(),
                "transport connect failed on readiness; channel closed"
            );
            return;
        }
        info!(
            target = "harbor::channel",
            sends = outbound.len(),
            listeners = listeners.len(),
            "backend ready; draining buffered operations"
        );

        for queued in outbound {
            match serde_json::from_str::<Value>(&queued.payload) {
                Ok(payload) => emit_logged(self.transport.as_ref(), &queued.channel, payload),
                Err(err) => warn!(
                    target = "harbor::channel",
                    channel = %queued.channel,
                    error = %err,
                    "dropping queued send with unreadable payload"
                ),
            }
        }
        for queued in listeners {
            self.transport.on(&queued.channel, queued.listener);
        }
    }
}

fn emit_logged(transport: &dyn RealtimeTransport, channel: &str, payload: Value) {
    if let Err(err) = transport.emit(channel, payload) {
        warn!(
            target = "harbor::channel",
            channel = %channel,
            error = %err,
            "emit failed"
        );
    }
}

/// Message channel to one backend that buffers until the backend is ready.
#[derive(Clone)]
pub struct BufferedChannel {
    inner: Arc<Inner>,
}

impl BufferedChannel {
    /// Wrap `transport`, which stays disconnected until `tracker` reports ready.
    pub fn new(transport: Arc<dyn RealtimeTransport>, tracker: &ReadinessTracker) -> Self {
        let inner = Arc::new(Inner {
            transport,
            state: Mutex::new(ChannelState::Buffering {
                outbound: VecDeque::new(),
                listeners: Vec::new(),
            }),
            subscription: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        // Fires synchronously here when the tracker is already ready.
        let subscription = tracker.on_ready(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain();
            }
        });
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Send `payload` on `channel`, now if ready, otherwise once ready.
    ///
    /// Never blocks and never fails; a payload that cannot be serialized is
    /// logged and dropped.
    pub fn send<T>(&self, channel: &str, payload: &T)
    where
        T: Serialize + ?Sized,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            ChannelState::Buffering { outbound, .. } => match serde_json::to_string(payload) {
                Ok(text) => outbound.push_back(QueuedSend {
                    channel: channel.to_string(),
                    payload: text,
                }),
                Err(err) => warn!(
                    target = "harbor::channel",
                    channel = %channel,
                    error = %err,
                    "dropping send with unserializable payload"
                ),
            },
            ChannelState::Live => {
                drop(state);
                match serde_json::to_value(payload) {
                    Ok(value) => emit_logged(self.inner.transport.as_ref(), channel, value),
                    Err(err) => warn!(
                        target = "harbor::channel",
                        channel = %channel,
                        error = %err,
                        "dropping send with unserializable payload"
                    ),
                }
            }
            ChannelState::Closed => {
                debug!(target = "harbor::channel", channel = %channel, "send on closed channel ignored");
            }
        }
    }

    pub fn add_listener(&self, channel: &str, listener: Listener) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            ChannelState::Buffering { listeners, .. } => listeners.push(QueuedListener {
                channel: channel.to_string(),
                listener,
            }),
            ChannelState::Live => {
                drop(state);
                self.inner.transport.on(channel, listener);
            }
            ChannelState::Closed => {
                debug!(target = "harbor::channel", channel = %channel, "listener on closed channel ignored");
            }
        }
    }

    /// Remove `listener` from `channel`; while buffering this drops the first
    /// queued registration of that exact listener.
    pub fn remove_listener(&self, channel: &str, listener: &Listener) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            ChannelState::Buffering { listeners, .. } => {
                if let Some(idx) = listeners
                    .iter()
                    .position(|q| q.channel == channel && q.listener.same_as(listener))
                {
                    listeners.remove(idx);
                }
            }
            ChannelState::Live => {
                drop(state);
                self.inner.transport.off(channel, listener);
            }
            ChannelState::Closed => {}
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(*self.inner.state.lock(), ChannelState::Live)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ChannelState::Closed)
    }

    pub fn pending_sends(&self) -> Vec<QueuedSend> {
        match &*self.inner.state.lock() {
            ChannelState::Buffering { outbound, .. } => outbound.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn pending_listeners(&self) -> usize {
        match &*self.inner.state.lock() {
            ChannelState::Buffering { listeners, .. } => listeners.len(),
            _ => 0,
        }
    }

    /// Disconnect the transport and discard anything still queued. Idempotent.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), ChannelState::Closed);
        if matches!(previous, ChannelState::Closed) {
            return;
        }
        if let Some(subscription) = self.inner.subscription.lock().take() {
            let _ = subscription.unsubscribe();
        }
        self.inner.transport.disconnect();
        debug!(target = "harbor::channel", "channel destroyed");
    }
}

impl std::fmt::Debug for BufferedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            ChannelState::Buffering {
                outbound,
                listeners,
            } => format!("buffering(sends={}, listeners={})", outbound.len(), listeners.len()),
            ChannelState::Live => "live".to_string(),
            ChannelState::Closed => "closed".to_string(),
        };
        f.debug_struct("BufferedChannel").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReadinessError;
    use crate::readiness::{ReadinessOptions, StatusByteStream, StatusSource};
    use crate::transport::{LocalTransport, TransportOp};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::channel::mpsc;
    use serde_json::json;

    /// Status source whose stream is fed by the test.
    struct GatedSource {
        initial: &'static str,
        stream: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, ReadinessError>>>>,
    }

    #[async_trait]
    impl StatusSource for GatedSource {
        async fn fetch_status(&self) -> Result<String, ReadinessError> {
            Ok(self.initial.to_string())
        }

        async fn open_stream(&self) -> Result<StatusByteStream, ReadinessError> {
            let rx = self
                .stream
                .lock()
                .take()
                .ok_or_else(|| ReadinessError::Network("stream opened twice".into()))?;
            Ok(rx.boxed())
        }
    }

    struct Gate(mpsc::UnboundedSender<Result<Bytes, ReadinessError>>);

    impl Gate {
        fn open(&self) {
            let frame = "data: {\"state\":\"Ready\",\"time\":\"now\"}\n\n";
            let _ = self.0.unbounded_send(Ok(Bytes::from_static(frame.as_bytes())));
        }
    }

    fn gated_tracker() -> (ReadinessTracker, Gate) {
        let (tx, rx) = mpsc::unbounded();
        let source = GatedSource {
            initial: "Loading",
            stream: Mutex::new(Some(rx)),
        };
        let tracker = ReadinessTracker::start(source, ReadinessOptions::default()).unwrap();
        (tracker, Gate(tx))
    }

    fn ready_tracker() -> ReadinessTracker {
        let (tx, rx) = mpsc::unbounded();
        drop(tx);
        let source = GatedSource {
            initial: "Ready",
            stream: Mutex::new(Some(rx)),
        };
        ReadinessTracker::start(source, ReadinessOptions::default()).unwrap()
    }

    fn recorder(seen: &Arc<Mutex<Vec<Value>>>) -> Listener {
        let seen = seen.clone();
        Listener::new(move |value| seen.lock().push(value.clone()))
    }

    #[tokio::test]
    async fn queued_sends_replay_in_order_after_connect() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);

        channel.send("msg", "a");
        channel.send("msg", "b");
        channel.send("msg", "c");
        assert!(transport.ops().is_empty());
        assert_eq!(channel.pending_sends().len(), 3);

        gate.open();
        tracker.wait().await.unwrap();

        assert!(channel.is_live());
        assert_eq!(
            transport.ops(),
            vec![
                TransportOp::Connect,
                TransportOp::Emit {
                    event: "msg".into(),
                    payload: json!("a")
                },
                TransportOp::Emit {
                    event: "msg".into(),
                    payload: json!("b")
                },
                TransportOp::Emit {
                    event: "msg".into(),
                    payload: json!("c")
                },
            ]
        );
        assert!(channel.pending_sends().is_empty());
    }

    #[tokio::test]
    async fn sends_drain_before_listeners_attach() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);
        let seen = Arc::new(Mutex::new(Vec::new()));

        channel.add_listener("state", recorder(&seen));
        channel.send("join", &json!({"room": 1}));
        channel.add_listener("chat", recorder(&seen));
        assert_eq!(channel.pending_listeners(), 2);
        assert_eq!(transport.listener_count("state"), 0);

        gate.open();
        tracker.wait().await.unwrap();

        assert_eq!(
            transport.ops(),
            vec![
                TransportOp::Connect,
                TransportOp::Emit {
                    event: "join".into(),
                    payload: json!({"room": 1})
                },
                TransportOp::On {
                    event: "state".into()
                },
                TransportOp::On {
                    event: "chat".into()
                },
            ]
        );
        assert_eq!(channel.pending_listeners(), 0);

        transport.deliver("chat", &json!("hello"));
        assert_eq!(*seen.lock(), vec![json!("hello")]);
    }

    #[tokio::test]
    async fn queued_payload_is_frozen_at_send_time() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);

        let mut cursor = vec![1, 2];
        channel.send("cursor", &cursor);
        cursor.push(3);

        gate.open();
        tracker.wait().await.unwrap();
        assert_eq!(
            transport.emitted(),
            vec![("cursor".to_string(), json!([1, 2]))]
        );
    }

    #[tokio::test]
    async fn removed_listener_is_never_attached() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let dropped = recorder(&seen);
        let kept = recorder(&seen);
        channel.add_listener("chat", dropped.clone());
        channel.add_listener("chat", kept.clone());
        channel.remove_listener("other", &dropped);
        assert_eq!(channel.pending_listeners(), 2);
        channel.remove_listener("chat", &dropped);
        assert_eq!(channel.pending_listeners(), 1);

        gate.open();
        tracker.wait().await.unwrap();

        assert_eq!(transport.listener_count("chat"), 1);
        transport.deliver("chat", &json!(1));
        assert_eq!(seen.lock().len(), 1);

        channel.remove_listener("chat", &kept);
        assert_eq!(transport.listener_count("chat"), 0);
    }

    #[tokio::test]
    async fn channel_on_ready_tracker_is_live_immediately() {
        let tracker = ready_tracker();
        tracker.wait().await.unwrap();

        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);
        assert!(channel.is_live());
        assert_eq!(transport.ops(), vec![TransportOp::Connect]);

        channel.send("ping", &json!({"n": 1}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        channel.add_listener("pong", recorder(&seen));
        assert_eq!(
            transport.emitted(),
            vec![("ping".to_string(), json!({"n": 1}))]
        );
        assert_eq!(transport.listener_count("pong"), 1);
    }

    #[tokio::test]
    async fn nothing_reaches_transport_before_ready() {
        let (tracker, _gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);

        channel.send("a", &1);
        channel.add_listener("b", Listener::new(|_| {}));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!tracker.is_ready());
        assert!(!channel.is_live());
        assert!(transport.ops().is_empty());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_blocks_later_drain() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);
        channel.send("a", &1);
        assert_eq!(tracker.pending_callbacks(), 1);

        channel.destroy();
        channel.destroy();
        assert!(channel.is_closed());
        assert_eq!(tracker.pending_callbacks(), 0);

        gate.open();
        tracker.wait().await.unwrap();
        channel.send("b", &2);

        assert_eq!(transport.ops(), vec![TransportOp::Disconnect]);
    }

    #[tokio::test]
    async fn failed_connect_closes_channel_instead_of_going_live() {
        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);
        channel.send("a", &1);

        // A closed transport refuses to connect.
        transport.disconnect();
        gate.open();
        tracker.wait().await.unwrap();

        assert!(channel.is_closed());
        assert!(!channel.is_live());
        channel.send("b", &2);
        assert_eq!(transport.ops(), vec![TransportOp::Disconnect]);
    }

    #[test]
    fn channel_built_off_runtime_connects_on_the_transport_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (tracker, transport) = runtime.block_on(async {
            let tracker = ready_tracker();
            tracker.wait().await.unwrap();
            let transport = Arc::new(crate::socketio::SocketIoTransport::new(
                &url::Url::parse("http://127.0.0.1:1/").unwrap(),
            ));
            (tracker, transport)
        });

        let (live, emitted) = std::thread::spawn({
            let transport = transport.clone();
            move || {
                let channel = BufferedChannel::new(transport.clone(), &tracker);
                let emitted = transport.emit("ping", serde_json::json!(1));
                (channel.is_live(), emitted)
            }
        })
        .join()
        .unwrap();

        assert!(live);
        assert_eq!(emitted, Ok(()));
        transport.disconnect();
    }

    #[tokio::test]
    async fn unserializable_payload_is_dropped() {
        use std::collections::HashMap;

        let (tracker, gate) = gated_tracker();
        let transport = LocalTransport::new();
        let channel = BufferedChannel::new(transport.clone(), &tracker);

        // Non-string map keys cannot be represented in JSON.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        channel.send("bad", &bad);
        channel.send("good", &true);
        assert_eq!(channel.pending_sends().len(), 1);

        gate.open();
        tracker.wait().await.unwrap();
        assert_eq!(transport.emitted(), vec![("good".to_string(), json!(true))]);
    }
}
