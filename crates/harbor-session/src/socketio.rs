use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::transport::{Listener, ListenerTable, RealtimeTransport};

/// socket.io endpoint for a backend url: `{origin}{path}/socket.io/`, with
/// one trailing slash dropped from the path before the suffix is appended.
pub fn socket_endpoint(url: &Url) -> Url {
    let path = url.path();
    let path = path.strip_suffix('/').unwrap_or(path);
    let mut endpoint = url.clone();
    endpoint.set_path(&format!("{path}/socket.io/"));
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    endpoint
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

enum Command {
    Emit { event: String, payload: Value },
    Disconnect,
}

/// [`RealtimeTransport`] over a socket.io server.
///
/// Construction only derives the endpoint. `connect` starts a driver task
/// that opens the socket and then applies emits in the order they were
/// issued, including emits issued while the socket was still opening.
pub struct SocketIoTransport {
    endpoint: Url,
    bearer_token: Option<String>,
    listeners: Arc<ListenerTable>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state: Arc<Mutex<LinkState>>,
    runtime: Option<Handle>,
}

impl SocketIoTransport {
    /// Remembers the tokio runtime it is created on (if any), so `connect`
    /// may later be called from threads outside that runtime.
    pub fn new(backend_url: &Url) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            endpoint: socket_endpoint(backend_url),
            bearer_token: None,
            listeners: Arc::new(ListenerTable::new()),
            commands,
            pending: Mutex::new(Some(pending)),
            state: Arc::new(Mutex::new(LinkState::Idle)),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Sent as `Authorization: Bearer ...` when the socket opens.
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl RealtimeTransport for SocketIoTransport {
    fn connect(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        match *state {
            LinkState::Idle => {}
            LinkState::Closed => return Err(TransportError::Closed),
            LinkState::Connecting | LinkState::Connected => return Ok(()),
        }
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| TransportError::NoRuntime)?,
        };
        let commands = self.pending.lock().take().ok_or(TransportError::Closed)?;
        *state = LinkState::Connecting;
        drop(state);

        info!(
            target = "harbor::socketio",
            endpoint = %self.endpoint,
            "opening realtime socket"
        );
        runtime.spawn(drive(
            self.endpoint.clone(),
            self.bearer_token.clone(),
            self.listeners.clone(),
            self.state.clone(),
            commands,
        ));
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> TransportResult<()> {
        match *self.state.lock() {
            LinkState::Closed => return Err(TransportError::Closed),
            // No driver yet, nothing would ever read the command.
            LinkState::Idle => return Err(TransportError::NotConnected),
            LinkState::Connecting | LinkState::Connected => {}
        }
        self.commands
            .send(Command::Emit {
                event: event.to_string(),
                payload,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn on(&self, event: &str, listener: Listener) {
        self.listeners.add(event, listener);
    }

    fn off(&self, event: &str, listener: &Listener) {
        self.listeners.remove(event, listener);
    }

    fn disconnect(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, LinkState::Closed)
        };
        match previous {
            LinkState::Closed => return,
            LinkState::Idle => {
                self.pending.lock().take();
            }
            LinkState::Connecting | LinkState::Connected => {
                let _ = self.commands.send(Command::Disconnect);
            }
        }
        self.listeners.clear();
        debug!(
            target = "harbor::socketio",
            endpoint = %self.endpoint,
            "realtime socket closed"
        );
    }

    fn is_connected(&self) -> bool {
        *self.state.lock() == LinkState::Connected
    }
}

async fn drive(
    endpoint: Url,
    bearer_token: Option<String>,
    listeners: Arc<ListenerTable>,
    state: Arc<Mutex<LinkState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let routed = listeners.clone();
    let mut builder = ClientBuilder::new(endpoint.as_str()).on_any(
        move |event: Event, payload: Payload, _client: Client| {
            let listeners = routed.clone();
            async move { route_inbound(&listeners, event, payload) }.boxed()
        },
    );
    if let Some(token) = bearer_token {
        builder = builder.opening_header("Authorization", format!("Bearer {token}"));
    }

    let client = match builder.connect().await {
        Ok(client) => client,
        Err(err) => {
            warn!(
                target = "harbor::socketio",
                endpoint = %endpoint,
                error = %err,
                "realtime socket failed to connect"
            );
            *state.lock() = LinkState::Closed;
            return;
        }
    };

    let closed_while_connecting = {
        let mut guard = state.lock();
        if *guard == LinkState::Closed {
            true
        } else {
            *guard = LinkState::Connected;
            false
        }
    };
    if !closed_while_connecting {
        debug!(target = "harbor::socketio", endpoint = %endpoint, "realtime socket connected");
        while let Some(command) = commands.recv().await {
            match command {
                Command::Emit { event, payload } => {
                    if let Err(err) = client
                        .emit(event.as_str(), Payload::Text(vec![payload]))
                        .await
                    {
                        warn!(
                            target = "harbor::socketio",
                            event = %event,
                            error = %err,
                            "emit failed"
                        );
                    }
                }
                Command::Disconnect => break,
            }
        }
    }

    if let Err(err) = client.disconnect().await {
        debug!(target = "harbor::socketio", error = %err, "socket disconnect reported an error");
    }
    *state.lock() = LinkState::Closed;
}

fn route_inbound(listeners: &ListenerTable, event: Event, payload: Payload) {
    let name = match event {
        Event::Custom(name) => name,
        Event::Message => "message".to_string(),
        _ => return,
    };
    let value = match payload {
        Payload::Text(mut values) => {
            if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            }
        }
        Payload::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        #[allow(unreachable_patterns)]
        _ => {
            debug!(target = "harbor::socketio", event = %name, "ignoring legacy string payload");
            return;
        }
    };
    let delivered = listeners.dispatch(&name, &value);
    if delivered == 0 {
        debug!(target = "harbor::socketio", event = %name, "no listener for inbound event");
    }
}
