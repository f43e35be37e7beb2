use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::{TransportError, TransportResult};

/// Callback attached to a named realtime event.
///
/// Identity is the allocation: clones of one `Listener` are the same
/// listener, two listeners built from equal closures are not.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Value) + Send + Sync>);

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    /// Listener that decodes each payload into `T` before calling `callback`.
    /// Payloads that do not decode are logged and dropped.
    pub fn typed<T, F>(callback: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::new(move |value: &Value| match T::deserialize(value) {
            Ok(decoded) => callback(decoded),
            Err(err) => {
                warn!(
                    target = "harbor::transport",
                    error = %err,
                    "dropping event payload that does not match listener type"
                );
            }
        })
    }

    pub fn call(&self, payload: &Value) {
        (self.0)(payload)
    }

    pub fn same_as(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Bidirectional realtime transport the buffered channel sits on.
///
/// Calls never block: implementations hand work to their own driver and
/// report only immediate failures.
pub trait RealtimeTransport: Send + Sync {
    fn connect(&self) -> TransportResult<()>;
    fn emit(&self, event: &str, payload: Value) -> TransportResult<()>;
    fn on(&self, event: &str, listener: Listener);
    fn off(&self, event: &str, listener: &Listener);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

/// Per-event ordered listener lists.
#[derive(Debug, Default)]
pub struct ListenerTable {
    events: RwLock<HashMap<String, Vec<Listener>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, listener: Listener) {
        self.events
            .write()
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove the first listener on `event` that is `listener`.
    pub fn remove(&self, event: &str, listener: &Listener) -> bool {
        let mut guard = self.events.write();
        let Some(list) = guard.get_mut(event) else {
            return false;
        };
        let Some(idx) = list.iter().position(|l| l.same_as(listener)) else {
            return false;
        };
        list.remove(idx);
        if list.is_empty() {
            guard.remove(event);
        }
        true
    }

    pub fn len(&self, event: &str) -> usize {
        self.events.read().get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Invoke every listener on `event` in registration order. Returns how many ran.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        // Listeners may add or remove listeners; call them outside the lock.
        let listeners = match self.events.read().get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for listener in &listeners {
            listener.call(payload);
        }
        listeners.len()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    Connect,
    Emit { event: String, payload: Value },
    On { event: String },
    Off { event: String },
    Disconnect,
}

/// In-memory transport that records what was applied to it.
///
/// Used by tests and by offline contexts that want the channel semantics
/// without a network peer. Inbound traffic is injected with [`deliver`].
///
/// [`deliver`]: LocalTransport::deliver
#[derive(Debug, Default)]
pub struct LocalTransport {
    ops: Mutex<Vec<TransportOp>>,
    listeners: ListenerTable,
    connected: Mutex<bool>,
    closed: Mutex<bool>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().clone()
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                TransportOp::Emit { event, payload } => Some((event.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.len(event)
    }

    /// Simulate an inbound event from the peer.
    pub fn deliver(&self, event: &str, payload: &Value) -> usize {
        if !self.is_connected() {
            return 0;
        }
        self.listeners.dispatch(event, payload)
    }

    fn record(&self, op: TransportOp) {
        self.ops.lock().push(op);
    }
}

impl RealtimeTransport for LocalTransport {
    fn connect(&self) -> TransportResult<()> {
        if *self.closed.lock() {
            return Err(TransportError::Closed);
        }
        *self.connected.lock() = true;
        self.record(TransportOp::Connect);
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.record(TransportOp::Emit {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn on(&self, event: &str, listener: Listener) {
        self.listeners.add(event, listener);
        self.record(TransportOp::On {
            event: event.to_string(),
        });
    }

    fn off(&self, event: &str, listener: &Listener) {
        if self.listeners.remove(event, listener) {
            self.record(TransportOp::Off {
                event: event.to_string(),
            });
        }
    }

    fn disconnect(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        *self.connected.lock() = false;
        self.listeners.clear();
        self.record(TransportOp::Disconnect);
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listener_identity_follows_clones() {
        let a = Listener::new(|_| {});
        let b = Listener::new(|_| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn table_removes_first_identity_match_only() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = {
            let hits = hits.clone();
            Listener::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        table.add("chat", listener.clone());
        table.add("chat", listener.clone());
        assert!(table.remove("chat", &listener));
        assert_eq!(table.len("chat"), 1);

        assert_eq!(table.dispatch("chat", &json!("hi")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(!table.remove("chat", &Listener::new(|_| {})));
        assert!(table.remove("chat", &listener));
        assert!(table.is_empty());
    }

    #[test]
    fn typed_listener_decodes_payloads() {
        #[derive(Deserialize)]
        struct Move {
            x: i32,
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = seen.clone();
            Listener::typed(move |m: Move| seen.lock().push(m.x))
        };
        listener.call(&json!({ "x": 4 }));
        listener.call(&json!("not a move"));
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn local_transport_records_ops_and_delivers_inbound() {
        let transport = LocalTransport::new();
        assert!(transport.emit("early", json!(1)).is_err());

        transport.connect().unwrap();
        transport.emit("move", json!({"x": 1})).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = seen.clone();
            Listener::new(move |value| seen.lock().push(value.clone()))
        };
        transport.on("update", listener.clone());
        assert_eq!(transport.deliver("update", &json!("a")), 1);
        transport.off("update", &listener);
        assert_eq!(transport.deliver("update", &json!("b")), 0);
        assert_eq!(*seen.lock(), vec![json!("a")]);

        transport.disconnect();
        transport.disconnect();
        assert_eq!(
            transport.ops(),
            vec![
                TransportOp::Connect,
                TransportOp::Emit {
                    event: "move".into(),
                    payload: json!({"x": 1})
                },
                TransportOp::On {
                    event: "update".into()
                },
                TransportOp::Off {
                    event: "update".into()
                },
                TransportOp::Disconnect,
            ]
        );
        assert!(matches!(transport.connect(), Err(TransportError::Closed)));
    }
}
