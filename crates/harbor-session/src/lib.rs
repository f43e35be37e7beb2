//! Client side of a spawned backend session.
//!
//! A [`Session`] ties together a [`ReadinessTracker`], which follows the
//! backend's status endpoint until it reports `Ready`, and a
//! [`BufferedChannel`], which queues sends and listener registrations until
//! that moment and then replays them onto a [`RealtimeTransport`] in order.
//!
//! ```no_run
//! # async fn demo(result: harbor_spawn::SpawnResult) -> Result<(), harbor_session::SessionError> {
//! use harbor_session::{Listener, Session, SessionOptions};
//!
//! let session = Session::open(&result, SessionOptions::default())?;
//! session.add_listener("state", Listener::new(|value| println!("{value}")));
//! session.send("join", &serde_json::json!({ "user": "ada" }));
//! session.wait_ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod readiness;
pub mod session;
pub mod socketio;
pub mod status;
pub mod transport;

pub use channel::{BufferedChannel, QueuedSend};
pub use error::{ReadinessError, SessionError, TransportError, TransportResult};
pub use readiness::{
    HttpStatusSource, ReadinessOptions, ReadinessOutcome, ReadinessTracker, ReadySubscription,
    StatusByteStream, StatusSource,
};
pub use session::{Session, SessionEndpoints, SessionOptions};
pub use socketio::{SocketIoTransport, socket_endpoint};
pub use status::{BackendState, PayloadParseError, StatusEvent};
pub use transport::{Listener, ListenerTable, LocalTransport, RealtimeTransport, TransportOp};
