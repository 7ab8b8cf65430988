//! Caller-facing realtime client, one instance per logical channel.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

use crate::{Result, error::Error};
use crate::ws::config::Config;
use crate::ws::connection::{ConnectionManager, ConnectionState};
use crate::ws::registry::{LifecycleHooks, ListenerId, ListenerRegistry};
use crate::ws::router::MessageRouter;

/// A logical realtime channel served by the backend.
///
/// Each channel maps to a dedicated WebSocket path on the API origin; a
/// client instance is bound to exactly one channel for its lifetime.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// A single chat conversation or consultation thread
    Chat {
        /// Conversation or consultation identifier embedded in the path
        conversation_id: String,
    },
    /// The per-user notification stream
    Notifications,
    /// Online-presence tracking
    Presence,
}

impl Channel {
    /// Chat channel for the given conversation or consultation.
    #[must_use]
    pub fn chat<S: Into<String>>(conversation_id: S) -> Self {
        Self::Chat {
            conversation_id: conversation_id.into(),
        }
    }

    fn path(&self) -> String {
        match self {
            Self::Chat { conversation_id } => format!("/ws/chat/{conversation_id}/"),
            Self::Notifications => "/ws/notifications/".to_owned(),
            Self::Presence => "/ws/presence/".to_owned(),
        }
    }
}

/// Realtime WebSocket client for a single channel.
///
/// The client multiplexes typed JSON messages to registered listeners and
/// recovers from network failures with bounded exponential backoff.
/// Listeners survive reconnection; only [`disconnect`](Self::disconnect)
/// clears them. Instances are independent: one client per chat thread,
/// notification stream, or presence tracker, each explicitly torn down by
/// its owner.
///
/// # Examples
///
/// ```rust, no_run
/// use numera_realtime_sdk::{Channel, RealtimeClient};
/// use numera_realtime_sdk::ws::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = RealtimeClient::notifications("https://api.numera.app", Config::default())?;
///
///     client.on_connect(|| println!("notifications online"));
///     let _id = client.on("notification", |data| {
///         println!("notification: {data}");
///     });
///
///     client.connect(Some("session-token"));
///
///     // ... application runs ...
///
///     client.disconnect();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Connection manager owning the socket and reconnect policy
    connection: ConnectionManager,
    /// Typed message listeners, shared with the router
    registry: Arc<ListenerRegistry>,
    /// Connect/disconnect transition hooks
    hooks: Arc<LifecycleHooks>,
}

impl RealtimeClient {
    /// Create a client bound to `channel` on the given HTTP API origin.
    ///
    /// The origin's scheme is mapped `http -> ws` / `https -> wss` and the
    /// channel path is appended. Returns a validation error for any other
    /// scheme. No connection is opened until [`connect`](Self::connect).
    pub fn new(origin: &str, channel: Channel, config: Config) -> Result<Self> {
        let endpoint = derive_endpoint(origin, &channel)?;

        let registry = Arc::new(ListenerRegistry::new());
        let hooks = Arc::new(LifecycleHooks::new());
        let router = MessageRouter::new(Arc::clone(&registry));
        let connection = ConnectionManager::new(
            endpoint,
            config,
            router,
            Arc::clone(&registry),
            Arc::clone(&hooks),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                registry,
                hooks,
            }),
        })
    }

    /// Client for a single chat conversation or consultation.
    pub fn chat(origin: &str, conversation_id: &str, config: Config) -> Result<Self> {
        Self::new(origin, Channel::chat(conversation_id), config)
    }

    /// Client for the notification stream.
    pub fn notifications(origin: &str, config: Config) -> Result<Self> {
        Self::new(origin, Channel::Notifications, config)
    }

    /// Client for presence tracking.
    pub fn presence(origin: &str, config: Config) -> Result<Self> {
        Self::new(origin, Channel::Presence, config)
    }

    /// Open the connection.
    ///
    /// Idempotent while a connection is open or being established. `token`
    /// is appended to the endpoint as a `?token=` query credential.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self, token: Option<&str>) {
        self.inner.connection.connect(token);
    }

    /// Tear the client down: close the socket, cancel any pending
    /// reconnect, and clear every registered listener and hook. Terminal.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    /// Send a typed message.
    ///
    /// Delivered only while connected; otherwise dropped with a logged
    /// warning. The only error is payload serialization failure.
    pub fn send<D: Serialize>(&self, msg_type: &str, data: Option<D>) -> Result<()> {
        self.inner.connection.send(msg_type, data)
    }

    /// Register `callback` for messages of type `event`.
    ///
    /// Registering under [`crate::ws::WILDCARD_EVENT`] delivers every
    /// inbound message's full envelope regardless of type. Returns an
    /// opaque handle for [`off`](Self::off).
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.registry.on(event, callback)
    }

    /// Remove a previously registered listener. Unknown handles and events
    /// are silent no-ops.
    pub fn off(&self, event: &str, id: ListenerId) {
        self.inner.registry.off(event, id);
    }

    /// Register a hook fired each time the connection is established,
    /// including after automatic reconnection.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.on_connect(hook);
    }

    /// Register a hook fired each time the connection is lost.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.on_disconnect(hook);
    }

    /// Register a hook fired once when automatic reconnection gives up.
    ///
    /// Without this hook, exhausted retries would only be observable
    /// through [`is_connected`](Self::is_connected) polling.
    pub fn on_reconnect_exhausted<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.on_reconnect_exhausted(hook);
    }

    /// Check whether the connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }
}

/// Map an HTTP API origin to the WebSocket endpoint for a channel.
fn derive_endpoint(origin: &str, channel: &Channel) -> Result<Url> {
    let mut url = Url::parse(origin)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme `{other}`; expected http(s) or ws(s)"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::validation("origin does not permit a websocket scheme"))?;

    url.set_path(&channel.path());
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}
