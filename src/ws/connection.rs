#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::registry::{LifecycleHooks, ListenerRegistry};
use super::router::MessageRouter;
use crate::{Result, error::Error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed but never connected
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Not connected; automatic reconnection has given up
    Disconnected,
    /// Reconnecting after failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Explicitly torn down; terminal
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if the client has been explicitly torn down.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Owns the single underlying socket and drives the connection lifecycle.
///
/// The manager handles all connection concerns:
/// - Establishing the connection and appending the auth token credential
/// - Automatic reconnection with bounded exponential backoff
/// - Handing inbound frames to the [`MessageRouter`]
/// - Firing lifecycle hooks on connect/disconnect transitions
///
/// At most one socket is live per manager at any time. The connection runs
/// in a background task; transport errors and close events are folded onto
/// a single internal failed transition so recovery never depends on which
/// of the two the runtime reports.
pub struct ConnectionManager {
    endpoint: Url,
    config: Config,
    router: Arc<MessageRouter>,
    registry: Arc<ListenerRegistry>,
    hooks: Arc<LifecycleHooks>,
    /// Watch channel for state changes (enables reconnection detection)
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Terminal teardown signal; also cancels a pending reconnect timer
    shutdown_tx: watch::Sender<bool>,
    /// Sender half for outgoing messages, present while a connection task runs
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new connection manager in the [`ConnectionState::Idle`]
    /// state. No socket is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        endpoint: Url,
        config: Config,
        router: MessageRouter,
        registry: Arc<ListenerRegistry>,
        hooks: Arc<LifecycleHooks>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            endpoint,
            config,
            router: Arc::new(router),
            registry,
            hooks,
            state_tx,
            state_rx,
            shutdown_tx,
            outbound: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Open the connection, spawning the background connection loop.
    ///
    /// Idempotent: a no-op while a connection task is alive (connecting,
    /// connected, or waiting out a backoff delay), and a warning-level no-op
    /// after [`disconnect`](Self::disconnect). When `token` is present it is
    /// appended to the endpoint as a `?token=` query credential; this is the
    /// sole supported auth mechanism.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self, token: Option<&str>) {
        if *self.shutdown_tx.borrow() {
            #[cfg(feature = "tracing")]
            tracing::warn!("connect() called after disconnect(); client is closed");
            return;
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            return;
        }

        let endpoint = endpoint_with_token(&self.endpoint, token);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(outbound_tx);

        let config = self.config.clone();
        let router = Arc::clone(&self.router);
        let hooks = Arc::clone(&self.hooks);
        let state_tx = self.state_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            Self::connection_loop(
                endpoint,
                config,
                outbound_rx,
                router,
                hooks,
                state_tx,
                shutdown_rx,
            )
            .await;
        }));
    }

    /// Main connection loop with automatic reconnection.
    async fn connection_loop(
        endpoint: String,
        config: Config,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        router: Arc<MessageRouter>,
        hooks: Arc<LifecycleHooks>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut attempt = 0_u32;
        let mut backoff: ExponentialBackoff = config.reconnect.clone().into();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            _ = state_tx.send(ConnectionState::Connecting);

            match connect_async(&endpoint).await {
                Ok((ws_stream, _)) => {
                    // Torn down while the handshake was in flight
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    attempt = 0;
                    backoff.reset();
                    _ = state_tx.send(ConnectionState::Connected {
                        since: Instant::now(),
                    });
                    hooks.fire_connected();

                    Self::drive_connection(ws_stream, &mut outbound_rx, &router, &mut shutdown_rx)
                        .await;

                    hooks.fire_disconnected();
                }
                Err(e) => {
                    let error = Error::from(WsError::Connection(e));
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%error, "unable to connect");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;
                }
            }

            // Explicit teardown never reconnects
            if *shutdown_rx.borrow() {
                break;
            }

            attempt = attempt.saturating_add(1);
            if let Some(max) = config.reconnect.max_attempts
                && attempt > max
            {
                _ = state_tx.send(ConnectionState::Disconnected);
                hooks.fire_reconnect_exhausted();
                break;
            }

            _ = state_tx.send(ConnectionState::Reconnecting { attempt });

            let delay = backoff
                .next_backoff()
                .unwrap_or(config.reconnect.max_delay);
            // Racing the shutdown signal cancels a pending reconnect attempt
            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        if *shutdown_rx.borrow() {
            _ = state_tx.send(ConnectionState::Closed);
        }
    }

    /// Drive an active connection until it closes, errors, or is torn down.
    async fn drive_connection(
        ws_stream: WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        router: &MessageRouter,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                // Inbound frames, in wire arrival order
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => router.dispatch(text.as_bytes()),
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {
                            // Ignore binary frames and transport-level ping/pong
                        }
                        Some(Err(e)) => {
                            // Errors take the same exit as a close so recovery
                            // never depends on which event the runtime reports
                            let error = Error::from(WsError::Connection(e));
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%error, "transport error; treating as connection failure");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;
                            return;
                        }
                    }
                }

                // Outbound messages from send()
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }

    /// Send a typed message to the server.
    ///
    /// The message is delivered only when the connection state is
    /// `Connected`; otherwise it is dropped with a logged warning. There is
    /// no outbound queue and no delivery confirmation. The only error is
    /// payload serialization failure.
    pub fn send<D: Serialize>(&self, msg_type: &str, data: Option<D>) -> Result<()> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("type".to_owned(), Value::String(msg_type.to_owned()));
        if let Some(data) = data {
            envelope.insert("data".to_owned(), serde_json::to_value(data)?);
        }

        if !self.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::warn!(msg_type, "not connected; dropping outbound message");
            return Ok(());
        }

        let json = Value::Object(envelope).to_string();
        let guard = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            tx.send(json).map_err(|_e| WsError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Tear the client down.
    ///
    /// Closes the socket if open, cancels any pending reconnect timer,
    /// clears the listener registry and all lifecycle hooks, and moves to
    /// the terminal [`ConnectionState::Closed`] state. No listener or hook
    /// registered before this call fires for any further activity.
    pub fn disconnect(&self) {
        _ = self.shutdown_tx.send(true);

        *self
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.registry.clear();
        self.hooks.clear();

        _ = self.state_tx.send(ConnectionState::Closed);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Check whether the connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies when the connection state changes.
    /// Useful for observing reconnection progress.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

fn endpoint_with_token(endpoint: &Url, token: Option<&str>) -> String {
    let mut url = endpoint.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Url {
        Url::parse("wss://api.numera.app/ws/notifications/").expect("static url")
    }

    #[test]
    fn token_is_appended_as_query_credential() {
        let url = endpoint_with_token(&endpoint(), Some("abc123"));
        assert_eq!(url, "wss://api.numera.app/ws/notifications/?token=abc123");
    }

    #[test]
    fn token_values_are_percent_encoded() {
        let url = endpoint_with_token(&endpoint(), Some("a b&c"));
        assert_eq!(url, "wss://api.numera.app/ws/notifications/?token=a+b%26c");
    }

    #[test]
    fn missing_token_leaves_endpoint_untouched() {
        let url = endpoint_with_token(&endpoint(), None);
        assert_eq!(url, "wss://api.numera.app/ws/notifications/");
    }

    #[test]
    fn only_connected_counts_as_connected() {
        assert!(
            ConnectionState::Connected {
                since: Instant::now()
            }
            .is_connected()
        );
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting { attempt: 1 },
            ConnectionState::Closed,
        ] {
            assert!(!state.is_connected(), "{state:?} must not count as connected");
        }
    }
}
