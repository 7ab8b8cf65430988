#![expect(
    clippy::module_name_repetitions,
    reason = "Router types expose their domain in the name for clarity"
)]

//! Inbound frame decoding and dispatch.

use std::sync::Arc;

use serde_json::Value;

use super::error::WsError;
use super::registry::{ListenerRegistry, invoke_isolated};
use crate::error::Error;

/// Event name under which listeners receive every inbound message,
/// regardless of its declared type.
pub const WILDCARD_EVENT: &str = "message";

/// Decodes inbound frames and fans each one out to the listeners registered
/// for its declared type, plus any wildcard listeners.
///
/// Dispatch is fail-closed: a frame that does not decode to a JSON object
/// carrying a string `type` is logged and discarded, and no listener sees
/// it. A listener that panics is contained and logged; the remaining
/// listeners for the same frame still run.
pub struct MessageRouter {
    registry: Arc<ListenerRegistry>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self { registry }
    }

    /// Decode a raw frame and dispatch it.
    ///
    /// Typed listeners receive the message's `data` field, or the whole
    /// envelope when `data` is absent. Wildcard listeners always receive
    /// the unmodified envelope.
    pub fn dispatch(&self, raw: &[u8]) {
        let envelope: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                let error = Error::from(WsError::Decode(e));
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, "dropping undecodable frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &error;
                return;
            }
        };

        let Some(msg_type) = envelope.get("type").and_then(Value::as_str) else {
            #[cfg(feature = "tracing")]
            tracing::warn!("dropping frame without a string `type` field");
            return;
        };

        let payload = envelope
            .get("data")
            .cloned()
            .unwrap_or_else(|| envelope.clone());

        for entry in self.registry.snapshot(msg_type) {
            let payload = payload.clone();
            invoke_isolated(msg_type, move || (entry.callback)(payload));
        }

        // Wildcard listeners see the full envelope for every message type
        for entry in self.registry.snapshot(WILDCARD_EVENT) {
            let envelope = envelope.clone();
            invoke_isolated(WILDCARD_EVENT, move || (entry.callback)(envelope));
        }
    }
}
