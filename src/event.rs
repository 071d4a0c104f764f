//! Listener contract between the connection manager and its consumer.
//!
//! Callbacks run on whichever task produced them. A consumer that touches
//! thread-bound state has to hand the notification over to its own thread.

use std::sync::Arc;

/// Lifecycle notifications emitted by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LinkEvent {
   /// The stream to the peer is open and the receive loop is starting.
   ConnectSuccess,
   /// The connect attempt failed, for whatever reason.
   ConnectTimeout,
   /// An established stream died, either on request or on its own.
   ConnectionClosed,
   /// The transport is switched off. Only raised by callers that check it.
   TransportOff,
}

/// Consumer-side sink for inbound data and lifecycle events.
pub trait EventListener: Send + Sync {
   /// One call per chunk read from the stream, in read order. Never empty.
   fn on_receive_data(&self, data: &[u8]);

   fn on_connection_event(&self, event: LinkEvent);
}

/// Type alias for a thread-safe listener handle.
pub type EventSender = Arc<dyn EventListener>;
