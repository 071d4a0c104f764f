//! Narrow view of the host Bluetooth stack used by the connection manager.
//!
//! The manager only ever talks to the radio through [`TransportAdapter`],
//! which keeps it testable against in-memory streams.

use std::future::Future;

use bluer::Address;
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::Result;

/// Serial Port Profile service class, used for every connection attempt.
pub const SERIAL_PORT_PROFILE: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

/// A bonded remote device as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDevice {
   pub address: Address,
   pub name: SmolStr,
}

impl PeerDevice {
   pub fn new(address: Address, name: impl Into<SmolStr>) -> Self {
      Self {
         address,
         name: name.into(),
      }
   }

   /// Uses the address string as the name, for devices without one.
   pub fn unnamed(address: Address) -> Self {
      Self::new(address, address.to_smolstr())
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.to_string(),
         "name": self.name.as_str(),
      })
   }
}

/// Capability to drive the local adapter.
///
/// Every method may block on the radio, so callers run them off the
/// thread that issued the command.
pub trait TransportAdapter: Send + Sync + 'static {
   /// Duplex byte stream produced by [`TransportAdapter::open_stream`].
   type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

   fn is_enabled(&self) -> impl Future<Output = Result<bool>> + Send;

   /// Asks the adapter to power on.
   fn enable(&self) -> impl Future<Output = Result<()>> + Send;

   /// Snapshot of the bonded-device registry, in registry order.
   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<PeerDevice>>> + Send;

   /// Resolves the transport-level handle for an address.
   fn remote_device(&self, address: Address) -> impl Future<Output = Result<PeerDevice>> + Send;

   /// Stops any inquiry in progress so that connection attempts are not slowed down.
   fn cancel_discovery(&self) -> impl Future<Output = Result<()>> + Send;

   /// Opens a reliable stream to `address` for the given service class.
   fn open_stream(
      &self,
      address: Address,
      service: Uuid,
   ) -> impl Future<Output = Result<Self::Stream>> + Send;
}
