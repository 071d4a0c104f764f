use std::str::FromStr;

use bluer::Address;
use log::{info, warn};
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{bluez::BluezAdapter, manager::ConnectionManager, transport::PeerDevice},
   event::{EventSender, LinkEvent},
};

pub type Manager = ConnectionManager<BluezAdapter>;

pub struct SerialLinkService {
   manager: Manager,
   events: EventSender,
}

impl SerialLinkService {
   pub const fn new(manager: Manager, events: EventSender) -> Self {
      Self { manager, events }
   }

   /// Publishes transitions made by a method call. Transitions driven by
   /// link events are published by the event dispatcher.
   async fn announce_state(&self, emitter: &SignalEmitter<'_>) {
      if let Err(e) = self.state_changed(emitter).await {
         warn!("Failed to publish state change: {e}");
      }
   }
}

#[interface(name = "org.spplink.Manager")]
impl SerialLinkService {
   async fn is_transport_enabled(&self) -> bool {
      self.manager.is_transport_enabled().await
   }

   async fn request_enable(&self) -> bool {
      self.manager.request_enable().await
   }

   async fn list_devices(&self) -> zbus::fdo::Result<String> {
      let peers: Vec<serde_json::Value> = self
         .manager
         .list_bonded_peers()
         .await
         .iter()
         .map(PeerDevice::to_json)
         .collect();
      serde_json::to_string(&peers).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn connect(
      &self,
      address: String,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      if !self.manager.has_transport() {
         info!("Connect to {address} requested without a Bluetooth adapter");
         return Ok(false);
      }
      if !self.manager.is_transport_enabled().await {
         info!("Connect to {address} requested while the adapter is off");
         self.events.on_connection_event(LinkEvent::TransportOff);
         return Ok(false);
      }

      let peer = self
         .manager
         .list_bonded_peers()
         .await
         .into_iter()
         .find(|p| p.address == addr)
         .unwrap_or_else(|| PeerDevice::unnamed(addr));

      self
         .manager
         .connect(peer)
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      self.announce_state(&emitter).await;
      Ok(true)
   }

   async fn disconnect(&self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) -> bool {
      let open = self.manager.current_peer().is_some();
      self.manager.disconnect();
      if open {
         self.announce_state(&emitter).await;
      }
      open
   }

   async fn send(&self, payload: Vec<u8>) {
      self.manager.send(&payload).await;
   }

   async fn send_text(&self, text: String) {
      self.manager.send(text.as_bytes()).await;
   }

   async fn current_device(&self) -> String {
      self
         .manager
         .current_peer()
         .map(|p| p.to_json().to_string())
         .unwrap_or_default()
   }

   // Signals
   #[zbus(signal)]
   pub async fn data_received(emitter: &SignalEmitter<'_>, data: &[u8]) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_event(emitter: &SignalEmitter<'_>, kind: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.manager.state().to_string()
   }
}
