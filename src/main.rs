//! Serial Port Profile D-Bus service
//!
//! This service keeps a single RFCOMM serial link to a paired Bluetooth
//! device and exposes connect, disconnect and transmit commands over
//! D-Bus, forwarding received data and link events as signals.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   bluez::BluezAdapter,
   link::Chunk,
   manager::{ConnectionManager, LinkOptions},
};
use dbus::SerialLinkService;
use event::{EventListener, LinkEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;

use crate::{dbus::SerialLinkServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting spplinkd...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration: adapter={}, chunk size={}",
      config.adapter.as_deref().unwrap_or("default"),
      config.chunk_size()
   );

   let adapter =
      match BluezAdapter::open(config.adapter.as_deref(), config.profile_name.clone()).await {
         Ok(adapter) => Some(adapter),
         Err(e) => {
            warn!("No usable Bluetooth adapter ({e}), running without transport");
            None
         },
      };

   let event_bus = EventProcessor::new();
   let manager = ConnectionManager::new(adapter, event_bus.clone(), LinkOptions::from(&config));
   let service = SerialLinkService::new(manager, event_bus.clone());

   let connection = connection::Builder::session()?
      .name("org.spplink")?
      .serve_at("/org/spplink/manager", service)?
      .build()
      .await?;

   info!("spplinkd D-Bus service started at org.spplink");

   event_bus.spawn_dispatcher(&connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down spplinkd...");

   Ok(())
}

enum Notification {
   Data(Chunk),
   Event(LinkEvent),
}

/// Queues listener callbacks and replays them as D-Bus signals.
struct EventProcessor {
   queue: SegQueue<Notification>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, notification: Notification) {
      self.queue.push(notification);
      self.notifier.notify_waiters();
   }

   async fn recv(self: &Arc<Self>) -> Option<Notification> {
      loop {
         if let Some(notification) = self.queue.pop() {
            return Some(notification);
         }
         let notify = self.notifier.notified();
         if let Some(notification) = self.queue.pop() {
            return Some(notification);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<SerialLinkService>,
      notification: Notification,
   ) -> Result<()> {
      match notification {
         Notification::Data(chunk) => {
            iface.data_received(&chunk).await?;
         },
         Notification::Event(event) => {
            iface.connection_event(event.into()).await?;
            iface
               .get()
               .await
               .state_changed(iface.signal_emitter())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: &Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SerialLinkService>("/org/spplink/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(notification) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, notification).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventListener for EventProcessor {
   fn on_receive_data(&self, data: &[u8]) {
      self.push(Notification::Data(Chunk::from_slice(data)));
   }

   fn on_connection_event(&self, event: LinkEvent) {
      info!("Link event: {event}");
      self.push(Notification::Event(event));
   }
}
