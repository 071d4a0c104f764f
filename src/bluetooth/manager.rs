//! Connection manager for a single serial link.
//!
//! This module owns the adapter handle and the one active connection slot,
//! runs connect attempts in the background and drives the receive loop that
//! hands inbound chunks to the listener.

use std::{
   sync::{Arc, Weak},
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::{
   bluetooth::{
      link::{self, DEFAULT_CHUNK_SIZE, LinkReceiver, LinkSender},
      transport::{PeerDevice, SERIAL_PORT_PROFILE, TransportAdapter},
   },
   config::Config,
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
};

/// Lifecycle of the single managed link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Closing,
}

/// Socket parameters applied to every new link.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
   pub chunk_size: usize,
   pub write_timeout: Duration,
}

impl Default for LinkOptions {
   fn default() -> Self {
      Self {
         chunk_size: DEFAULT_CHUNK_SIZE,
         write_timeout: Duration::from_secs(25),
      }
   }
}

impl From<&Config> for LinkOptions {
   fn from(config: &Config) -> Self {
      Self {
         chunk_size: config.chunk_size(),
         write_timeout: config.write_timeout(),
      }
   }
}

/// The open stream to the connected peer.
struct ActiveConnection {
   peer: PeerDevice,
   sender: LinkSender,
   jset: JoinSet<()>,
}

impl Drop for ActiveConnection {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

struct LinkSlot {
   state: ConnectionState,
   active: Option<ActiveConnection>,
   /// Bumped by every connect attempt; lets stale tasks recognise themselves.
   generation: u64,
}

struct ManagerInner<A> {
   adapter: Option<A>,
   listener: EventSender,
   options: LinkOptions,
   slot: Mutex<LinkSlot>,
}

/// Manages the connection to one bonded peer at a time.
///
/// This type is cheaply cloneable; clones share the same link. Listener
/// callbacks are never made while internal locks are held, so a listener
/// may call back into the manager.
pub struct ConnectionManager<A>(Arc<ManagerInner<A>>);

impl<A> Clone for ConnectionManager<A> {
   fn clone(&self) -> Self {
      Self(self.0.clone())
   }
}

impl<A: TransportAdapter> ConnectionManager<A> {
   /// Creates a manager. `None` means the host has no usable transport,
   /// in which case every operation degrades to a no-op.
   pub fn new(adapter: Option<A>, listener: EventSender, options: LinkOptions) -> Self {
      Self(Arc::new(ManagerInner {
         adapter,
         listener,
         options,
         slot: Mutex::new(LinkSlot {
            state: ConnectionState::Disconnected,
            active: None,
            generation: 0,
         }),
      }))
   }

   /// Whether the transport is on. Always true without a transport.
   ///
   /// A `false` result is only a signal: nothing is retried, the caller
   /// decides whether to call [`Self::request_enable`] and try again.
   pub async fn is_transport_enabled(&self) -> bool {
      let Some(adapter) = &self.0.adapter else {
         return true;
      };
      match adapter.is_enabled().await {
         Ok(enabled) => enabled,
         Err(e) => {
            warn!("Failed to query adapter power state: {e}");
            false
         },
      }
   }

   /// Asks the adapter to power on. Returns whether it is on afterwards.
   pub async fn request_enable(&self) -> bool {
      let Some(adapter) = &self.0.adapter else {
         return true;
      };
      if let Err(e) = adapter.enable().await {
         warn!("Failed to power on adapter: {e}");
      }
      self.is_transport_enabled().await
   }

   /// Snapshot of the bonded devices, in registry order.
   pub async fn list_bonded_peers(&self) -> Vec<PeerDevice> {
      let Some(adapter) = &self.0.adapter else {
         return Vec::new();
      };
      match adapter.bonded_devices().await {
         Ok(peers) => peers,
         Err(e) => {
            warn!("Failed to list bonded devices: {e}");
            Vec::new()
         },
      }
   }

   /// Whether an adapter backs this manager at all.
   pub fn has_transport(&self) -> bool {
      self.0.adapter.is_some()
   }

   pub fn state(&self) -> ConnectionState {
      self.0.slot.lock().state
   }

   /// The device behind the active connection, if any.
   pub fn current_peer(&self) -> Option<PeerDevice> {
      self.0.slot.lock().active.as_ref().map(|c| c.peer.clone())
   }

   /// Starts a background connect attempt to `peer`.
   ///
   /// The outcome arrives as [`LinkEvent::ConnectSuccess`] or
   /// [`LinkEvent::ConnectTimeout`]. Only one link may exist or be in the
   /// making: any other state is rejected with [`LinkError::Busy`].
   /// Without a transport this does nothing.
   pub fn connect(&self, peer: PeerDevice) -> Result<()> {
      if !self.has_transport() {
         debug!("Ignoring connect to {}: no transport", peer.address);
         return Ok(());
      }

      let generation = {
         let mut slot = self.0.slot.lock();
         if slot.state != ConnectionState::Disconnected {
            debug!("Rejecting connect to {}: link is {}", peer.address, slot.state);
            return Err(LinkError::Busy);
         }
         slot.state = ConnectionState::Connecting;
         slot.generation += 1;
         slot.generation
      };

      let inner = self.0.clone();
      tokio::spawn(async move {
         inner.run_connect(peer, generation).await;
      });
      Ok(())
   }

   /// Closes the active stream, if it is still open.
   ///
   /// No event is emitted here: closing the stream ends the receive loop,
   /// which reports [`LinkEvent::ConnectionClosed`].
   pub fn disconnect(&self) {
      let mut guard = self.0.slot.lock();
      let slot = &mut *guard;
      if let Some(conn) = slot.active.as_mut()
         && conn.sender.is_connected()
      {
         info!("Disconnecting from {}", conn.peer.address);
         slot.state = ConnectionState::Closing;
         conn.jset.abort_all();
      } else {
         debug!("Disconnect requested without an open link");
      }
   }

   /// Writes `payload` to the peer.
   ///
   /// Silently does nothing without an open link. Write failures are
   /// logged and otherwise dropped.
   pub async fn send(&self, payload: &[u8]) {
      let (sender, address) = {
         let slot = self.0.slot.lock();
         match &slot.active {
            Some(conn)
               if slot.state == ConnectionState::Connected && conn.sender.is_connected() =>
            {
               (conn.sender.clone(), conn.peer.address)
            },
            _ => {
               debug!("Dropping {} bytes: no open link", payload.len());
               return;
            },
         }
      };

      if let Err(e) = sender.send(payload).await {
         warn!("Failed to transmit {} bytes to {address}: {e}", payload.len());
      }
   }
}

impl<A: TransportAdapter> ManagerInner<A> {
   async fn run_connect(self: Arc<Self>, peer: PeerDevice, generation: u64) {
      info!("Connecting to {} ({})", peer.name, peer.address);
      match self.open(&peer).await {
         Ok((device, stream)) => self.attach(device, stream, generation),
         Err(e) => {
            warn!("Failed to connect to {}: {e}", peer.address);
            {
               let mut slot = self.slot.lock();
               if slot.generation == generation && slot.state == ConnectionState::Connecting {
                  slot.state = ConnectionState::Disconnected;
               }
            }
            self.listener.on_connection_event(LinkEvent::ConnectTimeout);
         },
      }
   }

   async fn open(&self, peer: &PeerDevice) -> Result<(PeerDevice, A::Stream)> {
      let Some(adapter) = &self.adapter else {
         return Err(LinkError::AdapterNotFound);
      };
      let device = adapter.remote_device(peer.address).await?;
      adapter.cancel_discovery().await?;
      let stream = adapter
         .open_stream(device.address, SERIAL_PORT_PROFILE)
         .await?;
      Ok((device, stream))
   }

   fn attach(self: Arc<Self>, device: PeerDevice, stream: A::Stream, generation: u64) {
      let address = device.address;
      let mut jset = JoinSet::new();
      let (receiver, sender) = link::spawn(
         &mut jset,
         stream,
         address,
         self.options.chunk_size,
         self.options.write_timeout,
      );

      {
         let mut slot = self.slot.lock();
         slot.state = ConnectionState::Connected;
         slot.active = Some(ActiveConnection {
            peer: device,
            sender,
            jset,
         });
      }

      info!("Connected to {address}");
      self.listener.on_connection_event(LinkEvent::ConnectSuccess);

      tokio::spawn(receive_loop(
         Arc::downgrade(&self),
         receiver,
         address,
         generation,
      ));
   }

   /// Tears down the link owned by `generation` and reports the closure.
   fn notify_closed(&self, address: Address, generation: u64) {
      let closed = {
         let mut slot = self.slot.lock();
         if slot.generation == generation {
            slot.state = ConnectionState::Disconnected;
            slot.active.take()
         } else {
            None
         }
      };
      drop(closed);

      info!("Connection to {address} closed");
      self.listener.on_connection_event(LinkEvent::ConnectionClosed);
   }
}

/// Hands every inbound chunk to the listener until the stream fails.
async fn receive_loop<A: TransportAdapter>(
   weak: Weak<ManagerInner<A>>,
   mut rx: LinkReceiver,
   address: Address,
   generation: u64,
) {
   loop {
      match rx.recv().await {
         Ok(chunk) => match weak.upgrade() {
            Some(inner) => inner.listener.on_receive_data(&chunk),
            None => {
               warn!("{address}: Manager was dropped");
               return;
            },
         },
         Err(e) => {
            debug!("{address}: Receive loop ending: {e}");
            break;
         },
      }
   }

   if let Some(inner) = weak.upgrade() {
      inner.notify_closed(address, generation);
   }
}

#[cfg(test)]
mod tests {
   use std::{
      collections::VecDeque,
      io,
      sync::atomic::{AtomicBool, AtomicUsize, Ordering},
   };

   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
      sync::mpsc,
      time,
   };
   use tokio_test::io::Builder;
   use uuid::Uuid;

   use super::*;
   use crate::event::EventListener;

   const WAIT: Duration = Duration::from_secs(5);

   struct MockAdapter<S> {
      enabled: AtomicBool,
      bonded: Vec<PeerDevice>,
      streams: Mutex<VecDeque<S>>,
      discovery_cancels: AtomicUsize,
      opened: Mutex<Vec<(Address, Uuid)>>,
   }

   impl<S> MockAdapter<S> {
      fn new(bonded: Vec<PeerDevice>, streams: impl IntoIterator<Item = S>) -> Self {
         Self {
            enabled: AtomicBool::new(true),
            bonded,
            streams: Mutex::new(streams.into_iter().collect()),
            discovery_cancels: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
         }
      }
   }

   impl<S> TransportAdapter for MockAdapter<S>
   where
      S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
   {
      type Stream = S;

      async fn is_enabled(&self) -> Result<bool> {
         Ok(self.enabled.load(Ordering::SeqCst))
      }

      async fn enable(&self) -> Result<()> {
         self.enabled.store(true, Ordering::SeqCst);
         Ok(())
      }

      async fn bonded_devices(&self) -> Result<Vec<PeerDevice>> {
         Ok(self.bonded.clone())
      }

      async fn remote_device(&self, address: Address) -> Result<PeerDevice> {
         Ok(self
            .bonded
            .iter()
            .find(|p| p.address == address)
            .cloned()
            .unwrap_or_else(|| PeerDevice::unnamed(address)))
      }

      async fn cancel_discovery(&self) -> Result<()> {
         self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }

      async fn open_stream(&self, address: Address, service: Uuid) -> Result<S> {
         self.opened.lock().push((address, service));
         self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| {
               LinkError::Io(io::Error::new(io::ErrorKind::HostUnreachable, "no route"))
            })
      }
   }

   #[derive(Debug, PartialEq)]
   enum Seen {
      Data(Vec<u8>),
      Event(LinkEvent),
   }

   struct Recorder(mpsc::UnboundedSender<Seen>);

   impl EventListener for Recorder {
      fn on_receive_data(&self, data: &[u8]) {
         let _ = self.0.send(Seen::Data(data.to_vec()));
      }

      fn on_connection_event(&self, event: LinkEvent) {
         let _ = self.0.send(Seen::Event(event));
      }
   }

   fn manager<S>(
      adapter: Option<MockAdapter<S>>,
   ) -> (ConnectionManager<MockAdapter<S>>, mpsc::UnboundedReceiver<Seen>)
   where
      S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
   {
      let (tx, rx) = mpsc::unbounded_channel();
      let manager = ConnectionManager::new(adapter, Arc::new(Recorder(tx)), LinkOptions::default());
      (manager, rx)
   }

   async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
      time::timeout(WAIT, rx.recv())
         .await
         .expect("timed out waiting for a notification")
         .expect("listener dropped")
   }

   /// Asserts nothing else is delivered for a little while.
   async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Seen>) {
      time::sleep(Duration::from_millis(50)).await;
      assert!(rx.try_recv().is_err());
   }

   fn peer(last: u8, name: &str) -> PeerDevice {
      PeerDevice::new(Address::new([0x98, 0xd3, 0x31, 0x00, 0x00, last]), name)
   }

   #[tokio::test]
   async fn test_without_transport() {
      let (manager, mut rx) = manager::<DuplexStream>(None);

      assert!(manager.is_transport_enabled().await);
      assert!(manager.request_enable().await);
      assert!(manager.list_bonded_peers().await.is_empty());
      assert!(!manager.has_transport());
      manager.connect(peer(1, "HC-05")).unwrap();
      assert_eq!(manager.current_peer(), None);
      manager.send(b"T").await;
      manager.disconnect();

      assert_eq!(manager.state(), ConnectionState::Disconnected);
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_transport_power_state() {
      let adapter = MockAdapter::<DuplexStream>::new(vec![], []);
      adapter.enabled.store(false, Ordering::SeqCst);
      let (manager, _rx) = manager(Some(adapter));

      assert!(!manager.is_transport_enabled().await);
      assert!(manager.request_enable().await);
      assert!(manager.is_transport_enabled().await);
   }

   #[tokio::test]
   async fn test_bonded_peers_keep_registry_order() {
      let bonded = vec![peer(3, "HC-06"), peer(1, "HC-05"), peer(2, "ESP32")];
      let (manager, _rx) = manager(Some(MockAdapter::<DuplexStream>::new(bonded.clone(), [])));

      assert_eq!(manager.list_bonded_peers().await, bonded);
      assert_eq!(manager.list_bonded_peers().await, bonded);
   }

   #[tokio::test]
   async fn test_connect_exchange_and_disconnect() {
      let (local, mut remote) = duplex(1024);
      let target = peer(1, "HC-05");
      let (manager, mut rx) = manager(Some(MockAdapter::new(vec![target.clone()], [local])));

      manager.connect(target.clone()).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));
      assert_eq!(manager.state(), ConnectionState::Connected);
      assert_eq!(manager.current_peer(), Some(target.clone()));

      {
         let adapter = manager.0.adapter.as_ref().unwrap();
         assert_eq!(adapter.discovery_cancels.load(Ordering::SeqCst), 1);
         assert_eq!(*adapter.opened.lock(), [(target.address, SERIAL_PORT_PROFILE)]);
      }

      remote.write_all(b"AB").await.unwrap();
      assert_eq!(next(&mut rx).await, Seen::Data(b"AB".to_vec()));

      manager.send(b"T").await;
      let mut buf = [0u8; 1];
      remote.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"T");

      manager.disconnect();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectionClosed));
      assert_eq!(manager.state(), ConnectionState::Disconnected);
      assert_eq!(manager.current_peer(), None);

      // The peer sees the socket go away.
      assert_eq!(remote.read(&mut buf).await.unwrap(), 0);

      // Nothing arrives once closed, and closing again changes nothing.
      let _ = remote.write_all(b"late").await;
      manager.disconnect();
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_failed_connect_reports_timeout() {
      let target = peer(1, "HC-05");
      let adapter = MockAdapter::<DuplexStream>::new(vec![target.clone()], []);
      let (manager, mut rx) = manager(Some(adapter));

      manager.connect(target).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectTimeout));
      assert_eq!(manager.current_peer(), None);
      assert_eq!(manager.state(), ConnectionState::Disconnected);
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_send_without_link_is_silent() {
      let (manager, mut rx) = manager(Some(MockAdapter::<DuplexStream>::new(vec![], [])));

      assert_eq!(manager.current_peer(), None);
      manager.send(b"T").await;
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_send_after_peer_hangup_writes_nothing() {
      let (local, mut remote) = duplex(64);
      let target = peer(1, "HC-05");
      let (manager, mut rx) = manager(Some(MockAdapter::new(vec![target.clone()], [local])));

      manager.connect(target).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));

      remote.shutdown().await.unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectionClosed));
      assert_eq!(manager.current_peer(), None);

      manager.send(b"T").await;
      let mut buf = [0u8; 1];
      assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_write_failure_is_swallowed() {
      let (stream, _handle) = Builder::new()
         .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"))
         .read(b"x")
         .build_with_handle();
      let target = peer(1, "HC-05");
      let (manager, mut rx) = manager(Some(MockAdapter::new(vec![target.clone()], [stream])));

      manager.connect(target.clone()).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));

      manager.send(b"T").await;
      assert_eq!(next(&mut rx).await, Seen::Data(b"x".to_vec()));
      assert_eq!(manager.state(), ConnectionState::Connected);
      assert_eq!(manager.current_peer(), Some(target));
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_overlapping_connect_is_rejected() {
      let (local, _remote) = duplex(64);
      let target = peer(1, "HC-05");
      let (manager, mut rx) = manager(Some(MockAdapter::new(vec![target.clone()], [local])));

      manager.connect(target.clone()).unwrap();
      assert!(matches!(manager.connect(target.clone()), Err(LinkError::Busy)));

      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));
      assert!(matches!(manager.connect(target), Err(LinkError::Busy)));
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_receive_loop_delivers_chunks_then_closes() {
      let stream = Builder::new()
         .read(&[0x41, 0x42])
         .read(&[0x43])
         .read_error(io::Error::new(io::ErrorKind::ConnectionAborted, "link loss"))
         .build();
      let target = peer(1, "HC-05");
      let (manager, mut rx) = manager(Some(MockAdapter::new(vec![target.clone()], [stream])));

      manager.connect(target).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));
      assert_eq!(next(&mut rx).await, Seen::Data(b"AB".to_vec()));
      assert_eq!(next(&mut rx).await, Seen::Data(b"C".to_vec()));
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectionClosed));

      assert_eq!(manager.current_peer(), None);
      manager.disconnect();
      assert_quiet(&mut rx).await;
   }

   #[tokio::test]
   async fn test_peer_hangup_then_reconnect() {
      let (first, first_remote) = duplex(64);
      let (second, mut second_remote) = duplex(64);
      let target = peer(1, "HC-05");
      let adapter = MockAdapter::new(vec![target.clone()], [first, second]);
      let (manager, mut rx) = manager(Some(adapter));

      manager.connect(target.clone()).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));

      drop(first_remote);
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectionClosed));
      assert_eq!(manager.state(), ConnectionState::Disconnected);

      manager.connect(target.clone()).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));
      assert_eq!(manager.current_peer(), Some(target));

      second_remote.write_all(b"ok").await.unwrap();
      assert_eq!(next(&mut rx).await, Seen::Data(b"ok".to_vec()));
   }

   #[tokio::test]
   async fn test_delivered_chunks_reassemble_stream() {
      let (local, mut remote) = duplex(4096);
      let target = peer(1, "HC-05");
      let (tx, mut rx) = mpsc::unbounded_channel();
      let options = LinkOptions {
         chunk_size: 16,
         ..Default::default()
      };
      let manager = ConnectionManager::new(
         Some(MockAdapter::new(vec![target.clone()], [local])),
         Arc::new(Recorder(tx)),
         options,
      );

      manager.connect(target).unwrap();
      assert_eq!(next(&mut rx).await, Seen::Event(LinkEvent::ConnectSuccess));

      let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
      remote.write_all(&payload).await.unwrap();
      drop(remote);

      let mut received = Vec::new();
      loop {
         match next(&mut rx).await {
            Seen::Data(chunk) => {
               assert!(!chunk.is_empty() && chunk.len() <= 16);
               received.extend(chunk);
            },
            Seen::Event(event) => {
               assert_eq!(event, LinkEvent::ConnectionClosed);
               break;
            },
         }
      }
      assert_eq!(received, payload);
   }
}
