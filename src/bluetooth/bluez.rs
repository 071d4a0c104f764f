//! BlueZ-backed transport adapter.
//!
//! Streams are opened through an RFCOMM client profile registered with
//! bluetoothd, so the service class UUID is resolved by BlueZ over SDP
//! instead of requiring a fixed channel number.

use bluer::{
   Adapter, Address, Device, Session,
   rfcomm::{Profile, ProfileHandle, Role, Stream},
};
use futures::StreamExt;
use log::{debug, info};
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{PeerDevice, TransportAdapter},
   error::{LinkError, Result},
};

pub struct BluezAdapter {
   session: Session,
   adapter: Adapter,
   profile_name: String,
   /// Client profile currently registered with bluetoothd, by service class
   profile: Mutex<Option<(Uuid, ProfileHandle)>>,
   system_bus: OnceCell<zbus::Connection>,
}

impl BluezAdapter {
   /// Opens the named adapter, or the system default one.
   pub async fn open(name: Option<&str>, profile_name: impl Into<String>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      // Fails early when the adapter object does not exist.
      adapter.address().await?;
      info!("Using Bluetooth adapter {}", adapter.name());

      Ok(Self {
         session,
         adapter,
         profile_name: profile_name.into(),
         profile: Mutex::new(None),
         system_bus: OnceCell::new(),
      })
   }

   async fn describe(device: &Device) -> PeerDevice {
      let address = device.address();
      let name = match device.alias().await {
         Ok(alias) if !alias.is_empty() => SmolStr::from(alias),
         _ => address.to_smolstr(),
      };
      PeerDevice::new(address, name)
   }

   async fn register_profile(&self, service: Uuid) -> Result<ProfileHandle> {
      let profile = Profile {
         uuid: service,
         name: Some(self.profile_name.clone()),
         role: Some(Role::Client),
         require_authentication: Some(false),
         require_authorization: Some(false),
         auto_connect: Some(false),
         ..Default::default()
      };
      debug!("Registering RFCOMM client profile {service}");
      Ok(self.session.register_profile(profile).await?)
   }
}

impl TransportAdapter for BluezAdapter {
   type Stream = Stream;

   async fn is_enabled(&self) -> Result<bool> {
      Ok(self.adapter.is_powered().await?)
   }

   async fn enable(&self) -> Result<()> {
      self.adapter.set_powered(true).await?;
      info!("Powered on adapter: {}", self.adapter.name());
      Ok(())
   }

   async fn bonded_devices(&self) -> Result<Vec<PeerDevice>> {
      let mut peers = Vec::new();
      for addr in self.adapter.device_addresses().await? {
         let device = self.adapter.device(addr)?;
         if device.is_paired().await.unwrap_or(false) {
            peers.push(Self::describe(&device).await);
         }
      }
      Ok(peers)
   }

   async fn remote_device(&self, address: Address) -> Result<PeerDevice> {
      let device = self.adapter.device(address)?;
      Ok(Self::describe(&device).await)
   }

   async fn cancel_discovery(&self) -> Result<()> {
      if !self.adapter.is_discovering().await? {
         return Ok(());
      }

      // BlueZ only lets the client that started an inquiry stop it, so a
      // refusal here is expected when another application is scanning.
      let bus = self
         .system_bus
         .get_or_try_init(zbus::Connection::system)
         .await?;
      let path = format!("/org/bluez/{}", self.adapter.name());
      match bus
         .call_method(
            Some("org.bluez"),
            path.as_str(),
            Some("org.bluez.Adapter1"),
            "StopDiscovery",
            &(),
         )
         .await
      {
         Ok(_) => debug!("Stopped discovery on {}", self.adapter.name()),
         Err(e) => debug!("Discovery on {} left running: {e}", self.adapter.name()),
      }
      Ok(())
   }

   async fn open_stream(&self, address: Address, service: Uuid) -> Result<Stream> {
      let device = self.adapter.device(address)?;

      let mut profile = self.profile.lock().await;
      if !matches!(&*profile, Some((uuid, _)) if *uuid == service) {
         // Dropping the old handle unregisters it.
         *profile = None;
         *profile = Some((service, self.register_profile(service).await?));
      }
      let (_, handle) = profile
         .as_mut()
         .ok_or_else(|| LinkError::ConnectFailed(address, "profile not registered".into()))?;

      debug!("Connecting profile {service} on {address}");
      let connect = async {
         device
            .connect_profile(&service)
            .await
            .map_err(LinkError::from)
      };
      let accept = async {
         while let Some(req) = handle.next().await {
            if req.device() == address {
               return Ok(req.accept()?);
            }
            debug!("Rejecting connect request from {}", req.device());
         }
         Err(LinkError::ConnectFailed(
            address,
            "profile unregistered by bluetoothd".into(),
         ))
      };

      let ((), stream) = tokio::try_join!(connect, accept)?;
      info!("RFCOMM link to {address} established");
      Ok(stream)
   }
}
