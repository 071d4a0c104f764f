//! Byte-stream plumbing for one open serial link.
//!
//! The stream is split into a reader task and a writer task, both owned by
//! the caller's `JoinSet`. Aborting the set closes the socket, and the
//! receiver half then reports [`LinkError::ConnectionClosed`], the same
//! as when the peer goes away.

use std::time::Duration;

use bluer::Address;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{LinkError, Result};

/// Read buffer size used unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Holds a default-sized read inline.
pub type Chunk = SmallVec<[u8; DEFAULT_CHUNK_SIZE]>;
/// Queue depth between the socket tasks and their handles
const CHANNEL_BUFFER_SIZE: usize = 128;

enum Command {
   Send {
      data: Chunk,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of a serial link.
#[derive(Debug)]
pub struct LinkReceiver {
   rx: mpsc::Receiver<Result<Chunk>>,
}

impl LinkReceiver {
   /// Next chunk in read order, or the error that ended the stream.
   pub async fn recv(&mut self) -> Result<Chunk> {
      self.rx.recv().await.ok_or(LinkError::ConnectionClosed)?
   }
}

/// Sender half of a serial link.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Command>,
   write_timeout: Duration,
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Queues `data` and waits until it has been written and flushed.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(LinkError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Chunk::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| LinkError::ConnectionClosed)?;

      time::timeout(self.write_timeout, rx)
         .await
         .map_err(|_| LinkError::RequestTimeout)?
         .map_err(|_| LinkError::ConnectionClosed)?
   }
}

/// Starts the socket tasks for `stream` inside `jset`.
pub fn spawn<S>(
   jset: &mut JoinSet<()>,
   stream: S,
   address: Address,
   chunk_size: usize,
   write_timeout: Duration,
) -> (LinkReceiver, LinkSender)
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   let (reader, writer) = tokio::io::split(stream);
   let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

   jset.spawn(recv_thread(address, in_tx, reader, chunk_size.max(1)));
   jset.spawn(send_thread(address, cmd_rx, writer));

   (
      LinkReceiver { rx: in_rx },
      LinkSender {
         tx: cmd_tx,
         write_timeout,
      },
   )
}

async fn recv_thread<R>(
   adr: Address,
   tx: mpsc::Sender<Result<Chunk>>,
   mut reader: R,
   chunk_size: usize,
) where
   R: AsyncRead + Unpin,
{
   let mut buf = vec![0u8; chunk_size];
   let err = loop {
      match reader.read(&mut buf).await {
         Ok(0) => {
            warn!("{adr}: Stream closed by peer");
            break LinkError::ConnectionClosed;
         },
         Ok(n) => {
            let recvd = &buf[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            if let Err(e) = tx.send(Ok(Chunk::from_slice(recvd))).await {
               warn!("Failed to forward data: {e:?}");
               return;
            }
         },
         Err(e) => {
            warn!("{adr}: Read failed: {e}");
            break LinkError::Io(e);
         },
      }
   };
   let _ = tx.send(Err(err)).await;
}

async fn send_thread<W>(adr: Address, mut rx: mpsc::Receiver<Command>, mut writer: W)
where
   W: AsyncWrite + Unpin,
{
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let written = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(e) = written {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(LinkError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: Writer shut down");
   let _ = writer.shutdown().await;
}
