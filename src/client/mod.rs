//! Client side: a command half that sends requests and a receive task that stores files.

mod receiver;

pub use receiver::ReceiveEvent;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::common::{AppError, ClientSettings, SessionError, TransferError, TransferSettings};
use crate::session::{Command, Session};
use crate::transfer::{FrameReader, FrameWriter};
use crate::utils::security::validate_filename;
use receiver::{ReceiveLoop, Request, RequestKind};

/// A connected client. Only this half writes to the server.
pub struct Client {
    writer: FrameWriter<OwnedWriteHalf>,
    requests: UnboundedSender<Request>,
    /// One request on the wire at a time
    in_flight: Arc<Semaphore>,
    receiver: JoinHandle<()>,
    server: SocketAddr,
}

impl Client {
    /// Connects and starts the receive task. Its events arrive on the returned channel.
    pub async fn connect(
        settings: &ClientSettings,
        transfer: &TransferSettings,
    ) -> Result<(Self, UnboundedReceiver<ReceiveEvent>), AppError> {
        let connect_err = |source| AppError::Connect {
            addr: settings.address.clone(),
            source,
        };

        let stream = TcpStream::connect(settings.address.as_str())
            .await
            .map_err(connect_err)?;
        let server = stream.peer_addr().map_err(connect_err)?;
        // the read half goes to the receive task, we keep the write half
        let (read, write) = stream.into_split();

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let receive_loop = ReceiveLoop {
            reader: FrameReader::new(read, transfer),
            session: Session::new(server),
            requests: requests_rx,
            events: events_tx,
            download_dir: settings.download_dir.clone(),
            idle_timeout: transfer.idle_timeout(),
            entry_wait: settings.entry_wait(),
            in_flight: None,
        };
        let receiver = tokio::spawn(receive_loop.run());

        info!(server = %server, "connected");
        Ok((
            Self {
                writer: FrameWriter::new(write, transfer),
                requests: requests_tx,
                in_flight: Arc::new(Semaphore::new(1)),
                receiver,
                server,
            },
            events_rx,
        ))
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Asks for one file. Bad names are refused here and never reach the server.
    ///
    /// Waits for any earlier request to finish before sending.
    pub async fn request_file(&mut self, name: &str) -> Result<(), SessionError> {
        validate_filename(name).map_err(|e| TransferError::invalid_name(name, e))?;
        self.writer.check_token(name)?;

        // the receive loop must be waiting before the reply can arrive
        self.queue(RequestKind::SingleFile(name.to_string())).await?;
        self.writer.write_token(Command::File.as_token()).await?;
        self.writer.write_token(name).await?;
        debug!(file = %name, "file requested");
        Ok(())
    }

    /// Asks for every file in the server's shared folder.
    pub async fn request_all(&mut self) -> Result<(), SessionError> {
        self.queue(RequestKind::AllFiles).await?;
        self.writer.write_token(Command::All.as_token()).await?;
        debug!("all files requested");
        Ok(())
    }

    /// Closes the connection. A transfer still in progress is abandoned.
    pub async fn close(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "shutdown failed");
        }
        drop(self.requests);
        // it may be parked on a read that never ends
        self.receiver.abort();
        info!(server = %self.server, "disconnected");
    }

    async fn queue(&self, kind: RequestKind) -> Result<(), SessionError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::ReceiverStopped)?;
        self.requests
            .send(Request { kind, permit })
            .map_err(|_| SessionError::ReceiverStopped)
    }
}
