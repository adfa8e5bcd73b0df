//! Background task that owns the read half and the client session state.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use crate::common::{CodecError, TransferError};
use crate::session::{Command, Flow, Session, SessionState};
use crate::transfer::{
    discard_body, receive_entry_file, receive_file, EndSignal, FrameReader, TransferStats,
};
use crate::utils::security::{join_filename, ValidationError};

/// Work handed over by the command loop, in the order it hit the wire.
///
/// The permit is held until the request is finished, so the next request's
/// tokens cannot reach the server while this body is still arriving.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) kind: RequestKind,
    pub(crate) permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    SingleFile(String),
    AllFiles,
}

/// What the receive loop reports back to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    FileReceived { name: String, bytes: u64 },
    /// The request ended without any body bytes
    NoData { name: String },
    FileFailed { name: String, error: String },
    /// The current request is finished
    Idle,
    Disconnected,
}

/// How the file being received was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Named by us with `file`; the server may not have it
    Requested,
    /// Named by the server during `all`
    Announced,
}

pub(crate) struct ReceiveLoop<R> {
    pub(crate) reader: FrameReader<R>,
    pub(crate) session: Session,
    pub(crate) requests: UnboundedReceiver<Request>,
    pub(crate) events: UnboundedSender<ReceiveEvent>,
    pub(crate) download_dir: PathBuf,
    pub(crate) idle_timeout: Duration,
    pub(crate) entry_wait: Duration,
    pub(crate) in_flight: Option<OwnedSemaphorePermit>,
}

impl<R: AsyncRead + Unpin> ReceiveLoop<R> {
    pub(crate) async fn run(mut self) {
        loop {
            let flow = match self.session.state() {
                SessionState::Idle => self.await_request().await,
                SessionState::SingleFileRequest => self.receive_single().await,
                SessionState::AllFilesRequest => self.receive_all().await,
            };

            if flow == Flow::Disconnected {
                info!("receive loop stopped");
                self.emit(ReceiveEvent::Disconnected);
                return;
            }
        }
    }

    async fn await_request(&mut self) -> Flow {
        let Some(request) = self.requests.recv().await else {
            return Flow::Disconnected;
        };

        match request.kind {
            RequestKind::SingleFile(name) => {
                self.session.begin(Command::File);
                self.session.set_current_file(name);
            }
            RequestKind::AllFiles => self.session.begin(Command::All),
        }
        self.in_flight = Some(request.permit);
        debug!(state = %self.session.state(), "request started");
        Flow::Continue
    }

    async fn receive_single(&mut self) -> Flow {
        let Some(name) = self.session.current_file().map(str::to_owned) else {
            self.finish();
            return Flow::Continue;
        };

        let result = self.receive_entry(&name, Delivery::Requested).await;
        let flow = self.report(&name, result, Delivery::Requested);
        if flow == Flow::Continue {
            self.finish();
        }
        flow
    }

    /// Reads the next entry name, then its body. Silence past `entry_wait` ends the request.
    async fn receive_all(&mut self) -> Flow {
        let token = {
            let mut reader = self.reader.scoped_timeout(self.entry_wait);
            reader.read_token().await
        };

        let name = match token {
            Ok(Some(name)) => name,
            Ok(None) => return Flow::Disconnected,
            Err(CodecError::Timeout) => {
                debug!("no further entries");
                self.finish();
                return Flow::Continue;
            }
            // the frame was consumed whole, so only this entry is lost
            Err(CodecError::InvalidToken) => {
                warn!("entry name is not valid UTF-8, skipping its body");
                let name = "<invalid name>";
                let result = discard_body(&mut self.reader, self.idle_timeout)
                    .await
                    .and_then(|_| {
                        Err(TransferError::invalid_name(name, ValidationError::InvalidComponent))
                    });
                return self.report(name, result, Delivery::Announced);
            }
            Err(err) => {
                error!(error = %err, "cannot read entry name");
                return Flow::Disconnected;
            }
        };

        self.session.set_current_file(name.as_str());
        let result = self.receive_entry(&name, Delivery::Announced).await;
        self.report(&name, result, Delivery::Announced)
    }

    /// Unsafe names are refused locally but their body is still consumed.
    async fn receive_entry(
        &mut self,
        name: &str,
        delivery: Delivery,
    ) -> Result<TransferStats, TransferError> {
        match join_filename(&self.download_dir, name) {
            // the server named it, so it exists even if it is empty
            Ok(dest) if delivery == Delivery::Announced => {
                receive_entry_file(&dest, &mut self.reader, self.idle_timeout).await
            }
            Ok(dest) => receive_file(&dest, &mut self.reader, self.idle_timeout).await,
            Err(source) => {
                discard_body(&mut self.reader, self.idle_timeout).await?;
                Err(TransferError::invalid_name(name, source))
            }
        }
    }

    fn report(
        &self,
        name: &str,
        result: Result<TransferStats, TransferError>,
        delivery: Delivery,
    ) -> Flow {
        let name = name.to_string();
        match result {
            Ok(stats) => {
                // a requested file with no body is indistinguishable from a missing one
                if stats.bytes == 0 && delivery == Delivery::Requested {
                    warn!(file = %name, "no data received");
                    self.emit(ReceiveEvent::NoData { name });
                } else {
                    info!(file = %name, bytes = stats.bytes, "file received");
                    self.emit(ReceiveEvent::FileReceived {
                        name,
                        bytes: stats.bytes,
                    });
                }

                if stats.ended_by == EndSignal::PeerClosed {
                    Flow::Disconnected
                } else {
                    Flow::Continue
                }
            }
            Err(err) if err.is_local() => {
                warn!(file = %name, error = %err, "receive failed");
                self.emit(ReceiveEvent::FileFailed {
                    name,
                    error: err.to_string(),
                });
                Flow::Continue
            }
            Err(err) => {
                error!(file = %name, error = %err, "transfer aborted");
                self.emit(ReceiveEvent::FileFailed {
                    name,
                    error: err.to_string(),
                });
                Flow::Disconnected
            }
        }
    }

    /// Back to idle; the next queued request may go out.
    fn finish(&mut self) {
        self.session.reset();
        self.in_flight = None;
        self.emit(ReceiveEvent::Idle);
    }

    fn emit(&self, event: ReceiveEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}
