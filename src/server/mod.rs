pub mod folder;
pub mod handlers;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::common::{AppError, ServerSettings, TransferSettings};
use crate::session::{Session, SessionRegistry};
use folder::SharedFolder;
use handlers::{handle_connection, ServeContext};

/// Accepts clients and gives each one its own session task.
pub struct FileServer {
    listener: TcpListener,
    ctx: Arc<ServeContext>,
    permits: Arc<Semaphore>,
    registry: SessionRegistry,
    max_sessions: usize,
}

impl FileServer {
    pub async fn bind(
        settings: &ServerSettings,
        transfer: &TransferSettings,
    ) -> Result<Self, AppError> {
        let folder = SharedFolder::open(&settings.folder).await?;

        let bind_err = |source| AppError::Bind {
            addr: settings.address.clone(),
            source,
        };

        let addr = lookup_host(settings.address.as_str())
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| bind_err(io::Error::new(io::ErrorKind::NotFound, "no address")))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_err)?;
        // quick restarts should not trip over TIME_WAIT
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;

        let backlog = u32::try_from(settings.max_sessions).unwrap_or(u32::MAX);
        let listener = socket.listen(backlog).map_err(|source| AppError::Listen {
            addr: settings.address.clone(),
            source,
        })?;

        info!(
            address = %addr,
            folder = %folder.root().display(),
            max_sessions = settings.max_sessions,
            "server listening"
        );

        Ok(Self {
            listener,
            ctx: Arc::new(ServeContext {
                folder,
                transfer: *transfer,
                pause_before_body: settings.pause_before_body(),
                pause_after_body: settings.pause_after_body(),
            }),
            permits: Arc::new(Semaphore::new(settings.max_sessions)),
            registry: SessionRegistry::new(),
            max_sessions: settings.max_sessions,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Serves until `shutdown` fires; live sessions are cancelled with it.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };

            // full: the client sees an immediate close
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                let err = AppError::CapacityExceeded {
                    limit: self.max_sessions,
                    peer,
                };
                warn!("{err}");
                drop(stream);
                continue;
            };

            let session = Session::new(peer);
            let id = session.id();
            self.registry.register(&session);

            let registry = self.registry.clone();
            let ctx = self.ctx.clone();
            let cancel = shutdown.child_token();
            // every log line from this task carries the session id
            let span = info_span!("session", id = %id, peer = %peer);

            tokio::spawn(
                async move {
                    tokio::select! {
                        result = handle_connection(stream, session, ctx) => {
                            if let Err(err) = result {
                                error!(error = %err, "session ended");
                            }
                        }
                        _ = cancel.cancelled() => debug!("session cancelled"),
                    }

                    registry.unregister(&id);
                    drop(permit);
                }
                .instrument(span),
            );
        }

        // sessions still open are cancelled through their child tokens
        let peers = self.registry.peers();
        info!(live = peers.len(), peers = ?peers, "server stopped accepting");
    }
}
