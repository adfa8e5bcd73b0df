use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use dirdrop::client::ReceiveEvent;
use dirdrop::common::{ClientSettings, ServerSettings, TransferSettings};
use dirdrop::server::FileServer;
use dirdrop::session::SessionRegistry;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Longest any single test waits on the network.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

pub fn transfer_settings() -> TransferSettings {
    TransferSettings {
        chunk_size: 64,
        token_size: 32,
        idle_timeout_ms: 250,
    }
}

pub fn server_settings(folder: &Path, max_sessions: usize) -> ServerSettings {
    ServerSettings {
        address: "127.0.0.1:0".to_string(),
        folder: folder.to_path_buf(),
        max_sessions,
        pause_before_body_ms: 30,
        pause_after_body_ms: 500,
    }
}

pub fn client_settings(addr: SocketAddr, download_dir: &Path) -> ClientSettings {
    ClientSettings {
        address: addr.to_string(),
        download_dir: download_dir.to_path_buf(),
        entry_wait_ms: 1_000,
    }
}

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// A running server sharing its own temp folder. Shut down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shared: TempDir,
    pub registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl TestServer {
    pub fn write_file(&self, name: &str, contents: &str) {
        std::fs::write(self.shared.path().join(name), contents).expect("write shared file");
    }

    /// Polls the registry until it holds `count` sessions.
    pub async fn wait_for_sessions(&self, count: usize) {
        tokio::time::timeout(TEST_DEADLINE, async {
            while self.registry.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never reached");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_server(max_sessions: usize) -> TestServer {
    let shared = setup_temp_dir();
    let server = FileServer::bind(
        &server_settings(shared.path(), max_sessions),
        &transfer_settings(),
    )
    .await
    .expect("server should bind");

    let addr = server.local_addr().expect("local addr");
    let registry = server.registry();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    TestServer {
        addr,
        shared,
        registry,
        shutdown,
    }
}

/// Collects events up to and including the end of the current request.
pub async fn events_until_idle(events: &mut UnboundedReceiver<ReceiveEvent>) -> Vec<ReceiveEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(TEST_DEADLINE, async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, ReceiveEvent::Idle | ReceiveEvent::Disconnected);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("request never finished");
    seen
}
