//! Per-connection state machine on the server side.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::folder::SharedFolder;
use crate::common::{CodecError, SessionError, TransferError, TransferSettings};
use crate::session::{Command, Flow, Session, SessionState};
use crate::transfer::{send_file, FrameReader, FrameWriter, TransferStats};

/// Read-only state shared by every session of one server.
#[derive(Debug)]
pub struct ServeContext {
    pub folder: SharedFolder,
    pub transfer: TransferSettings,
    /// Lets the client switch from reading a name to reading a body
    pub pause_before_body: Duration,
    /// Lets the client's idle timeout fire before the next name goes out
    pub pause_after_body: Duration,
}

/// Serves one client until it disconnects or the connection fails.
pub async fn handle_connection<S>(
    stream: S,
    session: Session,
    ctx: Arc<ServeContext>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    let handler = ConnectionHandler {
        reader: FrameReader::new(read, &ctx.transfer),
        writer: FrameWriter::new(write, &ctx.transfer),
        session,
        ctx,
    };
    handler.run().await
}

struct ConnectionHandler<R, W> {
    session: Session,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    ctx: Arc<ServeContext>,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) -> Result<(), SessionError> {
        info!("client connected");

        loop {
            let flow = match self.session.state() {
                SessionState::Idle => self.await_command().await?,
                SessionState::SingleFileRequest => self.serve_single().await?,
                SessionState::AllFilesRequest => self.serve_all().await?,
            };

            if flow == Flow::Disconnected {
                info!("client disconnected");
                return Ok(());
            }
        }
    }

    /// Blocks on the next control token; no timeout while idle.
    async fn await_command(&mut self) -> Result<Flow, SessionError> {
        let token = match self.reader.read_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(Flow::Disconnected),
            // the whole frame was consumed, so the next one is still aligned
            Err(CodecError::InvalidToken) => {
                warn!("command is not valid UTF-8, ignoring it");
                return Ok(Flow::Continue);
            }
            Err(err) => return Err(err.into()),
        };

        match Command::parse(&token) {
            Ok(command) => {
                debug!(command = command.as_token(), "command received");
                self.session.begin(command);
            }
            Err(err) => warn!("{err}"),
        }
        Ok(Flow::Continue)
    }

    async fn serve_single(&mut self) -> Result<Flow, SessionError> {
        let name = match self.reader.read_token().await {
            Ok(Some(name)) => name,
            Ok(None) => return Ok(Flow::Disconnected),
            Err(CodecError::InvalidToken) => {
                // same as a missing file: nothing is sent back
                warn!("requested file name is not valid UTF-8");
                self.session.reset();
                return Ok(Flow::Continue);
            }
            Err(err) => return Err(err.into()),
        };
        self.session.set_current_file(name.as_str());
        info!(file = %name, "file requested");

        let result = match self.ctx.folder.resolve(&name).await {
            Ok(path) => send_file(&path, &mut self.writer).await,
            Err(err) => Err(err),
        };

        // missing files end the request, not the connection
        self.session.reset();
        report(&name, result)?;
        Ok(Flow::Continue)
    }

    async fn serve_all(&mut self) -> Result<Flow, SessionError> {
        info!("all files requested");

        let entries = match self.ctx.folder.list().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "cannot list shared folder");
                self.session.reset();
                return Ok(Flow::Continue);
            }
        };

        let mut sent = 0usize;
        for entry in &entries {
            self.session.set_current_file(entry.name.as_str());

            match self.writer.write_token(&entry.name).await {
                Ok(()) => {}
                Err(CodecError::TokenTooLong { len, limit }) => {
                    warn!(
                        file = %entry.name,
                        len,
                        limit,
                        "file name does not fit a token frame, skipping"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            tokio::time::sleep(self.ctx.pause_before_body).await;
            let result = send_file(&entry.path, &mut self.writer).await;
            if report(&entry.name, result)? {
                sent += 1;
            }
            tokio::time::sleep(self.ctx.pause_after_body).await;
        }

        info!(sent, listed = entries.len(), "all files sent");
        self.session.reset();
        Ok(Flow::Continue)
    }
}

/// Logs a pass. Local failures are swallowed (`Ok(false)`); transport failures end the session.
fn report(name: &str, result: Result<TransferStats, TransferError>) -> Result<bool, TransferError> {
    match result {
        Ok(stats) => {
            info!(file = %name, bytes = stats.bytes, chunks = stats.chunks, "file sent");
            Ok(true)
        }
        Err(err) if err.is_local() => {
            warn!(file = %name, error = %err, "request failed");
            Ok(false)
        }
        Err(err) => {
            tracing::error!(file = %name, error = %err, "transfer aborted");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{discard_body, receive_entry_file, receive_file};
    use std::path::Path;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    type ClientReader = FrameReader<ReadHalf<DuplexStream>>;
    type ClientWriter = FrameWriter<WriteHalf<DuplexStream>>;

    const IDLE: Duration = Duration::from_millis(150);

    fn transfer() -> TransferSettings {
        TransferSettings {
            chunk_size: 32,
            token_size: 32,
            idle_timeout_ms: 150,
        }
    }

    async fn start(
        shared: &Path,
    ) -> (ClientReader, ClientWriter, JoinHandle<Result<(), SessionError>>) {
        let ctx = Arc::new(ServeContext {
            folder: SharedFolder::open(shared).await.unwrap(),
            transfer: transfer(),
            pause_before_body: Duration::from_millis(10),
            pause_after_body: Duration::from_millis(300),
        });
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = Session::new("127.0.0.1:9".parse().unwrap());
        let task = tokio::spawn(handle_connection(server, session, ctx));

        let (read, write) = tokio::io::split(client);
        (
            FrameReader::new(read, &transfer()),
            FrameWriter::new(write, &transfer()),
            task,
        )
    }

    #[tokio::test]
    async fn serves_single_file_and_stays_open() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("a.txt"), "hello\n").unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        for round in 0..2 {
            writer.write_token("file").await.unwrap();
            writer.write_token("a.txt").await.unwrap();
            let dest = out.path().join(format!("a-{round}.txt"));
            receive_file(&dest, &mut reader, IDLE).await.unwrap();
            assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");
        }

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn missing_file_sends_nothing_and_keeps_session() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("b.txt"), "world\n").unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        writer.write_token("file").await.unwrap();
        writer.write_token("missing.txt").await.unwrap();
        let missing = out.path().join("missing.txt");
        let stats = receive_file(&missing, &mut reader, IDLE).await.unwrap();
        assert_eq!(stats.bytes, 0);
        assert!(!missing.exists());

        writer.write_token("file").await.unwrap();
        writer.write_token("b.txt").await.unwrap();
        let dest = out.path().join("b.txt");
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "world\n");

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unrecognized_command_is_ignored() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("a.txt"), "hello\n").unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        writer.write_token("FILE").await.unwrap();
        writer.write_token("file").await.unwrap();
        writer.write_token("a.txt").await.unwrap();
        let dest = out.path().join("a.txt");
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn all_sends_name_then_body_per_entry() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("a.txt"), "hello\n").unwrap();
        std::fs::write(shared.path().join("b.txt"), "world\n").unwrap();
        let (mut reader, mut writer, _task) = start(shared.path()).await;

        writer.write_token("all").await.unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let name = reader.read_token().await.unwrap().unwrap();
            let dest = out.path().join(&name);
            receive_file(&dest, &mut reader, IDLE).await.unwrap();
            received.push((name, std::fs::read_to_string(&dest).unwrap()));
        }
        received.sort();
        assert_eq!(
            received,
            vec![
                ("a.txt".to_string(), "hello\n".to_string()),
                ("b.txt".to_string(), "world\n".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn skips_names_too_long_for_a_token() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let long_name = format!("{}.txt", "x".repeat(40));
        std::fs::write(shared.path().join(&long_name), "skipped\n").unwrap();
        std::fs::write(shared.path().join("ok.txt"), "kept\n").unwrap();
        let (mut reader, mut writer, _task) = start(shared.path()).await;

        writer.write_token("all").await.unwrap();

        let name = reader.read_token().await.unwrap().unwrap();
        assert_eq!(name, "ok.txt");
        let dest = out.path().join(&name);
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "kept\n");
    }

    #[tokio::test]
    async fn undecodable_command_is_ignored() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("a.txt"), "hello\n").unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        // chunk and token frames are the same size here
        writer.write_chunk(&[0xff, 0xfe]).await.unwrap();
        writer.write_token("file").await.unwrap();
        writer.write_token("a.txt").await.unwrap();
        let dest = out.path().join("a.txt");
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn undecodable_file_name_is_treated_as_missing() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("a.txt"), "hello\n").unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        writer.write_token("file").await.unwrap();
        writer.write_chunk(&[b'a', 0xff, 0xfe]).await.unwrap();
        let nothing = out.path().join("nothing.txt");
        let stats = receive_file(&nothing, &mut reader, IDLE).await.unwrap();
        assert_eq!(stats.bytes, 0);
        assert!(!nothing.exists());

        writer.write_token("file").await.unwrap();
        writer.write_token("a.txt").await.unwrap();
        let dest = out.path().join("a.txt");
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn all_on_empty_folder_sends_nothing() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (mut reader, mut writer, task) = start(shared.path()).await;

        writer.write_token("all").await.unwrap();
        let stats = discard_body(&mut reader, IDLE).await.unwrap();
        assert_eq!(stats.bytes, 0);

        // a file added later is served on the same connection
        std::fs::write(shared.path().join("late.txt"), "late\n").unwrap();
        writer.write_token("file").await.unwrap();
        writer.write_token("late.txt").await.unwrap();
        let dest = out.path().join("late.txt");
        receive_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "late\n");

        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn empty_file_is_announced_without_a_body() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("empty.txt"), "").unwrap();
        let (mut reader, mut writer, _task) = start(shared.path()).await;

        writer.write_token("all").await.unwrap();
        let name = reader.read_token().await.unwrap().unwrap();
        assert_eq!(name, "empty.txt");
        let dest = out.path().join(&name);
        let stats = receive_entry_file(&dest, &mut reader, IDLE).await.unwrap();
        assert_eq!(stats.bytes, 0);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "");
    }

    #[tokio::test]
    async fn disconnect_while_idle_ends_session_cleanly() {
        let shared = tempfile::tempdir().unwrap();
        let (_reader, writer, task) = start(shared.path()).await;
        drop(writer);
        assert!(task.await.unwrap().is_ok());
    }
}
