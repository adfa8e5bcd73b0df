use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::common::SessionError;

/// Control tokens a client sends to start a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `file`: one named file follows
    File,
    /// `all`: every file in the shared folder
    All,
}

impl Command {
    pub fn as_token(&self) -> &'static str {
        match self {
            Command::File => "file",
            Command::All => "all",
        }
    }

    /// Tokens are case-sensitive.
    pub fn parse(token: &str) -> Result<Self, SessionError> {
        match token {
            "file" => Ok(Command::File),
            "all" => Ok(Command::All),
            other => Err(SessionError::UnrecognizedCommand(other.to_string())),
        }
    }
}

/// Whether a state handler leaves the connection usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    SingleFileRequest,
    AllFilesRequest,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::SingleFileRequest => "single-file",
            SessionState::AllFilesRequest => "all-files",
        };
        f.write_str(name)
    }
}

/// Protocol state of one connection.
///
/// Owned by the single task driving the connection; never shared.
/// `current_file` is cleared whenever the session returns to idle.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    state: SessionState,
    current_file: Option<String>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: SessionState::Idle,
            current_file: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Only `Some` while a request is in progress.
    pub fn current_file(&self) -> Option<&str> {
        match self.state {
            SessionState::Idle => None,
            _ => self.current_file.as_deref(),
        }
    }

    pub fn begin(&mut self, command: Command) {
        self.state = match command {
            Command::File => SessionState::SingleFileRequest,
            Command::All => SessionState::AllFilesRequest,
        };
        self.current_file = None;
    }

    pub fn set_current_file(&mut self, name: impl Into<String>) {
        self.current_file = Some(name.into());
    }

    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.current_file = None;
    }
}

/// Live sessions of one server, keyed by session id.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SocketAddr>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: &Session) {
        self.sessions.insert(session.id(), session.peer());
    }

    pub fn unregister(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|entry| *entry.value()).collect()
    }
}
