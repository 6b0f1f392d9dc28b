use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

mod ssh;

pub use ssh::{Invocation, SshExecutor};

/// Login material for one device, taken from configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("port", &self.port)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Remote to local.
    Get,
    /// Local to remote.
    Put,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub direction: TransferDirection,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Missing or unusable credentials/host settings. Retrying cannot help.
    #[error("remote configuration error: {0}")]
    Configuration(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: String, timeout: Duration },
    #[error("{what} failed ({status}): {stderr}")]
    Failed {
        what: String,
        status: ExitStatusCode,
        stderr: String,
    },
    #[error("local path {path}: {source}")]
    LocalPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, RemoteError::Configuration(_))
    }
}

/// Exit code of a finished child, or `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusCode(pub Option<i32>);

impl fmt::Display for ExitStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit status {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Bounded-time access to the fleet's hosts.
///
/// Implementations never retry and never run past `timeout`; every failure
/// comes back as a [`RemoteError`]. Wrapping long transfers in job-ledger
/// bookkeeping is the caller's concern.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run_command(
        &self,
        host: &str,
        credentials: &Credentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    async fn transfer_file(
        &self,
        direction: TransferDirection,
        host: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<TransferReport, RemoteError>;
}
