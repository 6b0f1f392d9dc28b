use std::{
    path::Path,
    process::{Output, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{
    CommandOutput, Credentials, ExitStatusCode, RemoteError, RemoteExecutor, TransferDirection,
    TransferReport,
};

const SSHPASS_ENV: &str = "SSHPASS";

/// A fully resolved child process: program, arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// [`RemoteExecutor`] backed by the system OpenSSH client.
///
/// Key-based logins run `ssh`/`scp` in batch mode. When a password is
/// configured the client is wrapped in `sshpass -e`, which reads the password
/// from the environment so it never shows up in the process list.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_program: String,
    scp_program: String,
    sshpass_program: String,
    connect_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".into(),
            scp_program: "scp".into(),
            sshpass_program: "sshpass".into(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_programs(
        ssh_program: impl Into<String>,
        scp_program: impl Into<String>,
        sshpass_program: impl Into<String>,
    ) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            scp_program: scp_program.into(),
            sshpass_program: sshpass_program.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn command_invocation(
        &self,
        host: &str,
        credentials: &Credentials,
        command: &str,
    ) -> Result<Invocation, RemoteError> {
        validate_target(host, credentials)?;
        if command.trim().is_empty() {
            return Err(RemoteError::Configuration("remote command is empty".into()));
        }

        let mut args = self.common_options(credentials);
        if let Some(port) = credentials.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        args.push(format!("{}@{}", credentials.username, host));
        args.push(command.to_string());
        Ok(self.wrap(&self.ssh_program, args, credentials))
    }

    pub fn transfer_invocation(
        &self,
        direction: TransferDirection,
        host: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<Invocation, RemoteError> {
        validate_target(host, credentials)?;
        if remote_path.trim().is_empty() {
            return Err(RemoteError::Configuration("remote path is empty".into()));
        }

        let mut args = self.common_options(credentials);
        args.push("-r".into());
        if let Some(port) = credentials.port {
            args.push("-P".into());
            args.push(port.to_string());
        }
        let remote = format!("{}@{}:{}", credentials.username, host, remote_path);
        let local = local_path.to_string_lossy().into_owned();
        match direction {
            TransferDirection::Get => {
                args.push(remote);
                args.push(local);
            }
            TransferDirection::Put => {
                args.push(local);
                args.push(remote);
            }
        }
        Ok(self.wrap(&self.scp_program, args, credentials))
    }

    fn common_options(&self, credentials: &Credentials) -> Vec<String> {
        let mut args = Vec::new();
        if credentials.password.is_none() {
            args.push("-o".into());
            args.push("BatchMode=yes".into());
        }
        args.push("-o".into());
        args.push("StrictHostKeyChecking=accept-new".into());
        args.push("-o".into());
        args.push(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ));
        if let Some(identity) = &credentials.identity_file {
            args.push("-i".into());
            args.push(identity.to_string_lossy().into_owned());
        }
        args
    }

    fn wrap(&self, program: &str, args: Vec<String>, credentials: &Credentials) -> Invocation {
        match &credentials.password {
            Some(password) => {
                let mut wrapped = vec!["-e".to_string(), program.to_string()];
                wrapped.extend(args);
                Invocation {
                    program: self.sshpass_program.clone(),
                    args: wrapped,
                    env: vec![(SSHPASS_ENV.to_string(), password.clone())],
                }
            }
            None => Invocation {
                program: program.to_string(),
                args,
                env: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run_command(
        &self,
        host: &str,
        credentials: &Credentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let invocation = self.command_invocation(host, credentials, command)?;
        let what = format!("command on {host}");
        let started = Instant::now();
        let output = execute(&what, invocation, timeout).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        })
    }

    async fn transfer_file(
        &self,
        direction: TransferDirection,
        host: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<TransferReport, RemoteError> {
        let invocation =
            self.transfer_invocation(direction, host, credentials, remote_path, local_path)?;
        if direction == TransferDirection::Get {
            if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| RemoteError::LocalPath {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let what = format!("transfer with {host}");
        let started = Instant::now();
        execute(&what, invocation, timeout).await?;
        Ok(TransferReport {
            direction,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            elapsed: started.elapsed(),
        })
    }
}

fn validate_target(host: &str, credentials: &Credentials) -> Result<(), RemoteError> {
    if host.trim().is_empty() {
        return Err(RemoteError::Configuration("host is empty".into()));
    }
    if credentials.username.trim().is_empty() {
        return Err(RemoteError::Configuration(format!(
            "no username configured for {host}"
        )));
    }
    Ok(())
}

/// Runs the child to completion or kills it once `timeout` expires.
async fn execute(
    what: &str,
    invocation: Invocation,
    timeout: Duration,
) -> Result<Output, RemoteError> {
    debug!(program = %invocation.program, %what, ?timeout, "remote: spawning");
    let child = Command::new(&invocation.program)
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RemoteError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    // Dropping the child on timeout kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(RemoteError::Spawn {
                program: invocation.program,
                source,
            })
        }
        Err(_) => {
            return Err(RemoteError::Timeout {
                what: what.to_string(),
                timeout,
            })
        }
    };

    if output.status.success() {
        return Ok(output);
    }
    Err(RemoteError::Failed {
        what: what.to_string(),
        status: ExitStatusCode(output.status.code()),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
#[path = "tests/ssh_tests.rs"]
mod tests;
