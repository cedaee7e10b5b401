//! SSH transport backed by the system OpenSSH client
//!
//! Each `exec` spawns one `ssh` process in batch mode, so sessions hold no
//! shared connection state and concurrent commands cannot interfere.

use crate::transport::traits::{ExecOutput, SshConnector, SshSession, SshTarget, TransportError};
use async_trait::async_trait;
use fleet_shared::AuthMethod;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Exit code OpenSSH reserves for its own errors
const SSH_ERROR_EXIT: i32 = 255;

/// Options shared by every session
#[derive(Debug, Clone)]
pub struct OpenSshOptions {
    /// Path or name of the `ssh` binary
    pub binary: String,
    /// Private key passed with `-i`
    pub identity_file: Option<PathBuf>,
    /// Refuse unknown host keys instead of accepting them on first use
    pub strict_host_key_checking: bool,
    /// Upper bound for a command once the session is up
    pub command_timeout: Duration,
}

impl Default for OpenSshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".into(),
            identity_file: None,
            strict_host_key_checking: false,
            command_timeout: Duration::from_millis(fleet_shared::limits::SSH_COMMAND_TIMEOUT_MS),
        }
    }
}

/// Connector producing OpenSSH-backed sessions
pub struct OpenSshConnector {
    options: OpenSshOptions,
}

impl OpenSshConnector {
    pub fn new(options: OpenSshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        ready_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, TransportError> {
        if target.host.trim().is_empty() {
            return Err(TransportError::Connect("no host address".into()));
        }
        if target.username.trim().is_empty() {
            return Err(TransportError::Auth("no SSH username configured".into()));
        }

        Ok(Box::new(OpenSshSession {
            options: self.options.clone(),
            target: target.clone(),
            ready_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "OpenSSH"
    }
}

/// A session is a target plus options; the process starts per command
pub struct OpenSshSession {
    options: OpenSshOptions,
    target: SshTarget,
    ready_timeout: Duration,
}

impl OpenSshSession {
    /// Arguments for `ssh`, excluding the binary itself
    fn build_args(&self, command_line: &str) -> Vec<String> {
        let connect_secs = self.ready_timeout.as_secs().max(1);
        let host_keys = if self.options.strict_host_key_checking {
            "yes"
        } else {
            "accept-new"
        };

        let mut args = vec![
            "-p".to_string(),
            self.target.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_secs),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", host_keys),
        ];

        if let Some(identity) = &self.options.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        if !self.target.auth_methods.is_empty() {
            let methods: Vec<&str> = self
                .target
                .auth_methods
                .iter()
                .map(|m| match m {
                    AuthMethod::PublicKey => "publickey",
                    AuthMethod::Password => "password",
                    AuthMethod::KeyboardInteractive => "keyboard-interactive",
                })
                .collect();
            args.push("-o".to_string());
            args.push(format!("PreferredAuthentications={}", methods.join(",")));
        }

        args.push("-l".to_string());
        args.push(self.target.username.clone());
        args.push(self.target.host.clone());
        args.push("--".to_string());
        args.push(command_line.to_string());
        args
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn exec(&mut self, command_line: &str) -> Result<ExecOutput, TransportError> {
        let args = self.build_args(command_line);
        debug!(
            "[SSH] {}@{}:{} $ {}",
            self.target.username, self.target.host, self.target.port, command_line
        );

        let child = Command::new(&self.options.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let deadline = self.ready_timeout + self.options.command_timeout;
        let output = match timeout(deadline, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(deadline)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(SSH_ERROR_EXIT) => Err(classify_ssh_failure(&stderr, self.ready_timeout)),
            Some(exit_code) => Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            }),
            None => Err(TransportError::Protocol(
                "ssh terminated by signal".to_string(),
            )),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Map OpenSSH's own error output to a transport error
fn classify_ssh_failure(stderr: &str, ready_timeout: Duration) -> TransportError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("timed out") {
        TransportError::Timeout(ready_timeout)
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        TransportError::Auth(message)
    } else if message.is_empty() {
        TransportError::Connect("ssh exited with status 255".to_string())
    } else {
        TransportError::Connect(message)
    }
}
