//! Running a fixed provisioning script on a freshly created instance.

use crate::lifecycle::WaitConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;

pub mod ssh;

/// An ordered list of shell commands fixed at build time.
/// There is no branching: every command must succeed before the next one runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProvisioningScript {
    pub name: &'static str,
    pub commands: &'static [&'static str],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the command did not report an exit status, e.g. because it was killed.
    pub exit_status: Option<u32>,
    /// Set when the command was killed by a signal
    pub signal: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.signal.is_none() && self.exit_status == Some(0)
    }

    fn failure_description(&self) -> String {
        match (&self.signal, self.exit_status) {
            (Some(signal), _) => format!("was {signal}"),
            (None, Some(status)) => format!("failed with exit code {status}"),
            (None, None) => "did not exit cleanly".to_owned(),
        }
    }
}

impl Display for CommandOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.stdout.is_empty() {
            write!(f, "stdout:\n{}", self.stdout)?;
        }
        if !self.stderr.is_empty() {
            write!(f, "stderr:\n{}", self.stderr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Step {step} of the {script} script, `{command}`, {description}\n{output}")]
    CommandFailed {
        script: &'static str,
        step: usize,
        command: &'static str,
        description: String,
        output: CommandOutput,
    },
    #[error("Failed to run step {step} of the {script} script, `{command}`")]
    Transport {
        script: &'static str,
        step: usize,
        command: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("Timed out after {timeout:?} trying to connect to {address} over ssh, last error was: {last_error}")]
    ConnectTimedOut {
        address: SocketAddr,
        timeout: std::time::Duration,
        last_error: String,
    },
}

/// Something that can run a single command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` to completion.
    /// Only failures to deliver the command are errors, a non-zero exit is reported in the [`CommandOutput`].
    async fn exec(&self, command: &str) -> Result<CommandOutput>;
}

/// Runs each command of `script` in order, stopping at the first one that does not succeed.
pub async fn run_script(
    shell: &dyn RemoteShell,
    script: &ProvisioningScript,
) -> Result<(), RemoteError> {
    for (index, &command) in script.commands.iter().enumerate() {
        let step = index + 1;
        tracing::info!("{} script step {step}/{}: {command}", script.name, script.commands.len());
        let output = shell
            .exec(command)
            .await
            .map_err(|source| RemoteError::Transport {
                script: script.name,
                step,
                command,
                source,
            })?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                script: script.name,
                step,
                command,
                description: output.failure_description(),
                output,
            });
        }
    }
    Ok(())
}

pub struct SshCredentials {
    pub user: String,
    pub private_key: String,
}

impl SshCredentials {
    pub async fn from_file(user: &str, private_key_file: &Path) -> Result<Self> {
        let private_key = tokio::fs::read_to_string(private_key_file)
            .await
            .with_context(|| format!("Failed to read private key from {private_key_file:?}"))?;
        Ok(SshCredentials {
            user: user.to_owned(),
            private_key,
        })
    }
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

const SSH_PORT: u16 = 22;

/// Connects to `endpoint`, retrying until it accepts connections or `wait.timeout` passes, then runs `script`.
pub async fn configure(
    endpoint: IpAddr,
    credentials: &SshCredentials,
    script: &ProvisioningScript,
    wait: &WaitConfig,
) -> Result<()> {
    let address = SocketAddr::new(endpoint, SSH_PORT);
    let connection = ssh::SshConnection::connect_with_retry(address, credentials, wait).await?;
    run_script(&connection, script).await?;
    tracing::info!("Finished the {} script on {endpoint}", script.name);
    Ok(())
}

/// The configuration step of a lifecycle, so that drivers can be exercised without a real host.
#[async_trait]
pub trait Configurator: Send + Sync {
    async fn configure(&self, endpoint: IpAddr, script: &ProvisioningScript) -> Result<()>;
}

pub struct SshConfigurator {
    pub credentials: SshCredentials,
    pub wait: WaitConfig,
}

#[async_trait]
impl Configurator for SshConfigurator {
    async fn configure(&self, endpoint: IpAddr, script: &ProvisioningScript) -> Result<()> {
        configure(endpoint, &self.credentials, script, &self.wait).await
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Records every command and fails the ones listed in `failing`.
    #[derive(Default)]
    pub(crate) struct FakeShell {
        pub(crate) ran: Mutex<Vec<String>>,
        pub(crate) failing: Vec<&'static str>,
        pub(crate) broken_transport: bool,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, command: &str) -> Result<CommandOutput> {
            if self.broken_transport {
                anyhow::bail!("channel closed");
            }
            self.ran.lock().unwrap().push(command.to_owned());
            if self.failing.iter().any(|failing| *failing == command) {
                Ok(CommandOutput {
                    stderr: "mkfs: no such device\n".to_owned(),
                    exit_status: Some(1),
                    ..Default::default()
                })
            } else {
                Ok(CommandOutput {
                    exit_status: Some(0),
                    ..Default::default()
                })
            }
        }
    }

    const SCRIPT: ProvisioningScript = ProvisioningScript {
        name: "test",
        commands: &["echo one", "false", "echo three"],
    };

    #[tokio::test]
    async fn runs_every_command_in_order() {
        let shell = FakeShell::default();
        run_script(&shell, &SCRIPT).await.unwrap();
        assert_eq!(
            *shell.ran.lock().unwrap(),
            vec!["echo one", "false", "echo three"]
        );
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let shell = FakeShell {
            failing: vec!["false"],
            ..Default::default()
        };
        let err = run_script(&shell, &SCRIPT).await.unwrap_err();

        assert_eq!(*shell.ran.lock().unwrap(), vec!["echo one", "false"]);
        assert_eq!(
            err.to_string(),
            "Step 2 of the test script, `false`, failed with exit code 1\nstderr:\nmkfs: no such device\n"
        );
    }

    #[tokio::test]
    async fn transport_failure() {
        let shell = FakeShell {
            broken_transport: true,
            ..Default::default()
        };
        let err = run_script(&shell, &SCRIPT).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport { step: 1, .. }));
    }

    #[test]
    fn killed_command_is_not_success() {
        let output = CommandOutput {
            exit_status: Some(0),
            signal: Some("killed via signal KILL".to_owned()),
            ..Default::default()
        };
        assert!(!output.success());
        assert_eq!(output.failure_description(), "was killed via signal KILL");
    }
}
