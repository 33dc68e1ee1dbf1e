use super::{CommandOutput, RemoteError, RemoteShell, SshCredentials};
use crate::lifecycle::WaitConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use russh::{
    client::{Config, Handle, Handler},
    ChannelMsg,
};
use russh_keys::key::PublicKey;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::Instant};

pub struct SshConnection {
    address: SocketAddr,
    session: Handle<Client>,
}

impl SshConnection {
    pub async fn new(
        stream: TcpStream,
        address: SocketAddr,
        credentials: &SshCredentials,
    ) -> Result<Self> {
        let config = Arc::new(Config::default());

        let key = Arc::new(
            russh_keys::decode_secret_key(&credentials.private_key, None)
                .map_err(|e| anyhow!(e).context("Failed to decode the ssh private key"))?,
        );
        let mut session = russh::client::connect_stream(config, stream, Client { address }).await?;
        if session
            .authenticate_publickey(credentials.user.as_str(), key)
            .await?
        {
            tracing::info!("Successfully connected to {address} over ssh");
            Ok(SshConnection { session, address })
        } else {
            Err(anyhow!(
                "Authentication with ssh server failed for user {}",
                credentials.user
            ))
        }
    }

    /// Connects to `address`, retrying until the host accepts ssh connections or `wait.timeout` passes.
    pub async fn connect_with_retry(
        address: SocketAddr,
        credentials: &SshCredentials,
        wait: &WaitConfig,
    ) -> Result<Self, RemoteError> {
        let deadline = Instant::now() + wait.timeout;
        loop {
            let start = Instant::now();
            // A freshly launched instance goes through each of these failures in order before ssh works.
            // Each is expected so they are logged with `info!` rather than returned.
            let last_error = match tokio::time::timeout(
                Duration::from_secs(10),
                TcpStream::connect(address),
            )
            .await
            {
                Err(_) => {
                    tracing::info!("Timed out connecting to {address} over ssh, the host is probably not accessible yet, retrying");
                    "tcp connect timed out".to_owned()
                }
                Ok(Err(e)) => {
                    tracing::info!("failed to connect to {address}, the host probably hasnt started its ssh service yet, retrying, error was {e}");
                    e.to_string()
                }
                Ok(Ok(stream)) => match SshConnection::new(stream, address, credentials).await {
                    Err(err) => {
                        tracing::info!("Failed to make ssh connection to server, the host has probably not finished booting yet, retrying, error was: {err:?}");
                        format!("{err:?}")
                    }
                    Ok(ssh) => return Ok(ssh),
                },
            };

            if Instant::now() + wait.poll_interval > deadline {
                return Err(RemoteError::ConnectTimedOut {
                    address,
                    timeout: wait.timeout,
                    last_error,
                });
            }
            tokio::time::sleep_until(start + wait.poll_interval).await;
        }
    }
}

#[async_trait]
impl RemoteShell for SshConnection {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!("running command on {}: {}", self.address, command);

        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;
        let mut stdout = vec![];
        let mut stderr = vec![];
        let mut exit_status = None;
        let mut signal = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data)
                    } else {
                        tracing::warn!("received unknown extended data with extension type {ext} containing: {:?}", data.to_vec())
                    }
                }
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                    // cant exit immediately, there might be more data still
                }
                ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    ..
                } => {
                    signal = Some(format!(
                        "killed via signal {signal_name:?} core_dumped={core_dumped} {error_message:?}"
                    ))
                }
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
            signal,
        })
    }
}

struct Client {
    address: SocketAddr,
}

#[async_trait]
impl Handler for Client {
    type Error = anyhow::Error;

    // The instance was launched moments ago from a public image so there is no known host key to compare against.
    async fn check_server_key(
        self,
        server_public_key: &PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        tracing::info!(
            "Accepting ssh host key of {} with fingerprint {}",
            self.address,
            server_public_key.fingerprint()
        );
        Ok((self, true))
    }
}
