//! Connection setup: host key policy and authentication.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use russh::{
    Channel,
    client::{self, Handle, Msg, Session},
    keys::{PrivateKeyWithHashAlg, PublicKey, check_known_hosts_path, load_secret_key},
};

use super::{
    SshError, forward,
    options::{RemoteForward, SshOptions},
};

/// Remote forwards by the port the server listens on.
pub type RemoteTargets = Arc<Mutex<HashMap<u32, RemoteForward>>>;

/// Reacts to server events of one connection.
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
    insecure: bool,
    remote_targets: RemoteTargets,
}

impl ClientHandler {
    fn new(options: &SshOptions, remote_targets: RemoteTargets) -> Self {
        Self {
            host: options.host.clone(),
            port: options.port,
            known_hosts: dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")),
            insecure: options.insecure,
            remote_targets,
        }
    }

    fn verify(&self, key: &PublicKey) -> Result<(), String> {
        let Some(path) = self.known_hosts.as_ref().filter(|p| p.exists()) else {
            return if self.insecure {
                tracing::warn!(host = %self.host, "known_hosts missing, accepting host key");
                Ok(())
            } else {
                Err("known_hosts file not found, use --ts-insecure to skip".to_string())
            };
        };
        match check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => Ok(()),
            Ok(false) if self.insecure => {
                tracing::warn!(host = %self.host, "unknown host, accepting host key");
                Ok(())
            }
            Ok(false) => Err(format!(
                "host '{}' is not in {}, use --ts-insecure to skip",
                self.host,
                path.display()
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.verify(server_public_key).map_err(SshError::HostKey)?;
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let target = self
            .remote_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connected_port)
            .cloned();
        tracing::debug!(
            %connected_address,
            connected_port,
            %originator_address,
            originator_port,
            "Forwarded connection"
        );
        match target {
            Some(target) => {
                tokio::spawn(forward::serve_remote(channel, target));
            }
            None => tracing::warn!(connected_port, "No remote forward for port"),
        }
        Ok(())
    }
}

/// Connect and authenticate.
///
/// # Errors
/// Returns error on timeout, host key rejection or when no auth method
/// succeeds.
pub async fn connect(
    options: &SshOptions,
    secret: &str,
    remote_targets: RemoteTargets,
) -> Result<Handle<ClientHandler>, SshError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });
    let handler = ClientHandler::new(options, remote_targets);
    let address = format!("{}:{}", options.host, options.port);
    let mut handle = tokio::time::timeout(
        options.connect_timeout,
        client::connect(config, (options.host.as_str(), options.port), handler),
    )
    .await
    .map_err(|_| SshError::Timeout(address))??;
    authenticate(&mut handle, options, secret).await?;
    Ok(handle)
}

/// Try every loadable identity file in order, then the password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    options: &SshOptions,
    secret: &str,
) -> Result<(), SshError> {
    let mut methods = 0usize;
    for path in &options.identity_files {
        let key = match load_secret_key(path, None) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(path = %path.display(), ?e, "Skipping identity file");
                continue;
            }
        };
        methods += 1;
        let hash = if key.algorithm().is_rsa() {
            handle.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        let result = handle
            .authenticate_publickey(
                &options.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await?;
        if result.success() {
            tracing::debug!(path = %path.display(), "Authenticated with public key");
            return Ok(());
        }
    }

    if !secret.is_empty() {
        methods += 1;
        if handle
            .authenticate_password(&options.user, secret)
            .await?
            .success()
        {
            tracing::debug!("Authenticated with password");
            return Ok(());
        }
    }

    if methods == 0 {
        Err(SshError::NoAuthMethod)
    } else {
        Err(SshError::AuthFailed(options.user.clone()))
    }
}
