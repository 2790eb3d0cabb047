//! Remote executor over an authenticated SSH connection.
//!
//! One session channel carries a shell (or a single command); its stdout and
//! stderr feed the persistent output stream. Port forwards live as long as
//! the connection.

mod connection;
mod forward;
pub mod options;
mod socks;

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chatterm_core::{
    ConfigStore, Executor, ExecutorConfig, ExecutorError, History, OutputStream,
    constants::{INTERRUPT, PTY_COLS, PTY_ROWS},
    traits::compose_buttons,
};
use chatterm_pty::OutputDecoder;
use russh::{ChannelMsg, Disconnect, Pty, client};
use thiserror::Error;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use options::SshOptions;

use connection::{ClientHandler, RemoteTargets};

pub const USAGE: &str = "option: ssh [flags] [user@]host[:port] [command]
Flags:
* -p port : Port to connect to on the remote host, default 22
* -i identity_file : Private key file, can be repeated. Default ~/.ssh/id_rsa, id_ecdsa, id_ed25519 ...
* -T : Disable pseudo-terminal allocation
* -L [bind_address:]port:host:hostport : Local port forwarding, can be repeated
* -R [bind_address:]port[:host:hostport] : Remote port forwarding, SOCKS proxy when host is absent, can be repeated
* -D [bind_address:]port : Dynamic (SOCKS) port forwarding, can be repeated
* -o ServerAliveInterval=15 | ServerAliveCountMax=5 | ConnectTimeout=20
* --ts-insecure : Accept hosts missing from ~/.ssh/known_hosts
The executor secret, if set, is used as the password.
E.g.:
/addexecutor myssh ssh bob@1.2.3.4
/addexecutor tunnel ssh -T -L 8080:localhost:80 bob@1.2.3.4";

/// Fixed buttons once a pty is granted. Never repeated in the history row.
const PERMANENT_BUTTONS: &[&str] = &["^C", "^Z", "pwd"];

/// Capacity of the persistent output channel.
const OUTPUT_CAPACITY: usize = 1;

/// SSH executor error.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("{0}")]
    Config(String),
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("host key verification failed: {0}")]
    HostKey(String),
    #[error("no available auth method")]
    NoAuthMethod,
    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),
    #[error("forward {spec} failed: {reason}")]
    Forward { spec: String, reason: String },
    #[error("{0}")]
    Protocol(#[from] russh::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SshError> for ExecutorError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::Config(_) => Self::InvalidConfig(e.to_string()),
            SshError::Io(e) => Self::Io(e),
            _ => Self::Connection(e.to_string()),
        }
    }
}

/// Runs command lines on a remote host.
pub struct SshExecutor {
    name: String,
    store: Arc<ConfigStore>,
    options: SshOptions,
    secret: String,
    history: Mutex<History>,
    pty_granted: AtomicBool,
    shutdown: CancellationToken,
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    output_tx: Mutex<Option<mpsc::Sender<String>>>,
    output_rx: Mutex<Option<OutputStream>>,
}

impl SshExecutor {
    /// Create an SSH executor from its configuration plus `extra` options.
    ///
    /// # Errors
    /// Returns error if the config does not follow the SSH option grammar.
    pub fn new(
        store: Arc<ConfigStore>,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<Self, ExecutorError> {
        let options = SshOptions::parse(&config.config, extra)?;
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        Ok(Self {
            name: config.name.clone(),
            store,
            options,
            secret: config.secret.clone(),
            history: Mutex::new(History::default()),
            pty_granted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(None),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
        })
    }

    /// Registry constructor.
    ///
    /// # Errors
    /// See [`SshExecutor::new`].
    pub fn create(
        store: Arc<ConfigStore>,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        Ok(Arc::new(Self::new(store, config, extra)?))
    }

    #[must_use]
    pub const fn options(&self) -> &SshOptions {
        &self.options
    }

    fn has_pty(&self) -> bool {
        self.pty_granted.load(Ordering::Acquire)
    }

    fn write(&self, bytes: Vec<u8>) {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(writer) => {
                if writer.send(bytes).is_err() {
                    tracing::warn!(executor = %self.name, "ssh channel closed, input dropped");
                }
            }
            None => tracing::debug!(executor = %self.name, "ssh not open, input dropped"),
        }
    }

    async fn start(&self, output: &mpsc::Sender<String>) -> Result<(), SshError> {
        let targets = RemoteTargets::default();
        let mut handle = connection::connect(&self.options, &self.secret, Arc::clone(&targets)).await?;
        tracing::info!(
            executor = %self.name,
            host = %self.options.host,
            port = self.options.port,
            user = %self.options.user,
            "SSH authenticated"
        );

        let local = forward::bind_local(&self.options.local_forwards).await?;
        forward::request_remote(&mut handle, &self.options.remote_forwards, &targets).await?;
        let dynamic = forward::bind_dynamic(&self.options.dynamic_forwards).await?;

        let handle = Arc::new(handle);
        for (listener, target) in local {
            tokio::spawn(forward::serve_local(
                Arc::clone(&handle),
                listener,
                target,
                self.shutdown.clone(),
            ));
        }
        for listener in dynamic {
            tokio::spawn(forward::serve_dynamic(
                Arc::clone(&handle),
                listener,
                self.shutdown.clone(),
            ));
        }

        let mut channel = handle.channel_open_session().await?;
        let mut pty = false;
        if !self.options.no_pty {
            channel
                .request_pty(
                    true,
                    "xterm",
                    u32::from(PTY_COLS),
                    u32::from(PTY_ROWS),
                    0,
                    0,
                    &[(Pty::ECHO, 0)],
                )
                .await?;
            match wait_reply(&mut channel).await {
                Ok(()) => pty = true,
                Err(reason) => {
                    let _ = output
                        .send(format!("Warning: failed to request pty: {reason}"))
                        .await;
                }
            }
        }
        self.pty_granted.store(pty, Ordering::Release);

        match &self.options.command {
            Some(command) => channel.exec(true, command.as_bytes()).await?,
            None => channel.request_shell(true).await?,
        }

        let (writer, input) = mpsc::unbounded_channel();
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);

        if pty && self.options.command.is_none() && self.options.server_alive_interval > 0 {
            let pinger = Arc::clone(&handle);
            tokio::spawn(keepalive(
                move || {
                    let handle = Arc::clone(&pinger);
                    async move { handle.send_ping().await }
                },
                Duration::from_secs(self.options.server_alive_interval),
                self.options.server_alive_count_max,
                self.shutdown.clone(),
                self.name.clone(),
            ));
        }

        tokio::spawn(pump(Pump {
            name: self.name.clone(),
            handle,
            channel,
            input,
            output: output.clone(),
            strip: pty,
            shutdown: self.shutdown.clone(),
        }));
        Ok(())
    }
}

/// Wait for the server's answer to a request sent with `want_reply`.
async fn wait_reply(channel: &mut russh::Channel<client::Msg>) -> Result<(), String> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err("refused by server".to_string()),
            Some(_) => {}
            None => return Err("channel closed".to_string()),
        }
    }
}

/// Moves bytes between the session channel and the executor streams.
struct Pump {
    name: String,
    handle: Arc<client::Handle<ClientHandler>>,
    channel: russh::Channel<client::Msg>,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    output: mpsc::Sender<String>,
    strip: bool,
    shutdown: CancellationToken,
}

async fn pump(pump: Pump) {
    let Pump {
        name,
        handle,
        mut channel,
        mut input,
        output,
        strip,
        shutdown,
    } = pump;
    let mut stdout = OutputDecoder::new(strip);
    let mut stderr = OutputDecoder::new(strip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(text) = stdout.decode(&data) {
                        if output.send(text).await.is_err() {
                            break;
                        }
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Some(text) = stderr.decode(&data) {
                        if output.send(text).await.is_err() {
                            break;
                        }
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::debug!(executor = %name, exit_status, "Remote process exited");
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            bytes = input.recv() => match bytes {
                Some(bytes) => {
                    tracing::debug!(executor = %name, len = bytes.len(), "ssh write");
                    if let Err(e) = channel.data(&bytes[..]).await {
                        tracing::warn!(executor = %name, ?e, "ssh write failed");
                        if output.send(format!("Failed to write to remote: {e}")).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    shutdown.cancel();
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "closed", "en")
        .await
    {
        tracing::debug!(executor = %name, ?e, "ssh disconnect failed");
    }
    tracing::info!(executor = %name, "SSH session ended");
}

/// Ping the server every `interval`. A ping left unanswered for `interval`
/// counts as a failure, and `count_max` failures in a row end the session.
async fn keepalive<F, Fut, E>(
    ping: F,
    interval: Duration,
    count_max: u32,
    shutdown: CancellationToken,
    name: String,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Debug,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut failures = 0u32;
    loop {
        let answered = tokio::select! {
            () = shutdown.cancelled() => break,
            answered = async {
                ticker.tick().await;
                tokio::time::timeout(interval, ping()).await
            } => answered,
        };
        match answered {
            Ok(Ok(())) => {
                failures = 0;
                continue;
            }
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(executor = %name, failures, ?e, "ssh keepalive failed");
            }
            Err(_) => {
                failures += 1;
                tracing::warn!(executor = %name, failures, "ssh keepalive unanswered");
            }
        }
        if failures >= count_max.max(1) {
            tracing::warn!(executor = %name, "ssh server unresponsive, closing");
            shutdown.cancel();
            break;
        }
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ExecutorError> {
        let Some(output) = self
            .output_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        self.start(&output).await.map_err(|e| {
            tracing::warn!(executor = %self.name, error = %e, "SSH open failed");
            self.shutdown.cancel();
            ExecutorError::from(e)
        })
    }

    fn exec(&self, _ctx: &CancellationToken, cmdline: &[u8], is_raw: bool) -> Option<OutputStream> {
        let mut bytes = cmdline.to_vec();
        if !is_raw {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(String::from_utf8_lossy(cmdline).into_owned());
            bytes.push(b'\n');
        }
        self.write(bytes);
        None
    }

    fn cancel(&self) {
        if self.has_pty() {
            self.write(vec![INTERRUPT]);
        }
    }

    fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.output_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn chan(&self) -> Option<OutputStream> {
        self.output_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .to_vec()
    }

    fn buttons(&self) -> Vec<String> {
        if self.options.command.is_some() {
            return Vec::new();
        }
        let recent = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_buttons(PERMANENT_BUTTONS);
        let mode: &[&str] = if self.has_pty() { PERMANENT_BUTTONS } else { &[] };
        compose_buttons(recent, mode, self.store.buttons(&self.name))
    }
}
