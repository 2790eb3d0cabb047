//! Local shell executor: a persistent pty interpreter or one process per line.

use std::{
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chatterm_core::{
    CancelListener, CancelSignal, ConfigStore, Executor, ExecutorConfig, ExecutorError, History,
    OutputStream,
    constants::{INTERRUPT, PTY_COLS, PTY_ROWS},
    text::split_first_and_others,
    traits::compose_buttons,
    workdir,
};
use chatterm_pty::{OutputDecoder, PtySession, session::OUTPUT_CAPACITY};
use command_group::AsyncCommandGroup;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::command::{CommandBuildError, ShellCommand};

pub const USAGE: &str = "option: shell [flags] [interpreter]
[interpreter] is the cmdline interpreter, default to 'cmd' on windows, SHELL env value on other platforms.
Flags:
* --ts-oneshot : Create new process for every cmdline, passing cmdline to interpreter as single arg
* --ts-shell : Force treat interpreter as a system shell
* --ts-parse : Valid in oneshot mode. Split cmdline to tokens instead of as single arg when executing it
E.g.:
/addexecutor ps shell powershell
/addexecutor python shell python3";

const PTY_BUTTONS: &[&str] = &["^C", "^Z"];
const SHELL_BUTTONS: &[&str] = &["pwd", "/files"];

/// Per-command limit in oneshot mode.
pub const ONESHOT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER: usize = 10 * 1024;

/// How long output may keep arriving after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

impl From<CommandBuildError> for ExecutorError {
    fn from(e: CommandBuildError) -> Self {
        match e {
            CommandBuildError::InvalidBase(_) => Self::InvalidConfig(e.to_string()),
            CommandBuildError::NotFound(program) => Self::ExecutableNotFound(program),
        }
    }
}

/// Runs command lines with a local interpreter.
pub struct ShellExecutor {
    name: String,
    store: Arc<ConfigStore>,
    command: ShellCommand,
    timeout: Duration,
    history: Mutex<History>,
    cancel: CancelSignal,
    pty: Mutex<Option<PtySession>>,
    output_tx: Mutex<Option<mpsc::Sender<String>>>,
    output_rx: Mutex<Option<OutputStream>>,
}

impl ShellExecutor {
    /// Create a shell executor from its configuration plus `extra` options
    /// given when switching to it.
    ///
    /// # Errors
    /// Returns error if the config is not valid shell words.
    pub fn new(
        store: Arc<ConfigStore>,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<Self, ExecutorError> {
        let command = ShellCommand::parse(&config.config, extra)?;
        let (output_tx, output_rx) = if command.options.oneshot {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
            (Some(tx), Some(rx))
        };
        Ok(Self {
            name: config.name.clone(),
            store,
            command,
            timeout: ONESHOT_TIMEOUT,
            history: Mutex::new(History::default()),
            cancel: CancelSignal::new(),
            pty: Mutex::new(None),
            output_tx: Mutex::new(output_tx),
            output_rx: Mutex::new(output_rx),
        })
    }

    /// Registry constructor.
    ///
    /// # Errors
    /// See [`ShellExecutor::new`].
    pub fn create(
        store: Arc<ConfigStore>,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        Ok(Arc::new(Self::new(store, config, extra)?))
    }

    /// Override the oneshot per-command limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn command(&self) -> &ShellCommand {
        &self.command
    }

    const fn is_pty(&self) -> bool {
        !self.command.options.oneshot
    }

    fn mode_buttons(&self) -> Vec<&'static str> {
        let mut buttons = Vec::new();
        if self.is_pty() {
            buttons.extend_from_slice(PTY_BUTTONS);
        }
        if self.command.is_shell {
            buttons.extend_from_slice(SHELL_BUTTONS);
        }
        buttons
    }

    fn write_pty(&self, bytes: Vec<u8>) {
        let pty = self.pty.lock().unwrap_or_else(PoisonError::into_inner);
        match pty.as_ref() {
            Some(pty) => {
                if !pty.write(bytes) {
                    tracing::warn!(executor = %self.name, "pty writer stopped");
                }
            }
            None => tracing::debug!(executor = %self.name, "pty not open, input dropped"),
        }
    }

    fn spawn_oneshot(&self, ctx: &CancellationToken, cmdline: &str) -> OutputStream {
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        let parts = self.command.oneshot(cmdline);
        let run = Oneshot {
            program: parts.program,
            args: parts.args,
            cmdline: cmdline.to_string(),
            timeout: self.timeout,
        };
        tokio::spawn(run.run(self.cancel.listen(), ctx.clone(), tx));
        rx
    }
}

/// A builtin intercepted in oneshot mode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Builtin {
    Cd(String),
    Pwd,
}

impl Builtin {
    /// Only lines without a statement separator qualify. A trailing `;` is
    /// allowed.
    fn parse(cmdline: &str) -> Option<Self> {
        if let Some(i) = cmdline.find(';') {
            if i < cmdline.len() - 1 {
                return None;
            }
        }
        let cmdline = cmdline.trim_end_matches(';');
        match split_first_and_others(cmdline) {
            ("cd", dir) => Some(Self::Cd(dir.to_string())),
            ("pwd", _) => Some(Self::Pwd),
            _ => None,
        }
    }

    async fn run(self) -> String {
        match self {
            Self::Cd(dir) => match workdir::cd(&dir).await {
                Ok(cwd) => format!("cd {}", cwd.display()),
                Err(e) => format!("Failed to cd {dir}: {e}"),
            },
            Self::Pwd => match workdir::current() {
                Ok(cwd) => cwd.display().to_string(),
                Err(e) => format!("Failed to get working directory: {e}"),
            },
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

struct Oneshot {
    program: String,
    args: Vec<String>,
    cmdline: String,
    timeout: Duration,
}

impl Oneshot {
    async fn run(
        self,
        mut listener: CancelListener,
        ctx: CancellationToken,
        output: mpsc::Sender<String>,
    ) {
        let cmdline = self.cmdline;
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = output
                    .send(format!("Failed to start process '{cmdline}': {e}"))
                    .await;
                return;
            }
        };
        tracing::debug!(program = %self.program, %cmdline, "Started oneshot process");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.inner().stdout.take() {
            readers.push(relay(stdout, output.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            readers.push(relay(stderr, output.clone()));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            () = listener.cancelled() => Outcome::Cancelled,
            () = ctx.cancelled() => Outcome::Cancelled,
        };
        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                tracing::debug!(%cmdline, ?e, "Failed to kill process group");
            }
            let _ = child.wait().await;
        }

        for reader in readers {
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                tracing::debug!(%cmdline, "Output still open after exit");
            }
        }

        let marker = match outcome {
            Outcome::Exited(Ok(status)) => format!("Process '{cmdline}' exited, {status}"),
            Outcome::Exited(Err(e)) => format!("Process '{cmdline}' failed: {e}"),
            Outcome::TimedOut => format!(
                "Process '{cmdline}' timed out after {}s and was killed",
                self.timeout.as_secs()
            ),
            Outcome::Cancelled => format!("Process '{cmdline}' cancelled"),
        };
        let _ = output.send(marker).await;
    }
}

fn relay<R>(mut pipe: R, output: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = OutputDecoder::new(false);
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(text) = decoder.decode(&buf[..n]) {
                        if output.send(text).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ExecutorError> {
        let output = self
            .output_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (program, args) = self.command.interactive().into_resolved().await?;

        let Some(output) = output else {
            return Ok(());
        };
        let program = program.to_string_lossy().into_owned();
        let session = PtySession::spawn(&program, &args, PTY_ROWS, PTY_COLS, output)
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;
        tracing::info!(executor = %self.name, %program, "Opened pty shell");
        *self.pty.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    fn exec(&self, ctx: &CancellationToken, cmdline: &[u8], is_raw: bool) -> Option<OutputStream> {
        if self.is_pty() {
            let mut bytes = cmdline.to_vec();
            if !is_raw {
                self.history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(String::from_utf8_lossy(cmdline).into_owned());
                bytes.push(b'\n');
            }
            self.write_pty(bytes);
            return None;
        }

        let cmdline = String::from_utf8_lossy(cmdline);
        let cmdline = cmdline.trim();
        if !is_raw {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(cmdline);
        }
        if !is_raw {
            if let Some(builtin) = Builtin::parse(cmdline) {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let _ = tx.send(builtin.run().await).await;
                });
                return Some(rx);
            }
        }
        Some(self.spawn_oneshot(ctx, cmdline))
    }

    fn cancel(&self) {
        if self.is_pty() {
            self.write_pty(vec![INTERRUPT]);
        } else {
            let reached = self.cancel.fire();
            tracing::debug!(executor = %self.name, reached, "Cancel fired");
        }
    }

    fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn close(&self) {
        self.cancel.fire();
        if let Some(pty) = self.pty.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pty.kill();
        }
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
        let mode = self.mode_buttons();
        let recent = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_buttons(&mode);
        compose_buttons(recent, &mode, self.store.buttons(&self.name))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use chatterm_core::{ConfigData, config::DEFAULT_EXECUTOR};
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> Arc<ConfigStore> {
        Arc::new(ConfigStore::in_memory(ConfigData::default()))
    }

    fn oneshot(store: Arc<ConfigStore>) -> ShellExecutor {
        let config = ExecutorConfig::new(DEFAULT_EXECUTOR, "shell", "/bin/sh --ts-oneshot");
        ShellExecutor::new(store, &config, "").unwrap()
    }

    async fn collect(mut rx: OutputStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_builtin_parse() {
        assert_eq!(Builtin::parse("cd /tmp"), Some(Builtin::Cd("/tmp".into())));
        assert_eq!(Builtin::parse("cd"), Some(Builtin::Cd(String::new())));
        assert_eq!(Builtin::parse("pwd;"), Some(Builtin::Pwd));
        assert_eq!(Builtin::parse("cd /tmp; ls"), None);
        assert_eq!(Builtin::parse("ls"), None);
    }

    #[tokio::test]
    async fn test_oneshot_output_then_marker() {
        let executor = oneshot(store());
        assert!(executor.chan().is_none());
        executor.open().await.unwrap();

        let rx = executor
            .exec(&CancellationToken::new(), b"echo hello", false)
            .unwrap();
        let out = collect(rx).await;
        assert!(out.concat().contains("hello"));
        assert!(out.last().unwrap().starts_with("Process 'echo hello' exited"));
        assert_eq!(executor.history(), ["echo hello"]);
    }

    #[tokio::test]
    async fn test_oneshot_timeout_kills_process() {
        let executor = oneshot(store()).with_timeout(Duration::from_millis(200));
        let rx = executor
            .exec(&CancellationToken::new(), b"sleep 30", false)
            .unwrap();
        let out = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert!(out.last().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_oneshot_cancel() {
        let executor = oneshot(store());
        let rx = executor
            .exec(&CancellationToken::new(), b"sleep 30", false)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.cancel();
        let out = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert!(out.last().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_without_running_command_is_noop() {
        let executor = oneshot(store());
        executor.cancel();
        executor.cancel();
    }

    #[tokio::test]
    async fn test_raw_lines_skip_history() {
        let executor = oneshot(store());
        let rx = executor
            .exec(&CancellationToken::new(), b"true", true)
            .unwrap();
        collect(rx).await;
        assert!(executor.history().is_empty());
    }

    #[tokio::test]
    async fn test_buttons_layout() {
        let store = store();
        store.add_button(DEFAULT_EXECUTOR, "uptime").unwrap();
        let executor = oneshot(Arc::clone(&store));
        for line in ["pwd", "ls"] {
            collect(
                executor
                    .exec(&CancellationToken::new(), line.as_bytes(), false)
                    .unwrap(),
            )
            .await;
        }
        assert_eq!(
            executor.buttons(),
            ["ls", "", "pwd", "/files", "/history", "uptime"]
        );
        executor.clear();
        assert_eq!(executor.buttons(), ["", "pwd", "/files", "/history", "uptime"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pty_mode() {
        let config = ExecutorConfig::new("pty", "shell", "/bin/sh");
        let executor = ShellExecutor::new(store(), &config, "").unwrap();
        let mut rx = executor.chan().unwrap();
        assert!(executor.chan().is_none());
        executor.open().await.unwrap();

        assert!(
            executor
                .exec(&CancellationToken::new(), b"echo pty-$((20+22))", false)
                .is_none()
        );
        let mut out = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !out.contains("pty-42") {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => out.push_str(&chunk),
                _ => break,
            }
        }
        assert!(out.contains("pty-42"));
        assert_eq!(executor.buttons()[..3], ["echo pty-$((20+22))", "", "^C"]);

        executor.close();
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_open_fails_for_missing_interpreter() {
        let config = ExecutorConfig::new("pty", "shell", "/definitely/not/a/shell");
        let executor = ShellExecutor::new(store(), &config, "").unwrap();
        let mut rx = executor.chan().unwrap();
        assert!(matches!(
            executor.open().await,
            Err(ExecutorError::ExecutableNotFound(_))
        ));
        assert!(rx.recv().await.is_none());
    }
}
