//! The single consumer owning every session.
//!
//! Commands and lifecycle messages arrive on two bounded channels and are
//! handled one at a time, so the session table and the active map need no
//! locking. Anything slow (opening an executor, relaying output, moving
//! files) runs on a spawned task that reports back through the message
//! channel.

use std::{fmt::Write as _, sync::Arc};

use chatterm_core::{
    CancelSignal, ChatId, CmdConfig, ConfigStore, ExecutorConfig, OutputStream,
    config::DEFAULT_EXECUTOR,
    constants::TEXT_LIMIT,
    text::{self, split_first_and_others},
    workdir,
};
use chatterm_executor::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    commands::{
        self, MSG_INVALID, MSG_RESET_EXECUTOR, MSG_START, MSG_SUCCESS, USAGE_ADDBTN,
        USAGE_ADDCMD, USAGE_ADDEXECUTOR, USAGE_CLEARBTN, USAGE_DELBTN, USAGE_DELCMD,
        USAGE_DELEXECUTOR, USAGE_GETFILE, USAGE_RAW, USAGE_RUN, USAGE_SETSECRET,
    },
    dispatch::{expand_executor_shortcut, route_text},
    files::{self, FileAction},
    listing::{self, BUTTONS_HEADER, CMDS_HEADER, EXECUTORS_HEADER, FILES_HEADER, HISTORY_HEADER},
    message::{Attachment, Command, CommandOutput, Message, Origin},
    runner,
    session::{ActiveSessions, Session, SessionError, SessionTable, session_key},
    sink::MessageSink,
};

/// Capacity of both the command and the message channel.
pub const CHANNEL_CAPACITY: usize = 5;

/// Replies buffered per command. Handlers reply a few times at most.
pub const REPLY_CAPACITY: usize = 16;

fn reply(output: &CommandOutput, text: impl Into<String>) {
    if let Err(e) = output.try_send(text.into()) {
        tracing::warn!("Dropping reply: {e}");
    }
}

/// Submits work to a running [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::Sender<Command>,
    messages: mpsc::Sender<Message>,
    store: Arc<ConfigStore>,
}

impl LoopHandle {
    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Submit a command. Its replies come back as [`Message::Reply`] in
    /// order.
    ///
    /// # Errors
    /// Returns error if the loop has stopped.
    pub async fn submit(
        &self,
        chat: ChatId,
        name: &str,
        payload: &str,
        attachment: Option<Attachment>,
    ) -> Result<(), SessionError> {
        tracing::debug!(chat, name, payload, "Command submitted");
        let (output, mut replies) = mpsc::channel::<String>(REPLY_CAPACITY);
        let messages = self.messages.clone();
        tokio::spawn(async move {
            while let Some(text) = replies.recv().await {
                if messages.send(Message::Reply { chat, text }).await.is_err() {
                    break;
                }
            }
        });
        self.commands
            .send(Command {
                chat,
                name: name.to_string(),
                payload: payload.to_string(),
                ctx: CancellationToken::new(),
                attachment,
                output,
            })
            .await
            .map_err(|_| SessionError::LoopStopped)
    }

    /// Route a text message and submit it.
    ///
    /// # Errors
    /// Returns error if the loop has stopped.
    pub async fn submit_text(&self, chat: ChatId, text: &str) -> Result<(), SessionError> {
        let (name, payload) = route_text(&self.store, text);
        self.submit(chat, &name, &payload, None).await
    }
}

/// Owner of every session and of the per-conversation active selection.
pub struct EventLoop {
    store: Arc<ConfigStore>,
    registry: Arc<Registry>,
    sink: Arc<dyn MessageSink>,
    sessions: SessionTable,
    active: ActiveSessions,
    commands_rx: mpsc::Receiver<Command>,
    messages_rx: mpsc::Receiver<Message>,
    messages_tx: mpsc::Sender<Message>,
    /// Fired by `/cancel`; aborts in-flight uploads.
    cancel: CancelSignal,
}

impl EventLoop {
    /// Create the loop and open the default executor.
    ///
    /// # Errors
    /// Returns error if the default executor cannot be created or opened.
    pub async fn new(
        store: Arc<ConfigStore>,
        registry: Arc<Registry>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<(Self, LoopHandle), SessionError> {
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let config = store
            .get_executor(DEFAULT_EXECUTOR)
            .ok_or_else(|| SessionError::NotFound(DEFAULT_EXECUTOR.to_string()))?;
        let executor = registry.create(Arc::clone(&store), &config, "")?;
        let mut default = Session::new(executor, 0, config.global);
        if let Some(stream) = default.executor.chan() {
            spawn_reader(stream, default.origin(), 0, messages_tx.clone());
        }
        default.executor.open().await?;
        default.ready = true;
        tracing::info!(session = %default.key, "Default executor opened");

        let handle = LoopHandle {
            commands: commands_tx,
            messages: messages_tx.clone(),
            store: Arc::clone(&store),
        };
        let event_loop = Self {
            store,
            registry,
            sink,
            sessions: SessionTable::new(default),
            active: ActiveSessions::default(),
            commands_rx,
            messages_rx,
            messages_tx,
            cancel: CancelSignal::new(),
        };
        Ok((event_loop, handle))
    }

    /// Process commands and messages until `shutdown` fires, then close
    /// every session.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Event loop started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(command) = self.commands_rx.recv() => self.handle_command(command).await,
                Some(message) = self.messages_rx.recv() => self.handle_message(message).await,
                else => break,
            }
        }
        for session in self.sessions.remove_where(|_| true) {
            session.executor.close();
        }
        self.sessions.default_session().executor.close();
        tracing::info!("Event loop stopped");
    }

    fn active_session(&self, chat: ChatId) -> &Session {
        self.sessions.resolve(self.active.get(chat))
    }

    async fn refresh_menu(&self, chat: ChatId) {
        let menu = commands::menu(&self.store);
        if let Err(e) = self.sink.send_commands(chat, &menu).await {
            tracing::error!(chat, ?e, "Failed to send commands menu");
        }
    }

    async fn send_chunks(&self, chat: ChatId, text: &str, keyboard: Option<&[String]>) {
        for chunk in text::chunks(text, TEXT_LIMIT) {
            if let Err(e) = self.sink.send_text(chat, &chunk, keyboard).await {
                tracing::error!(chat, ?e, "Failed to send message");
            }
        }
    }

    async fn send_listing(&self, chat: ChatId, listing: &listing::Listing) {
        if let Err(e) = self
            .sink
            .send_listing(chat, &listing.text, &listing.buttons)
            .await
        {
            tracing::error!(chat, ?e, "Failed to send listing");
        }
    }

    /// Tell `chat` it fell back to the default executor.
    async fn notify_reset(&self, chat: ChatId) {
        let buttons = self.sessions.default_session().executor.buttons();
        self.send_chunks(chat, MSG_RESET_EXECUTOR, Some(buttons.as_slice()))
            .await;
    }

    async fn handle_command(&mut self, command: Command) {
        let (name, payload) = expand_executor_shortcut(&command.name, &command.payload);
        tracing::debug!(chat = command.chat, name = %name, "Handling command");
        let Command {
            chat,
            ctx,
            attachment,
            output,
            ..
        } = command;
        let payload = payload.as_str();
        match name.as_str() {
            "/executor" => self.switch_executor(chat, payload, &output),
            "/executors" => {
                let listing = listing::executors(&self.store.user_executors());
                self.send_listing(chat, &listing).await;
            }
            "/close" => self.close_session(chat, payload, &output).await,
            "/closeall" => self.close_all().await,
            "/cancel" => {
                let reached = self.cancel.fire();
                tracing::debug!(reached, "Cancel signal fired");
                self.active_session(chat).executor.cancel();
            }
            "/run" => {
                if payload.is_empty() {
                    reply(&output, USAGE_RUN);
                } else {
                    runner::run(self.active_session(chat), &ctx, output, payload);
                }
            }
            "/raw" => {
                if payload.is_empty() {
                    reply(&output, USAGE_RAW);
                } else {
                    let line = format!("^|{payload}");
                    runner::run(self.active_session(chat), &ctx, output, &line);
                }
            }
            "/history" => {
                let session = self.active_session(chat);
                let listing = listing::history(&session.name, &session.executor.history());
                self.send_listing(chat, &listing).await;
            }
            "/buttons" => {
                let name = &self.active_session(chat).name;
                let listing = listing::buttons(name, &self.store.buttons(name));
                self.send_listing(chat, &listing).await;
            }
            "/cmds" => {
                let listing = listing::cmds(&self.store.cmds());
                self.send_listing(chat, &listing).await;
            }
            "/addbtn" => self.add_button(chat, payload, &output),
            "/delbtn" => self.del_button(chat, payload, &output),
            "/clearbtn" => {
                let (executor, _) = split_first_and_others(payload);
                if executor.is_empty() {
                    reply(&output, USAGE_CLEARBTN);
                } else if let Err(e) = self.store.clear_buttons(executor) {
                    reply(
                        &output,
                        format!("Failed to clear executor {executor} buttons: {e}"),
                    );
                } else {
                    reply(&output, MSG_SUCCESS);
                }
            }
            "/addexecutor" => self.add_executor(chat, payload, &output).await,
            "/delexecutor" => {
                if payload.is_empty() {
                    reply(&output, USAGE_DELEXECUTOR);
                } else {
                    self.delete_executor(chat, payload, &output).await;
                }
            }
            "/setsecret" => self.set_secret(payload, &output),
            "/addcmd" => self.add_cmd(chat, payload, &output).await,
            "/delcmd" => {
                if payload.is_empty() {
                    reply(&output, USAGE_DELCMD);
                } else if let Err(e) = self.store.del_cmd(payload) {
                    reply(&output, format!("Failed to delete cmd '{payload}': {e}"));
                } else {
                    reply(&output, format!("Successfully deleted cmd {payload}"));
                    self.refresh_menu(chat).await;
                }
            }
            "/files" => match workdir::current().and_then(|cwd| listing::files(&cwd, payload)) {
                Ok(listing) => self.send_listing(chat, &listing).await,
                Err(e) => {
                    tracing::warn!(?e, "Listing files failed");
                    reply(&output, MSG_INVALID);
                }
            },
            "/getfile" => self.get_file(chat, payload, &output).await,
            "/cd" => match workdir::cd(payload).await {
                Ok(cwd) => reply(&output, format!("cd {}", cwd.display())),
                Err(e) => reply(&output, format!("Failed to cd {payload}: {e}")),
            },
            "/pwd" => {
                if let Ok(cwd) = workdir::current() {
                    reply(&output, cwd.display().to_string());
                }
            }
            "/reload" => match self.store.reload() {
                Ok(()) => {
                    self.refresh_menu(chat).await;
                    reply(&output, MSG_SUCCESS);
                }
                Err(e) => reply(&output, format!("Failed to reload config: {e}")),
            },
            "/refresh" => {
                self.refresh_menu(chat).await;
                reply(&output, MSG_SUCCESS);
            }
            "/start" => {
                self.refresh_menu(chat).await;
                reply(&output, MSG_START);
            }
            "/help" => {
                reply(&output, commands::help(&self.store, &self.registry));
                reply(&output, commands::HELP_TEXT);
            }
            "callback" => match attachment {
                Some(Attachment::Callback { data, message }) => {
                    self.handle_callback(chat, &ctx, &data, &message, output)
                        .await;
                }
                _ => tracing::warn!(chat, "Callback without callback data"),
            },
            "document" => match attachment {
                Some(Attachment::Document {
                    file_name,
                    data,
                    caption,
                }) => {
                    let path = files::save_target(&caption, &file_name);
                    tokio::spawn(files::save_document(
                        self.messages_tx.clone(),
                        self.cancel.listen(),
                        chat,
                        path,
                        data,
                    ));
                }
                _ => tracing::warn!(chat, "Document without file data"),
            },
            other => tracing::debug!(chat, command = other, "Unknown command ignored"),
        }
    }

    fn switch_executor(&mut self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let active_key = self
            .active
            .key_or(chat, self.sessions.default_key())
            .to_string();
        let (name, extra) = split_first_and_others(payload);
        if name.is_empty() {
            reply(output, self.executor_overview(chat));
            return;
        }
        if active_key == name || active_key == session_key(name, false, chat) {
            reply(output, format!("Already using {name} executor"));
            return;
        }
        if name == DEFAULT_EXECUTOR {
            self.active.reset(chat);
            reply(output, MSG_RESET_EXECUTOR);
            return;
        }
        let Some(config) = self.store.get_executor(name) else {
            reply(output, format!("Executor '{name}' not found"));
            return;
        };
        let key = session_key(&config.name, config.global, chat);
        if !self.sessions.contains(&key) {
            if let Err(e) = self.create_session(chat, &config, extra) {
                reply(
                    output,
                    format!("Failed to create executor '{}': {e}", config.name),
                );
                return;
            }
        }
        self.active.set(chat, key);
        reply(output, format!("Active executor changed to '{}'", config.name));
    }

    /// Construct and register a session, then open it in the background.
    fn create_session(
        &mut self,
        chat: ChatId,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<(), SessionError> {
        let executor = self
            .registry
            .create(Arc::clone(&self.store), config, extra)?;
        let session = Session::new(executor, chat, config.global);
        let origin = session.origin();
        if let Some(stream) = session.executor.chan() {
            spawn_reader(stream, origin.clone(), chat, self.messages_tx.clone());
        }
        let executor = Arc::clone(&session.executor);
        self.sessions.insert(session)?;

        let messages = self.messages_tx.clone();
        tokio::spawn(async move {
            let message = match executor.open().await {
                Ok(()) => Message::Opened { origin, chat },
                Err(e) => Message::OpenFailed {
                    origin,
                    chat,
                    error: e.to_string(),
                },
            };
            let _ = messages.send(message).await;
        });
        Ok(())
    }

    fn executor_overview(&self, chat: ChatId) -> String {
        let suffix = format!("_{chat}");
        let mut opened: Vec<&str> = self
            .sessions
            .keys()
            .into_iter()
            .map(|key| key.strip_suffix(&suffix).unwrap_or(key))
            .collect();
        opened.sort_unstable();

        let mut text = format!(
            "Active executor: {}\nOpened executors: {}\nActions: /close , /closeall\n\n",
            self.active_session(chat).name,
            opened.join(", ")
        );
        text.push_str("All executors: (*: user-defined)\n");
        for executor in self
            .store
            .internal_executors()
            .into_iter()
            .chain(self.store.user_executors())
        {
            let _ = writeln!(
                text,
                "- {} ({})\n/executor_{}",
                executor.name,
                executor.desc(),
                executor.name
            );
        }
        text.push_str("\nTo manage, send /executors");
        text
    }

    async fn close_session(&mut self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let key = if payload.is_empty() {
            self.active
                .key_or(chat, self.sessions.default_key())
                .to_string()
        } else {
            let chat_key = session_key(payload, false, chat);
            if self.sessions.contains(&chat_key) {
                chat_key
            } else {
                payload.to_string()
            }
        };
        match self.sessions.remove(&key) {
            Err(SessionError::DefaultSession) => {
                self.sessions.default_session().executor.clear();
                reply(output, "Using default executor");
            }
            Err(_) => reply(output, format!("Executor '{key}' not found")),
            Ok(session) => {
                session.executor.close();
                for other in self.active.reset_where(|k| k == key) {
                    if other == chat {
                        reply(output, MSG_RESET_EXECUTOR);
                    } else {
                        self.notify_reset(other).await;
                    }
                }
            }
        }
    }

    async fn close_all(&mut self) {
        for session in self.sessions.remove_where(|_| true) {
            session.executor.close();
        }
        for chat in self.active.clear() {
            self.notify_reset(chat).await;
        }
    }

    /// Close every session of executor `name` and reset conversations using
    /// one of them.
    async fn close_executor_sessions(&mut self, name: &str) {
        let removed = self.sessions.remove_where(|s| s.name == name);
        let keys: Vec<String> = removed
            .iter()
            .map(|session| {
                session.executor.close();
                session.key.clone()
            })
            .collect();
        for chat in self.active.reset_where(|k| keys.iter().any(|key| key == k)) {
            self.notify_reset(chat).await;
        }
    }

    fn add_button(&self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let name = &self.active_session(chat).name;
        if payload.is_empty() {
            reply(output, USAGE_ADDBTN);
        } else if let Err(e) = self.store.add_button(name, payload) {
            reply(output, format!("Failed to add executor {name} button: {e}"));
        } else {
            reply(output, MSG_SUCCESS);
        }
    }

    fn del_button(&self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let name = &self.active_session(chat).name;
        if payload.is_empty() {
            reply(output, USAGE_DELBTN);
        } else if let Err(e) = self.store.del_button(name, payload) {
            reply(output, format!("Failed to delete executor {name} button: {e}"));
        } else {
            reply(output, MSG_SUCCESS);
        }
    }

    async fn add_executor(&self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let (name, others) = split_first_and_others(payload);
        let (kind, config) = split_first_and_others(others);
        if name.is_empty() || kind.is_empty() {
            reply(output, USAGE_ADDEXECUTOR);
            return;
        }
        if !self.registry.contains(kind) {
            reply(output, format!("'{kind}' is NOT a valid executor type"));
            return;
        }
        let executor = ExecutorConfig::new(name, kind, config);
        let desc = executor.desc();
        match self.store.add_executor(executor) {
            Ok(()) => {
                self.refresh_menu(chat).await;
                reply(
                    output,
                    format!(
                        "Successfully added executor {name} ({desc})\nTo use it, send /executor_{name}"
                    ),
                );
            }
            Err(e) => reply(output, format!("Failed to add executor {name}: {e}")),
        }
    }

    async fn delete_executor(&mut self, chat: ChatId, name: &str, output: &CommandOutput) {
        if name == DEFAULT_EXECUTOR {
            reply(output, "default executor can NOT be deleted");
            return;
        }
        if let Err(e) = self.store.del_executor(name) {
            reply(output, format!("Failed to delete executor '{name}': {e}"));
            return;
        }
        self.refresh_menu(chat).await;
        reply(output, format!("Successfully deleted executor {name}"));
        self.close_executor_sessions(name).await;
    }

    fn set_secret(&self, payload: &str, output: &CommandOutput) {
        let (name, secret) = split_first_and_others(payload);
        if name.is_empty() {
            reply(output, USAGE_SETSECRET);
        } else if let Err(e) = self.store.set_executor_secret(name, secret) {
            reply(output, format!("failed to set executor '{name}' secret: {e}"));
        } else if secret.is_empty() {
            reply(output, format!("Successfully clear executor '{name}' secret."));
        } else {
            reply(output, format!("Successfully set executor '{name}' secret."));
        }
    }

    async fn add_cmd(&self, chat: ChatId, payload: &str, output: &CommandOutput) {
        let (name, cmdline) = split_first_and_others(payload);
        if name.is_empty() || cmdline.is_empty() {
            reply(output, USAGE_ADDCMD);
        } else if commands::is_builtin(name) {
            reply(output, format!("Can't override internal command '{name}'"));
        } else if let Err(e) = self.store.add_cmd(CmdConfig {
            name: name.to_string(),
            cmd: cmdline.to_string(),
        }) {
            reply(output, format!("Failed to add cmd {name}: {e}"));
        } else {
            self.refresh_menu(chat).await;
            reply(output, format!("Successfully added cmd {name}={cmdline}"));
        }
    }

    async fn get_file(&self, chat: ChatId, payload: &str, output: &CommandOutput) {
        if payload.is_empty() {
            reply(output, USAGE_GETFILE);
            return;
        }
        let Ok(path) = workdir::resolve(payload) else {
            reply(output, MSG_INVALID);
            return;
        };
        match tokio::fs::metadata(&path).await {
            Err(_) => reply(output, format!("File '{}' does NOT exist", path.display())),
            Ok(meta) if !meta.is_file() => reply(
                output,
                format!("File '{}' is not a regular file", path.display()),
            ),
            Ok(meta) => {
                let notice = format!(
                    "Sending {} ({})",
                    path.display(),
                    text::bytes_size(meta.len())
                );
                tokio::spawn(files::send_file(Arc::clone(&self.sink), chat, path, notice));
            }
        }
    }

    async fn handle_callback(
        &mut self,
        chat: ChatId,
        ctx: &CancellationToken,
        data: &str,
        listing: &str,
        output: CommandOutput,
    ) {
        let answer = match data.split_once('_') {
            Some((action, index)) if !action.is_empty() && !index.is_empty() => {
                self.callback_action(chat, ctx, action, index, listing, output)
                    .await
            }
            _ => MSG_INVALID.to_string(),
        };
        if let Err(e) = self.sink.answer_callback(chat, &answer).await {
            tracing::error!(chat, ?e, "Failed to answer callback");
        }
    }

    /// Act on a listing button and return the callback answer.
    async fn callback_action(
        &mut self,
        chat: ChatId,
        ctx: &CancellationToken,
        action: &str,
        index: &str,
        listing: &str,
        output: CommandOutput,
    ) -> String {
        let lines: Vec<&str> = listing.lines().collect();
        let executor = self.active_session(chat).name.clone();

        if listing.starts_with(HISTORY_HEADER) {
            let Some(cmdline) = text::find_line_data_by_first_field(&lines, index) else {
                return MSG_INVALID.to_string();
            };
            return match action {
                "run" => {
                    reply(&output, cmdline);
                    runner::run(self.active_session(chat), ctx, output, cmdline);
                    format!("Run {index}: {cmdline}")
                }
                "add" => match self.store.add_button(&executor, cmdline) {
                    Ok(()) => {
                        reply(&output, format!("Add '{cmdline}' to buttons"));
                        format!("Add {index}: {cmdline}")
                    }
                    Err(e) => e.to_string(),
                },
                _ => MSG_INVALID.to_string(),
            };
        }
        if listing.starts_with(BUTTONS_HEADER) {
            let Some(cmdline) = text::find_line_data_by_first_field(&lines, index) else {
                return MSG_INVALID.to_string();
            };
            if action != "del" {
                return MSG_INVALID.to_string();
            }
            return match self.store.del_button(&executor, cmdline) {
                Ok(()) => {
                    let answer = format!("Del button '{cmdline}'");
                    reply(&output, answer.clone());
                    answer
                }
                Err(e) => e.to_string(),
            };
        }
        if listing.starts_with(CMDS_HEADER) {
            if action != "del" {
                return MSG_INVALID.to_string();
            }
            return match self.store.del_cmd(index) {
                Ok(()) => {
                    self.refresh_menu(chat).await;
                    format!("Del cmd '{index}'")
                }
                Err(e) => e.to_string(),
            };
        }
        if listing.starts_with(EXECUTORS_HEADER) {
            if action != "del" || index == DEFAULT_EXECUTOR {
                return MSG_INVALID.to_string();
            }
            return match self.store.del_executor(index) {
                Ok(()) => {
                    self.refresh_menu(chat).await;
                    self.close_executor_sessions(index).await;
                    format!("Del executor '{index}'")
                }
                Err(e) => e.to_string(),
            };
        }
        if listing.starts_with(FILES_HEADER) {
            return match files::listing_action(listing, action, index) {
                Some(FileAction::Cd(path)) => match workdir::chdir(&path) {
                    Ok(cwd) => {
                        reply(&output, format!("cd {}", cwd.display()));
                        format!("cd {}", cwd.display())
                    }
                    Err(e) => format!("Failed to cd {}: {e}", path.display()),
                },
                Some(FileAction::Get(path)) => {
                    let notice = format!("Sending {}", path.display());
                    tokio::spawn(files::send_file(
                        Arc::clone(&self.sink),
                        chat,
                        path,
                        notice.clone(),
                    ));
                    notice
                }
                None => MSG_INVALID.to_string(),
            };
        }
        MSG_INVALID.to_string()
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Reply { chat, text } => {
                let buttons = self.active_session(chat).executor.buttons();
                self.send_chunks(chat, &text, Some(buttons.as_slice())).await;
            }
            Message::Global { chat, text } => self.send_chunks(chat, &text, None).await,
            Message::Data { origin, chat, text } => self.deliver_data(&origin, chat, &text).await,
            Message::Opened { origin, chat } => {
                let key = session_key(&origin.executor, origin.global, chat);
                if let Some(session) = self.sessions.get_instance_mut(&key, origin.instance) {
                    session.ready = true;
                    tracing::info!(session = %key, "Executor opened");
                }
            }
            Message::OpenFailed {
                origin,
                chat,
                error,
            } => {
                let key = session_key(&origin.executor, origin.global, chat);
                tracing::warn!(session = %key, %error, "Executor failed to open");
                let text = format!("Failed to open executor '{}': {error}", origin.executor);
                self.send_chunks(chat, &text, None).await;
                if self.sessions.remove_instance(&key, origin.instance).is_some() {
                    for other in self.active.reset_where(|k| k == key) {
                        self.notify_reset(other).await;
                    }
                }
            }
            Message::Closed { origin, chat } => {
                let key = session_key(&origin.executor, origin.global, chat);
                let Some(session) = self.sessions.remove_instance(&key, origin.instance) else {
                    return;
                };
                tracing::info!(session = %key, "Executor closed by backend");
                session.executor.close();
                let text = format!("Executor '{}' closed", origin.executor);
                let mut notified = self.active.reset_where(|k| k == key);
                if !notified.contains(&session.chat) {
                    self.send_chunks(session.chat, &text, None).await;
                }
                notified.sort_unstable();
                for other in notified {
                    self.send_chunks(other, &text, None).await;
                    self.notify_reset(other).await;
                }
            }
        }
    }

    /// Deliver persistent output to every conversation whose active session
    /// produced it.
    async fn deliver_data(&self, origin: &Origin, chat: ChatId, text: &str) {
        let key = session_key(&origin.executor, origin.global, chat);
        let Some(session) = self.sessions.get(&key) else {
            return;
        };
        if session.instance != origin.instance {
            return;
        }
        let targets = if origin.global && key != self.sessions.default_key() {
            self.active.chats_with(&key)
        } else if self
            .active
            .is_active(chat, &key, self.sessions.default_key())
        {
            vec![chat]
        } else {
            Vec::new()
        };
        let buttons = session.executor.buttons();
        for target in targets {
            self.send_chunks(target, text, Some(buttons.as_slice())).await;
        }
    }
}

/// Read a persistent stream into the message channel until it ends.
fn spawn_reader(
    mut stream: OutputStream,
    origin: Origin,
    chat: ChatId,
    messages: mpsc::Sender<Message>,
) {
    tokio::spawn(async move {
        while let Some(text) = stream.recv().await {
            let data = Message::Data {
                origin: origin.clone(),
                chat,
                text,
            };
            if messages.send(data).await.is_err() {
                return;
            }
        }
        let _ = messages.send(Message::Closed { origin, chat }).await;
    });
}
