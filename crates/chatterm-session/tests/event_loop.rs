//! Event loop behavior against a recording sink and fake executors.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chatterm_core::{
    ChatId, ConfigData, ConfigStore, Executor, ExecutorConfig, ExecutorError, OutputStream,
};
use chatterm_executor::Registry;
use chatterm_session::{
    EventLoop, InlineButton, LoopHandle, MenuCommand, MessageSink, SinkError,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Text {
        chat: ChatId,
        text: String,
        keyboard: Option<Vec<String>>,
    },
    Listing {
        chat: ChatId,
        text: String,
        buttons: Vec<Vec<InlineButton>>,
    },
    Document {
        chat: ChatId,
        file_name: String,
    },
    Commands {
        chat: ChatId,
    },
    Answer {
        chat: ChatId,
        text: String,
    },
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Sent>>,
    /// While set, text sends never complete.
    stalled: AtomicBool,
}

impl RecordingSink {
    fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    fn push(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }

    fn texts(&self, chat: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Text { chat: c, text, .. } if *c == chat => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until some text to `chat` satisfies `pred` and return it.
    async fn wait_text(&self, chat: ChatId, pred: impl Fn(&str) -> bool) -> String {
        for _ in 0..200 {
            if let Some(text) = self.texts(chat).into_iter().find(|t| pred(t)) {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no matching text for chat {chat}: {:?}", self.texts(chat));
    }

    async fn wait_sent(&self, pred: impl Fn(&Sent) -> bool) -> Sent {
        for _ in 0..200 {
            if let Some(sent) = self.snapshot().into_iter().find(|s| pred(s)) {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing matched: {:?}", self.snapshot());
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&[String]>,
    ) -> Result<(), SinkError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.push(Sent::Text {
            chat,
            text: text.to_string(),
            keyboard: keyboard.map(<[String]>::to_vec),
        });
        Ok(())
    }

    async fn send_listing(
        &self,
        chat: ChatId,
        text: &str,
        buttons: &[Vec<InlineButton>],
    ) -> Result<(), SinkError> {
        self.push(Sent::Listing {
            chat,
            text: text.to_string(),
            buttons: buttons.to_vec(),
        });
        Ok(())
    }

    async fn send_document(
        &self,
        chat: ChatId,
        file_name: &str,
        _data: Vec<u8>,
    ) -> Result<(), SinkError> {
        self.push(Sent::Document {
            chat,
            file_name: file_name.to_string(),
        });
        Ok(())
    }

    async fn send_commands(&self, chat: ChatId, _: &[MenuCommand]) -> Result<(), SinkError> {
        self.push(Sent::Commands { chat });
        Ok(())
    }

    async fn answer_callback(&self, chat: ChatId, text: &str) -> Result<(), SinkError> {
        self.push(Sent::Answer {
            chat,
            text: text.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Per-call output stream.
    Oneshot,
    /// Echoes every line on the persistent stream.
    Persistent,
    /// Opens, then its stream ends at once.
    Dying,
    /// Fails to open.
    Broken,
    /// Per-call stream that produces lines until its receiver is gone.
    Flood,
}

#[derive(Clone, Default)]
struct Counters {
    constructed: Arc<Mutex<Vec<String>>>,
    opened: Arc<AtomicUsize>,
    execs: Arc<Mutex<Vec<(String, Vec<u8>, bool)>>>,
    produced: Arc<AtomicUsize>,
}

impl Counters {
    fn constructed(&self, name: &str) -> usize {
        self.constructed
            .lock()
            .unwrap()
            .iter()
            .filter(|n| *n == name)
            .count()
    }

    fn exec_bytes(&self, name: &str) -> Vec<Vec<u8>> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, ..)| n == name)
            .map(|(_, cmdline, _)| cmdline.clone())
            .collect()
    }

    fn execs(&self, name: &str) -> Vec<(String, bool)> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, ..)| n == name)
            .map(|(_, cmdline, is_raw)| (String::from_utf8_lossy(cmdline).into_owned(), *is_raw))
            .collect()
    }
}

struct FakeExecutor {
    name: String,
    behavior: Behavior,
    counters: Counters,
    output_tx: Mutex<Option<mpsc::Sender<String>>>,
    output_rx: Mutex<Option<OutputStream>>,
}

impl FakeExecutor {
    fn new(name: &str, behavior: Behavior, counters: Counters) -> Self {
        let (tx, rx) = match behavior {
            Behavior::Oneshot | Behavior::Flood => (None, None),
            _ => {
                let (tx, rx) = mpsc::channel(5);
                (Some(tx), Some(rx))
            }
        };
        Self {
            name: name.to_string(),
            behavior,
            counters,
            output_tx: Mutex::new(tx),
            output_rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), ExecutorError> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        match self.behavior {
            Behavior::Broken => {
                self.output_tx.lock().unwrap().take();
                Err(ExecutorError::Connection("refused".into()))
            }
            Behavior::Dying => {
                self.output_tx.lock().unwrap().take();
                Ok(())
            }
            Behavior::Oneshot | Behavior::Persistent | Behavior::Flood => Ok(()),
        }
    }

    fn exec(&self, _: &CancellationToken, cmdline: &[u8], is_raw: bool) -> Option<OutputStream> {
        self.counters
            .execs
            .lock()
            .unwrap()
            .push((self.name.clone(), cmdline.to_vec(), is_raw));
        let cmdline = String::from_utf8_lossy(cmdline);
        match self.behavior {
            Behavior::Oneshot => {
                let (tx, rx) = mpsc::channel(5);
                tx.try_send(format!("ran: {cmdline}")).unwrap();
                Some(rx)
            }
            Behavior::Flood => {
                let (tx, rx) = mpsc::channel(5);
                let produced = Arc::clone(&self.counters.produced);
                tokio::spawn(async move {
                    loop {
                        let n = produced.fetch_add(1, Ordering::SeqCst);
                        if tx.send(format!("line {n}")).await.is_err() {
                            break;
                        }
                    }
                });
                Some(rx)
            }
            _ => {
                if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
                    let _ = tx.try_send(format!("echo: {cmdline}"));
                }
                None
            }
        }
    }

    fn cancel(&self) {}

    fn clear(&self) {}

    fn close(&self) {
        self.output_tx.lock().unwrap().take();
    }

    fn chan(&self) -> Option<OutputStream> {
        self.output_rx.lock().unwrap().take()
    }

    fn history(&self) -> Vec<String> {
        Vec::new()
    }

    fn buttons(&self) -> Vec<String> {
        vec![format!("{}-button", self.name)]
    }
}

fn registry(counters: &Counters, shell: Behavior) -> Registry {
    let mut registry = Registry::new();
    for (kind, behavior) in [
        ("shell", shell),
        ("fake", Behavior::Persistent),
        ("dying", Behavior::Dying),
        ("broken", Behavior::Broken),
    ] {
        let counters = counters.clone();
        registry.register(kind, "fake usage", move |_store, config, _extra| {
            counters
                .constructed
                .lock()
                .unwrap()
                .push(config.name.clone());
            let executor: Arc<dyn Executor> =
                Arc::new(FakeExecutor::new(&config.name, behavior, counters.clone()));
            Ok(executor)
        });
    }
    registry
}

struct Harness {
    handle: LoopHandle,
    sink: Arc<RecordingSink>,
    counters: Counters,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(Behavior::Oneshot).await
    }

    async fn start_with(shell: Behavior) -> Self {
        let global = ExecutorConfig {
            global: true,
            ..ExecutorConfig::new("gexec", "fake", "")
        };
        let store = ConfigStore::in_memory(ConfigData {
            token: "t".into(),
            whitelist: vec![1, 2, 42],
            executors: vec![
                ExecutorConfig::new("newexec", "fake", ""),
                ExecutorConfig::new("dying", "dying", ""),
                ExecutorConfig::new("broken", "broken", ""),
                global,
            ],
            ..ConfigData::default()
        });
        let counters = Counters::default();
        let sink = Arc::new(RecordingSink::default());
        let (event_loop, handle) = EventLoop::new(
            Arc::new(store),
            Arc::new(registry(&counters, shell)),
            Arc::clone(&sink) as Arc<dyn MessageSink>,
        )
        .await
        .unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(event_loop.run(shutdown.clone()));
        Self {
            handle,
            sink,
            counters,
            shutdown,
        }
    }

    async fn send(&self, chat: ChatId, text: &str) {
        tokio_test::assert_ok!(self.handle.submit_text(chat, text).await);
    }

    /// Switch `chat` to `name` and wait until the session is usable.
    async fn switch_ready(&self, chat: ChatId, name: &str) {
        self.send(chat, &format!("/executor {name}")).await;
        let changed = format!("Active executor changed to '{name}'");
        self.sink.wait_text(chat, |t| t == changed).await;
        for _ in 0..200 {
            self.send(chat, "/run warmup").await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self
                .sink
                .texts(chat)
                .iter()
                .any(|t| t == "echo: warmup" || t == "ran: warmup")
            {
                return;
            }
        }
        panic!("executor {name} never became ready");
    }
}

#[tokio::test]
async fn test_concurrent_switch_constructs_once() {
    let h = Harness::start().await;
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let handle = h.handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.submit(42, "/executor", "newexec", None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for _ in 0..200 {
        if h.sink.texts(42).len() >= 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let texts = h.sink.texts(42);
    let changed = texts
        .iter()
        .filter(|t| *t == "Active executor changed to 'newexec'")
        .count();
    let already = texts
        .iter()
        .filter(|t| *t == "Already using newexec executor")
        .count();
    assert_eq!((changed, already), (1, 7));
    assert_eq!(h.counters.constructed("newexec"), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The default executor was opened once at startup.
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_default_session_cannot_be_closed() {
    let h = Harness::start().await;
    h.send(1, "/close").await;
    h.sink.wait_text(1, |t| t == "Using default executor").await;
    h.send(1, "/close shell").await;
    for _ in 0..200 {
        let resets = h
            .sink
            .texts(1)
            .iter()
            .filter(|t| *t == "Using default executor")
            .count();
        if resets == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let resets = h.sink.texts(1).iter().filter(|t| *t == "Using default executor").count();
    assert_eq!(resets, 2);
    h.send(1, "/executor").await;
    let overview = h.sink.wait_text(1, |t| t.starts_with("Active executor:")).await;
    assert!(overview.starts_with("Active executor: shell\nOpened executors: shell\n"));
}

#[tokio::test]
async fn test_default_executor_without_active_entry() {
    let h = Harness::start().await;
    h.send(7, "uptime").await;
    h.sink.wait_text(7, |t| t == "ran: uptime").await;
    assert_eq!(h.counters.execs("shell"), [("uptime".to_string(), false)]);
}

#[tokio::test]
async fn test_raw_sequences_reach_executor() {
    let h = Harness::start().await;
    h.send(1, "^|pwd\\n").await;
    h.sink.wait_text(1, |t| t == "ran: pwd\n").await;
    h.send(1, "^C").await;
    h.sink.wait_text(1, |t| t == "ran: \u{3}").await;
    h.send(1, "/raw \\x1b").await;
    h.sink.wait_text(1, |t| t == "ran: \u{1b}").await;
    assert_eq!(
        h.counters.execs("shell"),
        [
            ("pwd\n".to_string(), true),
            ("\u{3}".to_string(), true),
            ("\u{1b}".to_string(), true)
        ]
    );

    h.send(1, "^|bad\\q").await;
    h.sink.wait_text(1, |t| t == "Invalid raw input").await;
    assert_eq!(h.counters.execs("shell").len(), 3);
}

#[tokio::test]
async fn test_raw_bytes_reach_executor_unchanged() {
    let h = Harness::start().await;
    h.send(1, "^|\\xff\\x03").await;
    h.sink.wait_text(1, |t| t.starts_with("ran: ")).await;
    assert_eq!(h.counters.exec_bytes("shell"), [vec![0xff, 0x03]]);
}

#[tokio::test]
async fn test_stalled_sink_holds_back_output() {
    let h = Harness::start_with(Behavior::Flood).await;
    h.sink.stall();
    h.send(1, "yes").await;

    for _ in 0..200 {
        if h.counters.produced.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let produced = h.counters.produced.load(Ordering::SeqCst);
    assert!(produced > 0);
    assert!(produced < 100, "{produced} lines produced into a stalled sink");
}

#[tokio::test]
async fn test_replies_carry_active_buttons() {
    let h = Harness::start().await;
    h.send(1, "/pwd").await;
    let sent = h
        .sink
        .wait_sent(|s| matches!(s, Sent::Text { chat: 1, .. }))
        .await;
    let Sent::Text { keyboard, .. } = sent else {
        unreachable!()
    };
    assert_eq!(keyboard, Some(vec!["shell-button".to_string()]));
}

#[tokio::test]
async fn test_persistent_output_goes_to_owner() {
    let h = Harness::start().await;
    h.switch_ready(1, "newexec").await;
    h.send(1, "ls").await;
    h.sink.wait_text(1, |t| t == "echo: ls").await;
    assert!(h.counters.execs("newexec").contains(&("ls".to_string(), false)));
    assert!(!h.sink.texts(2).iter().any(|t| t == "echo: ls"));
}

#[tokio::test]
async fn test_per_conversation_sessions() {
    let h = Harness::start().await;
    h.switch_ready(1, "newexec").await;
    h.switch_ready(2, "newexec").await;
    assert_eq!(h.counters.constructed("newexec"), 2);

    h.send(1, "/executor").await;
    let overview = h.sink.wait_text(1, |t| t.starts_with("Active executor:")).await;
    assert!(overview.contains("Opened executors: newexec, newexec_2, shell\n"));
}

#[tokio::test]
async fn test_global_session_is_shared() {
    let h = Harness::start().await;
    h.switch_ready(1, "gexec").await;
    h.switch_ready(2, "gexec").await;
    assert_eq!(h.counters.constructed("gexec"), 1);

    h.send(1, "date").await;
    h.sink.wait_text(1, |t| t == "echo: date").await;
    h.sink.wait_text(2, |t| t == "echo: date").await;
}

#[tokio::test]
async fn test_spontaneous_close_reverts_to_default() {
    let h = Harness::start().await;
    h.send(1, "/executor dying").await;
    h.sink.wait_text(1, |t| t == "Executor 'dying' closed").await;
    h.sink
        .wait_text(1, |t| t == "Active executor changed to default")
        .await;

    h.send(1, "whoami").await;
    h.sink.wait_text(1, |t| t == "ran: whoami").await;
}

#[tokio::test]
async fn test_open_failure_removes_session() {
    let h = Harness::start().await;
    h.send(1, "/executor broken").await;
    h.sink
        .wait_text(1, |t| {
            t == "Failed to open executor 'broken': connection failed: refused"
        })
        .await;
    h.sink
        .wait_text(1, |t| t == "Active executor changed to default")
        .await;

    h.send(1, "/executor").await;
    let overview = h
        .sink
        .wait_text(1, |t| t.starts_with("Active executor: shell"))
        .await;
    assert!(overview.contains("Opened executors: shell\n"));
}

#[tokio::test]
async fn test_close_resets_active() {
    let h = Harness::start().await;
    h.switch_ready(1, "newexec").await;
    h.send(1, "/close").await;
    h.sink
        .wait_text(1, |t| t == "Active executor changed to default")
        .await;
    h.send(1, "/close newexec").await;
    h.sink
        .wait_text(1, |t| t == "Executor 'newexec' not found")
        .await;
}

#[tokio::test]
async fn test_unknown_and_already_active() {
    let h = Harness::start().await;
    h.send(1, "/executor nope").await;
    h.sink.wait_text(1, |t| t == "Executor 'nope' not found").await;
    h.send(1, "/executor shell").await;
    h.sink.wait_text(1, |t| t == "Already using shell executor").await;
}

#[tokio::test]
async fn test_delete_executor_closes_sessions() {
    let h = Harness::start().await;
    h.switch_ready(1, "newexec").await;
    h.send(2, "/delexecutor newexec").await;
    h.sink
        .wait_text(2, |t| t == "Successfully deleted executor newexec")
        .await;
    h.sink
        .wait_text(1, |t| t == "Active executor changed to default")
        .await;
    h.send(2, "/delexecutor shell").await;
    h.sink
        .wait_text(2, |t| t == "default executor can NOT be deleted")
        .await;
}

#[tokio::test]
async fn test_history_callback_runs_line() {
    let h = Harness::start().await;
    let listing = "History (1) - shell\n- tip\n\n0  df -h\n".to_string();
    h.handle
        .submit(
            1,
            "callback",
            "",
            Some(chatterm_session::Attachment::Callback {
                data: "run_0".into(),
                message: listing,
            }),
        )
        .await
        .unwrap();
    h.sink.wait_text(1, |t| t == "ran: df -h").await;
    let answer = h
        .sink
        .wait_sent(|s| matches!(s, Sent::Answer { chat: 1, .. }))
        .await;
    assert_eq!(
        answer,
        Sent::Answer {
            chat: 1,
            text: "Run 0: df -h".into()
        }
    );
}

#[tokio::test]
async fn test_invalid_callback_is_answered() {
    let h = Harness::start().await;
    h.handle
        .submit(
            1,
            "callback",
            "",
            Some(chatterm_session::Attachment::Callback {
                data: "bogus".into(),
                message: "History (0) - shell".into(),
            }),
        )
        .await
        .unwrap();
    let answer = h
        .sink
        .wait_sent(|s| matches!(s, Sent::Answer { .. }))
        .await;
    assert_eq!(
        answer,
        Sent::Answer {
            chat: 1,
            text: "Invalid".into()
        }
    );
}

#[tokio::test]
async fn test_custom_commands() {
    let h = Harness::start().await;
    h.send(1, "/addcmd cd echo nope").await;
    h.sink
        .wait_text(1, |t| t == "Can't override internal command 'cd'")
        .await;
    h.send(1, "/addcmd hi echo hi").await;
    h.sink.wait_text(1, |t| t == "Successfully added cmd hi=echo hi").await;
    h.sink
        .wait_sent(|s| matches!(s, Sent::Commands { chat: 1 }))
        .await;
    h.send(1, "/hi there").await;
    h.sink.wait_text(1, |t| t == "ran: echo hi there").await;
}

#[tokio::test]
async fn test_listings() {
    let h = Harness::start().await;
    h.send(1, "/addbtn uptime").await;
    h.sink.wait_text(1, |t| t == "Success").await;
    h.send(1, "/buttons").await;
    let listing = h
        .sink
        .wait_sent(|s| matches!(s, Sent::Listing { chat: 1, .. }))
        .await;
    let Sent::Listing { text, buttons, .. } = listing else {
        unreachable!()
    };
    assert!(text.starts_with("Buttons (1) - shell\n"));
    assert!(text.ends_with("0  uptime\n"));
    assert_eq!(buttons, [[InlineButton::new("Del 0", "del_0")]]);
}

#[tokio::test]
async fn test_document_upload_and_getfile() {
    let h = Harness::start().await;
    let dir = tempfile::tempdir().unwrap();
    let caption = dir.path().display().to_string();
    h.handle
        .submit(
            1,
            "document",
            "",
            Some(chatterm_session::Attachment::Document {
                file_name: "notes.txt".into(),
                data: b"hello".to_vec(),
                caption,
            }),
        )
        .await
        .unwrap();
    h.sink
        .wait_text(1, |t| t == "Successfully saved file to the below path:")
        .await;
    let saved = dir.path().join("notes.txt");
    assert_eq!(std::fs::read(&saved).unwrap(), b"hello");

    h.send(1, &format!("/getfile {}", saved.display())).await;
    let sent = h
        .sink
        .wait_sent(|s| matches!(s, Sent::Document { chat: 1, .. }))
        .await;
    assert_eq!(
        sent,
        Sent::Document {
            chat: 1,
            file_name: "notes.txt".into()
        }
    );

    h.send(1, "/getfile /definitely/not/here").await;
    h.sink
        .wait_text(1, |t| t == "File '/definitely/not/here' does NOT exist")
        .await;
}
