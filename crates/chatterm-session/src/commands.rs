//! Built-in commands, user facing texts, the command menu and help.

use std::fmt::Write as _;

use chatterm_core::ConfigStore;
use chatterm_executor::Registry;

use crate::sink::MenuCommand;

/// Where a command shows up in the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Normal,
    /// Listed first.
    Pinned,
    /// Handled but not listed.
    Hidden,
}

/// A built-in command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Name without the leading slash.
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub kind: CommandKind,
}

const fn spec(
    name: &'static str,
    description: &'static str,
    usage: &'static str,
    kind: CommandKind,
) -> CommandSpec {
    CommandSpec {
        name,
        description,
        usage,
        kind,
    }
}

pub const USAGE_ADDBTN: &str = "Usage: /addbtn <cmdline>";
pub const USAGE_DELBTN: &str = "Usage: /delbtn <cmdline_prefix>";
pub const USAGE_CLEARBTN: &str = "Usage: /clearbtn <executor>";
pub const USAGE_SETSECRET: &str = "Usage: /setsecret <executor> [secret]\nIf [secret] is empty, clear it";
pub const USAGE_ADDEXECUTOR: &str =
    "Usage: /addexecutor <name> <type> [config]\nE.g.: /addexecutor myssh ssh 1.2.3.4";
pub const USAGE_DELEXECUTOR: &str = "Usage: /delexecutor <name>\nE.g.: /delexecutor myssh";
pub const USAGE_RUN: &str = "Usage: /run <cmdline>\nE.g.: /run /usr/bin/ls -lh";
pub const USAGE_ADDCMD: &str = "Usage: /addcmd <name> <cmdline>\nE.g.: /addcmd ping ping -c 5 8.8.8.8";
pub const USAGE_DELCMD: &str = "Usage: /delcmd <name>\nE.g.: /delcmd ping";
pub const USAGE_GETFILE: &str = "Usage: /getfile /path/to/file.txt";
pub const USAGE_CD: &str = "Usage: /cd [dir]\n[dir] default to user home dir";
pub const USAGE_RAW: &str = "Usage: /raw <sequence>\n<sequence> is a C-style escape string. E.g.:\n\\x03pwd\\n : Send 0x03 (Ctrl-C) + \"pwd\" + \"\\n\"";
pub const USAGE_FILES: &str = "Usage: /files [prefix]";

pub const MSG_START: &str = "Welcome! chatterm is up and your client is authenticated.\nFor help, send /help";
pub const MSG_RESET_EXECUTOR: &str = "Active executor changed to default";
pub const MSG_SUCCESS: &str = "Success";
pub const MSG_INVALID: &str = "Invalid";
pub const MSG_NOT_READY: &str = "The executor is not ready (still opening). To stop it, send /close";

pub const HISTORY_TIP: &str = "- Click 'Run' to execute\n- Click 'Add' to save to buttons\n- It works in active executor\n- To del buttons, send /buttons";
pub const BUTTONS_TIP: &str =
    "- Click 'Del' to delete\n- It works in active executor\n- To add from history, send /history";
pub const CMDS_TIP: &str = "- Click 'Del' to delete\n- To add new, use /addcmd";
pub const FILES_TIP: &str = "- Click '↓' to get\n- To narrow, use /files <prefix>";
pub const EXECUTORS_TIP: &str =
    "- Click 'Del' to delete\n- To refresh, send /executors\n- To add new, use /addexecutor";

pub const HELP_TEXT: &str = "Other messages:

- /<cmd_name> : User-defined shortcut cmd added via /addcmd. Its cmdline is executed by the active executor. Marked with '*' in the commands list
- /executor_<name> : Shortcut for switching executor
- Send a file: save the file to cwd (use the caption to change the save path)
- ^<char> : Send a control key stroke. <char> is a single char. E.g.: ^C (Ctrl-C), ^Z (Ctrl-Z)
- ^|<sequence> : Send a C-style escape string as is, same as /raw
- <cmdline> : Any other text is treated as a cmdline and executed by the active executor

Topics:

Executors : Internal executors are pre-defined and fixed. User-defined executors are added via /addexecutor. To view all, send /executor

Active executor : Default is 'shell' (internal executor). Use \"/executor_<name>\" or \"/executor <name>\" to change it

Cwd : Current working directory, shared by every conversation. Initially the user home dir. Use /cd or /pwd to change or display it. Sending \"cd <dir>\" in the default executor also changes it

Buttons : Shortcuts for sending cmdlines, shown in the keyboard area. Recent cmdlines of the active executor are shown automatically and cleared when the executor closes. To manage permanent shortcuts, use /addbtn, /delbtn or /clearbtn

Config data : User-defined cmds, executors and buttons are stored in ~/.config/chatterm/config.json. After editing the file by hand, send /reload";

/// Every built-in command, in menu order within each kind.
pub const COMMANDS: &[CommandSpec] = &[
    spec("cancel", "Cancel the running command(s)", "", CommandKind::Pinned),
    spec("close", "Close (active) executor", "Usage: /close [name]", CommandKind::Pinned),
    spec("executor", "Display or use executor(s)", "Usage: /executor [name]", CommandKind::Pinned),
    spec("run", "Run cmdline in active executor", USAGE_RUN, CommandKind::Normal),
    spec("addcmd", "Add a custom cmd", USAGE_ADDCMD, CommandKind::Normal),
    spec("delcmd", "Delete a custom cmd", USAGE_DELCMD, CommandKind::Normal),
    spec("cmds", "Manage custom cmds", "", CommandKind::Normal),
    spec("addexecutor", "Add an executor", USAGE_ADDEXECUTOR, CommandKind::Normal),
    spec("delexecutor", "Delete an executor", USAGE_DELEXECUTOR, CommandKind::Normal),
    spec("setsecret", "Set the secret of an executor", USAGE_SETSECRET, CommandKind::Normal),
    spec("addbtn", "Add a button to active executor", USAGE_ADDBTN, CommandKind::Normal),
    spec("delbtn", "Delete a button of active executor", USAGE_DELBTN, CommandKind::Normal),
    spec("clearbtn", "Delete all buttons of an executor", USAGE_CLEARBTN, CommandKind::Normal),
    spec("getfile", "Download a file from server", USAGE_GETFILE, CommandKind::Normal),
    spec("refresh", "Refresh commands menu", "", CommandKind::Normal),
    spec("reload", "Reload config file", "", CommandKind::Normal),
    spec("raw", "Send raw input", USAGE_RAW, CommandKind::Normal),
    spec("pwd", "Get current working directory", "", CommandKind::Normal),
    spec("cd", "Change current working directory", USAGE_CD, CommandKind::Normal),
    spec("buttons", "Manage buttons", "", CommandKind::Normal),
    spec("executors", "Manage executors", "", CommandKind::Normal),
    spec("history", "Manage cmdline history", "", CommandKind::Normal),
    spec("files", "Manage files in cwd of server", USAGE_FILES, CommandKind::Normal),
    spec("closeall", "Close all opened executors", "", CommandKind::Normal),
    spec("help", "Show help", "", CommandKind::Normal),
    spec("start", "Welcome", "", CommandKind::Hidden),
];

/// Whether `name` (without slash) is a built-in command.
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    COMMANDS.iter().any(|c| c.name == name)
}

fn menu_entry(command: String, description: String) -> MenuCommand {
    MenuCommand {
        command,
        description,
    }
}

/// The command menu: pinned commands, user cmds, executor shortcuts, then the
/// remaining built-ins.
#[must_use]
pub fn menu(store: &ConfigStore) -> Vec<MenuCommand> {
    let builtin = |kind: CommandKind| {
        COMMANDS
            .iter()
            .filter(move |c| c.kind == kind)
            .map(|c| menu_entry(format!("/{}", c.name), c.description.to_string()))
    };
    let mut menu: Vec<MenuCommand> = builtin(CommandKind::Pinned).collect();
    menu.extend(
        store
            .cmds()
            .into_iter()
            .map(|c| menu_entry(format!("/{}", c.name), format!("{} *", c.cmd))),
    );
    menu.extend(
        store
            .internal_executors()
            .into_iter()
            .chain(store.user_executors())
            .map(|e| {
                menu_entry(
                    format!("/executor_{}", e.name),
                    format!("Executor {} ({})", e.name, e.desc()),
                )
            }),
    );
    menu.extend(builtin(CommandKind::Normal));
    menu
}

/// Full help: commands, internal executors and executor types.
#[must_use]
pub fn help(store: &ConfigStore, registry: &Registry) -> String {
    let mut msg = String::from(
        "chatterm works as a terminal emulator and ssh client driven from a chat.\n",
    );
    let _ = writeln!(msg, "Version: {}\n", env!("CARGO_PKG_VERSION"));

    msg.push_str("Available commands:\n\n");
    for command in COMMANDS {
        let _ = writeln!(msg, "/{}: {}", command.name, command.description);
        if !command.usage.is_empty() {
            let _ = writeln!(msg, "{}", command.usage);
        }
        msg.push('\n');
    }
    msg.push_str("Internal executors:\n\n");
    for executor in store.internal_executors() {
        let _ = write!(msg, "- {}\n{}\n\n", executor.name, executor.comment);
    }
    msg.push_str("Available executor types:\n\n");
    for info in registry.iter() {
        let _ = write!(msg, "- {}\n{}\n\n", info.name, info.usage);
    }
    msg
}
