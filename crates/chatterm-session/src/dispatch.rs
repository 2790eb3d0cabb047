//! Maps an incoming chat text to a command.

use chatterm_core::{ConfigStore, text::split_first_and_others};

use crate::commands::is_builtin;

/// Prefix of the executor switch shortcuts.
pub const EXECUTOR_SHORTCUT: &str = "/executor_";

/// Route a text message to `(command, payload)`.
///
/// - A built-in `/cmd payload` goes to that command.
/// - `/executor_<name> [extra]` goes to the executor switch.
/// - `/<custom> [args]` expands a user command and runs it.
/// - Anything else is run as is in the active executor.
#[must_use]
pub fn route_text(store: &ConfigStore, text: &str) -> (String, String) {
    let text = text.trim();
    let (command, payload) = split_first_and_others(text);
    if command.starts_with(EXECUTOR_SHORTCUT) {
        return (command.to_string(), payload.to_string());
    }
    if let Some(name) = command.strip_prefix('/') {
        if is_builtin(name) {
            return (command.to_string(), payload.to_string());
        }
        if let Some(cmd) = store.get_cmd(name) {
            let mut cmdline = cmd.cmd;
            if !payload.is_empty() {
                cmdline.push(' ');
                cmdline.push_str(payload);
            }
            return ("/run".to_string(), cmdline);
        }
    }
    ("/run".to_string(), text.to_string())
}

/// Rewrite `/executor_<name> [extra]` into `/executor` with `<name> [extra]`
/// as payload. Other commands pass through.
#[must_use]
pub fn expand_executor_shortcut(name: &str, payload: &str) -> (String, String) {
    match name.strip_prefix(EXECUTOR_SHORTCUT) {
        Some(executor) => {
            let mut expanded = executor.to_string();
            if !expanded.is_empty() && !payload.is_empty() {
                expanded.push(' ');
            }
            expanded.push_str(payload);
            ("/executor".to_string(), expanded)
        }
        None => (name.to_string(), payload.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chatterm_core::{CmdConfig, ConfigData};
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::in_memory(ConfigData {
            cmds: vec![CmdConfig {
                name: "ping".into(),
                cmd: "ping -c 5".into(),
            }],
            ..ConfigData::default()
        })
    }

    fn routed(text: &str) -> (String, String) {
        route_text(&store(), text)
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_builtin_commands() {
        assert_eq!(routed("/cd  /tmp "), pair("/cd", "/tmp"));
        assert_eq!(routed("/history"), pair("/history", ""));
    }

    #[test]
    fn test_custom_commands_expand() {
        assert_eq!(routed("/ping"), pair("/run", "ping -c 5"));
        assert_eq!(routed("/ping 8.8.8.8"), pair("/run", "ping -c 5 8.8.8.8"));
    }

    #[test]
    fn test_plain_text_runs() {
        assert_eq!(routed("ls -l"), pair("/run", "ls -l"));
        assert_eq!(routed("/usr/bin/ls -l"), pair("/run", "/usr/bin/ls -l"));
        assert_eq!(routed("^C"), pair("/run", "^C"));
    }

    #[test]
    fn test_executor_shortcut() {
        assert_eq!(routed("/executor_box -p 2222"), pair("/executor_box", "-p 2222"));
        assert_eq!(
            expand_executor_shortcut("/executor_box", "-p 2222"),
            pair("/executor", "box -p 2222")
        );
        assert_eq!(expand_executor_shortcut("/executor_box", ""), pair("/executor", "box"));
        assert_eq!(expand_executor_shortcut("/pwd", ""), pair("/pwd", ""));
    }
}
